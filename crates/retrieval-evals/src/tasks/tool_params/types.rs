//! Shared types for the filter-extraction evaluation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filter values an agent is expected to bind for a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
}

impl ExpectedFilters {
    pub fn get(&self, field: &str) -> Option<&str> {
        match field {
            "speaker" => self.speaker.as_deref(),
            "start_date" => self.start_date.as_deref(),
            "end_date" => self.end_date.as_deref(),
            "source" => self.source.as_deref(),
            "doc_type" => self.doc_type.as_deref(),
            _ => None,
        }
    }
}

pub const FILTER_FIELDS: [&str; 5] = ["speaker", "start_date", "end_date", "source", "doc_type"];

/// One captured tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallCapture {
    pub tool_name: String,
    pub query: String,
    pub filters: BTreeMap<String, String>,
}

/// Outcome of a single filter-extraction case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParamsEvalResult {
    pub case_id: String,
    pub query: String,
    pub expected_filters: ExpectedFilters,
    pub actual_filters: BTreeMap<String, String>,
    pub tool_calls: Vec<ToolCallCapture>,
    pub filter_matches: BTreeMap<String, bool>,
    pub overall_match: bool,
    #[serde(default)]
    pub answer: String,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Per-field comparison of expected against bound filters.
///
/// Both absent is correct; one-sided presence is not. With both present,
/// `speaker`/`source`/`doc_type` match when one value is a
/// case-insensitive substring of the other, and the date fields match on
/// their four-character year prefix.
pub fn compare_filters(
    expected: &ExpectedFilters,
    actual: &BTreeMap<String, String>,
) -> (BTreeMap<String, bool>, bool) {
    let mut matches = BTreeMap::new();

    for field in FILTER_FIELDS {
        let expected_value = expected.get(field).map(normalize);
        let actual_value = actual.get(field).map(|v| normalize(v));

        let matched = match (expected_value, actual_value) {
            (None, None) => true,
            (None, Some(_)) | (Some(_), None) => false,
            (Some(expected), Some(actual)) => {
                if field == "start_date" || field == "end_date" {
                    expected.len() >= 4 && actual.len() >= 4 && expected[..4] == actual[..4]
                } else {
                    expected.contains(&actual) || actual.contains(&expected)
                }
            }
        };
        matches.insert(field.to_string(), matched);
    }

    let overall = matches.values().all(|&m| m);
    (matches, overall)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actual(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn both_absent_is_correct() {
        let (matches, overall) = compare_filters(&ExpectedFilters::default(), &BTreeMap::new());
        assert!(overall);
        assert!(matches.values().all(|&m| m));
    }

    #[test]
    fn unexpected_filter_fails() {
        let (matches, overall) = compare_filters(
            &ExpectedFilters::default(),
            &actual(&[("speaker", "Elon Musk")]),
        );
        assert!(!overall);
        assert_eq!(matches["speaker"], false);
        assert_eq!(matches["source"], true);
    }

    #[test]
    fn missing_expected_filter_fails() {
        let expected = ExpectedFilters {
            speaker: Some("Sam Altman".to_string()),
            ..Default::default()
        };
        let (matches, overall) = compare_filters(&expected, &BTreeMap::new());
        assert!(!overall);
        assert_eq!(matches["speaker"], false);
    }

    #[test]
    fn speaker_matches_on_substring_either_way() {
        let expected = ExpectedFilters {
            speaker: Some("Elon Musk".to_string()),
            ..Default::default()
        };
        let (matches, _) = compare_filters(&expected, &actual(&[("speaker", "elon musk")]));
        assert!(matches["speaker"]);

        let (matches, _) = compare_filters(&expected, &actual(&[("speaker", "Musk")]));
        assert!(matches["speaker"]);

        let (matches, _) = compare_filters(&expected, &actual(&[("speaker", "Sam Altman")]));
        assert!(!matches["speaker"]);
    }

    #[test]
    fn dates_match_on_year_prefix() {
        let expected = ExpectedFilters {
            start_date: Some("2024-01-01".to_string()),
            end_date: Some("2024-12-31".to_string()),
            ..Default::default()
        };
        let (matches, overall) = compare_filters(
            &expected,
            &actual(&[("start_date", "2024-03-15"), ("end_date", "2024-06-30")]),
        );
        assert!(overall);
        assert!(matches["start_date"]);
        assert!(matches["end_date"]);

        let (matches, _) = compare_filters(&expected, &actual(&[
            ("start_date", "2023-01-01"),
            ("end_date", "2024-12-31"),
        ]));
        assert!(!matches["start_date"]);
        assert!(matches["end_date"]);
    }

    #[test]
    fn elon_musk_2024_scenario_passes() {
        let expected = ExpectedFilters {
            speaker: Some("Elon Musk".to_string()),
            start_date: Some("2024-01-01".to_string()),
            end_date: Some("2024-12-31".to_string()),
            ..Default::default()
        };
        let bound = actual(&[
            ("speaker", "Elon Musk"),
            ("start_date", "2024-01-01"),
            ("end_date", "2024-12-31"),
        ]);
        let (_, overall) = compare_filters(&expected, &bound);
        assert!(overall);
    }
}
