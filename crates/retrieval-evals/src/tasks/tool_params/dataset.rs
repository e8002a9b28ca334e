//! Built-in case set for the filter-extraction evaluation.

use super::types::ExpectedFilters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub id: String,
    pub category: String,
    pub description: String,
    pub query: String,
    pub expected_filters: ExpectedFilters,
}

fn case(
    id: &str,
    category: &str,
    description: &str,
    query: &str,
    expected_filters: ExpectedFilters,
) -> EvalCase {
    EvalCase {
        id: id.to_string(),
        category: category.to_string(),
        description: description.to_string(),
        query: query.to_string(),
        expected_filters,
    }
}

pub struct ToolParamsDataset {
    cases: Vec<EvalCase>,
}

impl Default for ToolParamsDataset {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolParamsDataset {
    pub fn new() -> Self {
        let cases = vec![
            case(
                "speaker_001",
                "speaker_filter",
                "Direct speaker attribution",
                "What has Elon Musk said about AI?",
                ExpectedFilters {
                    speaker: Some("Elon Musk".to_string()),
                    ..Default::default()
                },
            ),
            case(
                "speaker_002",
                "speaker_filter",
                "According-to phrasing",
                "According to Sam Altman, when will we reach AGI?",
                ExpectedFilters {
                    speaker: Some("Sam Altman".to_string()),
                    ..Default::default()
                },
            ),
            case(
                "speaker_003",
                "speaker_filter",
                "Possessive phrasing",
                "What are Ilya Sutskever's views on scaling laws?",
                ExpectedFilters {
                    speaker: Some("Ilya Sutskever".to_string()),
                    ..Default::default()
                },
            ),
            case(
                "no_speaker_001",
                "no_speaker_filter",
                "General topic question, no person named",
                "What are the main arguments about AI safety?",
                ExpectedFilters::default(),
            ),
            case(
                "no_speaker_002",
                "no_speaker_filter",
                "Conceptual question, no person named",
                "How do transformers use attention?",
                ExpectedFilters::default(),
            ),
            case(
                "date_001",
                "date_filter",
                "Year mention maps to a year range",
                "What was discussed about AGI in 2024?",
                ExpectedFilters {
                    start_date: Some("2024-01-01".to_string()),
                    end_date: Some("2024-12-31".to_string()),
                    ..Default::default()
                },
            ),
            case(
                "date_002",
                "date_filter",
                "Open-ended after-date",
                "What interviews after 2023 covered reinforcement learning?",
                ExpectedFilters {
                    start_date: Some("2023-01-01".to_string()),
                    ..Default::default()
                },
            ),
            case(
                "combined_001",
                "combined_filters",
                "Speaker plus year",
                "What has Elon Musk said about AI in 2024?",
                ExpectedFilters {
                    speaker: Some("Elon Musk".to_string()),
                    start_date: Some("2024-01-01".to_string()),
                    end_date: Some("2024-12-31".to_string()),
                    ..Default::default()
                },
            ),
            case(
                "combined_002",
                "combined_filters",
                "Speaker plus doc type",
                "In his interview transcripts, what does Dario Amodei say about interpretability?",
                ExpectedFilters {
                    speaker: Some("Dario Amodei".to_string()),
                    doc_type: Some("transcript".to_string()),
                    ..Default::default()
                },
            ),
            case(
                "edge_001",
                "edge_cases",
                "Person mentioned as topic, not speaker",
                "What do guests think about Elon Musk's companies?",
                ExpectedFilters::default(),
            ),
            case(
                "edge_002",
                "edge_cases",
                "Historical year that is not a date filter",
                "Who talked about the 1969 moon landing?",
                ExpectedFilters::default(),
            ),
        ];

        Self { cases }
    }

    pub fn all(&self) -> &[EvalCase] {
        &self.cases
    }

    pub fn get_by_id(&self, id: &str) -> Option<&EvalCase> {
        self.cases.iter().find(|case| case.id == id)
    }

    pub fn by_category(&self, category: &str) -> Vec<EvalCase> {
        self.cases
            .iter()
            .filter(|case| case.category == category)
            .cloned()
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        self.cases
            .iter()
            .map(|case| case.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_covers_every_category() {
        let dataset = ToolParamsDataset::new();
        let categories = dataset.categories();
        for expected in [
            "combined_filters",
            "date_filter",
            "edge_cases",
            "no_speaker_filter",
            "speaker_filter",
        ] {
            assert!(categories.iter().any(|c| c == expected), "missing {}", expected);
        }
    }

    #[test]
    fn lookup_by_id_and_category() {
        let dataset = ToolParamsDataset::new();
        assert!(dataset.get_by_id("speaker_001").is_some());
        assert!(dataset.get_by_id("nope").is_none());
        assert_eq!(dataset.by_category("speaker_filter").len(), 3);
    }
}
