//! Aggregate metrics for the filter-extraction evaluation.

use super::types::{ToolParamsEvalResult, FILTER_FIELDS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Confusion-matrix metrics for one filter field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterMetrics {
    pub filter_name: String,
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
    pub f1_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryMetrics {
    pub category: String,
    pub total_cases: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParamsMetrics {
    pub total_cases: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub overall_accuracy: f64,
    pub filter_metrics: BTreeMap<String, FilterMetrics>,
    pub category_metrics: BTreeMap<String, CategoryMetrics>,
    pub avg_latency_ms: f64,
}

fn compute_filter_metrics(field: &str, results: &[ToolParamsEvalResult]) -> FilterMetrics {
    let mut metrics = FilterMetrics {
        filter_name: field.to_string(),
        ..Default::default()
    };

    for result in results {
        if result.error.is_some() {
            continue;
        }

        let expected_applied = result.expected_filters.get(field).is_some();
        let actual_applied = result.actual_filters.contains_key(field);

        match (expected_applied, actual_applied) {
            (true, true) => {
                // Applied with the wrong value counts against precision
                if result.filter_matches.get(field).copied().unwrap_or(false) {
                    metrics.true_positives += 1;
                } else {
                    metrics.false_positives += 1;
                }
            }
            (false, false) => metrics.true_negatives += 1,
            (true, false) => metrics.false_negatives += 1,
            (false, true) => metrics.false_positives += 1,
        }
    }

    let total = metrics.true_positives
        + metrics.true_negatives
        + metrics.false_positives
        + metrics.false_negatives;
    if total > 0 {
        metrics.accuracy = (metrics.true_positives + metrics.true_negatives) as f64 / total as f64;
    }

    let tp_fp = metrics.true_positives + metrics.false_positives;
    if tp_fp > 0 {
        metrics.precision = metrics.true_positives as f64 / tp_fp as f64;
    }

    let tp_fn = metrics.true_positives + metrics.false_negatives;
    if tp_fn > 0 {
        metrics.recall = metrics.true_positives as f64 / tp_fn as f64;
    }

    if metrics.precision + metrics.recall > 0.0 {
        metrics.f1_score =
            2.0 * metrics.precision * metrics.recall / (metrics.precision + metrics.recall);
    }

    metrics
}

pub fn compute_tool_params_metrics(
    results: &[ToolParamsEvalResult],
    categories_by_case: &BTreeMap<String, String>,
) -> ToolParamsMetrics {
    let mut metrics = ToolParamsMetrics {
        total_cases: results.len(),
        ..Default::default()
    };

    if results.is_empty() {
        return metrics;
    }

    let mut total_latency = 0.0;
    for result in results {
        if result.error.is_some() {
            metrics.errors += 1;
        } else if result.overall_match {
            metrics.passed += 1;
        } else {
            metrics.failed += 1;
        }
        total_latency += result.latency_ms;
    }

    let non_error = metrics.total_cases - metrics.errors;
    if non_error > 0 {
        metrics.overall_accuracy = metrics.passed as f64 / non_error as f64;
    }
    metrics.avg_latency_ms = total_latency / metrics.total_cases as f64;

    for field in FILTER_FIELDS {
        metrics
            .filter_metrics
            .insert(field.to_string(), compute_filter_metrics(field, results));
    }

    let mut grouped: BTreeMap<String, Vec<&ToolParamsEvalResult>> = BTreeMap::new();
    for result in results {
        let category = categories_by_case
            .get(&result.case_id)
            .cloned()
            .unwrap_or_else(|| "general".to_string());
        grouped.entry(category).or_default().push(result);
    }

    for (category, group) in grouped {
        let mut cm = CategoryMetrics {
            category: category.clone(),
            total_cases: group.len(),
            ..Default::default()
        };
        for result in &group {
            if result.error.is_some() {
                cm.errors += 1;
            } else if result.overall_match {
                cm.passed += 1;
            } else {
                cm.failed += 1;
            }
        }
        if cm.total_cases > 0 {
            cm.pass_rate = cm.passed as f64 / cm.total_cases as f64;
        }
        metrics.category_metrics.insert(category, cm);
    }

    metrics
}

pub fn format_metrics_report(metrics: &ToolParamsMetrics) -> String {
    let mut out = String::new();
    let bar = "=".repeat(60);
    let rule = "-".repeat(40);

    let _ = writeln!(out, "{}", bar);
    let _ = writeln!(out, "AGENT TOOL PARAMETER EVALUATION REPORT");
    let _ = writeln!(out, "{}\n", bar);

    let _ = writeln!(out, "OVERALL RESULTS");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Total Cases:      {}", metrics.total_cases);
    let _ = writeln!(out, "Passed:           {}", metrics.passed);
    let _ = writeln!(out, "Failed:           {}", metrics.failed);
    let _ = writeln!(out, "Errors:           {}", metrics.errors);
    let _ = writeln!(
        out,
        "Overall Accuracy: {:.1}%",
        metrics.overall_accuracy * 100.0
    );
    let _ = writeln!(out, "Avg Latency:      {:.1}ms\n", metrics.avg_latency_ms);

    let _ = writeln!(out, "FILTER-LEVEL METRICS");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(
        out,
        "{:<12} {:>10} {:>10} {:>10} {:>10}",
        "Filter", "Precision", "Recall", "F1", "Accuracy"
    );
    let _ = writeln!(out, "{}", "-".repeat(54));
    for (name, fm) in &metrics.filter_metrics {
        let _ = writeln!(
            out,
            "{:<12} {:>9.1}% {:>9.1}% {:>9.1}% {:>9.1}%",
            name,
            fm.precision * 100.0,
            fm.recall * 100.0,
            fm.f1_score * 100.0,
            fm.accuracy * 100.0
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "CATEGORY BREAKDOWN");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(
        out,
        "{:<20} {:>8} {:>8} {:>8} {:>10}",
        "Category", "Total", "Pass", "Fail", "Rate"
    );
    let _ = writeln!(out, "{}", "-".repeat(56));
    for (category, cm) in &metrics.category_metrics {
        let _ = writeln!(
            out,
            "{:<20} {:>8} {:>8} {:>8} {:>9.1}%",
            category,
            cm.total_cases,
            cm.passed,
            cm.failed,
            cm.pass_rate * 100.0
        );
    }
    let _ = writeln!(out, "\n{}", bar);

    out
}

pub fn format_detailed_results(results: &[ToolParamsEvalResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "DETAILED RESULTS");
    let _ = writeln!(out, "{}", "=".repeat(60));

    for result in results {
        let status = if result.error.is_some() {
            "ERROR"
        } else if result.overall_match {
            "PASS"
        } else {
            "FAIL"
        };

        let _ = writeln!(out, "\nCase: {} [{}]", result.case_id, status);
        let _ = writeln!(out, "Query: {}", result.query);
        let _ = writeln!(out, "Latency: {:.1}ms", result.latency_ms);

        if let Some(error) = &result.error {
            let _ = writeln!(out, "Error: {}", error);
            continue;
        }

        let _ = writeln!(out, "Expected Filters:");
        for field in FILTER_FIELDS {
            if let Some(value) = result.expected_filters.get(field) {
                let _ = writeln!(out, "  {}: {}", field, value);
            }
        }

        let _ = writeln!(out, "Actual Filters:");
        if result.actual_filters.is_empty() {
            let _ = writeln!(out, "  (none)");
        } else {
            for (field, value) in &result.actual_filters {
                let status = if result.filter_matches.get(field).copied().unwrap_or(false) {
                    "OK"
                } else {
                    "MISMATCH"
                };
                let _ = writeln!(out, "  {}: {} [{}]", field, value, status);
            }
        }

        if !result.tool_calls.is_empty() {
            let _ = writeln!(out, "Tool Calls: {}", result.tool_calls.len());
            for call in &result.tool_calls {
                let _ = writeln!(out, "  - query: {}", call.query);
            }
        }

        let _ = writeln!(out, "{}", "-".repeat(40));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::tool_params::types::{compare_filters, ExpectedFilters};

    fn result(
        case_id: &str,
        expected: ExpectedFilters,
        actual: &[(&str, &str)],
        error: Option<&str>,
    ) -> ToolParamsEvalResult {
        let actual: BTreeMap<String, String> = actual
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let (filter_matches, overall_match) = compare_filters(&expected, &actual);
        ToolParamsEvalResult {
            case_id: case_id.to_string(),
            query: "q".to_string(),
            expected_filters: expected,
            actual_filters: actual,
            tool_calls: Vec::new(),
            filter_matches,
            overall_match,
            answer: String::new(),
            latency_ms: 100.0,
            error: error.map(String::from),
        }
    }

    #[test]
    fn confusion_matrix_counts() {
        let speaker = |name: &str| ExpectedFilters {
            speaker: Some(name.to_string()),
            ..Default::default()
        };
        let results = vec![
            // TP: expected and bound correctly
            result("a", speaker("Elon Musk"), &[("speaker", "Elon Musk")], None),
            // FN: expected but not bound
            result("b", speaker("Sam Altman"), &[], None),
            // FP: bound but not expected
            result("c", ExpectedFilters::default(), &[("speaker", "Someone")], None),
            // TN: neither
            result("d", ExpectedFilters::default(), &[], None),
        ];

        let metrics = compute_tool_params_metrics(&results, &BTreeMap::new());
        let speaker_metrics = &metrics.filter_metrics["speaker"];
        assert_eq!(speaker_metrics.true_positives, 1);
        assert_eq!(speaker_metrics.false_negatives, 1);
        assert_eq!(speaker_metrics.false_positives, 1);
        assert_eq!(speaker_metrics.true_negatives, 1);
        assert!((speaker_metrics.accuracy - 0.5).abs() < 1e-9);
        assert!((speaker_metrics.precision - 0.5).abs() < 1e-9);
        assert!((speaker_metrics.recall - 0.5).abs() < 1e-9);
    }

    #[test]
    fn errors_are_excluded_from_accuracy() {
        let results = vec![
            result("a", ExpectedFilters::default(), &[], None),
            result("b", ExpectedFilters::default(), &[], Some("boom")),
        ];
        let metrics = compute_tool_params_metrics(&results, &BTreeMap::new());
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.passed, 1);
        assert!((metrics.overall_accuracy - 1.0).abs() < 1e-9);
    }

    #[test]
    fn category_pass_rates() {
        let mut categories = BTreeMap::new();
        categories.insert("a".to_string(), "speaker_filter".to_string());
        categories.insert("b".to_string(), "speaker_filter".to_string());

        let expected = ExpectedFilters {
            speaker: Some("X".to_string()),
            ..Default::default()
        };
        let results = vec![
            result("a", expected.clone(), &[("speaker", "X")], None),
            result("b", expected, &[], None),
        ];
        let metrics = compute_tool_params_metrics(&results, &categories);
        let cm = &metrics.category_metrics["speaker_filter"];
        assert_eq!(cm.total_cases, 2);
        assert_eq!(cm.passed, 1);
        assert!((cm.pass_rate - 0.5).abs() < 1e-9);
    }
}
