//! Result schemas and aggregation for retrieval eval runs.

use crate::metrics::retrieval::RetrievalMetrics;
use crate::tasks::retrieval::dataset::{DifficultyLevel, QuestionType};
use chrono::{DateTime, Utc};
use retrieval_api_server::services::llm::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary statistics over one metric across a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub median: f64,
    pub max: f64,
    /// How many items contributed a value. Differs from the run size for
    /// MRR, which is undefined when nothing relevant was retrieved.
    pub count: usize,
}

impl MetricStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        };

        Self {
            mean,
            std: variance.sqrt(),
            min: sorted[0],
            max: sorted[count - 1],
            median,
            count,
        }
    }
}

/// Aggregated metrics for a group of results at one `k`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsBreakdown {
    pub count: usize,
    pub recall: MetricStats,
    pub precision: MetricStats,
    pub hit_rate: MetricStats,
    pub mrr: MetricStats,
    pub ndcg: MetricStats,
    pub latency_ms: MetricStats,
}

/// Per-item evaluation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub eval_id: String,
    pub question: String,
    pub question_type: QuestionType,
    pub difficulty_level: DifficultyLevel,
    pub reference_answer: String,
    pub expected_chunk_ids: Vec<i64>,
    pub generated_answer: String,
    pub retrieved_chunk_ids: Vec<i64>,
    pub metrics_by_k: BTreeMap<usize, RetrievalMetrics>,
    pub latency_ms: f64,
    pub model_used: String,
    pub tokens_used: TokenUsage,
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_queries: Option<Vec<String>>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub eval_id: String,
    pub error: String,
}

/// Complete output of one retrieval eval run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRunResults {
    pub run_id: String,
    pub agent_type: String,
    pub dataset_path: String,
    pub dataset_version: String,
    pub retrieval_mode: String,
    pub fts_candidates: usize,
    pub max_returned: usize,
    pub k_values: Vec<usize>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub results: Vec<EvalResult>,
    pub overall_by_k: BTreeMap<usize, MetricsBreakdown>,
    pub by_difficulty: BTreeMap<String, BTreeMap<usize, MetricsBreakdown>>,
    pub by_question_type: BTreeMap<String, BTreeMap<usize, MetricsBreakdown>>,
    pub num_successful: usize,
    pub num_failed: usize,
    pub errors: Vec<RunError>,
}

impl EvalRunResults {
    pub fn total_examples(&self) -> usize {
        self.results.len()
    }

    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.num_successful as f64 / self.results.len() as f64
        }
    }

    pub fn total_duration_seconds(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Aggregates a result group at one `k`. MRR averages only the items
/// where it is defined; the other metrics average over every result.
pub fn build_metrics_breakdown(results: &[EvalResult], k: usize) -> MetricsBreakdown {
    let mut recall = Vec::new();
    let mut precision = Vec::new();
    let mut hit_rate = Vec::new();
    let mut mrr = Vec::new();
    let mut ndcg = Vec::new();
    let mut latency = Vec::new();

    for result in results {
        if let Some(metrics) = result.metrics_by_k.get(&k) {
            recall.push(metrics.recall_at_k);
            precision.push(metrics.precision_at_k);
            hit_rate.push(metrics.hit_rate);
            ndcg.push(metrics.ndcg_at_k);
            if let Some(value) = metrics.mrr {
                mrr.push(value);
            }
        }
        latency.push(result.latency_ms);
    }

    MetricsBreakdown {
        count: results.len(),
        recall: MetricStats::from_values(&recall),
        precision: MetricStats::from_values(&precision),
        hit_rate: MetricStats::from_values(&hit_rate),
        mrr: MetricStats::from_values(&mrr),
        ndcg: MetricStats::from_values(&ndcg),
        latency_ms: MetricStats::from_values(&latency),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_known_values() {
        let stats = MetricStats::from_values(&[1.0, 2.0, 3.0, 4.0]);
        assert!((stats.mean - 2.5).abs() < 1e-9);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert!((stats.median - 2.5).abs() < 1e-9);
        assert_eq!(stats.count, 4);
    }

    #[test]
    fn stats_of_empty_input_are_zeroed() {
        let stats = MetricStats::from_values(&[]);
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.count, 0);
    }

    #[test]
    fn odd_length_median_is_the_middle_value() {
        let stats = MetricStats::from_values(&[5.0, 1.0, 3.0]);
        assert_eq!(stats.median, 3.0);
    }
}
