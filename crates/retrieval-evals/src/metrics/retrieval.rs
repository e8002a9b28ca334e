//! Standard IR metrics for retrieval quality.
//!
//! All metrics take the retrieved chunk ids in rank order and the
//! unordered ground-truth ids. Scores live in `[0, 1]`; MRR is `None`
//! rather than zero when nothing relevant was retrieved, so "no match"
//! stays distinguishable from "match at infinity".

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Complete metric set for one query at one `k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub recall_at_k: f64,
    pub precision_at_k: f64,
    pub hit_rate: f64,
    pub mrr: Option<f64>,
    pub ndcg_at_k: f64,
    pub k: usize,
    pub num_retrieved: usize,
    pub num_ground_truth: usize,
    pub num_relevant_retrieved: usize,
}

/// Recall@k = |ground_truth ∩ retrieved[..k]| / |ground_truth|.
/// Zero when the ground truth is empty.
pub fn recall_at_k(retrieved: &[i64], ground_truth: &[i64], k: usize) -> f64 {
    if ground_truth.is_empty() || retrieved.is_empty() {
        return 0.0;
    }

    let truth: HashSet<i64> = ground_truth.iter().copied().collect();
    let relevant = retrieved
        .iter()
        .take(k)
        .filter(|id| truth.contains(id))
        .count();

    relevant as f64 / ground_truth.len() as f64
}

/// Precision@k = |ground_truth ∩ retrieved[..k]| / min(k, |retrieved|).
pub fn precision_at_k(retrieved: &[i64], ground_truth: &[i64], k: usize) -> f64 {
    if ground_truth.is_empty() || retrieved.is_empty() {
        return 0.0;
    }

    let truth: HashSet<i64> = ground_truth.iter().copied().collect();
    let top_k = &retrieved[..retrieved.len().min(k)];
    let relevant = top_k.iter().filter(|id| truth.contains(id)).count();

    relevant as f64 / top_k.len() as f64
}

/// 1.0 iff any ground-truth id appears in the top k.
pub fn hit_rate(retrieved: &[i64], ground_truth: &[i64], k: usize) -> f64 {
    if ground_truth.is_empty() || retrieved.is_empty() {
        return 0.0;
    }

    let truth: HashSet<i64> = ground_truth.iter().copied().collect();
    if retrieved.iter().take(k).any(|id| truth.contains(id)) {
        1.0
    } else {
        0.0
    }
}

/// Reciprocal rank of the first relevant item, 1-indexed. `None` when
/// nothing relevant was retrieved.
pub fn mrr(retrieved: &[i64], ground_truth: &[i64]) -> Option<f64> {
    if retrieved.is_empty() || ground_truth.is_empty() {
        return None;
    }

    let truth: HashSet<i64> = ground_truth.iter().copied().collect();
    retrieved
        .iter()
        .position(|id| truth.contains(id))
        .map(|pos| 1.0 / (pos + 1) as f64)
}

/// NDCG@k with binary relevance: `DCG = Σ 1/log2(rank + 1)` over the
/// relevant ranks; `IDCG` assumes the first `min(|ground_truth|, k)`
/// positions are all relevant.
pub fn ndcg_at_k(retrieved: &[i64], ground_truth: &[i64], k: usize) -> f64 {
    if retrieved.is_empty() || ground_truth.is_empty() {
        return 0.0;
    }

    let truth: HashSet<i64> = ground_truth.iter().copied().collect();

    let dcg: f64 = retrieved
        .iter()
        .take(k)
        .enumerate()
        .filter(|(_, id)| truth.contains(id))
        .map(|(i, _)| 1.0 / ((i + 2) as f64).log2())
        .sum();

    if dcg == 0.0 {
        return 0.0;
    }

    let num_relevant = ground_truth.len().min(k);
    let idcg: f64 = (1..=num_relevant)
        .map(|rank| 1.0 / ((rank + 1) as f64).log2())
        .sum();

    if idcg == 0.0 {
        return 0.0;
    }

    dcg / idcg
}

/// Computes the full metric set for a single query.
pub fn compute_retrieval_metrics(
    retrieved: &[i64],
    ground_truth: &[i64],
    k: usize,
) -> RetrievalMetrics {
    assert!(k >= 1, "k must be >= 1, got {}", k);

    let truth: HashSet<i64> = ground_truth.iter().copied().collect();
    let top_k: HashSet<i64> = retrieved.iter().take(k).copied().collect();
    let num_relevant_retrieved = truth.intersection(&top_k).count();

    RetrievalMetrics {
        recall_at_k: recall_at_k(retrieved, ground_truth, k),
        precision_at_k: precision_at_k(retrieved, ground_truth, k),
        hit_rate: hit_rate(retrieved, ground_truth, k),
        mrr: mrr(retrieved, ground_truth),
        ndcg_at_k: ndcg_at_k(retrieved, ground_truth, k),
        k,
        num_retrieved: retrieved.len(),
        num_ground_truth: ground_truth.len(),
        num_relevant_retrieved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn recall_precision_hit_mrr_worked_example() {
        let retrieved = [10, 20, 30, 40, 50];
        let ground_truth = [20, 30, 60];
        let metrics = compute_retrieval_metrics(&retrieved, &ground_truth, 3);

        assert!((metrics.recall_at_k - 2.0 / 3.0).abs() < EPS);
        assert!((metrics.precision_at_k - 2.0 / 3.0).abs() < EPS);
        assert_eq!(metrics.hit_rate, 1.0);
        assert!((metrics.mrr.unwrap() - 0.5).abs() < EPS);
        assert_eq!(metrics.num_relevant_retrieved, 2);
    }

    #[test]
    fn ndcg_is_one_for_perfect_ranking() {
        assert!((ndcg_at_k(&[1, 2, 3], &[1, 2], 3) - 1.0).abs() < EPS);
    }

    #[test]
    fn permutation_of_ground_truth_scores_one_everywhere() {
        let retrieved = [3, 1, 2];
        let ground_truth = [1, 2, 3];
        let metrics = compute_retrieval_metrics(&retrieved, &ground_truth, 5);

        assert_eq!(metrics.recall_at_k, 1.0);
        assert_eq!(metrics.precision_at_k, 1.0);
        assert_eq!(metrics.hit_rate, 1.0);
        assert_eq!(metrics.mrr, Some(1.0));
        assert!((metrics.ndcg_at_k - 1.0).abs() < EPS);
    }

    #[test]
    fn disjoint_lists_score_zero_and_mrr_is_none() {
        let retrieved = [1, 2, 3];
        let ground_truth = [4, 5];
        let metrics = compute_retrieval_metrics(&retrieved, &ground_truth, 3);

        assert_eq!(metrics.recall_at_k, 0.0);
        assert_eq!(metrics.precision_at_k, 0.0);
        assert_eq!(metrics.hit_rate, 0.0);
        assert_eq!(metrics.mrr, None);
        assert_eq!(metrics.ndcg_at_k, 0.0);
    }

    #[test]
    fn hit_rate_iff_recall_positive() {
        let cases: [(&[i64], &[i64]); 4] = [
            (&[1, 2, 3], &[3]),
            (&[1, 2, 3], &[9]),
            (&[], &[1]),
            (&[5, 6], &[5, 6, 7]),
        ];
        for (retrieved, ground_truth) in cases {
            let recall = recall_at_k(retrieved, ground_truth, 3);
            let hit = hit_rate(retrieved, ground_truth, 3);
            assert_eq!(hit == 1.0, recall > 0.0);
        }
    }

    #[test]
    fn swapping_non_relevant_neighbours_changes_nothing() {
        let ground_truth = [2];
        let original = [1, 2, 3, 4];
        let swapped = [1, 2, 4, 3];

        for k in 1..=4 {
            let a = compute_retrieval_metrics(&original, &ground_truth, k);
            let b = compute_retrieval_metrics(&swapped, &ground_truth, k);
            assert_eq!(a.recall_at_k, b.recall_at_k);
            assert_eq!(a.precision_at_k, b.precision_at_k);
            assert_eq!(a.hit_rate, b.hit_rate);
            assert_eq!(a.mrr, b.mrr);
            assert!((a.ndcg_at_k - b.ndcg_at_k).abs() < EPS);
        }
    }

    #[test]
    fn all_metrics_stay_in_unit_interval() {
        let retrieved = [1, 2, 3, 4, 5, 6, 7];
        let ground_truth = [2, 9, 5];
        for k in [1, 3, 5, 10] {
            let m = compute_retrieval_metrics(&retrieved, &ground_truth, k);
            for value in [m.recall_at_k, m.precision_at_k, m.hit_rate, m.ndcg_at_k] {
                assert!((0.0..=1.0).contains(&value));
            }
            if let Some(mrr) = m.mrr {
                assert!(mrr > 0.0 && mrr <= 1.0);
            }
        }
    }

    #[test]
    fn empty_ground_truth_scores_zero() {
        let metrics = compute_retrieval_metrics(&[1, 2], &[], 2);
        assert_eq!(metrics.recall_at_k, 0.0);
        assert_eq!(metrics.precision_at_k, 0.0);
        assert_eq!(metrics.mrr, None);
    }

    #[test]
    #[should_panic(expected = "k must be >= 1")]
    fn zero_k_panics() {
        compute_retrieval_metrics(&[1], &[1], 0);
    }
}
