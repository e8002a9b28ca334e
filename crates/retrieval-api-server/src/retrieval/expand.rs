use super::models::ChunkMetadata;
use crate::database::models::TurnRow;
use crate::database::Repository;
use crate::utils::error::ApiError;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const MIN_TOKEN_BUDGET: usize = 100;
pub const DEFAULT_TOKEN_BUDGET: usize = 8000;

/// A bare turn, used for preceding questions and QA pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnText {
    pub turn_id: i64,
    pub doc_id: i64,
    pub ord: i32,
    pub speaker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_s: Option<f64>,
    pub text: String,
    pub token_count: i32,
}

impl From<TurnRow> for TurnText {
    fn from(row: TurnRow) -> Self {
        TurnText {
            turn_id: row.turn_id,
            doc_id: row.doc_id,
            ord: row.ord,
            speaker: row.speaker,
            section: row.section,
            start_time_s: row.start_time_s,
            text: row.text,
            token_count: row.token_count,
        }
    }
}

/// A turn expanded from retrieved chunks: full turn text, document
/// metadata, the best score among the source chunks, and optionally the
/// turn that precedes it in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnView {
    pub turn_id: i64,
    pub doc_id: i64,
    pub ord: i32,
    pub speaker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_s: Option<f64>,
    pub text: String,
    pub token_count: i32,
    pub score: f64,
    pub metadata: ChunkMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preceding_question: Option<TurnText>,
}

impl TurnView {
    /// Tokens this view contributes to the budget, preceding question
    /// included when present.
    pub fn budget_cost(&self) -> usize {
        let own = self.token_count.max(0) as usize;
        let preceding = self
            .preceding_question
            .as_ref()
            .map(|p| p.token_count.max(0) as usize)
            .unwrap_or(0);
        own + preceding
    }
}

/// A `(previous_turn, this_turn)` pair, typically question and answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaPair {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_turn: Option<TurnText>,
    pub turn: TurnText,
}

/// Walks turns in rank order, keeping each while the running token total
/// stays within `token_budget`. Stops at the first turn that would
/// exceed the budget; later, smaller turns are not considered.
pub fn assemble_under_budget(ranked: Vec<TurnView>, token_budget: usize) -> Vec<TurnView> {
    let mut assembled = Vec::new();
    let mut total = 0usize;

    for view in ranked {
        let cost = view.budget_cost();
        if total + cost > token_budget {
            break;
        }
        total += cost;
        assembled.push(view);
    }

    assembled
}

/// Groups retrieved chunks back into the speaker turns they came from.
pub struct TurnExpander {
    repository: Arc<Repository>,
}

impl TurnExpander {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }

    /// Expands scored chunk ids into unique turns under a token budget.
    ///
    /// The same turn referenced by several chunks appears once, carrying
    /// the maximum score observed among its chunks. Chunks that do not
    /// belong to a turn (non-transcript documents) are skipped.
    pub async fn expand(
        &self,
        chunks: &[(i64, f64)],
        token_budget: usize,
        include_preceding_question: bool,
    ) -> Result<Vec<TurnView>, ApiError> {
        if token_budget < MIN_TOKEN_BUDGET {
            return Err(ApiError::BadInput(format!(
                "token_budget must be >= {}, got {}",
                MIN_TOKEN_BUDGET, token_budget
            )));
        }

        let mut score_by_chunk: HashMap<i64, f64> = HashMap::new();
        for (chunk_id, score) in chunks {
            let entry = score_by_chunk.entry(*chunk_id).or_insert(f64::MIN);
            if *score > *entry {
                *entry = *score;
            }
        }

        let chunk_ids: Vec<i64> = score_by_chunk.keys().copied().collect();
        let rows = self.repository.fetch_turns_by_chunk_ids(&chunk_ids).await?;

        // Deduplicate by turn, keeping the best chunk score per turn
        let mut by_turn: HashMap<i64, (TurnRow, f64)> = HashMap::new();
        for row in rows {
            let score = score_by_chunk
                .get(&row.chunk_id)
                .copied()
                .unwrap_or(f64::MIN);
            match by_turn.entry(row.turn.turn_id) {
                Entry::Occupied(mut entry) => {
                    let (_, best) = entry.get_mut();
                    if score > *best {
                        *best = score;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert((row.turn, score));
                }
            }
        }

        let preceding = if include_preceding_question {
            let pairs: Vec<(i64, i32)> = by_turn
                .values()
                .map(|(turn, _)| (turn.doc_id, turn.ord))
                .collect();
            self.repository
                .fetch_previous_turns(&pairs)
                .await?
                .into_iter()
                .map(|row| ((row.doc_id, row.ord), row))
                .collect::<HashMap<(i64, i32), TurnRow>>()
        } else {
            HashMap::new()
        };

        let mut ranked: Vec<TurnView> = by_turn
            .into_values()
            .map(|(turn, score)| {
                let preceding_question = preceding
                    .get(&(turn.doc_id, turn.ord - 1))
                    .cloned()
                    .map(TurnText::from);
                TurnView {
                    turn_id: turn.turn_id,
                    doc_id: turn.doc_id,
                    ord: turn.ord,
                    speaker: turn.speaker,
                    section: turn.section,
                    start_time_s: turn.start_time_s,
                    text: turn.text,
                    token_count: turn.token_count,
                    score,
                    metadata: ChunkMetadata {
                        title: turn.title,
                        url: turn.url,
                        published_at: turn.published_at,
                        source: Some(turn.source),
                        speaker: None,
                    },
                    preceding_question,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.turn_id.cmp(&b.turn_id))
        });

        let assembled = assemble_under_budget(ranked, token_budget);
        debug!(
            turns = assembled.len(),
            token_budget, "turn expansion complete"
        );

        Ok(assembled)
    }

    /// For each turn id, the turn and its predecessor in the same
    /// document. Output order follows the input order; unknown ids are
    /// skipped.
    pub async fn qa_pairs(&self, turn_ids: &[i64]) -> Result<Vec<QaPair>, ApiError> {
        let rows = self.repository.fetch_turns_by_ids(turn_ids).await?;
        let by_id: HashMap<i64, TurnRow> =
            rows.into_iter().map(|row| (row.turn_id, row)).collect();

        let pairs: Vec<(i64, i32)> = by_id
            .values()
            .map(|turn| (turn.doc_id, turn.ord))
            .collect();
        let previous: HashMap<(i64, i32), TurnRow> = self
            .repository
            .fetch_previous_turns(&pairs)
            .await?
            .into_iter()
            .map(|row| ((row.doc_id, row.ord), row))
            .collect();

        let mut result = Vec::new();
        for turn_id in turn_ids {
            let Some(turn) = by_id.get(turn_id) else {
                continue;
            };
            let previous_turn = previous
                .get(&(turn.doc_id, turn.ord - 1))
                .cloned()
                .map(TurnText::from);
            result.push(QaPair {
                previous_turn,
                turn: TurnText::from(turn.clone()),
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(turn_id: i64, token_count: i32, score: f64) -> TurnView {
        TurnView {
            turn_id,
            doc_id: 1,
            ord: turn_id as i32,
            speaker: "Guest".to_string(),
            section: None,
            start_time_s: None,
            text: format!("turn {}", turn_id),
            token_count,
            score,
            metadata: ChunkMetadata::default(),
            preceding_question: None,
        }
    }

    #[test]
    fn budget_stops_at_first_exceedance() {
        // 60 + 80 = 140 fits in 150; the 100-token turn would exceed and
        // assembly stops there rather than skipping past it.
        let ranked = vec![view(1, 60, 0.9), view(2, 80, 0.8), view(3, 100, 0.7)];
        let assembled = assemble_under_budget(ranked, 150);
        assert_eq!(
            assembled.iter().map(|v| v.turn_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn budget_does_not_skip_and_continue() {
        // The second turn exceeds; the third would fit but is never
        // considered.
        let ranked = vec![view(1, 50, 0.9), view(2, 200, 0.8), view(3, 10, 0.7)];
        let assembled = assemble_under_budget(ranked, 100);
        assert_eq!(
            assembled.iter().map(|v| v.turn_id).collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn preceding_question_counts_against_budget() {
        let mut first = view(1, 60, 0.9);
        first.preceding_question = Some(TurnText {
            turn_id: 0,
            doc_id: 1,
            ord: 0,
            speaker: "Host".to_string(),
            section: None,
            start_time_s: None,
            text: "question".to_string(),
            token_count: 50,
        });
        let ranked = vec![first, view(2, 50, 0.8)];
        // 60 + 50 = 110, the next 50 would exceed 150
        let assembled = assemble_under_budget(ranked, 150);
        assert_eq!(assembled.len(), 1);
        assert_eq!(assembled[0].turn_id, 1);
    }

    #[test]
    fn total_tokens_never_exceed_budget() {
        let ranked = vec![
            view(1, 40, 0.9),
            view(2, 40, 0.8),
            view(3, 40, 0.7),
            view(4, 40, 0.6),
        ];
        let assembled = assemble_under_budget(ranked, 100);
        let total: usize = assembled.iter().map(|v| v.budget_cost()).sum();
        assert!(total <= 100);
        assert_eq!(assembled.len(), 2);
    }
}
