use crate::database::models::RetrievedChunkRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retrieval mode selected by the API layer; the core dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Fts,
    Vector,
    Hybrid,
}

/// FTS query operator: `or` broadens recall, `and` requires every term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FtsOperator {
    Or,
    And,
}

/// Metadata filters applied to every retrieval mode, combined as AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalFilters {
    /// Exact match on the document source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Exact match on the document type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Half-open range on `published_at`: inclusive start, exclusive end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on the chunk's inherited speaker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl RetrievalFilters {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.doc_type.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
            && self.speaker.is_none()
    }
}

/// Document metadata attached to every retrieved chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub speaker: Option<String>,
}

/// Single retrieved chunk. Scores are only comparable within one
/// retrieval call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: i64,
    pub doc_id: i64,
    pub text: String,
    pub score: f64,
    pub metadata: ChunkMetadata,
    pub ord: i32,
}

impl From<RetrievedChunkRow> for RetrievalResult {
    fn from(row: RetrievedChunkRow) -> Self {
        RetrievalResult {
            chunk_id: row.chunk_id,
            doc_id: row.doc_id,
            text: row.text,
            score: row.score,
            metadata: ChunkMetadata {
                title: row.title,
                url: row.url,
                published_at: row.published_at,
                source: Some(row.source),
                speaker: Some(row.speaker),
            },
            ord: row.ord,
        }
    }
}

/// Per-stage latency breakdown. Stages that a mode does not execute are
/// absent rather than zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranking_ms: Option<f64>,
    pub total_ms: f64,
}

/// Complete retrieval response with timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub chunks: Vec<RetrievalResult>,
    pub timing_ms: RetrievalTiming,
}

/// Parameters shared by the API layer, the agents, and the eval harness.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub mode: RetrievalMode,
    pub operator: FtsOperator,
    pub fts_candidates: usize,
    pub max_returned: usize,
    pub filters: RetrievalFilters,
}

impl RetrievalParams {
    pub const DEFAULT_FTS_CANDIDATES: usize = 100;
    pub const MAX_FTS_CANDIDATES: usize = 500;

    pub fn new(mode: RetrievalMode, max_returned: usize) -> Self {
        Self {
            mode,
            operator: FtsOperator::Or,
            fts_candidates: Self::DEFAULT_FTS_CANDIDATES,
            max_returned,
            filters: RetrievalFilters::default(),
        }
    }
}
