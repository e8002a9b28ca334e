use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Document type as stored in `docs.doc_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Transcript,
    Blog,
    Text,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Transcript => "transcript",
            DocType::Blog => "blog",
            DocType::Text => "text",
        }
    }
}

/// Document to be ingested. Immutable once committed.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub source: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub doc_type: DocType,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub raw_text: String,
}

/// Speaker turn to be inserted under a document. `ord` is zero-based
/// within the document.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub ord: i32,
    pub speaker: String,
    pub start_time_s: Option<f64>,
    pub section: Option<String>,
    pub text: String,
    pub token_count: i32,
}

/// Chunk to be inserted under a document. `turn_index` points into the
/// turn list inserted in the same transaction, if the chunk was cut from
/// a turn.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub ord: i32,
    pub turn_index: Option<usize>,
    pub text: String,
    pub token_count: i32,
}

/// Retrieval row: chunk joined with document metadata and inherited
/// speaker. `score` is mode-specific (ts_rank or cosine similarity) and
/// only comparable within a single retrieval call.
#[derive(Debug, Clone, FromRow)]
pub struct RetrievedChunkRow {
    pub chunk_id: i64,
    pub doc_id: i64,
    pub ord: i32,
    pub text: String,
    pub score: f64,
    pub url: Option<String>,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub source: String,
    pub speaker: String,
}

/// Candidate similarity computed store-side during hybrid reranking.
#[derive(Debug, Clone, FromRow)]
pub struct CandidateSimilarity {
    pub chunk_id: i64,
    pub similarity: f64,
}

/// Turn row joined with its document's metadata.
#[derive(Debug, Clone, FromRow)]
pub struct TurnRow {
    pub turn_id: i64,
    pub doc_id: i64,
    pub ord: i32,
    pub speaker: String,
    pub start_time_s: Option<f64>,
    pub section: Option<String>,
    pub text: String,
    pub token_count: i32,
    pub url: Option<String>,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub source: String,
}

/// Turn row annotated with the chunk it was reached through.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkTurnRow {
    pub chunk_id: i64,
    #[sqlx(flatten)]
    pub turn: TurnRow,
}
