use crate::config::Settings;
use crate::database::models::{DocType, NewChunk, NewDocument, NewTurn};
use crate::database::Repository;
use crate::services::embedding::Embedder;
use crate::utils::error::ApiError;
use crate::utils::timing::{round_ms, Timer};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::{info, warn};

/// A token-bounded slice produced by the chunker, ordered within its
/// input text.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub text: String,
    pub token_count: usize,
    pub ord: usize,
}

/// Token-based chunker over the cl100k tokenizer.
///
/// Windows of at most `max_tokens`, stepping back `overlap_tokens`
/// between windows. Slices under `min_tokens` are dropped unless they
/// close out the input.
pub struct TokenChunker {
    min_tokens: usize,
    max_tokens: usize,
    overlap_tokens: usize,
    bpe: CoreBPE,
}

impl TokenChunker {
    pub fn new(min_tokens: usize, max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        anyhow::ensure!(max_tokens > 0, "max_tokens must be positive");
        anyhow::ensure!(
            overlap_tokens < max_tokens,
            "overlap_tokens must be smaller than max_tokens"
        );
        Ok(Self {
            min_tokens,
            max_tokens,
            overlap_tokens,
            bpe: cl100k_base()?,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.chunk_min_tokens,
            settings.chunk_max_tokens,
            settings.chunk_overlap_tokens,
        )
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    pub fn chunk(&self, text: &str) -> Result<Vec<ChunkPiece>> {
        let tokens = self.bpe.encode_ordinary(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut ord = 0usize;

        loop {
            let end = (start + self.max_tokens).min(tokens.len());
            let window = &tokens[start..end];

            if window.len() >= self.min_tokens || end == tokens.len() {
                let chunk_text = self.bpe.decode(window.to_vec())?;
                let trimmed = chunk_text.trim();
                if !trimmed.is_empty() {
                    chunks.push(ChunkPiece {
                        text: trimmed.to_string(),
                        token_count: window.len(),
                        ord,
                    });
                    ord += 1;
                }
            }

            if end == tokens.len() {
                break;
            }
            start = end - self.overlap_tokens;
        }

        Ok(chunks)
    }
}

/// One speaker turn supplied with a transcript ingest request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnPayload {
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub start_time_s: Option<f64>,
    #[serde(default)]
    pub section: Option<String>,
}

/// Ingest request after HTTP-level validation.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub text: String,
    pub title: Option<String>,
    pub source: String,
    pub url: Option<String>,
    pub doc_type: DocType,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub turns: Vec<TurnPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub doc_id: i64,
    pub chunk_count: usize,
    pub turn_count: usize,
    pub total_tokens: usize,
    pub embeddings_generated: bool,
    pub ingestion_time_ms: f64,
}

/// Chunk → embed → store pipeline. All writes for one document commit
/// or roll back together; retrieval never sees a half-ingested doc.
pub struct IngestionService {
    repository: Arc<Repository>,
    embedder: Option<Arc<dyn Embedder>>,
    chunker: TokenChunker,
}

impl IngestionService {
    pub fn new(
        repository: Arc<Repository>,
        embedder: Option<Arc<dyn Embedder>>,
        chunker: TokenChunker,
    ) -> Self {
        Self {
            repository,
            embedder,
            chunker,
        }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReport, ApiError> {
        let timer = Timer::start();

        if request.text.trim().is_empty() && request.turns.is_empty() {
            return Err(ApiError::BadInput("text must not be empty".to_string()));
        }

        // Chunk outside the transaction; only the writes hold a connection
        let (new_turns, new_chunks, raw_text) = self.prepare(&request)?;
        let total_tokens: usize = new_chunks.iter().map(|c| c.token_count as usize).sum();

        let embeddings = match &self.embedder {
            Some(embedder) if !new_chunks.is_empty() => {
                let texts: Vec<String> = new_chunks.iter().map(|c| c.text.clone()).collect();
                Some(embedder.embed_batch(&texts, None).await?)
            }
            _ => None,
        };

        let doc = NewDocument {
            source: request.source,
            url: request.url,
            title: request.title,
            doc_type: request.doc_type,
            published_at: request.published_at,
            metadata: request.metadata,
            raw_text,
        };

        let mut tx = self.repository.begin().await?;
        let doc_id = self.repository.insert_doc(&mut tx, &doc).await?;
        let turn_ids = self
            .repository
            .insert_turns(&mut tx, doc_id, &new_turns)
            .await?;
        let chunk_ids = self
            .repository
            .insert_chunks_with_turn(&mut tx, doc_id, &new_chunks, &turn_ids)
            .await?;

        let embeddings_generated = match embeddings {
            Some(vectors) => {
                let pairs: Vec<(i64, Vec<f32>)> =
                    chunk_ids.iter().copied().zip(vectors).collect();
                self.repository.insert_embeddings(&mut tx, &pairs).await?;
                true
            }
            None => {
                if self.embedder.is_none() {
                    warn!("no embedder configured, skipping embeddings for doc");
                }
                false
            }
        };

        tx.commit().await.map_err(ApiError::from)?;

        let report = IngestReport {
            doc_id,
            chunk_count: chunk_ids.len(),
            turn_count: turn_ids.len(),
            total_tokens,
            embeddings_generated,
            ingestion_time_ms: round_ms(timer.elapsed_ms()),
        };
        info!(
            doc_id,
            chunks = report.chunk_count,
            turns = report.turn_count,
            "document ingested"
        );

        Ok(report)
    }

    /// Cuts turns and chunks. Chunks never cross turn boundaries; plain
    /// text without turns chunks as one stream.
    fn prepare(
        &self,
        request: &IngestRequest,
    ) -> Result<(Vec<NewTurn>, Vec<NewChunk>, String), ApiError> {
        let mut new_turns = Vec::new();
        let mut new_chunks = Vec::new();

        if request.turns.is_empty() {
            let pieces = self
                .chunker
                .chunk(&request.text)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            for piece in pieces {
                new_chunks.push(NewChunk {
                    ord: piece.ord as i32,
                    turn_index: None,
                    text: piece.text,
                    token_count: piece.token_count as i32,
                });
            }
            return Ok((new_turns, new_chunks, request.text.clone()));
        }

        let mut doc_ord = 0i32;
        for (turn_index, turn) in request.turns.iter().enumerate() {
            new_turns.push(NewTurn {
                ord: turn_index as i32,
                speaker: turn.speaker.clone(),
                start_time_s: turn.start_time_s,
                section: turn.section.clone(),
                text: turn.text.clone(),
                token_count: self.chunker.count_tokens(&turn.text) as i32,
            });

            let pieces = self
                .chunker
                .chunk(&turn.text)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            for piece in pieces {
                new_chunks.push(NewChunk {
                    ord: doc_ord,
                    turn_index: Some(turn_index),
                    text: piece.text,
                    token_count: piece.token_count as i32,
                });
                doc_ord += 1;
            }
        }

        let raw_text = if request.text.trim().is_empty() {
            request
                .turns
                .iter()
                .map(|turn| format!("{}: {}", turn.speaker, turn.text))
                .collect::<Vec<_>>()
                .join("\n\n")
        } else {
            request.text.clone()
        };

        Ok((new_turns, new_chunks, raw_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(min: usize, max: usize, overlap: usize) -> TokenChunker {
        TokenChunker::new(min, max, overlap).unwrap()
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = chunker(5, 20, 2).chunk("").unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_text_becomes_a_single_chunk() {
        let chunks = chunker(400, 800, 50).chunk("a short sentence").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ord, 0);
        assert!(chunks[0].token_count < 400);
    }

    #[test]
    fn long_text_respects_token_bounds() {
        let text = "the quick brown fox jumps over the lazy dog ".repeat(200);
        let chunker = chunker(50, 100, 10);
        let chunks = chunker.chunk(&text).unwrap();

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ord, i);
            assert!(chunk.token_count <= 100);
            if i + 1 < chunks.len() {
                assert!(chunk.token_count >= 50);
            }
        }
    }

    #[test]
    fn overlap_repeats_trailing_tokens() {
        let text = "alpha beta gamma delta epsilon zeta eta theta ".repeat(50);
        let chunker = chunker(10, 40, 8);
        let chunks = chunker.chunk(&text).unwrap();

        assert!(chunks.len() > 1);
        // The second chunk starts with text already seen at the end of
        // the first.
        let first_tail: String = chunks[0]
            .text
            .split_whitespace()
            .rev()
            .take(2)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" ");
        assert!(chunks[1].text.contains(&first_tail));
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        assert!(TokenChunker::new(10, 20, 20).is_err());
        assert!(TokenChunker::new(10, 0, 0).is_err());
    }
}
