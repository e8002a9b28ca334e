use super::fts::FtsRetriever;
use super::models::{
    FtsOperator, RetrievalFilters, RetrievalResponse, RetrievalResult, RetrievalTiming,
};
use crate::database::Repository;
use crate::services::embedding::Embedder;
use crate::utils::error::ApiError;
use crate::utils::timing::{round_ms, Timer};
use pgvector::Vector;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Two-stage retriever: FTS candidate generation for broad recall, then
/// a vector rerank of exactly those candidates for precision.
pub struct HybridRetriever {
    repository: Arc<Repository>,
    fts: FtsRetriever,
    embedder: Arc<dyn Embedder>,
}

impl HybridRetriever {
    pub fn new(repository: Arc<Repository>, embedder: Arc<dyn Embedder>) -> Self {
        let fts = FtsRetriever::new(repository.clone());
        Self {
            repository,
            fts,
            embedder,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        n: usize,
        filters: &RetrievalFilters,
        fts_candidates: usize,
        operator: FtsOperator,
        parent_span: Option<Uuid>,
    ) -> Result<RetrievalResponse, ApiError> {
        if n == 0 {
            return Err(ApiError::BadInput("n must be >= 1".to_string()));
        }
        if fts_candidates == 0 || fts_candidates > 500 {
            return Err(ApiError::BadInput(format!(
                "fts_candidates must be in [1, 500], got {}",
                fts_candidates
            )));
        }

        // Stage 1: broad lexical recall
        let mut timer = Timer::start();
        let fts_results = self
            .fts
            .retrieve(query, fts_candidates, filters, operator)
            .await?;
        let fts_ms = round_ms(timer.lap_ms());

        if fts_results.chunks.is_empty() {
            return Ok(RetrievalResponse {
                chunks: Vec::new(),
                timing_ms: RetrievalTiming {
                    fts_ms: Some(fts_ms),
                    embedding_ms: Some(0.0),
                    reranking_ms: Some(0.0),
                    total_ms: fts_ms,
                    ..Default::default()
                },
            });
        }

        // Stage 2: embed once, rerank store-side
        let query_embedding = self.embedder.embed(query, parent_span).await?;
        let embedding_ms = round_ms(timer.lap_ms());

        let chunk_ids: Vec<i64> = fts_results.chunks.iter().map(|c| c.chunk_id).collect();
        let similarities = self
            .repository
            .rerank_by_vector(Vector::from(query_embedding), &chunk_ids)
            .await?;

        let similarity_map: HashMap<i64, f64> = similarities
            .into_iter()
            .map(|row| (row.chunk_id, row.similarity))
            .collect();

        // Candidates without an embedding drop out of the ranking
        let mut reranked: Vec<RetrievalResult> = fts_results
            .chunks
            .into_iter()
            .filter_map(|mut chunk| {
                similarity_map.get(&chunk.chunk_id).map(|similarity| {
                    chunk.score = *similarity;
                    chunk
                })
            })
            .collect();

        reranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        reranked.truncate(n);

        let reranking_ms = round_ms(timer.elapsed_ms());
        debug!(
            candidates = chunk_ids.len(),
            returned = reranked.len(),
            fts_ms,
            embedding_ms,
            reranking_ms,
            "hybrid retrieval complete"
        );

        Ok(RetrievalResponse {
            chunks: reranked,
            timing_ms: RetrievalTiming {
                fts_ms: Some(fts_ms),
                embedding_ms: Some(embedding_ms),
                reranking_ms: Some(reranking_ms),
                total_ms: round_ms(fts_ms + embedding_ms + reranking_ms),
                ..Default::default()
            },
        })
    }

    /// Two-stage explanation: the FTS plan plus a description of the
    /// rerank, including what the extra embedding cost.
    pub async fn explain(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        fts_candidates: usize,
        operator: FtsOperator,
    ) -> Result<String, ApiError> {
        let fts_explain = self
            .fts
            .explain(query, filters, operator, fts_candidates)
            .await?;

        let timer = Timer::start();
        self.embedder.embed(query, None).await?;
        let embedding_ms = round_ms(timer.elapsed_ms());

        let bar = "=".repeat(80);
        Ok(format!(
            "{bar}\n\
             HYBRID RETRIEVAL EXPLAIN\n\
             {bar}\n\n\
             Stage 1: Full-Text Search (FTS)\n\
             \x20 - Retrieves {fts_candidates} candidates with the configured operator\n\
             \x20 - FTS EXPLAIN ANALYZE:\n\n\
             {fts_explain}\n\n\
             Stage 2: Vector Reranking\n\
             \x20 - Query embedding generation: {embedding_ms:.2}ms\n\
             \x20 - Fetches embeddings for the FTS candidates from chunk_embeddings\n\
             \x20 - Computes cosine similarity between the query and each candidate\n\
             \x20 - Reranks by similarity (descending) and returns the top N\n\n\
             {bar}"
        ))
    }
}
