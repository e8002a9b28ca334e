use super::models::{RetrievalFilters, RetrievalResponse, RetrievalResult, RetrievalTiming};
use crate::database::Repository;
use crate::services::embedding::Embedder;
use crate::utils::error::ApiError;
use crate::utils::timing::{round_ms, Timer};
use pgvector::Vector;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Semantic retriever: query embedding, then a store-side cosine scan
/// over `chunk_embeddings`. Distance converts to similarity as
/// `1 - distance`; ties break by ascending chunk id.
pub struct VectorRetriever {
    repository: Arc<Repository>,
    embedder: Arc<dyn Embedder>,
}

impl VectorRetriever {
    pub fn new(repository: Arc<Repository>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            repository,
            embedder,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        n: usize,
        filters: &RetrievalFilters,
        parent_span: Option<Uuid>,
    ) -> Result<RetrievalResponse, ApiError> {
        if n == 0 {
            return Err(ApiError::BadInput("n must be >= 1".to_string()));
        }

        let mut timer = Timer::start();
        let query_embedding = self.embedder.embed(query, parent_span).await?;
        let embedding_ms = round_ms(timer.lap_ms());

        let rows = self
            .repository
            .query_chunks_vector(Vector::from(query_embedding), filters, n)
            .await?;
        let retrieval_ms = round_ms(timer.elapsed_ms());

        debug!(
            results = rows.len(),
            embedding_ms, retrieval_ms, "vector retrieval complete"
        );

        Ok(RetrievalResponse {
            chunks: rows.into_iter().map(RetrievalResult::from).collect(),
            timing_ms: RetrievalTiming {
                embedding_ms: Some(embedding_ms),
                retrieval_ms: Some(retrieval_ms),
                total_ms: round_ms(embedding_ms + retrieval_ms),
                ..Default::default()
            },
        })
    }

    /// EXPLAIN output plus the embedding latency the explain itself paid.
    pub async fn explain(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        n: usize,
    ) -> Result<(String, f64), ApiError> {
        let timer = Timer::start();
        let query_embedding = self.embedder.embed(query, None).await?;
        let embedding_ms = round_ms(timer.elapsed_ms());

        let explain = self
            .repository
            .explain_chunks_vector(Vector::from(query_embedding), filters, n)
            .await?;

        Ok((explain, embedding_ms))
    }
}
