pub mod expand;
pub mod fts;
pub mod hybrid;
pub mod models;
pub mod vector;

use crate::database::Repository;
use crate::observability::trace::SpanRecorder;
use crate::services::embedding::Embedder;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use fts::FtsRetriever;
use hybrid::HybridRetriever;
use models::{RetrievalMode, RetrievalParams, RetrievalResponse, RetrievalResult};
use std::sync::Arc;
use uuid::Uuid;
use vector::VectorRetriever;

/// Narrow seam the agents and the eval harness retrieve through. The
/// API layer dispatches on [`RetrievalMode`]; callers of this trait
/// don't care which retriever answered. `parent_span` nests the
/// retrieval's trace span under the caller's.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        params: &RetrievalParams,
        parent_span: Option<Uuid>,
    ) -> Result<Vec<RetrievalResult>, ApiError>;
}

/// Mode-dispatching facade over the three retrievers.
pub struct RetrieverService {
    fts: FtsRetriever,
    vector: VectorRetriever,
    hybrid: HybridRetriever,
}

impl RetrieverService {
    pub fn new(repository: Arc<Repository>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            fts: FtsRetriever::new(repository.clone()),
            vector: VectorRetriever::new(repository.clone(), embedder.clone()),
            hybrid: HybridRetriever::new(repository, embedder),
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        params: &RetrievalParams,
        parent_span: Option<Uuid>,
    ) -> Result<RetrievalResponse, ApiError> {
        let span = SpanRecorder::start("retrieval", parent_span);
        let span_id = span.id();
        let result = match params.mode {
            RetrievalMode::Fts => {
                self.fts
                    .retrieve(query, params.max_returned, &params.filters, params.operator)
                    .await
            }
            RetrievalMode::Vector => {
                self.vector
                    .retrieve(query, params.max_returned, &params.filters, Some(span_id))
                    .await
            }
            RetrievalMode::Hybrid => {
                self.hybrid
                    .retrieve(
                        query,
                        params.max_returned,
                        &params.filters,
                        params.fts_candidates,
                        params.operator,
                        Some(span_id),
                    )
                    .await
            }
        };
        span.finish(result.is_ok());
        result
    }

    pub fn fts(&self) -> &FtsRetriever {
        &self.fts
    }

    pub fn vector(&self) -> &VectorRetriever {
        &self.vector
    }

    pub fn hybrid(&self) -> &HybridRetriever {
        &self.hybrid
    }
}

#[async_trait]
impl SearchProvider for RetrieverService {
    async fn search(
        &self,
        query: &str,
        params: &RetrievalParams,
        parent_span: Option<Uuid>,
    ) -> Result<Vec<RetrievalResult>, ApiError> {
        Ok(self.retrieve(query, params, parent_span).await?.chunks)
    }
}
