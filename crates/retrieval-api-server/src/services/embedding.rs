use crate::config::Settings;
use crate::observability::trace::SpanRecorder;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Text-to-vector boundary. The one seam the retrievers depend on, so
/// tests can substitute a mock. `parent_span` nests the embedding's
/// trace span under the caller's.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str, parent_span: Option<Uuid>) -> Result<Vec<f32>, ApiError>;
    async fn embed_batch(
        &self,
        texts: &[String],
        parent_span: Option<Uuid>,
    ) -> Result<Vec<Vec<f32>>, ApiError>;
}

/// OpenAI-compatible embedding client (`/v1/embeddings`).
///
/// Every returned vector is checked against the configured
/// dimensionality; a mismatch is a protocol error, not a retriable one.
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    pub dimensions: usize,
}

impl EmbeddingService {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: settings.openai_base_url.clone(),
            api_key: settings.openai_api_key.clone(),
            model: settings.embedding_model.clone(),
            dimensions: settings.embedding_dimensions,
        }
    }

    /// One provider call per batch, results in input order.
    async fn request_embeddings(
        &self,
        texts: &[String],
        parent_span: Option<Uuid>,
    ) -> Result<Vec<Vec<f32>>, ApiError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let span = SpanRecorder::start("embedding", parent_span);
        let result = self.request_embeddings_inner(texts).await;
        span.finish(result.is_ok());
        result
    }

    async fn request_embeddings_inner(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        debug!(
            batch = texts.len(),
            model = %self.model,
            "requesting embeddings"
        );

        let url = format!("{}/v1/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            input: texts,
            model: &self.model,
        });

        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::EmbedderUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::EmbedderUnavailable(format!(
                "embedding API returned {}: {}",
                status, body
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ApiError::EmbedderProtocol(e.to_string()))?;

        if body.data.len() != texts.len() {
            return Err(ApiError::EmbedderProtocol(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }

        let mut vectors = Vec::with_capacity(body.data.len());
        for (i, item) in body.data.into_iter().enumerate() {
            if item.embedding.len() != self.dimensions {
                return Err(ApiError::EmbedderProtocol(format!(
                    "embedding dimension mismatch at index {}: expected {}, got {}",
                    i,
                    self.dimensions,
                    item.embedding.len()
                )));
            }
            vectors.push(item.embedding);
        }

        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed(&self, text: &str, parent_span: Option<Uuid>) -> Result<Vec<f32>, ApiError> {
        let mut vectors = self
            .request_embeddings(&[text.to_string()], parent_span)
            .await?;
        vectors
            .pop()
            .ok_or_else(|| ApiError::EmbedderProtocol("empty embedding response".to_string()))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        parent_span: Option<Uuid>,
    ) -> Result<Vec<Vec<f32>>, ApiError> {
        self.request_embeddings(texts, parent_span).await
    }
}
