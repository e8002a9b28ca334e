use crate::database::models::DocType;
use crate::services::ingestion::{IngestReport, IngestRequest, IngestionService, TurnPayload};
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct TextIngestRequest {
    #[serde(default)]
    pub text: String,
    pub title: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    pub url: Option<String>,
    pub doc_type: Option<DocType>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub turns: Vec<TurnPayload>,
}

fn default_source() -> String {
    "api".to_string()
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

pub async fn ingest_text(
    Extension(ingestion): Extension<Arc<IngestionService>>,
    Json(request): Json<TextIngestRequest>,
) -> Result<Json<IngestReport>, ApiError> {
    if request.text.trim().is_empty() && request.turns.is_empty() {
        return Err(ApiError::BadInput(
            "either text or turns must be provided".to_string(),
        ));
    }

    // Turn payloads imply a transcript unless the caller says otherwise
    let doc_type = request.doc_type.unwrap_or(if request.turns.is_empty() {
        DocType::Text
    } else {
        DocType::Transcript
    });

    info!(
        source = %request.source,
        turns = request.turns.len(),
        "text ingest request"
    );

    let report = ingestion
        .ingest(IngestRequest {
            text: request.text,
            title: request.title,
            source: request.source,
            url: request.url,
            doc_type,
            published_at: request.published_at,
            metadata: request.metadata,
            turns: request.turns,
        })
        .await?;

    Ok(Json(report))
}
