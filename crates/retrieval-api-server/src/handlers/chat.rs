use crate::config::Settings;
use crate::retrieval::models::{FtsOperator, RetrievalFilters, RetrievalMode, RetrievalParams};
use crate::services::agents::{multi_query, AgentFactory, AgentResponse, AgentType};
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub question: String,
    #[serde(default = "default_agent")]
    pub agent: AgentType,
    #[serde(default = "default_mode")]
    pub mode: RetrievalMode,
    #[serde(default = "default_operator")]
    pub operator: FtsOperator,
    #[serde(default = "default_fts_candidates")]
    pub fts_candidates: usize,
    pub max_returned: Option<usize>,
    pub filters: Option<RetrievalFilters>,
}

fn default_agent() -> AgentType {
    AgentType::Vanilla
}

fn default_mode() -> RetrievalMode {
    RetrievalMode::Hybrid
}

fn default_operator() -> FtsOperator {
    FtsOperator::Or
}

fn default_fts_candidates() -> usize {
    RetrievalParams::DEFAULT_FTS_CANDIDATES
}

pub async fn chat_completion(
    Extension(agents): Extension<Arc<AgentFactory>>,
    Extension(settings): Extension<Arc<Settings>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Json<AgentResponse>, ApiError> {
    if request.question.trim().is_empty() {
        return Err(ApiError::BadInput("question must not be empty".to_string()));
    }
    if request.fts_candidates == 0 || request.fts_candidates > RetrievalParams::MAX_FTS_CANDIDATES
    {
        return Err(ApiError::BadInput(format!(
            "fts_candidates must be in [1, {}]",
            RetrievalParams::MAX_FTS_CANDIDATES
        )));
    }

    let max_returned = request.max_returned.unwrap_or(match request.agent {
        AgentType::MultiQuery => multi_query::DEFAULT_MAX_RETURNED,
        AgentType::Vanilla => settings.default_rerank_k,
    });
    if max_returned == 0 {
        return Err(ApiError::BadInput("max_returned must be >= 1".to_string()));
    }

    let params = RetrievalParams {
        mode: request.mode,
        operator: request.operator,
        fts_candidates: request.fts_candidates,
        max_returned,
        filters: request.filters.unwrap_or_default(),
    };

    info!(agent = ?request.agent, mode = ?request.mode, "chat completion request");

    let agent = agents.get(request.agent);
    let response = agent.generate(&request.question, &params).await?;

    Ok(Json(response))
}
