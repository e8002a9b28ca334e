use crate::config::Settings;
use crate::retrieval::expand::{QaPair, TurnExpander, TurnView, DEFAULT_TOKEN_BUDGET};
use crate::retrieval::models::{
    FtsOperator, RetrievalFilters, RetrievalMode, RetrievalParams, RetrievalResponse,
};
use crate::retrieval::RetrieverService;
use crate::utils::error::ApiError;
use crate::utils::timing::{round_ms, Timer};
use axum::extract::{Extension, Query};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub n: Option<usize>,
    #[serde(default = "default_mode")]
    pub mode: RetrievalMode,
    #[serde(default = "default_operator")]
    pub operator: FtsOperator,
    #[serde(default = "default_fts_candidates")]
    pub fts_candidates: usize,
    pub filters: Option<RetrievalFilters>,
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

pub async fn query_chunks(
    Extension(retriever): Extension<Arc<RetrieverService>>,
    Extension(settings): Extension<Arc<Settings>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<RetrievalResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadInput("query must not be empty".to_string()));
    }

    let n = request.n.unwrap_or(settings.default_retrieval_n);
    if n == 0 {
        return Err(ApiError::BadInput("n must be >= 1".to_string()));
    }
    if request.fts_candidates == 0 || request.fts_candidates > RetrievalParams::MAX_FTS_CANDIDATES
    {
        return Err(ApiError::BadInput(format!(
            "fts_candidates must be in [1, {}]",
            RetrievalParams::MAX_FTS_CANDIDATES
        )));
    }

    let params = RetrievalParams {
        mode: request.mode,
        operator: request.operator,
        fts_candidates: request.fts_candidates,
        max_returned: n,
        filters: request.filters.unwrap_or_default(),
    };

    info!(mode = ?request.mode, n, "retrieval query");
    let response = retriever.retrieve(&request.query, &params, None).await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ExpandRequest {
    pub chunk_ids: Vec<i64>,
    pub scores: Option<Vec<f64>>,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default)]
    pub include_preceding_question: bool,
}

fn default_token_budget() -> usize {
    DEFAULT_TOKEN_BUDGET
}

#[derive(Debug, Serialize)]
pub struct ExpandResponse {
    pub turns: Vec<TurnView>,
    pub total_tokens: usize,
}

pub async fn expand_chunks(
    Extension(expander): Extension<Arc<TurnExpander>>,
    Json(request): Json<ExpandRequest>,
) -> Result<Json<ExpandResponse>, ApiError> {
    if request.chunk_ids.is_empty() {
        return Err(ApiError::BadInput("chunk_ids must not be empty".to_string()));
    }
    if let Some(scores) = &request.scores {
        if scores.len() != request.chunk_ids.len() {
            return Err(ApiError::BadInput(
                "scores must align with chunk_ids".to_string(),
            ));
        }
    }

    let pairs: Vec<(i64, f64)> = match request.scores {
        Some(scores) => request.chunk_ids.iter().copied().zip(scores).collect(),
        None => request.chunk_ids.iter().map(|id| (*id, 0.0)).collect(),
    };

    let turns = expander
        .expand(
            &pairs,
            request.token_budget,
            request.include_preceding_question,
        )
        .await?;
    let total_tokens = turns.iter().map(|turn| turn.budget_cost()).sum();

    Ok(Json(ExpandResponse { turns, total_tokens }))
}

#[derive(Debug, Deserialize)]
pub struct QaPairsRequest {
    pub turn_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct QaPairsResponse {
    pub pairs: Vec<QaPair>,
}

pub async fn qa_pairs(
    Extension(expander): Extension<Arc<TurnExpander>>,
    Json(request): Json<QaPairsRequest>,
) -> Result<Json<QaPairsResponse>, ApiError> {
    if request.turn_ids.is_empty() {
        return Err(ApiError::BadInput("turn_ids must not be empty".to_string()));
    }

    let pairs = expander.qa_pairs(&request.turn_ids).await?;
    Ok(Json(QaPairsResponse { pairs }))
}

#[derive(Debug, Deserialize)]
pub struct BenchParams {
    pub q: String,
    #[serde(default = "default_bench_mode")]
    pub mode: RetrievalMode,
    #[serde(default = "default_operator")]
    pub operator: FtsOperator,
    #[serde(default = "default_fts_candidates")]
    pub fts_candidates: usize,
}

fn default_bench_mode() -> RetrievalMode {
    RetrievalMode::Fts
}

#[derive(Debug, Serialize)]
pub struct BenchmarkResponse {
    pub query_time_ms: f64,
    pub rows_returned: usize,
    pub explain: String,
    pub query: String,
}

/// EXPLAIN ANALYZE plus wall-clock timing for one retrieval. The vector
/// and hybrid variants pay an extra embedding call for the explain; its
/// latency is reported inside the output.
pub async fn benchmark_retrieval(
    Extension(retriever): Extension<Arc<RetrieverService>>,
    Extension(settings): Extension<Arc<Settings>>,
    Query(params): Query<BenchParams>,
) -> Result<Json<BenchmarkResponse>, ApiError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::BadInput("q must not be empty".to_string()));
    }
    if params.fts_candidates == 0 || params.fts_candidates > RetrievalParams::MAX_FTS_CANDIDATES {
        return Err(ApiError::BadInput(format!(
            "fts_candidates must be in [1, {}]",
            RetrievalParams::MAX_FTS_CANDIDATES
        )));
    }

    let n = settings.default_retrieval_n;
    let filters = RetrievalFilters::default();

    let retrieval_params = RetrievalParams {
        mode: params.mode,
        operator: params.operator,
        fts_candidates: params.fts_candidates,
        max_returned: n,
        filters: filters.clone(),
    };

    let timer = Timer::start();
    let result = retriever
        .retrieve(&params.q, &retrieval_params, None)
        .await?;
    let query_time_ms = round_ms(timer.elapsed_ms());

    let explain = match params.mode {
        RetrievalMode::Fts => {
            retriever
                .fts()
                .explain(&params.q, &filters, params.operator, n)
                .await?
        }
        RetrievalMode::Vector => {
            let (explain, embedding_ms) =
                retriever.vector().explain(&params.q, &filters, n).await?;
            format!("Embedding Generation: {:.2}ms\n\n{}", embedding_ms, explain)
        }
        RetrievalMode::Hybrid => {
            retriever
                .hybrid()
                .explain(&params.q, &filters, params.fts_candidates, params.operator)
                .await?
        }
    };

    Ok(Json(BenchmarkResponse {
        query_time_ms,
        rows_returned: result.chunks.len(),
        explain,
        query: params.q,
    }))
}
