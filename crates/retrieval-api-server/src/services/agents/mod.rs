pub mod multi_query;
pub mod vanilla;

use crate::retrieval::models::{RetrievalParams, RetrievalResult};
use crate::retrieval::SearchProvider;
use crate::services::llm::{ChatClient, TokenUsage};
use crate::utils::error::ApiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use multi_query::MultiQueryAgent;
pub use vanilla::VanillaAgent;

/// Available agent strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentType {
    #[serde(rename = "vanilla")]
    Vanilla,
    #[serde(rename = "multi-query")]
    MultiQuery,
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vanilla" => Ok(AgentType::Vanilla),
            "multi-query" => Ok(AgentType::MultiQuery),
            other => Err(format!(
                "unknown agent type: {}. Valid types are: vanilla, multi-query",
                other
            )),
        }
    }
}

/// Deduplication statistics reported for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_before_dedup: usize,
    pub unique_chunks: usize,
    pub duplicates_removed: usize,
    pub chunks_boosted: usize,
    pub max_occurrences: usize,
    pub chunks_returned: usize,
}

/// Full agent response with observability metadata. The multi-query
/// fields stay empty for the vanilla agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub answer: String,
    pub trace_id: Option<String>,
    pub latency_ms: f64,
    pub retrieved_chunks: Vec<RetrievalResult>,
    pub model_used: String,
    pub tokens_used: TokenUsage,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub chunks_per_subquery: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_stats: Option<DedupStats>,
}

/// A question-answering agent over the retrieval system.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        params: &RetrievalParams,
    ) -> Result<AgentResponse, ApiError>;
}

/// Builds agents over shared retrieval and LLM seams.
pub struct AgentFactory {
    search: Arc<dyn SearchProvider>,
    chat: Arc<dyn ChatClient>,
}

impl AgentFactory {
    pub fn new(search: Arc<dyn SearchProvider>, chat: Arc<dyn ChatClient>) -> Self {
        Self { search, chat }
    }

    pub fn get(&self, agent_type: AgentType) -> Box<dyn Agent> {
        match agent_type {
            AgentType::Vanilla => {
                Box::new(VanillaAgent::new(self.search.clone(), self.chat.clone()))
            }
            AgentType::MultiQuery => {
                Box::new(MultiQueryAgent::new(self.search.clone(), self.chat.clone()))
            }
        }
    }
}
