use super::{Agent, AgentResponse};
use crate::observability::trace::{self, SpanRecorder};
use crate::retrieval::models::{RetrievalParams, RetrievalResult};
use crate::retrieval::SearchProvider;
use crate::services::llm::{ChatClient, ChatMessage};
use crate::utils::error::ApiError;
use crate::utils::timing::{round_ms, Timer};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use tracing::info;

/// Single-query RAG: retrieve once for the original question, hand the
/// chunks to the model as context, return its answer.
pub struct VanillaAgent {
    search: Arc<dyn SearchProvider>,
    chat: Arc<dyn ChatClient>,
}

impl VanillaAgent {
    pub fn new(search: Arc<dyn SearchProvider>, chat: Arc<dyn ChatClient>) -> Self {
        Self { search, chat }
    }

    fn build_context(chunks: &[RetrievalResult]) -> String {
        let mut context = String::new();
        for chunk in chunks {
            let title = chunk.metadata.title.as_deref().unwrap_or("Unknown");
            let _ = write!(
                context,
                "Title: {}\nText Quotation: {}\n\n",
                title, chunk.text
            );
        }
        context
    }
}

#[async_trait]
impl Agent for VanillaAgent {
    async fn generate(
        &self,
        question: &str,
        params: &RetrievalParams,
    ) -> Result<AgentResponse, ApiError> {
        let timer = Timer::start();
        let span = SpanRecorder::start("vanilla_agent", None);

        let chunks = match self.search.search(question, params, Some(span.id())).await {
            Ok(chunks) => chunks,
            Err(e) => {
                span.finish(false);
                return Err(e);
            }
        };
        info!(chunks = chunks.len(), "vanilla retrieval complete");

        let context = Self::build_context(&chunks);
        let system = format!(
            "Answer the user's question using only the provided information below:\n{}",
            context
        );
        let messages = vec![ChatMessage::system(system), ChatMessage::user(question)];

        let outcome = match self.chat.chat(&messages, &[]).await {
            Ok(outcome) => outcome,
            Err(e) => {
                span.finish(false);
                return Err(e);
            }
        };

        let trace_id = span.finish(true);

        Ok(AgentResponse {
            answer: outcome.text,
            trace_id: trace::is_enabled().then(|| trace_id.to_string()),
            latency_ms: round_ms(timer.elapsed_ms()),
            retrieved_chunks: chunks,
            model_used: self.chat.model().to_string(),
            tokens_used: outcome.usage,
            sub_queries: Vec::new(),
            chunks_per_subquery: BTreeMap::new(),
            deduplication_stats: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::models::{ChunkMetadata, RetrievalMode};
    use crate::retrieval::MockSearchProvider;
    use crate::services::llm::{ChatOutcome, MockChatClient, TokenUsage};

    fn chunk(chunk_id: i64, score: f64) -> RetrievalResult {
        RetrievalResult {
            chunk_id,
            doc_id: 1,
            text: format!("chunk {}", chunk_id),
            score,
            metadata: ChunkMetadata {
                title: Some("Interview".to_string()),
                ..Default::default()
            },
            ord: 0,
        }
    }

    #[tokio::test]
    async fn retrieves_once_and_synthesizes() {
        let mut search = MockSearchProvider::new();
        search
            .expect_search()
            .times(1)
            .returning(|_, _, parent| {
                assert!(parent.is_some());
                Ok(vec![chunk(1, 0.9), chunk(2, 0.8)])
            });

        let mut chat = MockChatClient::new();
        chat.expect_chat().times(1).returning(|messages, tools| {
            assert!(tools.is_empty());
            let system = messages[0].content.as_deref().unwrap_or_default();
            assert!(system.contains("Text Quotation: chunk 1"));
            Ok(ChatOutcome {
                text: "the answer".to_string(),
                tool_calls: Vec::new(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        });
        chat.expect_model().return_const("test-model".to_string());

        let agent = VanillaAgent::new(Arc::new(search), Arc::new(chat));
        let params = RetrievalParams::new(RetrievalMode::Hybrid, 10);
        let response = agent.generate("what was said?", &params).await.unwrap();

        assert_eq!(response.answer, "the answer");
        assert_eq!(response.retrieved_chunks.len(), 2);
        assert_eq!(response.model_used, "test-model");
        assert_eq!(response.tokens_used.total_tokens, 15);
        assert!(response.sub_queries.is_empty());
        assert!(response.deduplication_stats.is_none());
    }

    #[tokio::test]
    async fn retrieval_failure_propagates() {
        let mut search = MockSearchProvider::new();
        search
            .expect_search()
            .returning(|_, _, _| Err(ApiError::StoreUnavailable("down".to_string())));
        let chat = MockChatClient::new();

        let agent = VanillaAgent::new(Arc::new(search), Arc::new(chat));
        let params = RetrievalParams::new(RetrievalMode::Fts, 10);
        let err = agent.generate("q", &params).await.unwrap_err();
        assert!(matches!(err, ApiError::StoreUnavailable(_)));
    }
}
