use super::{Agent, AgentResponse, DedupStats};
use crate::observability::trace::{self, SpanRecorder};
use crate::retrieval::models::{RetrievalParams, RetrievalResult};
use crate::retrieval::SearchProvider;
use crate::services::llm::{ChatClient, ChatMessage, TokenUsage, ToolCall, ToolDefinition};
use crate::utils::error::ApiError;
use crate::utils::timing::{round_ms, Timer};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_RETURNED: usize = 15;
pub const BOOST_FACTOR: f64 = 0.2;
const MAX_SUB_QUERIES: usize = 5;
const MAX_MODEL_TURNS: usize = 4;
const TOOL_NAME: &str = "retrieve_for_queries";

/// Deduplicates chunks across sub-query results, boosting the score of
/// chunks that several sub-queries agreed on.
///
/// For a chunk appearing in `k` result lists with highest observed score
/// `s`, the merged score is `s * (1 + boost_factor * (k - 1))`. Results
/// sort by merged score descending, ties broken by ascending chunk id,
/// truncated to `max_returned`.
pub fn deduplicate_chunks(
    results_by_query: &[(String, Vec<RetrievalResult>)],
    max_returned: usize,
    boost_factor: f64,
) -> (Vec<RetrievalResult>, DedupStats) {
    struct Entry {
        chunk: RetrievalResult,
        count: usize,
        max_score: f64,
    }

    let mut chunk_map: HashMap<i64, Entry> = HashMap::new();
    let mut total_before = 0usize;

    for (_, chunks) in results_by_query {
        for chunk in chunks {
            total_before += 1;
            let entry = chunk_map.entry(chunk.chunk_id).or_insert_with(|| Entry {
                chunk: chunk.clone(),
                count: 0,
                max_score: f64::MIN,
            });
            entry.count += 1;
            if chunk.score > entry.max_score {
                entry.max_score = chunk.score;
            }
        }
    }

    let unique_chunks = chunk_map.len();
    let mut max_occurrences = 0usize;
    let mut chunks_boosted = 0usize;

    let mut boosted: Vec<RetrievalResult> = chunk_map
        .into_values()
        .map(|entry| {
            max_occurrences = max_occurrences.max(entry.count);
            if entry.count > 1 {
                chunks_boosted += 1;
            }
            let mut chunk = entry.chunk;
            chunk.score = entry.max_score * (1.0 + boost_factor * (entry.count as f64 - 1.0));
            chunk
        })
        .collect();

    boosted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    boosted.truncate(max_returned);

    let stats = DedupStats {
        total_before_dedup: total_before,
        unique_chunks,
        duplicates_removed: total_before - unique_chunks,
        chunks_boosted,
        max_occurrences,
        chunks_returned: boosted.len(),
    };

    (boosted, stats)
}

#[derive(Debug, Deserialize)]
struct RetrieveForQueriesArgs {
    queries: Vec<String>,
}

/// What one tool invocation produced, kept for the response metadata.
struct FanOutResult {
    sub_queries: Vec<String>,
    chunks_per_subquery: BTreeMap<String, usize>,
    deduplicated: Vec<RetrievalResult>,
    stats: DedupStats,
}

/// Multi-query RAG: the model decomposes the question into 2-5 MECE
/// sub-queries via a single tool call; the host fans the retrievals out
/// in parallel, deduplicates with score boosting, and hands the merged
/// context back for synthesis.
pub struct MultiQueryAgent {
    search: Arc<dyn SearchProvider>,
    chat: Arc<dyn ChatClient>,
}

impl MultiQueryAgent {
    pub fn new(search: Arc<dyn SearchProvider>, chat: Arc<dyn ChatClient>) -> Self {
        Self { search, chat }
    }

    fn tool_definition() -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description: "Search the knowledge base with multiple queries in parallel. \
                          Queries are executed concurrently, results are deduplicated \
                          across queries, and chunks found by several queries are \
                          boosted. Returns the most relevant chunks overall."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "queries": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "List of 2-5 search queries, each targeting a specific aspect of the information needed."
                    }
                },
                "required": ["queries"]
            }),
        }
    }

    fn instructions() -> &'static str {
        "You are a helpful assistant that answers questions using a knowledge base of \
         long-form interview transcripts.\n\n\
         You have access to a multi-query retrieval tool. To answer effectively:\n\n\
         1. FIRST, break the user's question down into 2-5 MECE (Mutually Exclusive, \
         Collectively Exhaustive) sub-queries\n\
         2. Each sub-query should target a specific aspect of the question\n\
         3. Call retrieve_for_queries with your list of sub-queries\n\
         4. Synthesize the retrieved information into a comprehensive answer\n\n\
         Example decomposition for \"What are the benefits and risks of AGI?\":\n\
         - Sub-queries: [\"benefits of AGI\", \"risks of AGI\", \"AGI safety concerns\", \
         \"AGI potential applications\"]\n\n\
         Guidelines:\n\
         - Use 2-3 sub-queries for simple questions, 4-5 for complex multi-part questions\n\
         - Make sub-queries specific and searchable\n\
         - Base your answer ONLY on the retrieved information\n\
         - If the information doesn't fully answer the question, say so clearly\n\
         - Reference sources when citing specific information"
    }

    /// Runs the accepted sub-queries concurrently. A failed sub-query
    /// contributes an empty result list rather than failing the call.
    async fn fan_out(
        &self,
        queries: &[String],
        params: &RetrievalParams,
        parent_span: Option<Uuid>,
    ) -> Vec<(String, Vec<RetrievalResult>)> {
        let futures = queries.iter().map(|query| {
            let search = self.search.clone();
            let params = params.clone();
            let query = query.clone();
            async move {
                let result = search.search(&query, &params, parent_span).await;
                (query, result)
            }
        });

        join_all(futures)
            .await
            .into_iter()
            .map(|(query, result)| match result {
                Ok(chunks) => (query, chunks),
                Err(e) => {
                    warn!(query = %query, "sub-query retrieval failed: {}", e);
                    (query, Vec::new())
                }
            })
            .collect()
    }

    fn render_context(
        queries: &[String],
        results_by_query: &[(String, Vec<RetrievalResult>)],
        deduplicated: &[RetrievalResult],
        stats: &DedupStats,
    ) -> String {
        if deduplicated.is_empty() {
            return "No relevant information found in the knowledge base for any of the queries."
                .to_string();
        }

        let counts: HashMap<&str, usize> = results_by_query
            .iter()
            .map(|(query, chunks)| (query.as_str(), chunks.len()))
            .collect();

        let mut header = format!(
            "Retrieved {} unique chunks from {} queries:\n",
            stats.unique_chunks,
            queries.len()
        );
        for query in queries {
            let _ = writeln!(
                header,
                "  - {}: {} chunks",
                query,
                counts.get(query.as_str()).copied().unwrap_or(0)
            );
        }
        let _ = write!(
            header,
            "\nAfter deduplication and ranking, top {} chunks:\n",
            deduplicated.len()
        );

        let mut parts = vec![header];
        for (i, chunk) in deduplicated.iter().enumerate() {
            let title = chunk.metadata.title.as_deref().unwrap_or("Unknown");
            parts.push(format!(
                "[Source {}: {}] [Score: {:.3}]\n{}",
                i + 1,
                title,
                chunk.score,
                chunk.text
            ));
        }

        parts.join("\n\n---\n\n")
    }

    /// Executes one `retrieve_for_queries` invocation. Returns the text
    /// rendered back to the model; tool-side errors become visible tool
    /// results so the model can retry within the conversation.
    async fn handle_tool_call(
        &self,
        call: &ToolCall,
        params: &RetrievalParams,
        parent_span: Option<Uuid>,
    ) -> (String, Option<FanOutResult>) {
        if call.name != TOOL_NAME {
            return (format!("Error: unknown tool '{}'.", call.name), None);
        }

        let args: RetrieveForQueriesArgs = match serde_json::from_str(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                return (format!("Error: invalid tool arguments: {}.", e), None);
            }
        };

        if args.queries.is_empty() {
            let rejected = ApiError::ToolInputRejected("at least one query is required".to_string());
            warn!("{}", rejected);
            return ("Error: at least one query is required.".to_string(), None);
        }

        let mut queries = args.queries;
        if queries.len() > MAX_SUB_QUERIES {
            queries.truncate(MAX_SUB_QUERIES);
        }

        let results_by_query = self.fan_out(&queries, params, parent_span).await;
        let (deduplicated, stats) =
            deduplicate_chunks(&results_by_query, params.max_returned, BOOST_FACTOR);

        info!(
            sub_queries = queries.len(),
            total_before_dedup = stats.total_before_dedup,
            unique_chunks = stats.unique_chunks,
            chunks_returned = stats.chunks_returned,
            "fan-out complete"
        );

        let rendered = Self::render_context(&queries, &results_by_query, &deduplicated, &stats);
        let chunks_per_subquery: BTreeMap<String, usize> = results_by_query
            .iter()
            .map(|(query, chunks)| (query.clone(), chunks.len()))
            .collect();

        (
            rendered,
            Some(FanOutResult {
                sub_queries: queries,
                chunks_per_subquery,
                deduplicated,
                stats,
            }),
        )
    }
}

#[async_trait]
impl Agent for MultiQueryAgent {
    async fn generate(
        &self,
        question: &str,
        params: &RetrievalParams,
    ) -> Result<AgentResponse, ApiError> {
        let timer = Timer::start();
        let span = SpanRecorder::start("multi_query_agent", None);
        let span_id = span.id();

        let tools = vec![Self::tool_definition()];
        let mut messages = vec![
            ChatMessage::system(Self::instructions()),
            ChatMessage::user(question),
        ];

        let mut usage = TokenUsage::default();
        let mut answer = String::new();
        let mut fan_out: Option<FanOutResult> = None;
        let mut completed = false;

        for _ in 0..MAX_MODEL_TURNS {
            let outcome = match self.chat.chat(&messages, &tools).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    span.finish(false);
                    return Err(e);
                }
            };
            usage.accumulate(&outcome.usage);

            if outcome.tool_calls.is_empty() {
                answer = outcome.text;
                completed = true;
                break;
            }

            messages.push(ChatMessage::assistant_tool_calls(&outcome.tool_calls));
            for call in &outcome.tool_calls {
                let (rendered, result) = self.handle_tool_call(call, params, Some(span_id)).await;
                if let Some(result) = result {
                    fan_out = Some(result);
                }
                messages.push(ChatMessage::tool_result(call.id.clone(), rendered));
            }
        }

        // The model kept calling tools on every allowed turn and never
        // produced a final message; fail loudly instead of returning an
        // empty answer.
        if !completed {
            warn!(turns = MAX_MODEL_TURNS, "turn limit exceeded without a final answer");
            span.finish(false);
            return Err(ApiError::Internal(
                "turn limit exceeded without a final answer".to_string(),
            ));
        }

        let trace_id = span.finish(true);
        let fan_out = fan_out.unwrap_or(FanOutResult {
            sub_queries: Vec::new(),
            chunks_per_subquery: BTreeMap::new(),
            deduplicated: Vec::new(),
            stats: DedupStats::default(),
        });

        Ok(AgentResponse {
            answer,
            trace_id: trace::is_enabled().then(|| trace_id.to_string()),
            latency_ms: round_ms(timer.elapsed_ms()),
            retrieved_chunks: fan_out.deduplicated,
            model_used: self.chat.model().to_string(),
            tokens_used: usage,
            sub_queries: fan_out.sub_queries,
            chunks_per_subquery: fan_out.chunks_per_subquery,
            deduplication_stats: Some(fan_out.stats),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::models::{ChunkMetadata, RetrievalMode};
    use crate::retrieval::MockSearchProvider;
    use crate::services::llm::{ChatOutcome, MockChatClient};

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

    fn results(pairs: &[(&str, Vec<RetrievalResult>)]) -> Vec<(String, Vec<RetrievalResult>)> {
        pairs
            .iter()
            .map(|(query, chunks)| (query.to_string(), chunks.clone()))
            .collect()
    }

    #[test]
    fn boost_uses_max_score_and_occurrence_count() {
        // Chunk C appears in two sub-query results with scores 0.6 and
        // 0.8: merged score is 0.8 * (1 + 0.2) = 0.96.
        let input = results(&[
            ("q1", vec![chunk(7, 0.6)]),
            ("q2", vec![chunk(7, 0.8)]),
        ]);
        let (chunks, stats) = deduplicate_chunks(&input, 15, 0.2);

        assert_eq!(chunks.len(), 1);
        assert!((chunks[0].score - 0.96).abs() < 1e-9);
        assert_eq!(stats.total_before_dedup, 2);
        assert_eq!(stats.unique_chunks, 1);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.chunks_boosted, 1);
        assert_eq!(stats.max_occurrences, 2);
        assert_eq!(stats.chunks_returned, 1);
    }

    #[test]
    fn identical_sub_query_results_boost_every_chunk() {
        let list = vec![chunk(1, 0.5), chunk(2, 0.4)];
        let input = results(&[
            ("q1", list.clone()),
            ("q2", list.clone()),
            ("q3", list.clone()),
        ]);
        let (chunks, stats) = deduplicate_chunks(&input, 15, 0.2);

        let multiplier = 1.0 + 0.2 * 2.0;
        assert_eq!(chunks.len(), 2);
        assert!((chunks[0].score - 0.5 * multiplier).abs() < 1e-9);
        assert!((chunks[1].score - 0.4 * multiplier).abs() < 1e-9);
        assert_eq!(stats.max_occurrences, 3);
        assert_eq!(stats.chunks_boosted, 2);
    }

    #[test]
    fn dedup_stat_invariants_hold() {
        let input = results(&[
            ("q1", vec![chunk(1, 0.9), chunk(2, 0.8), chunk(3, 0.7)]),
            ("q2", vec![chunk(2, 0.6), chunk(4, 0.5)]),
        ]);
        let (chunks, stats) = deduplicate_chunks(&input, 3, 0.2);

        assert!(stats.unique_chunks <= stats.total_before_dedup);
        assert_eq!(
            stats.duplicates_removed,
            stats.total_before_dedup - stats.unique_chunks
        );
        assert!(stats.chunks_returned <= stats.unique_chunks.min(3));
        assert_eq!(chunks.len(), stats.chunks_returned);
    }

    #[test]
    fn ordering_is_deterministic_under_ties() {
        // Same score everywhere: order must fall back to ascending ids
        // regardless of input order.
        let input_a = results(&[("q", vec![chunk(3, 0.5), chunk(1, 0.5), chunk(2, 0.5)])]);
        let input_b = results(&[("q", vec![chunk(2, 0.5), chunk(3, 0.5), chunk(1, 0.5)])]);

        let (chunks_a, _) = deduplicate_chunks(&input_a, 15, 0.2);
        let (chunks_b, _) = deduplicate_chunks(&input_b, 15, 0.2);

        let ids_a: Vec<i64> = chunks_a.iter().map(|c| c.chunk_id).collect();
        let ids_b: Vec<i64> = chunks_b.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids_a, vec![1, 2, 3]);
        assert_eq!(ids_a, ids_b);
    }

    fn tool_call_with(queries: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: TOOL_NAME.to_string(),
            arguments: serde_json::json!({ "queries": queries }).to_string(),
        }
    }

    #[tokio::test]
    async fn fan_out_isolates_sub_query_failures() {
        let mut search = MockSearchProvider::new();
        search.expect_search().times(3).returning(|query, _, parent| {
            assert!(parent.is_some());
            if query == "q2" {
                Err(ApiError::StoreUnavailable("boom".to_string()))
            } else {
                Ok(vec![chunk(if query == "q1" { 1 } else { 3 }, 0.9)])
            }
        });

        let mut chat = MockChatClient::new();
        let mut turn = 0;
        chat.expect_chat().times(2).returning(move |_, _| {
            turn += 1;
            if turn == 1 {
                Ok(ChatOutcome {
                    text: String::new(),
                    tool_calls: vec![tool_call_with(serde_json::json!(["q1", "q2", "q3"]))],
                    usage: TokenUsage::default(),
                })
            } else {
                Ok(ChatOutcome {
                    text: "synthesized answer".to_string(),
                    tool_calls: Vec::new(),
                    usage: TokenUsage::default(),
                })
            }
        });
        chat.expect_model().return_const("test-model".to_string());

        let agent = MultiQueryAgent::new(Arc::new(search), Arc::new(chat));
        let params = RetrievalParams::new(RetrievalMode::Hybrid, DEFAULT_MAX_RETURNED);
        let response = agent.generate("question", &params).await.unwrap();

        assert_eq!(response.answer, "synthesized answer");
        assert_eq!(
            response.sub_queries,
            vec!["q1".to_string(), "q2".to_string(), "q3".to_string()]
        );
        assert_eq!(response.chunks_per_subquery.get("q2"), Some(&0));
        assert_eq!(response.chunks_per_subquery.get("q1"), Some(&1));
        assert_eq!(response.retrieved_chunks.len(), 2);
    }

    #[tokio::test]
    async fn empty_query_list_is_rejected_and_model_can_retry() {
        let mut search = MockSearchProvider::new();
        search
            .expect_search()
            .times(2)
            .returning(|_, _, _| Ok(vec![chunk(1, 0.9)]));

        let mut chat = MockChatClient::new();
        let mut turn = 0;
        chat.expect_chat().times(3).returning(move |messages, _| {
            turn += 1;
            match turn {
                1 => Ok(ChatOutcome {
                    text: String::new(),
                    tool_calls: vec![tool_call_with(serde_json::json!([]))],
                    usage: TokenUsage::default(),
                }),
                2 => {
                    let tool_result = messages
                        .iter()
                        .rfind(|m| m.role == "tool")
                        .and_then(|m| m.content.as_deref())
                        .unwrap_or_default();
                    assert!(tool_result.contains("at least one query is required"));
                    Ok(ChatOutcome {
                        text: String::new(),
                        tool_calls: vec![tool_call_with(serde_json::json!(["a", "b"]))],
                        usage: TokenUsage::default(),
                    })
                }
                _ => Ok(ChatOutcome {
                    text: "done".to_string(),
                    tool_calls: Vec::new(),
                    usage: TokenUsage::default(),
                }),
            }
        });
        chat.expect_model().return_const("test-model".to_string());

        let agent = MultiQueryAgent::new(Arc::new(search), Arc::new(chat));
        let params = RetrievalParams::new(RetrievalMode::Fts, DEFAULT_MAX_RETURNED);
        let response = agent.generate("question", &params).await.unwrap();

        assert_eq!(response.answer, "done");
        assert_eq!(response.sub_queries.len(), 2);
    }

    #[tokio::test]
    async fn sub_queries_truncate_to_five() {
        let mut search = MockSearchProvider::new();
        search
            .expect_search()
            .times(5)
            .returning(|_, _, _| Ok(Vec::new()));

        let mut chat = MockChatClient::new();
        let mut turn = 0;
        chat.expect_chat().times(2).returning(move |_, _| {
            turn += 1;
            if turn == 1 {
                Ok(ChatOutcome {
                    text: String::new(),
                    tool_calls: vec![tool_call_with(serde_json::json!([
                        "q1", "q2", "q3", "q4", "q5", "q6", "q7"
                    ]))],
                    usage: TokenUsage::default(),
                })
            } else {
                Ok(ChatOutcome {
                    text: "answer".to_string(),
                    tool_calls: Vec::new(),
                    usage: TokenUsage::default(),
                })
            }
        });
        chat.expect_model().return_const("test-model".to_string());

        let agent = MultiQueryAgent::new(Arc::new(search), Arc::new(chat));
        let params = RetrievalParams::new(RetrievalMode::Hybrid, DEFAULT_MAX_RETURNED);
        let response = agent.generate("question", &params).await.unwrap();

        assert_eq!(response.sub_queries.len(), 5);
        assert_eq!(response.sub_queries[4], "q5");
    }

    #[tokio::test]
    async fn token_usage_sums_across_model_turns() {
        let mut search = MockSearchProvider::new();
        search.expect_search().returning(|_, _, _| Ok(Vec::new()));

        let mut chat = MockChatClient::new();
        let mut turn = 0;
        chat.expect_chat().times(2).returning(move |_, _| {
            turn += 1;
            let usage = TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
            };
            if turn == 1 {
                Ok(ChatOutcome {
                    text: String::new(),
                    tool_calls: vec![tool_call_with(serde_json::json!(["a", "b"]))],
                    usage,
                })
            } else {
                Ok(ChatOutcome {
                    text: "answer".to_string(),
                    tool_calls: Vec::new(),
                    usage,
                })
            }
        });
        chat.expect_model().return_const("test-model".to_string());

        let agent = MultiQueryAgent::new(Arc::new(search), Arc::new(chat));
        let params = RetrievalParams::new(RetrievalMode::Hybrid, DEFAULT_MAX_RETURNED);
        let response = agent.generate("question", &params).await.unwrap();

        assert_eq!(response.tokens_used.prompt_tokens, 200);
        assert_eq!(response.tokens_used.completion_tokens, 40);
        assert_eq!(response.tokens_used.total_tokens, 240);
    }

    #[tokio::test]
    async fn exhausted_turn_limit_is_an_error_not_an_empty_answer() {
        let mut search = MockSearchProvider::new();
        search.expect_search().returning(|_, _, _| Ok(Vec::new()));

        // The model never stops calling the tool
        let mut chat = MockChatClient::new();
        chat.expect_chat().times(MAX_MODEL_TURNS).returning(|_, _| {
            Ok(ChatOutcome {
                text: String::new(),
                tool_calls: vec![tool_call_with(serde_json::json!(["a", "b"]))],
                usage: TokenUsage::default(),
            })
        });
        chat.expect_model().return_const("test-model".to_string());

        let agent = MultiQueryAgent::new(Arc::new(search), Arc::new(chat));
        let params = RetrievalParams::new(RetrievalMode::Hybrid, DEFAULT_MAX_RETURNED);
        let err = agent.generate("question", &params).await.unwrap_err();

        assert!(matches!(err, ApiError::Internal(_)));
    }
}
