//! Filter-extraction evaluation runner.
//!
//! Exposes a retrieval tool whose parameter list is exactly the filter
//! fields, lets the agent answer natural-language queries, and scores
//! the filter values the model actually bound against expectations.

use super::dataset::{EvalCase, ToolParamsDataset};
use super::metrics::{
    compute_tool_params_metrics, format_detailed_results, format_metrics_report, ToolParamsMetrics,
};
use super::types::{compare_filters, ToolCallCapture, ToolParamsEvalResult};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use retrieval_api_server::config::Settings;
use retrieval_api_server::database::{DbPool, Repository};
use retrieval_api_server::observability::trace;
use retrieval_api_server::retrieval::models::{
    FtsOperator, RetrievalFilters, RetrievalMode, RetrievalParams,
};
use retrieval_api_server::retrieval::{RetrieverService, SearchProvider};
use retrieval_api_server::services::embedding::Embedder;
use retrieval_api_server::services::llm::{
    ChatClient, ChatMessage, ToolDefinition,
};
use retrieval_api_server::services::{EmbeddingService, LlmService};
use retrieval_api_server::utils::timing::{round_ms, Timer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const TOOL_NAME: &str = "search_knowledge_base";
const MAX_MODEL_TURNS: usize = 4;
const PASS_THRESHOLD: f64 = 0.8;

/// Run agent tool-parameter evaluations.
#[derive(Debug, Parser)]
#[command(name = "harness-tool-params")]
pub struct ToolParamsArgs {
    /// Run only cases in this category
    #[arg(long)]
    pub category: Option<String>,

    /// Run only a specific case by id
    #[arg(long)]
    pub case_id: Option<String>,

    /// Number of cases to run (default: all)
    #[arg(long)]
    pub num_samples: Option<usize>,

    /// Print detailed per-case results
    #[arg(long, short)]
    pub verbose: bool,

    /// Output directory for results
    #[arg(long, short, default_value = "evals/results")]
    pub output_dir: PathBuf,

    /// Retrieval mode
    #[arg(long, default_value = "fts")]
    pub mode: String,

    /// List available categories and exit
    #[arg(long)]
    pub list_categories: bool,

    /// List all cases and exit
    #[arg(long)]
    pub list_cases: bool,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    #[serde(default)]
    query: String,
    speaker: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    source: Option<String>,
    doc_type: Option<String>,
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Harness around an agent loop whose only tool carries the five filter
/// parameters. Tool calls are captured for comparison and still executed
/// against the real retriever.
pub struct ToolParamsHarness {
    search: Arc<dyn SearchProvider>,
    chat: Arc<dyn ChatClient>,
    retrieval_params: RetrievalParams,
}

impl ToolParamsHarness {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        chat: Arc<dyn ChatClient>,
        retrieval_params: RetrievalParams,
    ) -> Self {
        Self {
            search,
            chat,
            retrieval_params,
        }
    }

    fn tool_definition() -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description: "Search the knowledge base for relevant passages from interview \
                          transcripts. Results can be filtered by speaker name, date range, \
                          source, or document type."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query to find relevant information."
                    },
                    "speaker": {
                        "type": "string",
                        "description": "Filter by speaker name (e.g., \"Elon Musk\"). Use when the user asks what a specific person said."
                    },
                    "start_date": {
                        "type": "string",
                        "description": "Only return results from after this date (ISO format: YYYY-MM-DD)."
                    },
                    "end_date": {
                        "type": "string",
                        "description": "Only return results from before this date (ISO format: YYYY-MM-DD)."
                    },
                    "source": {
                        "type": "string",
                        "description": "Filter by source (e.g., \"youtube\", \"dwarkesh\")."
                    },
                    "doc_type": {
                        "type": "string",
                        "description": "Filter by document type (e.g., \"transcript\", \"blog\")."
                    }
                },
                "required": ["query"]
            }),
        }
    }

    fn instructions() -> &'static str {
        "You are a helpful assistant that answers questions using a knowledge base of \
         interview transcripts.\n\n\
         CRITICAL INSTRUCTIONS FOR TOOL USE:\n\n\
         1. ALWAYS use the search_knowledge_base tool to find information before answering.\n\n\
         2. SPEAKER FILTERING: when the user asks about what a SPECIFIC PERSON said, thought, \
         or discussed, extract the person's name and pass it as the 'speaker' parameter.\n\
         Examples:\n\
         - \"What has Elon Musk said about AI?\" -> speaker=\"Elon Musk\"\n\
         - \"According to Sam Altman...\" -> speaker=\"Sam Altman\"\n\n\
         3. DATE FILTERING: when the user mentions specific dates or years:\n\
         - \"in 2024\" -> start_date=\"2024-01-01\", end_date=\"2024-12-31\"\n\
         - \"after March 2023\" -> start_date=\"2023-03-01\"\n\
         - \"before 2022\" -> end_date=\"2021-12-31\"\n\n\
         4. When NO specific person is mentioned, do NOT use the speaker filter.\n\n\
         5. Base your answer ONLY on the retrieved information. If nothing relevant is \
         found, say so.\n\n\
         6. Be concise and cite your sources."
    }

    /// Executes one captured tool call against the retriever and renders
    /// the result for the model. Retrieval failures render as tool-side
    /// errors rather than aborting the case.
    async fn execute_search(&self, args: &SearchArgs) -> String {
        let filters = RetrievalFilters {
            speaker: args.speaker.clone(),
            source: args.source.clone(),
            doc_type: args.doc_type.clone(),
            start_date: args.start_date.as_deref().and_then(parse_date),
            end_date: args.end_date.as_deref().and_then(parse_date),
        };

        let mut params = self.retrieval_params.clone();
        params.filters = filters;

        match self.search.search(&args.query, &params, None).await {
            Ok(chunks) if chunks.is_empty() => {
                "No relevant information found in the knowledge base.".to_string()
            }
            Ok(chunks) => {
                let mut parts = Vec::with_capacity(chunks.len());
                for (i, chunk) in chunks.iter().enumerate() {
                    let title = chunk.metadata.title.as_deref().unwrap_or("Unknown");
                    let speaker = chunk.metadata.speaker.as_deref().unwrap_or("Unknown");
                    parts.push(format!(
                        "[Source {}: {} - {}]\n{}",
                        i + 1,
                        title,
                        speaker,
                        chunk.text
                    ));
                }
                parts.join("\n\n---\n\n")
            }
            Err(e) => {
                warn!("retrieval failed inside eval tool: {}", e);
                format!("Error retrieving information: {}", e)
            }
        }
    }

    pub async fn run_case(&self, case: &EvalCase) -> ToolParamsEvalResult {
        let timer = Timer::start();
        let tools = vec![Self::tool_definition()];
        let mut messages = vec![
            ChatMessage::system(Self::instructions()),
            ChatMessage::user(case.query.clone()),
        ];

        let mut tool_calls: Vec<ToolCallCapture> = Vec::new();
        let mut applied_filters: BTreeMap<String, String> = BTreeMap::new();
        let mut answer = String::new();

        for _ in 0..MAX_MODEL_TURNS {
            let outcome = match self.chat.chat(&messages, &tools).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    return ToolParamsEvalResult {
                        case_id: case.id.clone(),
                        query: case.query.clone(),
                        expected_filters: case.expected_filters.clone(),
                        actual_filters: applied_filters,
                        tool_calls,
                        filter_matches: BTreeMap::new(),
                        overall_match: false,
                        answer,
                        latency_ms: round_ms(timer.elapsed_ms()),
                        error: Some(e.to_string()),
                    };
                }
            };

            if outcome.tool_calls.is_empty() {
                answer = outcome.text;
                break;
            }

            messages.push(ChatMessage::assistant_tool_calls(&outcome.tool_calls));
            for call in &outcome.tool_calls {
                let rendered = if call.name != TOOL_NAME {
                    format!("Error: unknown tool '{}'.", call.name)
                } else {
                    match serde_json::from_str::<SearchArgs>(&call.arguments) {
                        Ok(args) => {
                            let mut filters = BTreeMap::new();
                            for (field, value) in [
                                ("speaker", &args.speaker),
                                ("start_date", &args.start_date),
                                ("end_date", &args.end_date),
                                ("source", &args.source),
                                ("doc_type", &args.doc_type),
                            ] {
                                if let Some(value) = value {
                                    filters.insert(field.to_string(), value.clone());
                                }
                            }

                            tool_calls.push(ToolCallCapture {
                                tool_name: call.name.clone(),
                                query: args.query.clone(),
                                filters: filters.clone(),
                            });
                            applied_filters.extend(filters);

                            self.execute_search(&args).await
                        }
                        Err(e) => format!("Error: invalid tool arguments: {}.", e),
                    }
                };
                messages.push(ChatMessage::tool_result(call.id.clone(), rendered));
            }
        }

        let (filter_matches, overall_match) =
            compare_filters(&case.expected_filters, &applied_filters);

        ToolParamsEvalResult {
            case_id: case.id.clone(),
            query: case.query.clone(),
            expected_filters: case.expected_filters.clone(),
            actual_filters: applied_filters,
            tool_calls,
            filter_matches,
            overall_match,
            answer,
            latency_ms: round_ms(timer.elapsed_ms()),
            error: None,
        }
    }

    pub async fn run_all(&self, cases: &[EvalCase]) -> Vec<ToolParamsEvalResult> {
        let mut results = Vec::with_capacity(cases.len());
        for (i, case) in cases.iter().enumerate() {
            info!(
                case_id = %case.id,
                progress = format!("{}/{}", i + 1, cases.len()),
                "evaluating"
            );
            results.push(self.run_case(case).await);
        }
        results
    }
}

fn parse_mode(mode: &str) -> Result<RetrievalMode> {
    match mode {
        "fts" => Ok(RetrievalMode::Fts),
        "vector" => Ok(RetrievalMode::Vector),
        "hybrid" => Ok(RetrievalMode::Hybrid),
        other => anyhow::bail!("invalid mode: {}. Use 'fts', 'vector', or 'hybrid'", other),
    }
}

/// Entry point. Returns the process exit code: non-zero when overall
/// accuracy falls below the pass threshold.
pub async fn run(args: ToolParamsArgs) -> Result<i32> {
    let dataset = ToolParamsDataset::new();

    if args.list_categories {
        println!("Available categories:");
        for category in dataset.categories() {
            println!("  {}: {} cases", category, dataset.by_category(&category).len());
        }
        return Ok(0);
    }

    if args.list_cases {
        println!("Available cases:");
        for case in dataset.all() {
            println!("  [{}] {}: {}", case.category, case.id, case.description);
        }
        return Ok(0);
    }

    let mut cases: Vec<EvalCase> = if let Some(case_id) = &args.case_id {
        match dataset.get_by_id(case_id) {
            Some(case) => vec![case.clone()],
            None => anyhow::bail!("case '{}' not found", case_id),
        }
    } else if let Some(category) = &args.category {
        let cases = dataset.by_category(category);
        anyhow::ensure!(
            !cases.is_empty(),
            "no cases found for category '{}'. Available: {}",
            category,
            dataset.categories().join(", ")
        );
        cases
    } else {
        dataset.all().to_vec()
    };

    if let Some(n) = args.num_samples {
        cases.truncate(n);
    }

    let mode = parse_mode(&args.mode)?;
    println!("Running {} evaluation case(s)...", cases.len());
    println!("Retrieval mode: {}\n", args.mode);

    let settings = Settings::load()?;
    trace::initialize_tracing(&settings);

    let pool = DbPool::new(&settings).await?;
    let repository = Arc::new(Repository::new(
        pool.clone(),
        settings.default_speaker.clone(),
    ));
    let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingService::new(&settings));
    let chat: Arc<dyn ChatClient> = Arc::new(LlmService::new(&settings));
    let search: Arc<dyn SearchProvider> =
        Arc::new(RetrieverService::new(repository, embedder));

    let harness = ToolParamsHarness::new(
        search,
        chat,
        RetrievalParams {
            mode,
            operator: FtsOperator::Or,
            fts_candidates: 100,
            max_returned: 5,
            filters: RetrievalFilters::default(),
        },
    );

    let results = harness.run_all(&cases).await;
    trace::force_flush().await;

    let categories_by_case: BTreeMap<String, String> = cases
        .iter()
        .map(|case| (case.id.clone(), case.category.clone()))
        .collect();
    let metrics = compute_tool_params_metrics(&results, &categories_by_case);

    println!("\n{}", format_metrics_report(&metrics));
    if args.verbose {
        println!("\n{}", format_detailed_results(&results));
    }

    std::fs::create_dir_all(&args.output_dir)?;
    let output_file = args.output_dir.join(format!(
        "tool_params_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    let output = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "config": {
            "retrieval_mode": args.mode,
            "category_filter": args.category,
            "case_id_filter": args.case_id,
            "num_samples": args.num_samples,
        },
        "metrics": summary_json(&metrics),
        "results": results,
    });
    std::fs::write(&output_file, serde_json::to_string_pretty(&output)?)?;
    println!("\nResults saved to: {}", output_file.display());

    pool.close().await;

    Ok(if metrics.overall_accuracy >= PASS_THRESHOLD {
        0
    } else {
        1
    })
}

fn summary_json(metrics: &ToolParamsMetrics) -> serde_json::Value {
    serde_json::json!({
        "total_cases": metrics.total_cases,
        "passed": metrics.passed,
        "failed": metrics.failed,
        "errors": metrics.errors,
        "overall_accuracy": metrics.overall_accuracy,
        "avg_latency_ms": metrics.avg_latency_ms,
        "filter_metrics": metrics.filter_metrics,
        "category_metrics": metrics.category_metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use retrieval_api_server::retrieval::models::RetrievalResult;
    use retrieval_api_server::services::llm::{ChatOutcome, TokenUsage, ToolCall};
    use retrieval_api_server::utils::error::ApiError;
    use std::sync::Mutex;

    struct FakeSearch {
        captured: Mutex<Vec<RetrievalParams>>,
    }

    #[async_trait]
    impl SearchProvider for FakeSearch {
        async fn search(
            &self,
            _query: &str,
            params: &RetrievalParams,
            _parent_span: Option<uuid::Uuid>,
        ) -> Result<Vec<RetrievalResult>, ApiError> {
            self.captured.lock().unwrap().push(params.clone());
            Ok(Vec::new())
        }
    }

    struct ScriptedChat {
        turns: Mutex<Vec<ChatOutcome>>,
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ChatOutcome, ApiError> {
            Ok(self.turns.lock().unwrap().remove(0))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn harness(turns: Vec<ChatOutcome>) -> (ToolParamsHarness, Arc<FakeSearch>) {
        let search = Arc::new(FakeSearch {
            captured: Mutex::new(Vec::new()),
        });
        let harness = ToolParamsHarness::new(
            search.clone(),
            Arc::new(ScriptedChat {
                turns: Mutex::new(turns),
            }),
            RetrievalParams::new(RetrievalMode::Fts, 5),
        );
        (harness, search)
    }

    fn tool_turn(arguments: serde_json::Value) -> ChatOutcome {
        ChatOutcome {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: TOOL_NAME.to_string(),
                arguments: arguments.to_string(),
            }],
            usage: TokenUsage::default(),
        }
    }

    fn answer_turn(text: &str) -> ChatOutcome {
        ChatOutcome {
            text: text.to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    #[tokio::test]
    async fn captures_bound_filters_and_passes_matching_case() {
        let case = ToolParamsDataset::new().get_by_id("combined_001").unwrap().clone();
        let (harness, search) = harness(vec![
            tool_turn(serde_json::json!({
                "query": "Elon Musk AI",
                "speaker": "Elon Musk",
                "start_date": "2024-01-01",
                "end_date": "2024-12-31",
            })),
            answer_turn("musk said things"),
        ]);

        let result = harness.run_case(&case).await;

        assert!(result.overall_match, "matches: {:?}", result.filter_matches);
        assert_eq!(result.answer, "musk said things");
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.actual_filters["speaker"], "Elon Musk");

        // The captured filters also reached the retriever, with dates parsed
        let captured = search.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].filters.speaker.as_deref(), Some("Elon Musk"));
        assert!(captured[0].filters.start_date.is_some());
        assert!(captured[0].filters.end_date.is_some());
    }

    #[tokio::test]
    async fn unexpected_speaker_binding_fails_the_case() {
        let case = ToolParamsDataset::new().get_by_id("edge_001").unwrap().clone();
        let (harness, _) = harness(vec![
            tool_turn(serde_json::json!({
                "query": "Elon Musk companies",
                "speaker": "Elon Musk",
            })),
            answer_turn("answer"),
        ]);

        let result = harness.run_case(&case).await;
        assert!(!result.overall_match);
        assert_eq!(result.filter_matches["speaker"], false);
    }

    #[tokio::test]
    async fn no_tool_call_with_expected_filters_is_a_miss() {
        let case = ToolParamsDataset::new().get_by_id("speaker_001").unwrap().clone();
        let (harness, _) = harness(vec![answer_turn("no tool used")]);

        let result = harness.run_case(&case).await;
        assert!(!result.overall_match);
        assert!(result.actual_filters.is_empty());
        assert!(result.error.is_none());
    }
}
