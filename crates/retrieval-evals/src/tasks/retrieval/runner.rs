//! Retrieval-quality evaluation runner.
//!
//! Runs an agent over the curated eval dataset and scores the chunk ids
//! it retrieved against the ground truth, at each configured `k`.

use super::dataset::{load_eval_dataset, DifficultyLevel, EvalTask, QuestionType,
    DEFAULT_DATASET_PATH};
use crate::metrics::retrieval::{compute_retrieval_metrics, RetrievalMetrics};
use crate::results::{
    build_metrics_breakdown, EvalResult, EvalRunResults, MetricsBreakdown, RunError,
};
use anyhow::Result;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use retrieval_api_server::config::Settings;
use retrieval_api_server::database::{DbPool, Repository};
use retrieval_api_server::observability::trace;
use retrieval_api_server::retrieval::models::{
    FtsOperator, RetrievalMode, RetrievalParams,
};
use retrieval_api_server::retrieval::{RetrieverService, SearchProvider};
use retrieval_api_server::services::agents::{Agent, AgentFactory, AgentType};
use retrieval_api_server::services::embedding::Embedder;
use retrieval_api_server::services::llm::{ChatClient, TokenUsage};
use retrieval_api_server::services::{EmbeddingService, LlmService};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AgentArg {
    Vanilla,
    MultiQuery,
}

impl From<AgentArg> for AgentType {
    fn from(arg: AgentArg) -> Self {
        match arg {
            AgentArg::Vanilla => AgentType::Vanilla,
            AgentArg::MultiQuery => AgentType::MultiQuery,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Fts,
    Vector,
    Hybrid,
}

impl From<ModeArg> for RetrievalMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Fts => RetrievalMode::Fts,
            ModeArg::Vector => RetrievalMode::Vector,
            ModeArg::Hybrid => RetrievalMode::Hybrid,
        }
    }
}

/// Run retrieval evaluation on RAG agents.
#[derive(Debug, Parser)]
#[command(name = "harness-retrieval")]
pub struct RetrievalArgs {
    /// Agent type to evaluate
    #[arg(long, value_enum, default_value = "multi-query")]
    pub agent: AgentArg,

    /// Path to the eval dataset JSON
    #[arg(long)]
    pub dataset: Option<PathBuf>,

    /// Number of examples to evaluate (default: all)
    #[arg(long)]
    pub num_samples: Option<usize>,

    /// K values for @k metrics
    #[arg(long, num_args = 1.., default_values_t = [5, 10, 15])]
    pub k: Vec<usize>,

    /// Retrieval mode
    #[arg(long, value_enum, default_value = "hybrid")]
    pub mode: ModeArg,

    /// Number of FTS candidates for hybrid mode
    #[arg(long, default_value_t = 100)]
    pub fts_candidates: usize,

    /// Number of chunks returned after reranking
    #[arg(long, default_value_t = 15)]
    pub max_returned: usize,

    /// Output directory for results
    #[arg(long, default_value = "evals/results")]
    pub output_dir: PathBuf,

    /// Timeout per example in seconds
    #[arg(long)]
    pub timeout: Option<f64>,
}

fn empty_result(
    task: &EvalTask,
    ground_truth: &[i64],
    k_values: &[usize],
    latency_ms: f64,
    error: String,
) -> EvalResult {
    let metrics_by_k: BTreeMap<usize, RetrievalMetrics> = k_values
        .iter()
        .map(|&k| (k, compute_retrieval_metrics(&[], ground_truth, k)))
        .collect();

    EvalResult {
        eval_id: task.id.clone(),
        question: task.question.clone(),
        question_type: task.question_type,
        difficulty_level: task.difficulty_level,
        reference_answer: task.reference_answer.clone(),
        expected_chunk_ids: ground_truth.to_vec(),
        generated_answer: String::new(),
        retrieved_chunk_ids: Vec::new(),
        metrics_by_k,
        latency_ms,
        model_used: String::new(),
        tokens_used: TokenUsage::default(),
        trace_id: None,
        sub_queries: None,
        success: false,
        error: Some(error),
    }
}

async fn run_single_eval(
    agent: &dyn Agent,
    task: &EvalTask,
    params: &RetrievalParams,
    k_values: &[usize],
    timeout: Option<f64>,
) -> EvalResult {
    let ground_truth: Vec<i64> = task.source_chunk_ids.clone().unwrap_or_default();

    // Transient store failures retry once at this level only
    let mut attempt = 0;
    let response = loop {
        let generate = agent.generate(&task.question, params);
        let outcome = match timeout {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs_f64(seconds), generate).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        return empty_result(
                            task,
                            &ground_truth,
                            k_values,
                            seconds * 1000.0,
                            "timeout".to_string(),
                        );
                    }
                }
            }
            None => generate.await,
        };

        match outcome {
            Ok(response) => break response,
            Err(e) if e.is_retriable() && attempt == 0 => {
                warn!(eval_id = %task.id, "retrying after transient failure: {}", e);
                attempt += 1;
            }
            Err(e) => {
                return empty_result(task, &ground_truth, k_values, 0.0, e.to_string());
            }
        }
    };

    let retrieved_ids: Vec<i64> = response
        .retrieved_chunks
        .iter()
        .map(|chunk| chunk.chunk_id)
        .collect();

    let metrics_by_k: BTreeMap<usize, RetrievalMetrics> = k_values
        .iter()
        .map(|&k| (k, compute_retrieval_metrics(&retrieved_ids, &ground_truth, k)))
        .collect();

    EvalResult {
        eval_id: task.id.clone(),
        question: task.question.clone(),
        question_type: task.question_type,
        difficulty_level: task.difficulty_level,
        reference_answer: task.reference_answer.clone(),
        expected_chunk_ids: ground_truth,
        generated_answer: response.answer,
        retrieved_chunk_ids: retrieved_ids,
        metrics_by_k,
        latency_ms: response.latency_ms,
        model_used: response.model_used,
        tokens_used: response.tokens_used,
        trace_id: response.trace_id,
        sub_queries: (!response.sub_queries.is_empty()).then_some(response.sub_queries),
        success: true,
        error: None,
    }
}

fn generate_markdown_report(run: &EvalRunResults) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Evaluation Results\n");
    let _ = writeln!(out, "## Configuration");
    let _ = writeln!(out, "- **Run ID:** {}", run.run_id);
    let _ = writeln!(out, "- **Agent:** {}", run.agent_type);
    let _ = writeln!(out, "- **Dataset:** {}", run.dataset_path);
    let _ = writeln!(out, "- **Dataset Version:** {}", run.dataset_version);
    let _ = writeln!(out, "- **Retrieval Mode:** {}", run.retrieval_mode);
    let _ = writeln!(out, "- **FTS Candidates:** {}", run.fts_candidates);
    let _ = writeln!(out, "- **Max Returned:** {}", run.max_returned);
    let _ = writeln!(out, "- **K Values:** {:?}", run.k_values);
    let _ = writeln!(out, "- **Started:** {}", run.started_at.to_rfc3339());
    let _ = writeln!(out, "- **Completed:** {}", run.completed_at.to_rfc3339());
    let _ = writeln!(out, "- **Duration:** {:.1}s\n", run.total_duration_seconds());

    let _ = writeln!(out, "## Summary");
    let _ = writeln!(out, "- **Total Examples:** {}", run.total_examples());
    let _ = writeln!(
        out,
        "- **Successful:** {} ({:.1}%)",
        run.num_successful,
        run.success_rate() * 100.0
    );
    let _ = writeln!(out, "- **Failed:** {}\n", run.num_failed);

    let _ = writeln!(out, "## Overall Metrics\n");
    let mut header = "| Metric |".to_string();
    let mut divider = "|--------|".to_string();
    for k in &run.k_values {
        let _ = write!(header, " k={} |", k);
        divider.push_str("------|");
    }
    let _ = writeln!(out, "{}", header);
    let _ = writeln!(out, "{}", divider);

    let rows: [(&str, fn(&MetricsBreakdown) -> &crate::results::MetricStats); 5] = [
        ("Recall", |b| &b.recall),
        ("Precision", |b| &b.precision),
        ("Hit Rate", |b| &b.hit_rate),
        ("MRR", |b| &b.mrr),
        ("NDCG", |b| &b.ndcg),
    ];
    for (name, pick) in rows {
        let mut row = format!("| {} |", name);
        for k in &run.k_values {
            match run.overall_by_k.get(k) {
                Some(breakdown) => {
                    let stats = pick(breakdown);
                    let _ = write!(row, " {:.3} ± {:.3} |", stats.mean, stats.std);
                }
                None => row.push_str(" - |"),
            }
        }
        let _ = writeln!(out, "{}", row);
    }
    let _ = writeln!(out);

    if let Some(first_k) = run.k_values.first() {
        if let Some(breakdown) = run.overall_by_k.get(first_k) {
            let _ = writeln!(out, "## Latency");
            let _ = writeln!(out, "- **Mean:** {:.0}ms", breakdown.latency_ms.mean);
            let _ = writeln!(out, "- **Median:** {:.0}ms", breakdown.latency_ms.median);
            let _ = writeln!(out, "- **Min:** {:.0}ms", breakdown.latency_ms.min);
            let _ = writeln!(out, "- **Max:** {:.0}ms\n", breakdown.latency_ms.max);
        }

        let _ = writeln!(out, "## By Difficulty (k={})\n", first_k);
        let _ = writeln!(out, "| Difficulty | Count | Recall | Precision | MRR |");
        let _ = writeln!(out, "|------------|-------|--------|-----------|-----|");
        for level in DifficultyLevel::ALL {
            if let Some(breakdown) = run
                .by_difficulty
                .get(&level.to_string())
                .and_then(|by_k| by_k.get(first_k))
            {
                let _ = writeln!(
                    out,
                    "| {} | {} | {:.3} | {:.3} | {:.3} |",
                    level,
                    breakdown.count,
                    breakdown.recall.mean,
                    breakdown.precision.mean,
                    breakdown.mrr.mean
                );
            }
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "## By Question Type (k={})\n", first_k);
        let _ = writeln!(out, "| Type | Count | Recall | Precision | MRR |");
        let _ = writeln!(out, "|------|-------|--------|-----------|-----|");
        for qtype in QuestionType::ALL {
            if let Some(breakdown) = run
                .by_question_type
                .get(&qtype.to_string())
                .and_then(|by_k| by_k.get(first_k))
            {
                let _ = writeln!(
                    out,
                    "| {} | {} | {:.3} | {:.3} | {:.3} |",
                    qtype,
                    breakdown.count,
                    breakdown.recall.mean,
                    breakdown.precision.mean,
                    breakdown.mrr.mean
                );
            }
        }
        let _ = writeln!(out);
    }

    if !run.errors.is_empty() {
        let _ = writeln!(out, "## Failed Examples\n");
        for error in &run.errors {
            let _ = writeln!(out, "- **{}**: {}", error.eval_id, error.error);
        }
        let _ = writeln!(out);
    }

    out
}

/// Entry point: runs the eval, writes JSON + markdown keyed by the run
/// id, prints a terminal summary. Returns the process exit code.
pub async fn run(args: RetrievalArgs) -> Result<i32> {
    let run_id = format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &Uuid::new_v4().to_string()[..8]
    );

    let dataset_path = args
        .dataset
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_PATH));
    let dataset = load_eval_dataset(&dataset_path)?;
    info!(
        examples = dataset.examples.len(),
        version = %dataset.version,
        "loaded eval dataset"
    );

    let mut examples = dataset.examples.clone();
    if let Some(n) = args.num_samples {
        examples.truncate(n);
        info!(sampled = examples.len(), "sampling examples");
    }

    let settings = Settings::load()?;
    trace::initialize_tracing(&settings);

    let pool = DbPool::new(&settings).await?;
    let repository = Arc::new(Repository::new(
        pool.clone(),
        settings.default_speaker.clone(),
    ));

    let chunk_count = repository.count_chunks().await?;
    info!(chunk_count, "database contains chunks");
    if chunk_count == 0 {
        warn!("no chunks in database, metrics will be 0");
    }

    let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingService::new(&settings));
    let chat: Arc<dyn ChatClient> = Arc::new(LlmService::new(&settings));
    let search: Arc<dyn SearchProvider> =
        Arc::new(RetrieverService::new(repository.clone(), embedder));
    let factory = AgentFactory::new(search, chat);

    let agent_type: AgentType = args.agent.into();
    let agent = factory.get(agent_type);
    let agent_name = match agent_type {
        AgentType::Vanilla => "vanilla",
        AgentType::MultiQuery => "multi-query",
    };
    info!(agent = agent_name, "agent ready");

    let params = RetrievalParams {
        mode: args.mode.into(),
        operator: FtsOperator::Or,
        fts_candidates: args.fts_candidates,
        max_returned: args.max_returned,
        filters: Default::default(),
    };

    let started_at = Utc::now();
    let mut results = Vec::with_capacity(examples.len());
    for (i, task) in examples.iter().enumerate() {
        info!(
            eval_id = %task.id,
            progress = format!("{}/{}", i + 1, examples.len()),
            "evaluating"
        );
        let result = run_single_eval(agent.as_ref(), task, &params, &args.k, args.timeout).await;
        results.push(result);
    }
    let completed_at = Utc::now();

    trace::force_flush().await;

    let mut overall_by_k = BTreeMap::new();
    for &k in &args.k {
        overall_by_k.insert(k, build_metrics_breakdown(&results, k));
    }

    let mut by_difficulty = BTreeMap::new();
    for level in DifficultyLevel::ALL {
        let group: Vec<EvalResult> = results
            .iter()
            .filter(|r| r.difficulty_level == level)
            .cloned()
            .collect();
        if !group.is_empty() {
            let mut by_k = BTreeMap::new();
            for &k in &args.k {
                by_k.insert(k, build_metrics_breakdown(&group, k));
            }
            by_difficulty.insert(level.to_string(), by_k);
        }
    }

    let mut by_question_type = BTreeMap::new();
    for qtype in QuestionType::ALL {
        let group: Vec<EvalResult> = results
            .iter()
            .filter(|r| r.question_type == qtype)
            .cloned()
            .collect();
        if !group.is_empty() {
            let mut by_k = BTreeMap::new();
            for &k in &args.k {
                by_k.insert(k, build_metrics_breakdown(&group, k));
            }
            by_question_type.insert(qtype.to_string(), by_k);
        }
    }

    let errors: Vec<RunError> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| RunError {
            eval_id: r.eval_id.clone(),
            error: r.error.clone().unwrap_or_else(|| "unknown".to_string()),
        })
        .collect();

    let num_successful = results.iter().filter(|r| r.success).count();
    let num_failed = results.len() - num_successful;

    let run_results = EvalRunResults {
        run_id: run_id.clone(),
        agent_type: agent_name.to_string(),
        dataset_path: dataset_path.display().to_string(),
        dataset_version: dataset.version,
        retrieval_mode: format!("{:?}", args.mode).to_lowercase(),
        fts_candidates: args.fts_candidates,
        max_returned: args.max_returned,
        k_values: args.k.clone(),
        started_at,
        completed_at,
        results,
        overall_by_k,
        by_difficulty,
        by_question_type,
        num_successful,
        num_failed,
        errors,
    };

    std::fs::create_dir_all(&args.output_dir)?;
    let json_path = args.output_dir.join(format!("{}_results.json", run_id));
    std::fs::write(&json_path, serde_json::to_string_pretty(&run_results)?)?;
    info!(path = %json_path.display(), "JSON results saved");

    let md_path = args.output_dir.join(format!("{}_summary.md", run_id));
    std::fs::write(&md_path, generate_markdown_report(&run_results))?;
    info!(path = %md_path.display(), "markdown report saved");

    println!("\n{}", "=".repeat(60));
    println!("EVALUATION COMPLETE");
    println!("{}", "=".repeat(60));
    println!("Agent: {}", agent_name);
    println!(
        "Examples: {} ({} successful)",
        run_results.total_examples(),
        run_results.num_successful
    );
    println!("Duration: {:.1}s", run_results.total_duration_seconds());
    println!();
    for k in &run_results.k_values {
        if let Some(breakdown) = run_results.overall_by_k.get(k) {
            println!("k={}:", k);
            println!(
                "  Recall:    {:.3} ± {:.3}",
                breakdown.recall.mean, breakdown.recall.std
            );
            println!(
                "  Precision: {:.3} ± {:.3}",
                breakdown.precision.mean, breakdown.precision.std
            );
            println!("  Hit Rate:  {:.3}", breakdown.hit_rate.mean);
            println!(
                "  MRR:       {:.3} ± {:.3} (defined for {} items)",
                breakdown.mrr.mean, breakdown.mrr.std, breakdown.mrr.count
            );
            println!(
                "  NDCG:      {:.3} ± {:.3}",
                breakdown.ndcg.mean, breakdown.ndcg.std
            );
            println!();
        }
    }
    println!("Results: {}", json_path.display());
    println!("Summary: {}", md_path.display());
    println!("{}", "=".repeat(60));

    pool.close().await;

    Ok(0)
}
