//! Unified evaluation harness.
//!
//! Dispatches to the retrieval-quality or tool-parameter runner; flags
//! after `--eval-type` pass through to the selected runner.
//!
//! ```text
//! harness --eval-type retrieval --agent multi-query --k 5 10 15
//! harness --eval-type tool-params --category speaker_filter
//! ```

use anyhow::Result;
use clap::{Parser, ValueEnum};

use retrieval_evals::tasks::retrieval::runner::{self as retrieval_runner, RetrievalArgs};
use retrieval_evals::tasks::tool_params::runner::{self as tool_params_runner, ToolParamsArgs};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EvalType {
    /// Retrieval quality against ground-truth chunk ids
    Retrieval,
    /// Agent filter-parameter extraction
    ToolParams,
}

#[derive(Debug, Parser)]
#[command(
    name = "harness",
    about = "Unified evaluation harness for running eval batches"
)]
struct Cli {
    #[arg(long = "eval-type", short = 't', value_enum)]
    eval_type: Option<EvalType>,

    /// List available eval types and exit
    #[arg(long, short)]
    list: bool,

    /// Arguments passed through to the selected eval runner
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    if cli.list {
        println!("Available eval types:");
        println!("  retrieval    Run retrieval quality evaluation against ground truth chunks");
        println!("  tool-params  Run agent tool parameter extraction evaluation");
        return Ok(());
    }

    let Some(eval_type) = cli.eval_type else {
        anyhow::bail!("--eval-type is required (use --list to see available types)");
    };

    let exit_code = match eval_type {
        EvalType::Retrieval => {
            let args = RetrievalArgs::parse_from(
                std::iter::once("harness-retrieval".to_string()).chain(cli.rest),
            );
            retrieval_runner::run(args).await?
        }
        EvalType::ToolParams => {
            let args = ToolParamsArgs::parse_from(
                std::iter::once("harness-tool-params".to_string()).chain(cli.rest),
            );
            tool_params_runner::run(args).await?
        }
    };

    std::process::exit(exit_code);
}
