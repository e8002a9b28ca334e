use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

mod config;
mod database;
mod handlers;
mod observability;
mod retrieval;
mod services;
mod utils;

use config::Settings;
use database::{DbPool, Repository};
use retrieval::expand::TurnExpander;
use retrieval::{RetrieverService, SearchProvider};
use services::agents::AgentFactory;
use services::embedding::Embedder;
use services::ingestion::TokenChunker;
use services::llm::ChatClient;
use services::{EmbeddingService, IngestionService, LlmService};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,retrieval_api_server=debug".to_string()),
        )
        .with_target(true)
        .init();

    info!("Starting retrieval API server...");

    let settings = Arc::new(Settings::load()?);
    info!("Configuration loaded");

    observability::trace::initialize_tracing(&settings);

    let db_pool = DbPool::new(&settings).await?;
    info!("Database connection established");

    let repository = Arc::new(Repository::new(
        db_pool.clone(),
        settings.default_speaker.clone(),
    ));

    let embedding_service: Arc<dyn Embedder> = Arc::new(EmbeddingService::new(&settings));
    let llm_service: Arc<dyn ChatClient> = Arc::new(LlmService::new(&settings));

    let retriever = Arc::new(RetrieverService::new(
        repository.clone(),
        embedding_service.clone(),
    ));
    let expander = Arc::new(TurnExpander::new(repository.clone()));

    let ingestion = Arc::new(IngestionService::new(
        repository.clone(),
        settings
            .openai_api_key
            .is_some()
            .then(|| embedding_service.clone()),
        TokenChunker::from_settings(&settings)?,
    ));

    let search: Arc<dyn SearchProvider> = retriever.clone();
    let agents = Arc::new(AgentFactory::new(search, llm_service));

    let app = build_router(settings.clone(), retriever, expander, ingestion, agents);

    let addr = SocketAddr::from((settings.api_host.parse::<std::net::IpAddr>()?, settings.api_port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final trace flush before the pool goes away
    observability::trace::shutdown_tracing().await;
    db_pool.close().await;
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

fn build_router(
    settings: Arc<Settings>,
    retriever: Arc<RetrieverService>,
    expander: Arc<TurnExpander>,
    ingestion: Arc<IngestionService>,
    agents: Arc<AgentFactory>,
) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health::health_check))
        .route("/api/chat/completion", post(handlers::chat::chat_completion))
        .route("/api/retrieval/query", post(handlers::retrieval::query_chunks))
        .route("/api/retrieval/expand", post(handlers::retrieval::expand_chunks))
        .route("/api/retrieval/qa-pairs", post(handlers::retrieval::qa_pairs))
        .route(
            "/api/retrieval/bench",
            get(handlers::retrieval::benchmark_retrieval),
        )
        .route("/api/ingest/text", post(handlers::ingest::ingest_text))
        .layer(Extension(settings))
        .layer(Extension(retriever))
        .layer(Extension(expander))
        .layer(Extension(ingestion))
        .layer(Extension(agents))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
