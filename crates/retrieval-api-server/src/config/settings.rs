use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Process-wide settings, loaded once at startup and immutable afterwards.
///
/// Sources, in precedence order: environment variables (optionally via a
/// `.env` file) over an optional `config/settings.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    // Database
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_host: String,
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,
    pub postgres_db: String,

    // Chunking
    #[serde(default = "default_chunk_min_tokens")]
    pub chunk_min_tokens: usize,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default = "default_chunk_overlap_tokens")]
    pub chunk_overlap_tokens: usize,

    // Retrieval
    #[serde(default = "default_retrieval_n")]
    pub default_retrieval_n: usize,
    #[serde(default = "default_rerank_k")]
    pub default_rerank_k: usize,
    #[serde(default = "default_speaker")]
    pub default_speaker: String,

    // LLM / embeddings
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    // Tracing
    pub langsmith_api_key: Option<String>,
    #[serde(default = "default_langsmith_project")]
    pub langsmith_project: String,
    #[serde(default = "default_langsmith_endpoint")]
    pub langsmith_endpoint: String,
    #[serde(default)]
    pub langsmith_tracing: bool,

    // API
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    pub api_base_url: Option<String>,
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_chunk_min_tokens() -> usize {
    400
}

fn default_chunk_max_tokens() -> usize {
    800
}

fn default_chunk_overlap_tokens() -> usize {
    50
}

fn default_retrieval_n() -> usize {
    50
}

fn default_rerank_k() -> usize {
    8
}

fn default_speaker() -> String {
    "Dwarkesh Patel".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_chat_model() -> String {
    "gpt-5-nano".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    1536
}

fn default_langsmith_project() -> String {
    "retrieval-evals".to_string()
}

fn default_langsmith_endpoint() -> String {
    "https://api.smith.langchain.com".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_host,
            self.postgres_port,
            self.postgres_db
        )
    }
}
