pub mod agents;
pub mod embedding;
pub mod ingestion;
pub mod llm;

pub use embedding::EmbeddingService;
pub use ingestion::IngestionService;
pub use llm::LlmService;
