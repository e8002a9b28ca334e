//! Eval dataset schema and loader.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub const DEFAULT_DATASET_PATH: &str = "crates/retrieval-evals/datasets/eval_questions.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    /// Direct fact recall from a transcript.
    Factual,
    /// Requires reasoning across transcript content.
    Analytical,
    /// Asks about subjective views expressed.
    Opinion,
}

impl QuestionType {
    pub const ALL: [QuestionType; 3] = [
        QuestionType::Factual,
        QuestionType::Analytical,
        QuestionType::Opinion,
    ];
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuestionType::Factual => "factual",
            QuestionType::Analytical => "analytical",
            QuestionType::Opinion => "opinion",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLevel {
    /// Single chunk, direct answer.
    Easy,
    /// Multi-chunk or simple reasoning.
    Medium,
    /// Synthesis across multiple sections.
    Hard,
}

impl DifficultyLevel {
    pub const ALL: [DifficultyLevel; 3] = [
        DifficultyLevel::Easy,
        DifficultyLevel::Medium,
        DifficultyLevel::Hard,
    ];
}

impl fmt::Display for DifficultyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DifficultyLevel::Easy => "easy",
            DifficultyLevel::Medium => "medium",
            DifficultyLevel::Hard => "hard",
        };
        f.write_str(s)
    }
}

/// One evaluation question with ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalTask {
    pub id: String,
    pub question: String,
    pub reference_answer: String,
    pub expected_sections: Vec<String>,
    pub difficulty_level: DifficultyLevel,
    /// Database chunk ids containing the answer, populated after
    /// ingestion.
    #[serde(default)]
    pub source_chunk_ids: Option<Vec<i64>>,
    pub question_type: QuestionType,
    #[serde(default)]
    pub transcript_source: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Versioned collection of eval questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalDataset {
    pub version: String,
    pub description: String,
    pub created_at: String,
    pub examples: Vec<EvalTask>,
}

pub fn load_eval_dataset(path: &Path) -> Result<EvalDataset> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read eval dataset at {}", path.display()))?;
    let dataset: EvalDataset = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse eval dataset at {}", path.display()))?;
    anyhow::ensure!(
        !dataset.examples.is_empty(),
        "eval dataset {} contains no examples",
        path.display()
    );
    Ok(dataset)
}
