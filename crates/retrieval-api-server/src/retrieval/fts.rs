use super::models::{
    FtsOperator, RetrievalFilters, RetrievalResponse, RetrievalResult, RetrievalTiming,
};
use crate::database::Repository;
use crate::utils::error::ApiError;
use crate::utils::timing::{round_ms, Timer};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Common English stop words that the Postgres FTS dictionary removes.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
        "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "will", "with",
        "not", "but", "they", "have", "been", "would", "could", "should", "their", "there",
    ]
    .into_iter()
    .collect()
});

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-zA-Z0-9]+").expect("valid regex"));

/// Builds an OR tsquery (`term | term | ...`) from a natural-language
/// query: alphanumeric terms, lower-cased, stop words and single
/// characters removed. Returns `None` when nothing meaningful remains,
/// in which case the caller falls back to the websearch parser.
pub fn build_or_tsquery(query: &str) -> Option<String> {
    let terms: Vec<String> = WORD_RE
        .find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(w.as_str()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" | "))
    }
}

/// Compiled FTS query: the string handed to the store plus the parser
/// function that interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTsQuery {
    pub tsquery: String,
    pub websearch: bool,
}

pub fn compile_tsquery(query: &str, operator: FtsOperator) -> CompiledTsQuery {
    match operator {
        FtsOperator::Or => match build_or_tsquery(query) {
            Some(or_query) => CompiledTsQuery {
                tsquery: or_query,
                websearch: false,
            },
            // Every term was a stop word; websearch keeps phrases intact
            None => CompiledTsQuery {
                tsquery: query.to_string(),
                websearch: true,
            },
        },
        FtsOperator::And => CompiledTsQuery {
            tsquery: query.to_string(),
            websearch: true,
        },
    }
}

/// Lexical retriever over the chunk tsvector index, ranked by `ts_rank`
/// with ties broken by ascending chunk id.
pub struct FtsRetriever {
    repository: Arc<Repository>,
}

impl FtsRetriever {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        n: usize,
        filters: &RetrievalFilters,
        operator: FtsOperator,
    ) -> Result<RetrievalResponse, ApiError> {
        if n == 0 {
            return Err(ApiError::BadInput("n must be >= 1".to_string()));
        }

        let compiled = compile_tsquery(query, operator);
        let timer = Timer::start();

        let rows = self
            .repository
            .query_chunks_fts(&compiled.tsquery, compiled.websearch, filters, n)
            .await?;

        let retrieval_ms = round_ms(timer.elapsed_ms());
        debug!(
            results = rows.len(),
            retrieval_ms, "fts retrieval complete"
        );

        Ok(RetrievalResponse {
            chunks: rows.into_iter().map(RetrievalResult::from).collect(),
            timing_ms: RetrievalTiming {
                retrieval_ms: Some(retrieval_ms),
                total_ms: retrieval_ms,
                ..Default::default()
            },
        })
    }

    /// EXPLAIN (ANALYZE, BUFFERS) output for the same query shape.
    pub async fn explain(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        operator: FtsOperator,
        n: usize,
    ) -> Result<String, ApiError> {
        let compiled = compile_tsquery(query, operator);
        self.repository
            .explain_chunks_fts(&compiled.tsquery, compiled.websearch, filters, n)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn or_query_drops_stop_words_and_short_terms() {
        let q = build_or_tsquery("what is the meaning of reinforcement learning");
        assert_eq!(q.as_deref(), Some("what | meaning | reinforcement | learning"));
    }

    #[test]
    fn or_query_lowercases_and_keeps_numbers() {
        let q = build_or_tsquery("GPT-4 Results 2024");
        assert_eq!(q.as_deref(), Some("gpt | results | 2024"));
    }

    #[test]
    fn all_stop_words_yields_none() {
        assert_eq!(build_or_tsquery("the and of"), None);
        assert_eq!(build_or_tsquery(""), None);
        assert_eq!(build_or_tsquery("a I"), None);
    }

    #[test]
    fn compile_or_falls_back_to_websearch() {
        let compiled = compile_tsquery("the and", FtsOperator::Or);
        assert!(compiled.websearch);
        assert_eq!(compiled.tsquery, "the and");
    }

    #[test]
    fn compile_and_uses_websearch_parser() {
        let compiled = compile_tsquery(r#""model scaling" safety"#, FtsOperator::And);
        assert!(compiled.websearch);
        assert_eq!(compiled.tsquery, r#""model scaling" safety"#);
    }

    #[test]
    fn compile_or_builds_disjunction() {
        let compiled = compile_tsquery("agents timeline", FtsOperator::Or);
        assert!(!compiled.websearch);
        assert_eq!(compiled.tsquery, "agents | timeline");
    }
}
