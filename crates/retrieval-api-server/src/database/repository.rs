use super::models::{
    CandidateSimilarity, ChunkTurnRow, NewChunk, NewDocument, NewTurn, RetrievedChunkRow, TurnRow,
};
use super::DbPool;
use crate::retrieval::models::RetrievalFilters;
use crate::utils::error::ApiError;
use pgvector::Vector;
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::debug;

const TSQUERY_FN_PLAIN: &str = "to_tsquery";
const TSQUERY_FN_WEBSEARCH: &str = "websearch_to_tsquery";

/// Typed access to docs/turns/chunks/embeddings.
///
/// All reads bind user input as parameters; nothing is interpolated into
/// SQL text. Mutations run inside a caller-owned transaction so a failed
/// ingest rolls back the whole document.
pub struct Repository {
    pool: DbPool,
    default_speaker: String,
}

impl Repository {
    pub fn new(pool: DbPool, default_speaker: String) -> Self {
        Self {
            pool,
            default_speaker,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, ApiError> {
        Ok(self.pool.get_pool().begin().await?)
    }

    pub async fn count_chunks(&self) -> Result<i64, ApiError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chunks")
            .fetch_one(self.pool.get_pool())
            .await?;
        Ok(count)
    }

    pub async fn insert_doc(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        doc: &NewDocument,
    ) -> Result<i64, ApiError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO docs (source, url, title, doc_type, published_at, metadata, raw_text)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING id"#,
        )
        .bind(&doc.source)
        .bind(&doc.url)
        .bind(&doc.title)
        .bind(doc.doc_type.as_str())
        .bind(doc.published_at)
        .bind(&doc.metadata)
        .bind(&doc.raw_text)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    pub async fn insert_turns(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        doc_id: i64,
        turns: &[NewTurn],
    ) -> Result<Vec<i64>, ApiError> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO turns (doc_id, ord, speaker, start_time_s, section, text, token_count) ",
        );
        qb.push_values(turns, |mut b, turn| {
            b.push_bind(doc_id)
                .push_bind(turn.ord)
                .push_bind(&turn.speaker)
                .push_bind(turn.start_time_s)
                .push_bind(&turn.section)
                .push_bind(&turn.text)
                .push_bind(turn.token_count);
        });
        qb.push(" RETURNING id");

        let ids: Vec<i64> = qb.build_query_scalar().fetch_all(&mut **tx).await?;
        debug!("Inserted {} turns for doc {}", ids.len(), doc_id);

        Ok(ids)
    }

    /// Inserts chunks, resolving each chunk's `turn_index` against the
    /// turn ids created in the same transaction. The `tsv` column is a
    /// stored generated column and is not written here.
    pub async fn insert_chunks_with_turn(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        doc_id: i64,
        chunks: &[NewChunk],
        turn_ids: &[i64],
    ) -> Result<Vec<i64>, ApiError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        for chunk in chunks {
            if let Some(idx) = chunk.turn_index {
                if idx >= turn_ids.len() {
                    return Err(ApiError::Internal(format!(
                        "chunk ord {} references turn index {} but only {} turns were inserted",
                        chunk.ord,
                        idx,
                        turn_ids.len()
                    )));
                }
            }
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO chunks (doc_id, turn_id, ord, text, token_count) ",
        );
        qb.push_values(chunks, |mut b, chunk| {
            b.push_bind(doc_id)
                .push_bind(chunk.turn_index.map(|idx| turn_ids[idx]))
                .push_bind(chunk.ord)
                .push_bind(&chunk.text)
                .push_bind(chunk.token_count);
        });
        qb.push(" RETURNING id");

        let ids: Vec<i64> = qb.build_query_scalar().fetch_all(&mut **tx).await?;
        debug!("Inserted {} chunks for doc {}", ids.len(), doc_id);

        Ok(ids)
    }

    pub async fn insert_embeddings(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        embeddings: &[(i64, Vec<f32>)],
    ) -> Result<(), ApiError> {
        if embeddings.is_empty() {
            return Ok(());
        }

        let mut qb =
            QueryBuilder::<Postgres>::new("INSERT INTO chunk_embeddings (chunk_id, embedding) ");
        qb.push_values(embeddings, |mut b, (chunk_id, embedding)| {
            b.push_bind(*chunk_id)
                .push_bind(Vector::from(embedding.clone()));
        });

        qb.build().execute(&mut **tx).await?;
        debug!("Inserted {} chunk embeddings", embeddings.len());

        Ok(())
    }

    /// Ranked FTS scan. `tsquery` is already compiled by the lexical
    /// retriever; `websearch` selects the parser function.
    pub async fn query_chunks_fts(
        &self,
        tsquery: &str,
        websearch: bool,
        filters: &RetrievalFilters,
        n: usize,
    ) -> Result<Vec<RetrievedChunkRow>, ApiError> {
        let mut qb = self.fts_query_builder(tsquery, websearch, filters, n, false);
        let rows = qb
            .build_query_as::<RetrievedChunkRow>()
            .fetch_all(self.pool.get_pool())
            .await?;
        Ok(rows)
    }

    pub async fn explain_chunks_fts(
        &self,
        tsquery: &str,
        websearch: bool,
        filters: &RetrievalFilters,
        n: usize,
    ) -> Result<String, ApiError> {
        let mut qb = self.fts_query_builder(tsquery, websearch, filters, n, true);
        let lines: Vec<String> = qb
            .build_query_scalar()
            .fetch_all(self.pool.get_pool())
            .await?;
        Ok(lines.join("\n"))
    }

    /// Cosine scan over every embedded chunk, scored as `1 - distance`.
    pub async fn query_chunks_vector(
        &self,
        embedding: Vector,
        filters: &RetrievalFilters,
        n: usize,
    ) -> Result<Vec<RetrievedChunkRow>, ApiError> {
        let mut qb = self.vector_query_builder(embedding, filters, n, false);
        let rows = qb
            .build_query_as::<RetrievedChunkRow>()
            .fetch_all(self.pool.get_pool())
            .await?;
        Ok(rows)
    }

    pub async fn explain_chunks_vector(
        &self,
        embedding: Vector,
        filters: &RetrievalFilters,
        n: usize,
    ) -> Result<String, ApiError> {
        let mut qb = self.vector_query_builder(embedding, filters, n, true);
        let lines: Vec<String> = qb
            .build_query_scalar()
            .fetch_all(self.pool.get_pool())
            .await?;
        Ok(lines.join("\n"))
    }

    /// Computes cosine similarity between the query embedding and exactly
    /// the candidate chunks. Candidates without an embedding are absent
    /// from the result.
    pub async fn rerank_by_vector(
        &self,
        embedding: Vector,
        chunk_ids: &[i64],
    ) -> Result<Vec<CandidateSimilarity>, ApiError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, CandidateSimilarity>(
            r#"SELECT
                ce.chunk_id,
                1 - (ce.embedding <=> $1) AS similarity
               FROM chunk_embeddings ce
               WHERE ce.chunk_id = ANY($2)"#,
        )
        .bind(embedding)
        .bind(chunk_ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows)
    }

    /// Resolves chunks to their owning turns, joined with document
    /// metadata. Chunks without a turn (non-transcript documents) are
    /// omitted.
    pub async fn fetch_turns_by_chunk_ids(
        &self,
        chunk_ids: &[i64],
    ) -> Result<Vec<ChunkTurnRow>, ApiError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ChunkTurnRow>(
            r#"SELECT
                c.id AS chunk_id,
                t.id AS turn_id,
                t.doc_id,
                t.ord,
                t.speaker,
                t.start_time_s,
                t.section,
                t.text,
                t.token_count,
                d.url,
                d.title,
                d.published_at,
                d.source
               FROM chunks c
               INNER JOIN turns t ON c.turn_id = t.id
               INNER JOIN docs d ON t.doc_id = d.id
               WHERE c.id = ANY($1)"#,
        )
        .bind(chunk_ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows)
    }

    pub async fn fetch_turns_by_ids(&self, turn_ids: &[i64]) -> Result<Vec<TurnRow>, ApiError> {
        if turn_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, TurnRow>(
            r#"SELECT
                t.id AS turn_id,
                t.doc_id,
                t.ord,
                t.speaker,
                t.start_time_s,
                t.section,
                t.text,
                t.token_count,
                d.url,
                d.title,
                d.published_at,
                d.source
               FROM turns t
               INNER JOIN docs d ON t.doc_id = d.id
               WHERE t.id = ANY($1)"#,
        )
        .bind(turn_ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows)
    }

    /// Fetches the turn at `ord - 1` for each `(doc_id, ord)` pair.
    /// Pairs with `ord == 0` have no predecessor and yield nothing.
    pub async fn fetch_previous_turns(
        &self,
        pairs: &[(i64, i32)],
    ) -> Result<Vec<TurnRow>, ApiError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let doc_ids: Vec<i64> = pairs.iter().map(|(doc_id, _)| *doc_id).collect();
        let prev_ords: Vec<i32> = pairs.iter().map(|(_, ord)| ord - 1).collect();

        let rows = sqlx::query_as::<_, TurnRow>(
            r#"SELECT
                t.id AS turn_id,
                t.doc_id,
                t.ord,
                t.speaker,
                t.start_time_s,
                t.section,
                t.text,
                t.token_count,
                d.url,
                d.title,
                d.published_at,
                d.source
               FROM turns t
               INNER JOIN docs d ON t.doc_id = d.id
               INNER JOIN unnest($1::bigint[], $2::int[]) AS want(doc_id, ord)
                 ON t.doc_id = want.doc_id AND t.ord = want.ord
               WHERE want.ord >= 0"#,
        )
        .bind(&doc_ids)
        .bind(&prev_ords)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows)
    }

    fn fts_query_builder(
        &self,
        tsquery: &str,
        websearch: bool,
        filters: &RetrievalFilters,
        n: usize,
        explain: bool,
    ) -> QueryBuilder<'_, Postgres> {
        let tsquery_fn = if websearch {
            TSQUERY_FN_WEBSEARCH
        } else {
            TSQUERY_FN_PLAIN
        };

        let mut qb = QueryBuilder::<Postgres>::new(if explain {
            "EXPLAIN (ANALYZE, BUFFERS) SELECT "
        } else {
            "SELECT "
        });

        qb.push("c.id AS chunk_id, c.doc_id, c.ord, c.text, ts_rank(c.tsv, ");
        qb.push(tsquery_fn);
        qb.push("('english', ");
        qb.push_bind(tsquery.to_string());
        qb.push("))::float8 AS score, d.url, d.title, d.published_at, d.source, COALESCE(t.speaker, ");
        qb.push_bind(self.default_speaker.clone());
        qb.push(
            ") AS speaker FROM chunks c \
             INNER JOIN docs d ON c.doc_id = d.id \
             LEFT JOIN turns t ON c.turn_id = t.id \
             WHERE c.tsv @@ ",
        );
        qb.push(tsquery_fn);
        qb.push("('english', ");
        qb.push_bind(tsquery.to_string());
        qb.push(")");

        self.push_filters(&mut qb, filters);

        qb.push(" ORDER BY score DESC, c.id ASC LIMIT ");
        qb.push_bind(n as i64);

        qb
    }

    fn vector_query_builder(
        &self,
        embedding: Vector,
        filters: &RetrievalFilters,
        n: usize,
        explain: bool,
    ) -> QueryBuilder<'_, Postgres> {
        let mut qb = QueryBuilder::<Postgres>::new(if explain {
            "EXPLAIN (ANALYZE, BUFFERS) SELECT "
        } else {
            "SELECT "
        });

        qb.push("c.id AS chunk_id, c.doc_id, c.ord, c.text, 1 - (ce.embedding <=> ");
        qb.push_bind(embedding);
        qb.push(") AS score, d.url, d.title, d.published_at, d.source, COALESCE(t.speaker, ");
        qb.push_bind(self.default_speaker.clone());
        qb.push(
            ") AS speaker FROM chunk_embeddings ce \
             INNER JOIN chunks c ON ce.chunk_id = c.id \
             INNER JOIN docs d ON c.doc_id = d.id \
             LEFT JOIN turns t ON c.turn_id = t.id \
             WHERE TRUE",
        );

        self.push_filters(&mut qb, filters);

        qb.push(" ORDER BY score DESC, c.id ASC LIMIT ");
        qb.push_bind(n as i64);

        qb
    }

    fn push_filters<'a>(&self, qb: &mut QueryBuilder<'a, Postgres>, filters: &RetrievalFilters) {
        if let Some(start) = filters.start_date {
            qb.push(" AND d.published_at >= ");
            qb.push_bind(start);
        }

        if let Some(end) = filters.end_date {
            qb.push(" AND d.published_at < ");
            qb.push_bind(end);
        }

        if let Some(doc_type) = &filters.doc_type {
            qb.push(" AND d.doc_type = ");
            qb.push_bind(doc_type.clone());
        }

        if let Some(source) = &filters.source {
            qb.push(" AND d.source = ");
            qb.push_bind(source.clone());
        }

        if let Some(speaker) = &filters.speaker {
            qb.push(" AND COALESCE(t.speaker, ");
            qb.push_bind(self.default_speaker.clone());
            qb.push(") ILIKE ");
            qb.push_bind(format!("%{}%", speaker));
        }
    }
}
