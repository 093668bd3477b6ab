use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::Row;

use crate::config::VectorStoreConfig;
use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::{NewVectorRecord, VectorFilter, VectorRecord};

/// Insert/search/delete of embedded chunks with structured metadata filters.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, dim: usize) -> Result<(), CoreError>;

    /// Returns the assigned primary keys, in input order.
    async fn insert(&self, records: &[NewVectorRecord]) -> Result<Vec<i64>, CoreError>;

    /// Up to `top_k` records matching `filter`, ascending by L2 distance,
    /// ties broken by ascending pk.
    async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorRecord>, CoreError>;

    /// Deletes all records matching `filter`; returns the count deleted.
    async fn delete(&self, filter: &VectorFilter) -> Result<u64, CoreError>;
}

/// pgvector-backed implementation. Metadata is stored as `jsonb` rather than
/// a fixed set of columns so additional fields can be added without a
/// migration, the same shape as the teacher's `vw_user_documents`-fronted
/// chunk rows in `database/repository.rs`.
pub struct PgVectorStore {
    pool: DbPool,
    config: VectorStoreConfig,
}

impl PgVectorStore {
    pub fn new(pool: DbPool, config: VectorStoreConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn ensure_collection(&self, dim: usize) -> Result<(), CoreError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                pk BIGSERIAL PRIMARY KEY,
                embedding vector({dim}) NOT NULL,
                content TEXT NOT NULL,
                source VARCHAR(512) NOT NULL,
                metadata JSONB NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
            table = self.config.collection,
            dim = dim,
        );
        sqlx::query(&create_table)
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| CoreError::StoreError(format!("ensure_collection failed: {e}")))?;

        // IVF_FLAT requires the lists parameter up front; nlist doubles as
        // pgvector's `lists`. Safe to re-run, hence IF NOT EXISTS.
        let create_index = format!(
            r#"
            CREATE INDEX IF NOT EXISTS {table}_embedding_ivfflat_idx
            ON {table}
            USING ivfflat (embedding vector_l2_ops)
            WITH (lists = {nlist})
            "#,
            table = self.config.collection,
            nlist = self.config.nlist,
        );
        sqlx::query(&create_index)
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| CoreError::StoreError(format!("ensure_collection index failed: {e}")))?;

        Ok(())
    }

    async fn insert(&self, records: &[NewVectorRecord]) -> Result<Vec<i64>, CoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .get_pool()
            .begin()
            .await
            .map_err(|e| CoreError::StoreError(format!("insert begin failed: {e}")))?;

        let mut pks = Vec::with_capacity(records.len());
        let now = Utc::now().timestamp_millis();

        for record in records {
            let metadata = serde_json::to_value(&record.metadata)
                .map_err(|e| CoreError::StoreError(format!("metadata encode failed: {e}")))?;

            let query = format!(
                "INSERT INTO {table} (embedding, content, source, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING pk",
                table = self.config.collection,
            );

            let row = sqlx::query(&query)
                .bind(Vector::from(record.embedding.clone()))
                .bind(&record.content)
                .bind(&record.source)
                .bind(metadata)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| CoreError::StoreError(format!("insert failed: {e}")))?;

            pks.push(row.get::<i64, _>("pk"));
        }

        tx.commit()
            .await
            .map_err(|e| CoreError::StoreError(format!("insert commit failed: {e}")))?;

        Ok(pks)
    }

    async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorRecord>, CoreError> {
        let (clause, binds) = build_filter_clause(filter, 2);

        // `ivfflat.probes` is a session GUC, not a bindable parameter, and
        // sqlx's prepared-statement protocol rejects multiple commands in one
        // query string. Set it on a single checked-out connection, then run
        // the search on that same connection so the setting actually applies.
        let mut conn = self
            .pool
            .get_pool()
            .acquire()
            .await
            .map_err(|e| CoreError::StoreError(format!("search connection acquire failed: {e}")))?;

        sqlx::query(&format!("SET ivfflat.probes = {}", self.config.nprobe))
            .execute(&mut *conn)
            .await
            .map_err(|e| CoreError::StoreError(format!("search probes setting failed: {e}")))?;

        let query = format!(
            "SELECT pk, embedding, content, source, metadata, created_at, \
                    embedding <-> $1 AS distance \
             FROM {table} \
             {clause} \
             ORDER BY distance ASC, pk ASC \
             LIMIT {top_k}",
            table = self.config.collection,
            clause = clause,
            top_k = top_k,
        );

        let mut builder = sqlx::query(&query).bind(Vector::from(query_vec.to_vec()));
        for bind in binds {
            builder = match bind {
                FilterValue::I64(v) => builder.bind(v),
            };
        }

        let rows = builder
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| CoreError::StoreError(format!("search failed: {e}")))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding: Vector = row.get("embedding");
            let metadata_json: serde_json::Value = row.get("metadata");
            let metadata = serde_json::from_value(metadata_json)
                .map_err(|e| CoreError::StoreError(format!("metadata decode failed: {e}")))?;

            results.push(VectorRecord {
                pk: row.get("pk"),
                embedding: embedding.to_vec(),
                content: row.get("content"),
                source: row.get("source"),
                metadata,
                created_at: row.get("created_at"),
                distance: row.get::<f32, _>("distance"),
            });
        }

        Ok(results)
    }

    async fn delete(&self, filter: &VectorFilter) -> Result<u64, CoreError> {
        let (clause, binds) = build_filter_clause(filter, 1);
        let query = format!(
            "DELETE FROM {table} {clause}",
            table = self.config.collection,
            clause = clause,
        );

        let mut builder = sqlx::query(&query);
        for bind in binds {
            builder = match bind {
                FilterValue::I64(v) => builder.bind(v),
            };
        }

        let result = builder
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| CoreError::StoreError(format!("delete failed: {e}")))?;

        Ok(result.rows_affected())
    }
}

enum FilterValue {
    I64(i64),
}

/// Builds a `WHERE` clause ANDing every present filter field against the
/// `metadata` jsonb column. Returns an empty clause (matches everything)
/// when no fields are set.
fn build_filter_clause(filter: &VectorFilter, start_placeholder: usize) -> (String, Vec<FilterValue>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();
    let mut next_placeholder = start_placeholder;

    if let Some(user_id) = filter.user_id {
        conditions.push(format!("(metadata->>'user_id')::bigint = ${next_placeholder}"));
        binds.push(FilterValue::I64(user_id));
        next_placeholder += 1;
    }
    if let Some(doc_id) = filter.doc_id {
        conditions.push(format!("(metadata->>'doc_id')::bigint = ${next_placeholder}"));
        binds.push(FilterValue::I64(doc_id));
        next_placeholder += 1;
    }
    if let Some(kb_id) = filter.kb_id {
        conditions.push(format!("(metadata->>'kb_id')::bigint = ${next_placeholder}"));
        binds.push(FilterValue::I64(kb_id));
    }

    if conditions.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), binds)
    }
}
