use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::{Document, DocumentKind, IndexState, IndexStatus};

/// `expected` selector for `compare_and_set_index_state`: either match any
/// current value (an unconditional install, used on task submission) or
/// require an exact match (used by workers finishing their own task).
#[derive(Debug, Clone, Copy)]
pub enum Expected {
    Any,
    Uuid(Uuid),
}

#[async_trait]
pub trait DocumentRepo: Send + Sync {
    async fn get(&self, user_id: i64, doc_id: i64) -> Result<Option<Document>, CoreError>;

    async fn list_by_kb(
        &self,
        user_id: i64,
        kb_id: i64,
        skip: i64,
        limit: i64,
        folder_id: Option<i64>,
    ) -> Result<Vec<Document>, CoreError>;

    /// Atomically transitions `IndexState`. When `expected` is `Uuid(u)`, the
    /// write only applies if the row's current `task_uuid` equals `u` — a
    /// single `UPDATE ... WHERE task_uuid = $u` round trip, never a
    /// read-then-write. Returns `true` if the row was updated.
    async fn compare_and_set_index_state(
        &self,
        user_id: i64,
        doc_id: i64,
        expected: Expected,
        new_state: IndexState,
    ) -> Result<bool, CoreError>;

    /// Rows currently `indexing` with `started_at` older than `now - timeout`.
    async fn list_stale_indexing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(i64, i64, Uuid)>, CoreError>;
}

pub struct PgDocumentRepo {
    pool: DbPool,
}

impl PgDocumentRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document, CoreError> {
    let kind_str: String = row.try_get("kind").map_err(db_err)?;
    let kind = match kind_str.as_str() {
        "note" => DocumentKind::Note,
        "uploaded" => DocumentKind::Uploaded,
        "folder" => DocumentKind::Folder,
        other => return Err(CoreError::StoreError(format!("unknown document kind: {other}"))),
    };

    let status_str: String = row.try_get("rag_index_status").map_err(db_err)?;
    let status: IndexStatus = status_str
        .parse()
        .map_err(|e| CoreError::StoreError(format!("{e}")))?;

    Ok(Document {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        kb_id: row.try_get("kb_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        kind,
        folder_id: row.try_get("folder_id").map_err(db_err)?,
        index_state: IndexState {
            status,
            task_uuid: row.try_get("rag_index_task_uuid").map_err(db_err)?,
            worker_id: row.try_get("rag_index_thread_id").map_err(db_err)?,
            started_at: row.try_get("rag_index_started_at").map_err(db_err)?,
            completed_at: row.try_get("rag_index_completed_at").map_err(db_err)?,
            error_message: row.try_get("rag_index_error").map_err(db_err)?,
        },
    })
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::StoreError(format!("document row decode failed: {e}"))
}

const SELECT_COLUMNS: &str = "id, user_id, kb_id, name, content, kind, folder_id, \
     rag_index_task_uuid, rag_index_thread_id, rag_index_status, \
     rag_index_started_at, rag_index_completed_at, rag_index_error";

#[async_trait]
impl DocumentRepo for PgDocumentRepo {
    async fn get(&self, user_id: i64, doc_id: i64) -> Result<Option<Document>, CoreError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM documents WHERE user_id = $1 AND id = $2"
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(doc_id)
            .fetch_optional(self.pool.get_pool())
            .await
            .map_err(|e| CoreError::StoreError(format!("document get failed: {e}")))?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_by_kb(
        &self,
        user_id: i64,
        kb_id: i64,
        skip: i64,
        limit: i64,
        folder_id: Option<i64>,
    ) -> Result<Vec<Document>, CoreError> {
        let query = if folder_id.is_some() {
            format!(
                "SELECT {SELECT_COLUMNS} FROM documents \
                 WHERE user_id = $1 AND kb_id = $2 AND folder_id = $3 \
                 ORDER BY id ASC OFFSET $4 LIMIT $5"
            )
        } else {
            format!(
                "SELECT {SELECT_COLUMNS} FROM documents \
                 WHERE user_id = $1 AND kb_id = $2 \
                 ORDER BY id ASC OFFSET $3 LIMIT $4"
            )
        };

        let mut builder = sqlx::query(&query).bind(user_id).bind(kb_id);
        if let Some(folder_id) = folder_id {
            builder = builder.bind(folder_id);
        }
        builder = builder.bind(skip).bind(limit);

        let rows = builder
            .fetch_all(self.pool.get_pool())
            .await
            .map_err(|e| CoreError::StoreError(format!("document list failed: {e}")))?;

        rows.iter().map(row_to_document).collect()
    }

    async fn compare_and_set_index_state(
        &self,
        user_id: i64,
        doc_id: i64,
        expected: Expected,
        new_state: IndexState,
    ) -> Result<bool, CoreError> {
        let query = match expected {
            Expected::Any => {
                "UPDATE documents SET \
                    rag_index_task_uuid = $3, rag_index_thread_id = $4, \
                    rag_index_status = $5, rag_index_started_at = $6, \
                    rag_index_completed_at = $7, rag_index_error = $8 \
                 WHERE user_id = $1 AND id = $2"
            }
            Expected::Uuid(_) => {
                "UPDATE documents SET \
                    rag_index_task_uuid = $3, rag_index_thread_id = $4, \
                    rag_index_status = $5, rag_index_started_at = $6, \
                    rag_index_completed_at = $7, rag_index_error = $8 \
                 WHERE user_id = $1 AND id = $2 AND rag_index_task_uuid = $9"
            }
        };

        let mut builder = sqlx::query(query)
            .bind(user_id)
            .bind(doc_id)
            .bind(new_state.task_uuid)
            .bind(new_state.worker_id)
            .bind(new_state.status.as_str())
            .bind(new_state.started_at)
            .bind(new_state.completed_at)
            .bind(new_state.error_message);

        if let Expected::Uuid(expected_uuid) = expected {
            builder = builder.bind(expected_uuid);
        }

        let result = builder
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| CoreError::StoreError(format!("index state CAS failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stale_indexing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<(i64, i64, Uuid)>, CoreError> {
        let rows = sqlx::query(
            "SELECT user_id, id, rag_index_task_uuid FROM documents \
             WHERE rag_index_status = 'indexing' AND rag_index_started_at < $1 \
             AND rag_index_task_uuid IS NOT NULL",
        )
        .bind(older_than)
        .fetch_all(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("stale scan failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let user_id: i64 = row.try_get("user_id").map_err(db_err)?;
                let doc_id: i64 = row.try_get("id").map_err(db_err)?;
                let uuid: Uuid = row.try_get("rag_index_task_uuid").map_err(db_err)?;
                Ok((user_id, doc_id, uuid))
            })
            .collect()
    }
}
