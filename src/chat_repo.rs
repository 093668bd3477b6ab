use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::{ChatMessage, ChatSession, ContentType, NewChatMessage, RagSource, Role};

#[async_trait]
pub trait ChatRepo: Send + Sync {
    async fn create_session(
        &self,
        user_id: i64,
        title: String,
        kb_id: Option<i64>,
    ) -> Result<ChatSession, CoreError>;

    async fn list_sessions(
        &self,
        user_id: i64,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatSession>, CoreError>;

    async fn get_session(&self, user_id: i64, session_id: i64) -> Result<Option<ChatSession>, CoreError>;

    async fn update_session(
        &self,
        user_id: i64,
        session_id: i64,
        title: Option<String>,
        kb_id: Option<Option<i64>>,
    ) -> Result<Option<ChatSession>, CoreError>;

    /// Cascades to the session's messages.
    async fn delete_session(&self, user_id: i64, session_id: i64) -> Result<bool, CoreError>;

    /// Ascending by created_at.
    async fn list_messages(
        &self,
        session_id: i64,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError>;

    /// The most recent `limit` messages of the session, returned in
    /// chronological (ascending) order — the prior-conversation window
    /// spec.md §4.9 step 3 builds the prompt from, not a skip/limit page.
    async fn list_recent_messages(
        &self,
        session_id: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError>;

    async fn append_message(&self, message: NewChatMessage) -> Result<ChatMessage, CoreError>;

    /// Bumps `updated_at` on the session; called after every appended message.
    async fn touch_session(&self, session_id: i64) -> Result<(), CoreError>;
}

pub struct PgChatRepo {
    pool: DbPool,
}

impl PgChatRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<ChatSession, CoreError> {
    Ok(ChatSession {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        kb_id: row.try_get("kb_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<ChatMessage, CoreError> {
    let role_str: String = row.try_get("role").map_err(db_err)?;
    let role = match role_str.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "system" => Role::System,
        other => return Err(CoreError::StoreError(format!("unknown role: {other}"))),
    };

    let content_type_str: String = row.try_get("content_type").map_err(db_err)?;
    let content_type = match content_type_str.as_str() {
        "thinking" => ContentType::Thinking,
        _ => ContentType::Content,
    };

    let rag_sources_json: Option<serde_json::Value> = row.try_get("rag_sources").map_err(db_err)?;
    let rag_sources: Option<Vec<RagSource>> = rag_sources_json
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| CoreError::StoreError(format!("rag_sources decode failed: {e}")))?;

    Ok(ChatMessage {
        id: row.try_get("id").map_err(db_err)?,
        session_id: row.try_get("session_id").map_err(db_err)?,
        role,
        content: row.try_get("content").map_err(db_err)?,
        content_type,
        rag_context: row.try_get("rag_context").map_err(db_err)?,
        rag_sources,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::StoreError(format!("chat row decode failed: {e}"))
}

#[async_trait]
impl ChatRepo for PgChatRepo {
    async fn create_session(
        &self,
        user_id: i64,
        title: String,
        kb_id: Option<i64>,
    ) -> Result<ChatSession, CoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO chat_sessions (user_id, title, kb_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) \
             RETURNING id, user_id, title, kb_id, created_at, updated_at",
        )
        .bind(user_id)
        .bind(title)
        .bind(kb_id)
        .bind(now)
        .fetch_one(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("create_session failed: {e}")))?;

        row_to_session(&row)
    }

    async fn list_sessions(
        &self,
        user_id: i64,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatSession>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, kb_id, created_at, updated_at FROM chat_sessions \
             WHERE user_id = $1 ORDER BY updated_at DESC OFFSET $2 LIMIT $3",
        )
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("list_sessions failed: {e}")))?;

        rows.iter().map(row_to_session).collect()
    }

    async fn get_session(&self, user_id: i64, session_id: i64) -> Result<Option<ChatSession>, CoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, kb_id, created_at, updated_at FROM chat_sessions \
             WHERE user_id = $1 AND id = $2",
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_optional(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("get_session failed: {e}")))?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn update_session(
        &self,
        user_id: i64,
        session_id: i64,
        title: Option<String>,
        kb_id: Option<Option<i64>>,
    ) -> Result<Option<ChatSession>, CoreError> {
        let existing = self.get_session(user_id, session_id).await?;
        let Some(existing) = existing else {
            return Ok(None);
        };

        let new_title = title.unwrap_or(existing.title);
        let new_kb_id = kb_id.unwrap_or(existing.kb_id);

        let row = sqlx::query(
            "UPDATE chat_sessions SET title = $3, kb_id = $4, updated_at = $5 \
             WHERE user_id = $1 AND id = $2 \
             RETURNING id, user_id, title, kb_id, created_at, updated_at",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(new_title)
        .bind(new_kb_id)
        .bind(Utc::now())
        .fetch_one(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("update_session failed: {e}")))?;

        Ok(Some(row_to_session(&row)?))
    }

    async fn delete_session(&self, user_id: i64, session_id: i64) -> Result<bool, CoreError> {
        let mut tx = self
            .pool
            .get_pool()
            .begin()
            .await
            .map_err(|e| CoreError::StoreError(format!("delete_session begin failed: {e}")))?;

        sqlx::query("DELETE FROM chat_messages WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::StoreError(format!("delete messages failed: {e}")))?;

        let result = sqlx::query("DELETE FROM chat_sessions WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoreError::StoreError(format!("delete session failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| CoreError::StoreError(format!("delete_session commit failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_messages(
        &self,
        session_id: i64,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, content_type, rag_context, rag_sources, created_at \
             FROM chat_messages WHERE session_id = $1 ORDER BY created_at ASC OFFSET $2 LIMIT $3",
        )
        .bind(session_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("list_messages failed: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn list_recent_messages(
        &self,
        session_id: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, content_type, rag_context, rag_sources, created_at \
             FROM chat_messages WHERE session_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("list_recent_messages failed: {e}")))?;

        let mut messages: Vec<ChatMessage> = rows.iter().map(row_to_message).collect::<Result<_, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn append_message(&self, message: NewChatMessage) -> Result<ChatMessage, CoreError> {
        let role_str = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        let content_type_str = match message.content_type {
            ContentType::Content => "content",
            ContentType::Thinking => "thinking",
        };
        let rag_sources_json = message
            .rag_sources
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::StoreError(format!("rag_sources encode failed: {e}")))?;

        let row = sqlx::query(
            "INSERT INTO chat_messages \
                (session_id, role, content, content_type, rag_context, rag_sources, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id, session_id, role, content, content_type, rag_context, rag_sources, created_at",
        )
        .bind(message.session_id)
        .bind(role_str)
        .bind(message.content)
        .bind(content_type_str)
        .bind(message.rag_context)
        .bind(rag_sources_json)
        .bind(Utc::now())
        .fetch_one(self.pool.get_pool())
        .await
        .map_err(|e| CoreError::StoreError(format!("append_message failed: {e}")))?;

        row_to_message(&row)
    }

    async fn touch_session(&self, session_id: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE chat_sessions SET updated_at = $2 WHERE id = $1")
            .bind(session_id)
            .bind(Utc::now())
            .execute(self.pool.get_pool())
            .await
            .map_err(|e| CoreError::StoreError(format!("touch_session failed: {e}")))?;
        Ok(())
    }
}
