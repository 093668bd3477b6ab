use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Content,
    Thinking,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Content
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSource {
    pub doc_name: String,
    pub doc_id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub kb_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    pub rag_context: Option<String>,
    pub rag_sources: Option<Vec<RagSource>>,
    pub created_at: DateTime<Utc>,
}

/// A new message to append; `id`/`created_at` are assigned by the repo.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    pub content_type: ContentType,
    pub rag_context: Option<String>,
    pub rag_sources: Option<Vec<RagSource>>,
}

/// A single unit emitted by `ChatPipeline::send`. Tagged by `type` so the SSE
/// writer can serialize any variant with one encoder, the same shape
/// `services::conversation::manager::ChatStreamChunk` and
/// `services::event_bus::SystemEvent` use in the teacher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    RagStep {
        step: String,
        data: serde_json::Value,
    },
    Message {
        content: String,
        content_type: ContentType,
    },
    Done,
    Error {
        content: String,
        data: Option<serde_json::Value>,
    },
}

impl StreamEvent {
    pub fn rag_step(step: &str, data: serde_json::Value) -> Self {
        StreamEvent::RagStep {
            step: step.to_string(),
            data,
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        StreamEvent::Message {
            content: content.into(),
            content_type: ContentType::Content,
        }
    }

    pub fn error(content: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        StreamEvent::Error {
            content: content.into(),
            data,
        }
    }
}
