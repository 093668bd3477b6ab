use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Only `Note` and `Uploaded` documents are indexable; `Folder` rows are
/// containers and never reach the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Note,
    Uploaded,
    Folder,
}

impl DocumentKind {
    pub fn is_indexable(self) -> bool {
        matches!(self, DocumentKind::Note | DocumentKind::Uploaded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Pending,
    Indexing,
    Completed,
    Failed,
    Timeout,
}

impl IndexStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexing => "indexing",
            IndexStatus::Completed => "completed",
            IndexStatus::Failed => "failed",
            IndexStatus::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for IndexStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => IndexStatus::Pending,
            "indexing" => IndexStatus::Indexing,
            "completed" => IndexStatus::Completed,
            "failed" => IndexStatus::Failed,
            "timeout" => IndexStatus::Timeout,
            other => anyhow::bail!("unknown index status: {other}"),
        })
    }
}

/// Invariant: `status == Indexing` implies `task_uuid` and `started_at` are
/// both set; `status` in {Completed, Failed, Timeout} implies `completed_at`
/// is set. Enforced by `DocumentRepo::compare_and_set_index_state`, which is
/// the only writer of this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexState {
    pub status: IndexStatus,
    pub task_uuid: Option<Uuid>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl IndexState {
    pub fn pending() -> Self {
        Self {
            status: IndexStatus::Pending,
            task_uuid: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn indexing(task_uuid: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            status: IndexStatus::Indexing,
            task_uuid: Some(task_uuid),
            worker_id: None,
            started_at: Some(now),
            completed_at: None,
            error_message: None,
        }
    }

    /// `task_uuid` is preserved rather than cleared: callers (and §8's S3
    /// scenario) rely on reading back the uuid a completed submission
    /// installed.
    pub fn completed(task_uuid: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            status: IndexStatus::Completed,
            task_uuid: Some(task_uuid),
            worker_id: None,
            started_at: None,
            completed_at: Some(now),
            error_message: None,
        }
    }

    pub fn failed(task_uuid: Uuid, error: String, now: DateTime<Utc>) -> Self {
        Self {
            status: IndexStatus::Failed,
            task_uuid: Some(task_uuid),
            worker_id: None,
            started_at: None,
            completed_at: Some(now),
            error_message: Some(error),
        }
    }

    pub fn timed_out(task_uuid: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            status: IndexStatus::Timeout,
            task_uuid: Some(task_uuid),
            worker_id: None,
            started_at: None,
            completed_at: Some(now),
            error_message: Some("Task exceeded timeout limit".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub user_id: i64,
    pub kb_id: i64,
    pub name: String,
    pub content: String,
    pub kind: DocumentKind,
    pub folder_id: Option<i64>,
    pub index_state: IndexState,
}
