use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;

/// Every failure kind named in the error-handling design. `Conflict` is
/// produced internally by `compare_and_set_index_state` CAS failures and must
/// never reach an HTTP response — if it does, it is logged and mapped to 500.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("embedding model error: {0}")]
    ModelError(String),

    #[error("vector store error: {0}")]
    StoreError(String),

    #[error("upstream LLM error: {0}")]
    UpstreamError(String),

    #[error("indexing error: {0}")]
    IndexError(String),

    #[error("indexer is at capacity: {0}")]
    BackpressureError(String),

    #[error("index state conflict (internal)")]
    Conflict,

    #[error("RAG subsystem disabled")]
    Disabled,
}

impl CoreError {
    fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NotFound",
            CoreError::PermissionDenied(_) => "PermissionDenied",
            CoreError::Validation(_) => "Validation",
            CoreError::ModelError(_) => "ModelError",
            CoreError::StoreError(_) => "StoreError",
            CoreError::UpstreamError(_) => "UpstreamError",
            CoreError::IndexError(_) => "IndexError",
            CoreError::BackpressureError(_) => "BackpressureError",
            CoreError::Conflict => "Conflict",
            CoreError::Disabled => "Disabled",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::ModelError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::StoreError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::UpstreamError(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::IndexError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::BackpressureError(_) => StatusCode::CONFLICT,
            CoreError::Conflict => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Disabled => StatusCode::CONFLICT,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        } else {
            tracing::warn!(kind = self.kind(), "{}", self);
        }

        let body = Json(ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
            },
        });

        (status, body).into_response()
    }
}
