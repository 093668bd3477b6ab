use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitsConfig;
use crate::error::CoreError;

/// Per-resource bounded admission, grounded on the teacher's
/// `utils::limiters::Limiters::acquire_timed`: a semaphore per contended
/// resource, acquired with a bounded wait that fails the caller with
/// `BackpressureError` rather than queueing indefinitely. `IndexCoordinator`
/// generalizes this same pattern for the worker pool itself (see
/// `index_coordinator.rs`); this struct covers the request-time resources the
/// chat pipeline fans out to.
pub struct Limiters {
    embedding: Arc<Semaphore>,
    db_search: Arc<Semaphore>,
    llm_stream: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(config.embedding_concurrency.max(1))),
            db_search: Arc::new(Semaphore::new(config.db_search_concurrency.max(1))),
            llm_stream: Arc::new(Semaphore::new(config.llm_stream_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }

    pub async fn acquire_embedding(&self) -> Result<OwnedSemaphorePermit, CoreError> {
        acquire_timed(&self.embedding, self.acquire_timeout, "embedding").await
    }

    pub async fn acquire_db_search(&self) -> Result<OwnedSemaphorePermit, CoreError> {
        acquire_timed(&self.db_search, self.acquire_timeout, "db_search").await
    }

    pub async fn acquire_llm_stream(&self) -> Result<OwnedSemaphorePermit, CoreError> {
        acquire_timed(&self.llm_stream, self.acquire_timeout, "llm_stream").await
    }
}

async fn acquire_timed(
    semaphore: &Arc<Semaphore>,
    timeout: Duration,
    resource: &str,
) -> Result<OwnedSemaphorePermit, CoreError> {
    match tokio::time::timeout(timeout, semaphore.clone().acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(CoreError::StoreError(format!("{resource} limiter closed"))),
        Err(_) => Err(CoreError::BackpressureError(format!(
            "{resource} concurrency limit reached"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_fails_with_backpressure_once_exhausted() {
        let limiters = Limiters::new(&LimitsConfig {
            embedding_concurrency: 1,
            db_search_concurrency: 1,
            llm_stream_concurrency: 1,
            acquire_timeout_ms: 10,
        });

        let _held = limiters.acquire_db_search().await.unwrap();
        let second = limiters.acquire_db_search().await;
        assert!(matches!(second, Err(CoreError::BackpressureError(_))));
    }

    #[tokio::test]
    async fn acquire_succeeds_once_permit_is_released() {
        let limiters = Limiters::new(&LimitsConfig {
            embedding_concurrency: 1,
            db_search_concurrency: 1,
            llm_stream_concurrency: 1,
            acquire_timeout_ms: 50,
        });

        let held = limiters.acquire_db_search().await.unwrap();
        drop(held);
        assert!(limiters.acquire_db_search().await.is_ok());
    }
}
