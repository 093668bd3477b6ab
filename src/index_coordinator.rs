use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::IndexingConfig;
use crate::document_repo::{DocumentRepo, Expected};
use crate::error::CoreError;
use crate::models::{Document, IndexState, VectorFilter};
use crate::rag_indexer::RAGIndexer;
use crate::vector_store::VectorStore;

/// Bounded worker pool that drives `RAGIndexer` from document-change
/// notifications, keeping the vector store eventually consistent with the
/// document store under concurrent edits. Grounded in the teacher's
/// `utils::limiters::Limiters::acquire_timed` admission pattern, generalized
/// here from a semaphore guarding I/O concurrency into one guarding a
/// genuinely bounded worker pool (the teacher's own `worker::queue::TaskQueue`
/// is a single-consumer `VecDeque` and was not reused for this).
pub struct IndexCoordinator {
    document_repo: Arc<dyn DocumentRepo>,
    indexer: Arc<RAGIndexer>,
    vector_store: Arc<dyn VectorStore>,
    semaphore: Arc<Semaphore>,
    admission_wait: Duration,
    timeout: Duration,
    enabled: AtomicBool,
    active_tasks: Arc<AtomicUsize>,
}

impl IndexCoordinator {
    pub fn new(
        document_repo: Arc<dyn DocumentRepo>,
        indexer: Arc<RAGIndexer>,
        vector_store: Arc<dyn VectorStore>,
        config: &IndexingConfig,
    ) -> Self {
        Self {
            document_repo,
            indexer,
            vector_store,
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            admission_wait: Duration::from_millis(config.admission_wait_ms),
            timeout: Duration::from_secs(config.timeout_seconds),
            enabled: AtomicBool::new(config.enabled),
            active_tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Fire-and-forget submission. Installs `new_uuid` unconditionally, which
    /// atomically supersedes any in-flight task for the same document, then
    /// admits the task onto the bounded worker pool.
    pub async fn on_document_created(&self, user_id: i64, document: Document) {
        self.submit(user_id, document).await;
    }

    /// Same submission protocol as creation; the unconditional CAS is what
    /// supersedes whatever task is currently running for this document.
    pub async fn on_document_updated(&self, user_id: i64, document: Document) {
        self.submit(user_id, document).await;
    }

    async fn submit(&self, user_id: i64, document: Document) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }

        let new_uuid = Uuid::new_v4();
        let now = Utc::now();

        let installed = self
            .document_repo
            .compare_and_set_index_state(
                user_id,
                document.id,
                Expected::Any,
                IndexState::indexing(new_uuid, now),
            )
            .await;

        if !matches!(installed, Ok(true)) {
            tracing::warn!(user_id, doc_id = document.id, "failed to install index task state");
            return;
        }

        let semaphore = self.semaphore.clone();
        let admission_wait = self.admission_wait;

        let permit = match tokio::time::timeout(admission_wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return, // semaphore closed, coordinator is shutting down
            Err(_) => {
                tracing::warn!(
                    user_id,
                    doc_id = document.id,
                    "index task submission hit backpressure"
                );
                return;
            }
        };

        let document_repo = self.document_repo.clone();
        let indexer = self.indexer.clone();
        let vector_store = self.vector_store.clone();
        let active_tasks = self.active_tasks.clone();

        active_tasks.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _permit = permit;
            run_task(document_repo, indexer, vector_store, user_id, document.id, new_uuid).await;
            active_tasks.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Synchronously removes vectors; does not go through the worker pool.
    /// Per the chosen reference policy for the delete-during-index race
    /// (S6), this call is unconditional — a worker whose insert lands after
    /// this delete will fail its completion CAS because the row is gone,
    /// and must re-issue a delete of its own (see `run_task`).
    pub async fn on_document_deleted(&self, user_id: i64, doc_id: i64) -> Result<u64, CoreError> {
        self.vector_store
            .delete(&VectorFilter::for_document(user_id, doc_id))
            .await
    }

    /// Sweeps `indexing` rows whose `started_at` precedes `now - timeout`
    /// and transitions them to `timeout`. Safe to call opportunistically on
    /// reads or periodically from a background tick.
    pub async fn check_timeout_tasks(&self) -> Result<usize, CoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.timeout).unwrap();
        let stale = self.document_repo.list_stale_indexing(cutoff).await?;

        let mut transitioned = 0;
        for (user_id, doc_id, task_uuid) in stale {
            let result = self
                .document_repo
                .compare_and_set_index_state(
                    user_id,
                    doc_id,
                    Expected::Uuid(task_uuid),
                    IndexState::timed_out(task_uuid, Utc::now()),
                )
                .await?;
            if result {
                transitioned += 1;
            }
        }

        Ok(transitioned)
    }
}

async fn run_task(
    document_repo: Arc<dyn DocumentRepo>,
    indexer: Arc<RAGIndexer>,
    vector_store: Arc<dyn VectorStore>,
    user_id: i64,
    doc_id: i64,
    my_uuid: Uuid,
) {
    let document = match document_repo.get(user_id, doc_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return, // deleted before the worker started
        Err(e) => {
            tracing::error!(user_id, doc_id, error = %e, "failed to re-read document for indexing");
            return;
        }
    };

    if document.index_state.task_uuid != Some(my_uuid) {
        return; // superseded before we even started
    }

    let reindex_result = indexer.reindex(user_id, &document).await;

    // Re-read before publishing completion: a newer submission (or a
    // deletion) may have landed while reindex() was running.
    let still_current = match document_repo.get(user_id, doc_id).await {
        Ok(Some(doc)) => doc.index_state.task_uuid == Some(my_uuid),
        Ok(None) => false,
        Err(e) => {
            tracing::error!(user_id, doc_id, error = %e, "failed to re-read document after indexing");
            false
        }
    };

    if !still_current {
        // S6 reference policy (a): the document row may be gone because it
        // was deleted mid-reindex. Our insert may have landed after that
        // delete, so re-issue one to avoid orphaned vectors; tolerate it
        // matching zero rows.
        if let Err(e) = vector_store
            .delete(&VectorFilter::for_document(user_id, doc_id))
            .await
        {
            tracing::error!(user_id, doc_id, error = %e, "post-supersession cleanup delete failed");
        }
        return;
    }

    let new_state = match reindex_result {
        Ok(_chunk_count) => IndexState::completed(my_uuid, Utc::now()),
        Err(e) => IndexState::failed(my_uuid, e.to_string(), Utc::now()),
    };

    if let Err(e) = document_repo
        .compare_and_set_index_state(user_id, doc_id, Expected::Uuid(my_uuid), new_state)
        .await
    {
        tracing::error!(user_id, doc_id, error = %e, "failed to publish index completion state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use crate::config::{ChunkingConfig, IndexingConfig};
    use crate::embedder::Embedder;
    use crate::models::{DocumentKind, IndexStatus, NewVectorRecord, VectorMetadata, VectorRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    struct FakeVectorStore {
        records: StdMutex<Vec<VectorRecord>>,
        next_pk: StdMutex<i64>,
    }

    impl FakeVectorStore {
        fn new() -> Self {
            Self {
                records: StdMutex::new(Vec::new()),
                next_pk: StdMutex::new(1),
            }
        }
    }

    fn matches(record: &VectorRecord, filter: &VectorFilter) -> bool {
        filter.doc_id.map_or(true, |d| record.metadata.doc_id == d)
            && filter.user_id.map_or(true, |u| record.metadata.user_id == u)
            && filter.kb_id.map_or(true, |k| record.metadata.kb_id == k)
    }

    #[async_trait]
    impl VectorStore for FakeVectorStore {
        async fn ensure_collection(&self, _dim: usize) -> Result<(), CoreError> {
            Ok(())
        }

        async fn insert(&self, records: &[NewVectorRecord]) -> Result<Vec<i64>, CoreError> {
            let mut store = self.records.lock().unwrap();
            let mut pk = self.next_pk.lock().unwrap();
            let mut pks = Vec::new();
            for r in records {
                store.push(VectorRecord {
                    pk: *pk,
                    embedding: r.embedding.clone(),
                    content: r.content.clone(),
                    source: r.source.clone(),
                    metadata: r.metadata.clone(),
                    created_at: 0,
                    distance: 0.0,
                });
                pks.push(*pk);
                *pk += 1;
            }
            Ok(pks)
        }

        async fn search(
            &self,
            _query_vec: &[f32],
            top_k: usize,
            filter: &VectorFilter,
        ) -> Result<Vec<VectorRecord>, CoreError> {
            let store = self.records.lock().unwrap();
            Ok(store
                .iter()
                .filter(|r| matches(r, filter))
                .take(top_k)
                .cloned()
                .collect())
        }

        async fn delete(&self, filter: &VectorFilter) -> Result<u64, CoreError> {
            let mut store = self.records.lock().unwrap();
            let before = store.len();
            store.retain(|r| !matches(r, filter));
            Ok((before - store.len()) as u64)
        }
    }

    struct FakeDocumentRepo {
        docs: StdMutex<HashMap<(i64, i64), Document>>,
    }

    impl FakeDocumentRepo {
        fn new() -> Self {
            Self {
                docs: StdMutex::new(HashMap::new()),
            }
        }

        fn put(&self, doc: Document) {
            self.docs.lock().unwrap().insert((doc.user_id, doc.id), doc);
        }
    }

    #[async_trait]
    impl DocumentRepo for FakeDocumentRepo {
        async fn get(&self, user_id: i64, doc_id: i64) -> Result<Option<Document>, CoreError> {
            Ok(self.docs.lock().unwrap().get(&(user_id, doc_id)).cloned())
        }

        async fn list_by_kb(
            &self,
            _user_id: i64,
            _kb_id: i64,
            _skip: i64,
            _limit: i64,
            _folder_id: Option<i64>,
        ) -> Result<Vec<Document>, CoreError> {
            Ok(Vec::new())
        }

        async fn compare_and_set_index_state(
            &self,
            user_id: i64,
            doc_id: i64,
            expected: Expected,
            new_state: IndexState,
        ) -> Result<bool, CoreError> {
            let mut docs = self.docs.lock().unwrap();
            let Some(doc) = docs.get_mut(&(user_id, doc_id)) else {
                return Ok(false);
            };
            if let Expected::Uuid(expected_uuid) = expected {
                if doc.index_state.task_uuid != Some(expected_uuid) {
                    return Ok(false);
                }
            }
            doc.index_state = new_state;
            Ok(true)
        }

        async fn list_stale_indexing(
            &self,
            older_than: chrono::DateTime<Utc>,
        ) -> Result<Vec<(i64, i64, Uuid)>, CoreError> {
            let docs = self.docs.lock().unwrap();
            Ok(docs
                .values()
                .filter(|d| {
                    d.index_state.status == IndexStatus::Indexing
                        && d.index_state.started_at.is_some_and(|s| s < older_than)
                })
                .map(|d| (d.user_id, d.id, d.index_state.task_uuid.unwrap()))
                .collect())
        }
    }

    fn doc(user_id: i64, id: i64, content: &str) -> Document {
        Document {
            id,
            user_id,
            kb_id: 1,
            name: "note.md".to_string(),
            content: content.to_string(),
            kind: DocumentKind::Note,
            folder_id: None,
            index_state: IndexState::pending(),
        }
    }

    async fn wait_idle(coordinator: &IndexCoordinator) {
        for _ in 0..200 {
            if coordinator.active_task_count() == 0 {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("coordinator did not quiesce in time");
    }

    fn make_coordinator(
        repo: Arc<FakeDocumentRepo>,
        store: Arc<FakeVectorStore>,
    ) -> IndexCoordinator {
        let chunker = Chunker::new(&ChunkingConfig {
            max_tokens: 512,
            overlap_tokens: 128,
        });
        let indexer = Arc::new(RAGIndexer::new(Arc::new(FakeEmbedder), store.clone(), chunker));
        let config = IndexingConfig {
            max_workers: 4,
            timeout_seconds: 300,
            enabled: true,
            queue_bound: 16,
            admission_wait_ms: 1000,
        };
        IndexCoordinator::new(repo, indexer, store, &config)
    }

    #[tokio::test]
    async fn created_document_converges_to_completed() {
        let repo = Arc::new(FakeDocumentRepo::new());
        repo.put(doc(1, 1, "hello world, a document with enough content to chunk."));
        let store = Arc::new(FakeVectorStore::new());
        let coordinator = make_coordinator(repo.clone(), store.clone());

        let document = repo.get(1, 1).await.unwrap().unwrap();
        coordinator.on_document_created(1, document).await;
        wait_idle(&coordinator).await;

        let row = repo.get(1, 1).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Completed);
        assert!(row.index_state.task_uuid.is_some());
        assert!(!store.records.lock().unwrap().is_empty());
    }

    /// S3: a second submission arriving before the first finishes must win —
    /// the store converges on the latest content and nothing from the first
    /// submission survives.
    #[tokio::test]
    async fn rapid_double_edit_converges_to_latest_content() {
        let repo = Arc::new(FakeDocumentRepo::new());
        repo.put(doc(1, 1, "content A"));
        let store = Arc::new(FakeVectorStore::new());
        let coordinator = make_coordinator(repo.clone(), store.clone());

        let first = repo.get(1, 1).await.unwrap().unwrap();
        coordinator.on_document_created(1, first).await;

        let mut second = repo.get(1, 1).await.unwrap().unwrap();
        second.content = "content B".to_string();
        repo.put(second.clone());
        coordinator.on_document_updated(1, second).await;

        wait_idle(&coordinator).await;

        let row = repo.get(1, 1).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Completed);

        let records = store.records.lock().unwrap();
        assert!(records.iter().any(|r| r.content.contains('B')));
        assert!(!records.iter().any(|r| r.content.contains("content A")));
    }

    #[tokio::test]
    async fn check_timeout_tasks_sweeps_stale_rows() {
        let repo = Arc::new(FakeDocumentRepo::new());
        let stale_uuid = Uuid::new_v4();
        let mut stuck = doc(1, 1, "frozen");
        stuck.index_state = IndexState::indexing(stale_uuid, Utc::now() - chrono::Duration::seconds(600));
        repo.put(stuck);
        let store = Arc::new(FakeVectorStore::new());
        let coordinator = make_coordinator(repo.clone(), store.clone());

        let transitioned = coordinator.check_timeout_tasks().await.unwrap();
        assert_eq!(transitioned, 1);

        let row = repo.get(1, 1).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Timeout);
        assert_eq!(row.index_state.task_uuid, Some(stale_uuid));
        assert!(row.index_state.completed_at.is_some());
    }

    #[tokio::test]
    async fn check_timeout_tasks_leaves_fresh_rows_alone() {
        let repo = Arc::new(FakeDocumentRepo::new());
        let fresh_uuid = Uuid::new_v4();
        let mut fresh = doc(1, 1, "just started");
        fresh.index_state = IndexState::indexing(fresh_uuid, Utc::now());
        repo.put(fresh);
        let store = Arc::new(FakeVectorStore::new());
        let coordinator = make_coordinator(repo.clone(), store.clone());

        let transitioned = coordinator.check_timeout_tasks().await.unwrap();
        assert_eq!(transitioned, 0);

        let row = repo.get(1, 1).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Indexing);
    }

    #[tokio::test]
    async fn on_document_deleted_removes_vectors_synchronously() {
        let repo = Arc::new(FakeDocumentRepo::new());
        let store = Arc::new(FakeVectorStore::new());
        store.records.lock().unwrap().push(VectorRecord {
            pk: 1,
            embedding: vec![0.1, 0.2],
            content: "leftover".to_string(),
            source: "note.md".to_string(),
            metadata: VectorMetadata {
                kb_id: 1,
                doc_id: 9,
                doc_kind: DocumentKind::Note,
                doc_name: "note.md".to_string(),
                user_id: 1,
                chunk_index: 0,
            },
            created_at: 0,
            distance: 0.0,
        });
        let coordinator = make_coordinator(repo, store.clone());

        let deleted = coordinator.on_document_deleted(1, 9).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_coordinator_does_not_submit() {
        let repo = Arc::new(FakeDocumentRepo::new());
        repo.put(doc(1, 1, "should not be touched"));
        let store = Arc::new(FakeVectorStore::new());
        let coordinator = make_coordinator(repo.clone(), store.clone());
        coordinator.disable();

        let document = repo.get(1, 1).await.unwrap().unwrap();
        coordinator.on_document_created(1, document).await;
        wait_idle(&coordinator).await;

        let row = repo.get(1, 1).await.unwrap().unwrap();
        assert_eq!(row.index_state.status, IndexStatus::Pending);
    }
}
