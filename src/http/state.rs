use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::chat_pipeline::ChatPipeline;
use crate::chat_repo::ChatRepo;
use crate::config::Settings;
use crate::document_repo::DocumentRepo;
use crate::embedder::SharedEmbedder;
use crate::index_coordinator::IndexCoordinator;
use crate::rag_indexer::RAGIndexer;
use crate::vector_store::VectorStore;

/// Shared application state handed to every handler via `Extension`/`State`,
/// the same shape as the teacher's `main.rs` wiring of its services into
/// the router.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub document_repo: Arc<dyn DocumentRepo>,
    pub chat_repo: Arc<dyn ChatRepo>,
    pub embedder: SharedEmbedder,
    pub vector_store: Arc<dyn VectorStore>,
    pub rag_indexer: Arc<RAGIndexer>,
    pub index_coordinator: Arc<IndexCoordinator>,
    pub chat_pipeline: Arc<ChatPipeline>,
    pub rag_enabled: Arc<AtomicBool>,
}
