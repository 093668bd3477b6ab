use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use knowledgebase_core::chat_pipeline::ChatPipeline;
use knowledgebase_core::chat_repo::PgChatRepo;
use knowledgebase_core::chunker::Chunker;
use knowledgebase_core::config::Settings;
use knowledgebase_core::db::DbPool;
use knowledgebase_core::document_repo::PgDocumentRepo;
use knowledgebase_core::embedder::HttpEmbedder;
use knowledgebase_core::http::{build_router, AppState};
use knowledgebase_core::index_coordinator::IndexCoordinator;
use knowledgebase_core::llm_client::HttpLLMClient;
use knowledgebase_core::logging;
use knowledgebase_core::rag_indexer::RAGIndexer;
use knowledgebase_core::vector_store::PgVectorStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let settings = Settings::load()?;
    tracing::info!(port = settings.server.port, "loaded configuration");

    let db_pool = DbPool::new(&settings.database).await?;

    let document_repo: Arc<dyn knowledgebase_core::document_repo::DocumentRepo> =
        Arc::new(PgDocumentRepo::new(db_pool.clone()));
    let chat_repo: Arc<dyn knowledgebase_core::chat_repo::ChatRepo> =
        Arc::new(PgChatRepo::new(db_pool.clone()));

    let embedder: Arc<dyn knowledgebase_core::embedder::Embedder> =
        Arc::new(HttpEmbedder::new(&settings.embedding));

    let vector_store: Arc<dyn knowledgebase_core::vector_store::VectorStore> =
        Arc::new(PgVectorStore::new(db_pool.clone(), settings.vector_store.clone()));
    vector_store.ensure_collection(settings.embedding.dimension).await?;

    let chunker = Chunker::new(&settings.chunking);

    let rag_indexer = Arc::new(RAGIndexer::new(
        embedder.clone(),
        vector_store.clone(),
        chunker,
    ));

    let index_coordinator = Arc::new(IndexCoordinator::new(
        document_repo.clone(),
        rag_indexer.clone(),
        vector_store.clone(),
        &settings.indexing,
    ));

    let llm_client: Arc<dyn knowledgebase_core::llm_client::LLMClient> =
        Arc::new(HttpLLMClient::new(&settings.llm));

    let rag_enabled = Arc::new(AtomicBool::new(true));

    let chat_pipeline = Arc::new(ChatPipeline::new(
        chat_repo.clone(),
        embedder.clone(),
        vector_store.clone(),
        llm_client.clone(),
        rag_enabled.clone(),
        settings.llm.model.clone(),
        settings.llm.temperature,
        settings.llm.max_tokens,
        settings.chat.max_context_tokens,
    ));

    let state = AppState {
        settings: Arc::new(settings.clone()),
        document_repo,
        chat_repo,
        embedder,
        vector_store,
        rag_indexer,
        index_coordinator: index_coordinator.clone(),
        chat_pipeline,
        rag_enabled,
    };

    spawn_timeout_sweeper(index_coordinator);

    let router = build_router(state);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    tracing::info!(%addr, "starting server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Runs `check_timeout_tasks` on a fixed tick, the periodic-invocation mode
/// spec.md §4.6 allows alongside the opportunistic sweep on document reads.
fn spawn_timeout_sweeper(coordinator: Arc<IndexCoordinator>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            match coordinator.check_timeout_tasks().await {
                Ok(n) if n > 0 => tracing::info!(count = n, "swept timed-out index tasks"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "timeout sweep failed"),
            }
        }
    });
}
