pub mod chat_pipeline;
pub mod chat_repo;
pub mod chunker;
pub mod config;
pub mod db;
pub mod document_repo;
pub mod embedder;
pub mod error;
pub mod http;
pub mod index_coordinator;
pub mod limiters;
pub mod llm_client;
pub mod logging;
pub mod models;
pub mod rag_indexer;
pub mod sse;
pub mod vector_store;
