use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub chunking: ChunkingConfig,
    pub indexing: IndexingConfig,
    pub llm: LlmConfig,
    pub limits: LimitsConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorStoreConfig {
    pub collection: String,
    pub nlist: u32,
    pub nprobe: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexingConfig {
    pub max_workers: usize,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub queue_bound: usize,
    pub admission_wait_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub embedding_concurrency: usize,
    pub db_search_concurrency: usize,
    pub llm_stream_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatConfig {
    /// Upper bound on retrieved-context tokens folded into the prompt.
    /// Hits beyond this budget are dropped in retrieval-score order
    /// (lowest-scored first) rather than truncated mid-chunk.
    pub max_context_tokens: usize,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        // Named env knobs from spec.md §6 take precedence over the layered
        // config source, matching rag-embedding-worker's practice of reading
        // a couple of hot operational knobs straight from the environment.
        if let Ok(v) = std::env::var("RAG_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                settings.indexing.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("RAG_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse() {
                settings.indexing.timeout_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL") {
            settings.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            settings.llm.api_key = Some(v);
        }

        Ok(settings)
    }
}
