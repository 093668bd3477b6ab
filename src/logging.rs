/// Initializes the global tracing subscriber. Mirrors rag-api-server::main's
/// setup: JSON output, env-filter driven by `RUST_LOG`, thread ids attached.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,knowledgebase_core=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();
}
