use axum::routing::{delete, get, post};
use axum::Router;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::http::state::AppState;

/// Builds the `/api/v1` surface described in the external interfaces design,
/// grounded in the teacher's `main.rs::build_router` layering (permissive
/// CORS, `TraceLayer`, panic isolation) but with the SSO-specific
/// authorization middleware removed — user resolution is out of scope here
/// and stubbed in `handlers::resolve_user_id`.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chats", post(handlers::create_session).get(handlers::list_sessions))
        .route(
            "/chats/{id}",
            get(handlers::get_session)
                .put(handlers::update_session)
                .delete(handlers::delete_session),
        )
        .route("/chats/{id}/messages", get(handlers::list_messages).post(handlers::post_message))
        .route("/rag/index", post(handlers::rag_index))
        .route("/rag/reindex/document/{doc_id}", post(handlers::rag_reindex_document))
        .route("/rag/index/document/{doc_id}", delete(handlers::delete_document_index))
        .route("/rag/index/{kb_id}", delete(handlers::delete_kb_index))
        .route("/rag/search", post(handlers::rag_search));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::health_ready))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
