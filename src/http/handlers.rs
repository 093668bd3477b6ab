use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::document_repo::Expected;
use crate::error::CoreError;
use crate::http::state::AppState;
use crate::models::{ChatMessage, ChatSession, Document, IndexState, VectorFilter};
use crate::rag_indexer::ChunkOverrides;
use crate::sse::into_sse_response;

/// Resolves the caller's `user_id` from the request. Authentication and
/// token validation live in the outer CRUD layer per the system's scope;
/// this is the seam a real deployment wires its auth middleware into. The
/// reference stub reads the bearer token as a raw numeric user id so the
/// core can be exercised standalone.
fn resolve_user_id(headers: &HeaderMap) -> Result<i64, CoreError> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoreError::PermissionDenied("missing Authorization header".to_string()))?;

    let token = auth
        .strip_prefix("Bearer ")
        .ok_or_else(|| CoreError::PermissionDenied("malformed Authorization header".to_string()))?;

    token
        .trim()
        .parse::<i64>()
        .map_err(|_| CoreError::PermissionDenied("unresolvable user id".to_string()))
}

#[derive(Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub title: String,
    pub knowledge_base_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub knowledge_base_id: Option<Option<i64>>,
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<ChatSession>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let session = state
        .chat_repo
        .create_session(user_id, body.title, body.knowledge_base_id)
        .await?;
    Ok(Json(session))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<ChatSession>>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let sessions = state
        .chat_repo
        .list_sessions(user_id, page.skip, page.limit)
        .await?;
    Ok(Json(sessions))
}

pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
) -> Result<Json<ChatSession>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let session = state
        .chat_repo
        .get_session(user_id, session_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("chat session {session_id}")))?;
    Ok(Json(session))
}

pub async fn update_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
    Json(body): Json<UpdateSessionRequest>,
) -> Result<Json<ChatSession>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let session = state
        .chat_repo
        .update_session(user_id, session_id, body.title, body.knowledge_base_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("chat session {session_id}")))?;
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
) -> Result<StatusCode, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let deleted = state.chat_repo.delete_session(user_id, session_id).await?;
    if !deleted {
        return Err(CoreError::NotFound(format!("chat session {session_id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<ChatMessage>>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    state
        .chat_repo
        .get_session(user_id, session_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("chat session {session_id}")))?;

    let messages = state
        .chat_repo
        .list_messages(session_id, page.skip, page.limit)
        .await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
}

pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
    Json(body): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let events = state
        .chat_pipeline
        .send(user_id, session_id, body.content)
        .await?;
    Ok(into_sse_response(events))
}

#[derive(Serialize)]
pub struct IndexStats {
    pub kb_id: i64,
    pub total_documents: usize,
    pub indexed_documents: usize,
    pub skipped_documents: usize,
    pub total_chunks: usize,
}

#[derive(Deserialize)]
pub struct IndexKbRequest {
    pub kb_id: i64,
    pub max_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
}

/// Synchronous batch-import path: bypasses the worker pool entirely and
/// drives `RAGIndexer` directly, the escape hatch `IndexCoordinator::disable`
/// exists for. Page size mirrors the reference page limit used elsewhere.
const BATCH_PAGE_SIZE: i64 = 200;

async fn index_documents_sync(
    state: &AppState,
    user_id: i64,
    documents: Vec<Document>,
    overrides: ChunkOverrides,
) -> Result<(usize, usize, usize), CoreError> {
    let mut indexed = 0usize;
    let mut skipped = 0usize;
    let mut total_chunks = 0usize;

    for document in documents {
        if !document.kind.is_indexable() {
            skipped += 1;
            continue;
        }

        let new_uuid = uuid::Uuid::new_v4();
        let now = Utc::now();
        state
            .document_repo
            .compare_and_set_index_state(
                user_id,
                document.id,
                Expected::Any,
                IndexState::indexing(new_uuid, now),
            )
            .await?;

        match state.rag_indexer.reindex_with_overrides(user_id, &document, overrides).await {
            Ok(chunk_count) => {
                total_chunks += chunk_count;
                indexed += 1;
                state
                    .document_repo
                    .compare_and_set_index_state(
                        user_id,
                        document.id,
                        Expected::Uuid(new_uuid),
                        IndexState::completed(new_uuid, Utc::now()),
                    )
                    .await?;
            }
            Err(e) => {
                state
                    .document_repo
                    .compare_and_set_index_state(
                        user_id,
                        document.id,
                        Expected::Uuid(new_uuid),
                        IndexState::failed(new_uuid, e.to_string(), Utc::now()),
                    )
                    .await?;
            }
        }
    }

    Ok((indexed, skipped, total_chunks))
}

pub async fn rag_index(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IndexKbRequest>,
) -> Result<Json<IndexStats>, CoreError> {
    let user_id = resolve_user_id(&headers)?;

    let mut all_documents = Vec::new();
    let mut skip = 0i64;
    loop {
        let page = state
            .document_repo
            .list_by_kb(user_id, body.kb_id, skip, BATCH_PAGE_SIZE, None)
            .await?;
        let page_len = page.len();
        all_documents.extend(page);
        if (page_len as i64) < BATCH_PAGE_SIZE {
            break;
        }
        skip += BATCH_PAGE_SIZE;
    }

    let total_documents = all_documents.len();
    let overrides = ChunkOverrides {
        max_tokens: body.max_tokens,
        overlap_tokens: body.overlap_tokens,
    };
    let (indexed_documents, skipped_documents, total_chunks) =
        index_documents_sync(&state, user_id, all_documents, overrides).await?;

    Ok(Json(IndexStats {
        kb_id: body.kb_id,
        total_documents,
        indexed_documents,
        skipped_documents,
        total_chunks,
    }))
}

pub async fn rag_reindex_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(doc_id): Path<i64>,
) -> Result<Json<IndexStats>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let document = state
        .document_repo
        .get(user_id, doc_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("document {doc_id}")))?;

    let kb_id = document.kb_id;
    let (indexed_documents, skipped_documents, total_chunks) =
        index_documents_sync(&state, user_id, vec![document], ChunkOverrides::default()).await?;

    Ok(Json(IndexStats {
        kb_id,
        total_documents: 1,
        indexed_documents,
        skipped_documents,
        total_chunks,
    }))
}

#[derive(Serialize)]
pub struct DeletedCount {
    pub deleted: u64,
}

pub async fn delete_document_index(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(doc_id): Path<i64>,
) -> Result<Json<DeletedCount>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let deleted = state.index_coordinator.on_document_deleted(user_id, doc_id).await?;
    Ok(Json(DeletedCount { deleted }))
}

pub async fn delete_kb_index(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kb_id): Path<i64>,
) -> Result<Json<DeletedCount>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let deleted = state
        .vector_store
        .delete(&VectorFilter::for_kb(user_id, kb_id))
        .await?;
    Ok(Json(DeletedCount { deleted }))
}

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub kb_id: Option<i64>,
    pub top_k: Option<usize>,
}

#[derive(Serialize)]
pub struct SearchResultItem {
    pub content: String,
    pub source: String,
    pub score: f32,
    pub metadata: crate::models::VectorMetadata,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub kb_id: Option<i64>,
    pub total: usize,
    pub results: Vec<SearchResultItem>,
}

pub async fn rag_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, CoreError> {
    let user_id = resolve_user_id(&headers)?;
    let top_k = body.top_k.unwrap_or(5);

    let query_vec = state
        .embedder
        .embed(&[body.query.clone()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::ModelError("empty embedding result".to_string()))?;

    let filter = VectorFilter {
        user_id: Some(user_id),
        doc_id: None,
        kb_id: body.kb_id,
    };
    let hits = state.vector_store.search(&query_vec, top_k, &filter).await?;

    let results: Vec<SearchResultItem> = hits
        .into_iter()
        .map(|h| SearchResultItem {
            content: h.content,
            source: h.source,
            score: h.distance,
            metadata: h.metadata,
        })
        .collect();

    Ok(Json(SearchResponse {
        total: results.len(),
        query: body.query,
        kb_id: body.kb_id,
        results,
    }))
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn health_ready(State(state): State<AppState>) -> Result<StatusCode, CoreError> {
    state
        .document_repo
        .list_by_kb(0, 0, 0, 1, None)
        .await
        .map_err(|_| CoreError::StoreError("database not ready".to_string()))?;
    Ok(StatusCode::OK)
}
