use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;

use crate::chat_repo::ChatRepo;
use crate::embedder::SharedEmbedder;
use crate::error::CoreError;
use crate::limiters::Limiters;
use crate::llm_client::{ChatOptions, LLMClient, LlmMessage, MessageRole};
use crate::models::{ContentType, NewChatMessage, RagSource, Role, StreamEvent};
use crate::vector_store::VectorStore;
use crate::models::VectorFilter;

const HISTORY_LIMIT: i64 = 20;
const RAG_TOP_K: usize = 5;

const SYSTEM_PROMPT: &str = "You are a helpful assistant. When context is \
provided below, answer using only the information in that context; if the \
context does not contain the answer, say so rather than guessing.";

/// Orchestrates retrieval, prompt assembly, and streaming generation for one
/// chat turn, emitting structured progress events as it goes. Grounded in
/// the teacher's `ConversationManager::handle_message` and the
/// `ChatStreamChunk`/`SystemEvent` tagged-enum precedent for the event shape.
pub struct ChatPipeline {
    chat_repo: Arc<dyn ChatRepo>,
    embedder: SharedEmbedder,
    vector_store: Arc<dyn VectorStore>,
    llm_client: Arc<dyn LLMClient>,
    limiters: Arc<Limiters>,
    rag_enabled: Arc<AtomicBool>,
    model: String,
    temperature: f32,
    max_tokens: usize,
    max_context_tokens: usize,
}

impl ChatPipeline {
    pub fn new(
        chat_repo: Arc<dyn ChatRepo>,
        embedder: SharedEmbedder,
        vector_store: Arc<dyn VectorStore>,
        llm_client: Arc<dyn LLMClient>,
        limiters: Arc<Limiters>,
        rag_enabled: Arc<AtomicBool>,
        model: String,
        temperature: f32,
        max_tokens: usize,
        max_context_tokens: usize,
    ) -> Self {
        Self {
            chat_repo,
            embedder,
            vector_store,
            llm_client,
            limiters,
            rag_enabled,
            model,
            temperature,
            max_tokens,
            max_context_tokens,
        }
    }

    pub async fn send(
        &self,
        user_id: i64,
        session_id: i64,
        user_text: String,
    ) -> Result<BoxStream<'static, StreamEvent>, CoreError> {
        let session = self
            .chat_repo
            .get_session(user_id, session_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("chat session {session_id}")))?;

        // Loaded before persisting the new user message: the prior
        // conversation excludes this turn, which is appended separately
        // below when assembling the LLM prompt.
        let history = self
            .chat_repo
            .list_recent_messages(session_id, HISTORY_LIMIT)
            .await?;

        self.chat_repo
            .append_message(NewChatMessage {
                session_id,
                role: Role::User,
                content: user_text.clone(),
                content_type: ContentType::Content,
                rag_context: None,
                rag_sources: None,
            })
            .await?;

        let chat_repo = self.chat_repo.clone();
        let embedder = self.embedder.clone();
        let vector_store = self.vector_store.clone();
        let llm_client = self.llm_client.clone();
        let limiters = self.limiters.clone();
        let rag_enabled = self.rag_enabled.clone();
        let model = self.model.clone();
        let temperature = self.temperature;
        let max_tokens = self.max_tokens;
        let max_context_tokens = self.max_context_tokens;
        let kb_id = session.kb_id;

        let stream = stream! {
            let mut context_block: Option<String> = None;
            let mut rag_sources: Option<Vec<RagSource>> = None;

            if let Some(kb_id) = kb_id {
                if rag_enabled.load(Ordering::SeqCst) {
                    yield StreamEvent::rag_step("search_start", json!({"kb_id": kb_id}));

                    let hits_result = async {
                        let query_vec = {
                            let _permit = limiters.acquire_embedding().await?;
                            embedder
                                .embed(&[user_text.clone()])
                                .await?
                                .into_iter()
                                .next()
                                .ok_or_else(|| CoreError::ModelError("empty embedding result".into()))?
                        };

                        let _permit = limiters.acquire_db_search().await?;
                        let filter = VectorFilter {
                            user_id: Some(user_id),
                            doc_id: None,
                            kb_id: Some(kb_id),
                        };
                        vector_store.search(&query_vec, RAG_TOP_K, &filter).await
                    }
                    .await;

                    match hits_result {
                        Ok(hits) => {
                            yield StreamEvent::rag_step("search_complete", json!({"count": hits.len()}));
                            yield StreamEvent::rag_step("context_build", json!({}));

                            let block = assemble_context_block(&hits, max_context_tokens);

                            let sources: Vec<RagSource> = hits
                                .iter()
                                .map(|h| RagSource {
                                    doc_name: h.metadata.doc_name.clone(),
                                    doc_id: h.metadata.doc_id,
                                    score: h.distance,
                                })
                                .collect();

                            context_block = if block.is_empty() { None } else { Some(block) };
                            let source_count = sources.len();
                            rag_sources = Some(sources);

                            yield StreamEvent::rag_step("context_complete", json!({"sources": source_count}));
                            yield StreamEvent::rag_step("generate_start", json!({}));
                        }
                        Err(e) => {
                            yield StreamEvent::rag_step("search_error", json!({"error": e.to_string()}));
                            yield StreamEvent::error(e.to_string(), None);
                            yield StreamEvent::Done;

                            let _ = chat_repo.append_message(NewChatMessage {
                                session_id,
                                role: Role::Assistant,
                                content: e.to_string(),
                                content_type: ContentType::Content,
                                rag_context: None,
                                rag_sources: None,
                            }).await;
                            return;
                        }
                    }
                }
            }

            let mut messages = vec![LlmMessage { role: MessageRole::System, content: SYSTEM_PROMPT.to_string() }];
            if let Some(block) = &context_block {
                messages.push(LlmMessage { role: MessageRole::System, content: format!("Context:\n{block}") });
            }
            for m in &history {
                let role = match m.role {
                    Role::User => MessageRole::User,
                    Role::Assistant => MessageRole::Assistant,
                    Role::System => MessageRole::System,
                };
                messages.push(LlmMessage { role, content: m.content.clone() });
            }
            messages.push(LlmMessage { role: MessageRole::User, content: user_text.clone() });

            let options = ChatOptions { model: model.clone(), temperature, max_tokens };

            let mut full_reply = String::new();

            // A stream-start or mid-stream failure simply truncates full_reply
            // at whatever was received; persistence below runs regardless. The
            // llm_stream permit is held for the whole generation, not just the
            // initial request, since that's when the upstream connection is
            // actually occupied.
            if let Ok(_permit) = limiters.acquire_llm_stream().await {
                if let Ok(mut deltas) = llm_client.stream_chat(messages, options).await {
                    while let Some(delta) = deltas.next().await {
                        match delta {
                            Ok(text) => {
                                full_reply.push_str(&text);
                                yield StreamEvent::message(text);
                            }
                            Err(_) => break,
                        }
                    }
                }
            }

            let append_result = chat_repo.append_message(NewChatMessage {
                session_id,
                role: Role::Assistant,
                content: full_reply,
                content_type: ContentType::Content,
                rag_context: context_block,
                rag_sources,
            }).await;

            if append_result.is_ok() {
                let _ = chat_repo.touch_session(session_id).await;
            }

            yield StreamEvent::Done;
        };

        Ok(stream.boxed())
    }
}

/// Concatenates hit contents, most relevant first, separated by blank lines
/// and prefixed by a header identifying the source document. Hits arrive
/// from `VectorStore::search` already ordered ascending by distance (best
/// match first), so honoring `max_context_tokens` by taking a prefix and
/// stopping is equivalent to dropping the lowest-scored hits first.
fn assemble_context_block(hits: &[crate::models::VectorRecord], max_context_tokens: usize) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let mut budget = max_context_tokens;

    for hit in hits {
        let estimated = estimate_tokens(&hit.content);
        if !blocks.is_empty() && estimated > budget {
            break;
        }
        budget = budget.saturating_sub(estimated);
        blocks.push(format!("[Source: {}]\n{}", hit.source, hit.content));
    }

    blocks.join("\n\n")
}

/// Whitespace-word count, good enough for a soft prompt budget; the actual
/// tokenizer lives in `Chunker` and is not re-run here.
fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{VectorMetadata, DocumentKind};

    fn hit(source: &str, content: &str) -> crate::models::VectorRecord {
        crate::models::VectorRecord {
            pk: 1,
            embedding: vec![0.0],
            content: content.to_string(),
            source: source.to_string(),
            metadata: VectorMetadata {
                kb_id: 1,
                doc_id: 1,
                doc_kind: DocumentKind::Note,
                doc_name: source.to_string(),
                user_id: 1,
                chunk_index: 0,
            },
            created_at: 0,
            distance: 0.1,
        }
    }

    #[test]
    fn empty_hits_yield_empty_block() {
        assert_eq!(assemble_context_block(&[], 1000), "");
    }

    #[test]
    fn single_hit_over_budget_is_still_included() {
        let hits = vec![hit("doc.md", "one two three four five")];
        let block = assemble_context_block(&hits, 1);
        assert!(block.contains("doc.md"));
        assert!(block.contains("one two three four five"));
    }

    #[test]
    fn later_hits_dropped_once_budget_exhausted() {
        let hits = vec![hit("a.md", "one two three"), hit("b.md", "four five six")];
        let block = assemble_context_block(&hits, 3);
        assert!(block.contains("a.md"));
        assert!(!block.contains("b.md"));
    }
}
