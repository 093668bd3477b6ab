use std::sync::Arc;

use crate::chunker::Chunker;
use crate::config::ChunkingConfig;
use crate::embedder::SharedEmbedder;
use crate::error::CoreError;
use crate::models::{Document, NewVectorRecord, VectorFilter, VectorMetadata};
use crate::vector_store::VectorStore;

const INSERT_BATCH_SIZE: usize = 100;

/// Per-request overrides for `POST /rag/index`'s optional `max_tokens` /
/// `overlap_tokens` body fields (spec.md §6). Absent fields fall back to the
/// indexer's configured `Chunker`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOverrides {
    pub max_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
}

impl ChunkOverrides {
    pub fn is_empty(&self) -> bool {
        self.max_tokens.is_none() && self.overlap_tokens.is_none()
    }
}

/// Composes the embedder, chunker, and vector store to index one document
/// end-to-end. Every step is idempotent by construction: the leading delete
/// tolerates zero matches, so calling `reindex` twice on the same content
/// leaves the same chunk set behind (modulo pk).
pub struct RAGIndexer {
    embedder: SharedEmbedder,
    vector_store: Arc<dyn VectorStore>,
    chunker: Chunker,
}

impl RAGIndexer {
    pub fn new(embedder: SharedEmbedder, vector_store: Arc<dyn VectorStore>, chunker: Chunker) -> Self {
        Self {
            embedder,
            vector_store,
            chunker,
        }
    }

    pub async fn reindex(&self, user_id: i64, document: &Document) -> Result<usize, CoreError> {
        self.reindex_with_overrides(user_id, document, ChunkOverrides::default()).await
    }

    /// Same as `reindex`, but chunked with `overrides` applied on top of the
    /// indexer's configured `Chunker` for this call only — used by the
    /// synchronous batch-import path, which accepts per-request
    /// `max_tokens`/`overlap_tokens` on `POST /rag/index`.
    pub async fn reindex_with_overrides(
        &self,
        user_id: i64,
        document: &Document,
        overrides: ChunkOverrides,
    ) -> Result<usize, CoreError> {
        self.vector_store
            .delete(&VectorFilter::for_document(user_id, document.id))
            .await
            .map_err(|e| CoreError::IndexError(format!("delete before reindex failed: {e}")))?;

        let chunks = if overrides.is_empty() {
            self.chunker.chunk(&document.content)
        } else {
            let config = ChunkingConfig {
                max_tokens: overrides.max_tokens.unwrap_or_else(|| self.chunker.max_tokens()),
                overlap_tokens: overrides
                    .overlap_tokens
                    .unwrap_or_else(|| self.chunker.overlap_tokens()),
            };
            Chunker::new(&config).chunk(&document.content)
        };
        if chunks.is_empty() {
            return Ok(0);
        }

        let vectors = self
            .embedder
            .embed(&chunks)
            .await
            .map_err(|e| CoreError::IndexError(format!("embedding failed: {e}")))?;

        let records: Vec<NewVectorRecord> = chunks
            .iter()
            .zip(vectors.into_iter())
            .enumerate()
            .map(|(chunk_index, (content, embedding))| NewVectorRecord {
                embedding,
                content: content.clone(),
                source: document.name.clone(),
                metadata: VectorMetadata {
                    kb_id: document.kb_id,
                    doc_id: document.id,
                    doc_kind: document.kind,
                    doc_name: document.name.clone(),
                    user_id,
                    chunk_index: chunk_index as i32,
                },
            })
            .collect();

        for batch in records.chunks(INSERT_BATCH_SIZE) {
            self.vector_store
                .insert(batch)
                .await
                .map_err(|e| CoreError::IndexError(format!("insert failed: {e}")))?;
        }

        Ok(chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentKind, IndexState, VectorRecord};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeEmbedder {
        dim: usize,
    }

    #[async_trait]
    impl crate::embedder::Embedder for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|_| vec![0.1; self.dim]).collect())
        }

        fn dimension(&self) -> usize {
            self.dim
        }
    }

    struct FakeStore {
        records: StdMutex<Vec<VectorRecord>>,
        next_pk: StdMutex<i64>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                records: StdMutex::new(Vec::new()),
                next_pk: StdMutex::new(1),
            }
        }
    }

    #[async_trait]
    impl VectorStore for FakeStore {
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
            _top_k: usize,
            _filter: &crate::models::VectorFilter,
        ) -> Result<Vec<VectorRecord>, CoreError> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn delete(&self, filter: &crate::models::VectorFilter) -> Result<u64, CoreError> {
            let mut store = self.records.lock().unwrap();
            let before = store.len();
            store.retain(|r| {
                !(filter.doc_id.map_or(true, |d| r.metadata.doc_id == d)
                    && filter.user_id.map_or(true, |u| r.metadata.user_id == u))
            });
            Ok((before - store.len()) as u64)
        }
    }

    fn doc(content: &str) -> Document {
        Document {
            id: 1,
            user_id: 7,
            kb_id: 1,
            name: "note.md".to_string(),
            content: content.to_string(),
            kind: DocumentKind::Note,
            folder_id: None,
            index_state: IndexState::pending(),
        }
    }

    #[tokio::test]
    async fn empty_document_yields_zero_chunks() {
        let indexer = RAGIndexer::new(
            Arc::new(FakeEmbedder { dim: 4 }),
            Arc::new(FakeStore::new()),
            Chunker::new(&crate::config::ChunkingConfig {
                max_tokens: 512,
                overlap_tokens: 128,
            }),
        );
        let count = indexer.reindex(7, &doc("")).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn reindex_is_idempotent_on_unchanged_content() {
        let store = Arc::new(FakeStore::new());
        let indexer = RAGIndexer::new(
            Arc::new(FakeEmbedder { dim: 4 }),
            store.clone(),
            Chunker::new(&crate::config::ChunkingConfig {
                max_tokens: 512,
                overlap_tokens: 128,
            }),
        );
        let d = doc("hello world, this is a small document.");
        let first = indexer.reindex(7, &d).await.unwrap();
        let second = indexer.reindex(7, &d).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.records.lock().unwrap().len(), second);
    }

    #[tokio::test]
    async fn reindex_with_overrides_uses_request_chunking_not_configured_chunker() {
        let paragraph = "the quick brown fox jumps over the lazy dog. ".repeat(40);
        let d = doc(&paragraph);

        let default_store = Arc::new(FakeStore::new());
        let default_indexer = RAGIndexer::new(
            Arc::new(FakeEmbedder { dim: 4 }),
            default_store.clone(),
            Chunker::new(&crate::config::ChunkingConfig {
                max_tokens: 512,
                overlap_tokens: 128,
            }),
        );
        let default_count = default_indexer.reindex(7, &d).await.unwrap();
        assert_eq!(default_count, 1);

        let override_store = Arc::new(FakeStore::new());
        let override_indexer = RAGIndexer::new(
            Arc::new(FakeEmbedder { dim: 4 }),
            override_store.clone(),
            Chunker::new(&crate::config::ChunkingConfig {
                max_tokens: 512,
                overlap_tokens: 128,
            }),
        );
        let override_count = override_indexer
            .reindex_with_overrides(
                7,
                &d,
                ChunkOverrides {
                    max_tokens: Some(32),
                    overlap_tokens: Some(8),
                },
            )
            .await
            .unwrap();

        assert!(
            override_count > default_count,
            "smaller max_tokens override should yield more chunks than the configured chunker"
        );
        assert_eq!(override_store.records.lock().unwrap().len(), override_count);
    }

    #[tokio::test]
    async fn reindex_with_empty_overrides_matches_plain_reindex() {
        let d = doc("hello world, this is a small document.");

        let store_a = Arc::new(FakeStore::new());
        let indexer_a = RAGIndexer::new(
            Arc::new(FakeEmbedder { dim: 4 }),
            store_a.clone(),
            Chunker::new(&crate::config::ChunkingConfig {
                max_tokens: 512,
                overlap_tokens: 128,
            }),
        );
        let count_a = indexer_a.reindex(7, &d).await.unwrap();

        let store_b = Arc::new(FakeStore::new());
        let indexer_b = RAGIndexer::new(
            Arc::new(FakeEmbedder { dim: 4 }),
            store_b.clone(),
            Chunker::new(&crate::config::ChunkingConfig {
                max_tokens: 512,
                overlap_tokens: 128,
            }),
        );
        let count_b = indexer_b
            .reindex_with_overrides(7, &d, ChunkOverrides::default())
            .await
            .unwrap();

        assert_eq!(count_a, count_b);
    }
}
