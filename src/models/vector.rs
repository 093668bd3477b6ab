use serde::{Deserialize, Serialize};

use super::document::DocumentKind;

/// Structured metadata carried on every vector record. Field names match the
/// wire schema in spec.md §6 exactly, since clients rely on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub kb_id: i64,
    pub doc_id: i64,
    pub doc_kind: DocumentKind,
    pub doc_name: String,
    pub user_id: i64,
    pub chunk_index: i32,
}

/// A record to insert. `pk` and `created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewVectorRecord {
    pub embedding: Vec<f32>,
    pub content: String,
    pub source: String,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub pk: i64,
    pub embedding: Vec<f32>,
    pub content: String,
    pub source: String,
    pub metadata: VectorMetadata,
    pub created_at: i64,
    /// L2 distance to the query vector. Only meaningful on search results;
    /// zero on freshly inserted records.
    pub distance: f32,
}

/// Equality filter applied server-side on `search`/`delete`. All present
/// fields are ANDed together.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub user_id: Option<i64>,
    pub doc_id: Option<i64>,
    pub kb_id: Option<i64>,
}

impl VectorFilter {
    pub fn for_document(user_id: i64, doc_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            doc_id: Some(doc_id),
            kb_id: None,
        }
    }

    pub fn for_kb(user_id: i64, kb_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            doc_id: None,
            kb_id: Some(kb_id),
        }
    }
}
