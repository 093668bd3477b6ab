use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::EmbeddingConfig;
use crate::error::CoreError;

/// Produces fixed-dimension, L2-normalized vectors from text.
///
/// Implementations must serialize concurrent calls internally — callers may
/// invoke `embed` from any worker without coordinating among themselves.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;

    fn dimension(&self) -> usize;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// HTTP-backed embedder for an OpenAI-compatible `/v1/embeddings` endpoint.
/// Calls are serialized behind an internal mutex, the same discipline the
/// teacher's `EmbeddingService` applies around its semaphore-gated client,
/// since most local embedding backends serialize requests on one GPU/CPU
/// worker regardless of how many HTTP connections arrive concurrently.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    api_key: Option<String>,
    lock: Mutex<()>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            api_key: config.api_key.clone(),
            lock: Mutex::new(()),
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: batch,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::ModelError(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::ModelError(format!(
                "embedding backend returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CoreError::ModelError(format!("malformed embedding response: {e}")))?;

        let mut vectors = vec![Vec::new(); batch.len()];
        for item in parsed.data {
            if item.index >= vectors.len() {
                continue;
            }
            if item.embedding.len() != self.dimension {
                return Err(CoreError::ModelError(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    item.embedding.len()
                )));
            }
            vectors[item.index] = l2_normalize(item.embedding);
        }

        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.lock.lock().await;

        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let vectors = self.embed_batch(chunk).await?;
            out.extend(vectors);
        }

        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn l2_normalize(vec: Vec<f32>) -> Vec<f32> {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vec;
    }
    vec.into_iter().map(|v| v / norm).collect()
}

pub type SharedEmbedder = Arc<dyn Embedder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        let norm = (v[0] * v[0] + v[1] * v[1]).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector_unchanged() {
        let v = l2_normalize(vec![0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
