use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Streaming chat completion over an OpenAI-compatible endpoint. The
/// returned stream is finite and yields plain text deltas; the producer may
/// pause arbitrarily between items.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn stream_chat(
        &self,
        messages: Vec<LlmMessage>,
        options: ChatOptions,
    ) -> Result<BoxStream<'static, Result<String, CoreError>>, CoreError>;
}

#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<LlmMessage>,
    temperature: f32,
    max_tokens: usize,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

pub struct HttpLLMClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpLLMClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .expect("reqwest client builds with a fixed timeout"),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl LLMClient for HttpLLMClient {
    async fn stream_chat(
        &self,
        messages: Vec<LlmMessage>,
        options: ChatOptions,
    ) -> Result<BoxStream<'static, Result<String, CoreError>>, CoreError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = CompletionRequest {
            model: options.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: true,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::UpstreamError(format!("chat completion request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::UpstreamError(format!(
                "upstream returned {status}: {text}"
            )));
        }

        let byte_stream = response.bytes_stream();

        // Parses the raw `data: {...}` / `data: [DONE]` SSE framing the
        // upstream emits, the same loose line-buffering LlmService::chat_stream
        // performs over reqwest's byte stream.
        let deltas = stream::unfold(
            (byte_stream, String::new(), false),
            |(mut byte_stream, mut buffer, done)| async move {
                if done {
                    return None;
                }

                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer.drain(..=pos);

                        let Some(payload) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let payload = payload.trim();

                        if payload.is_empty() {
                            continue;
                        }
                        if payload == "[DONE]" {
                            return Some((Ok(String::new()), (byte_stream, buffer, true)));
                        }

                        let parsed: Result<CompletionChunk, _> = serde_json::from_str(payload);
                        match parsed {
                            Ok(chunk) => {
                                let delta = chunk
                                    .choices
                                    .into_iter()
                                    .next()
                                    .and_then(|c| c.delta.content)
                                    .unwrap_or_default();
                                if delta.is_empty() {
                                    continue;
                                }
                                return Some((Ok(delta), (byte_stream, buffer, false)));
                            }
                            Err(e) => {
                                return Some((
                                    Err(CoreError::UpstreamError(format!(
                                        "malformed stream chunk: {e}"
                                    ))),
                                    (byte_stream, buffer, true),
                                ));
                            }
                        }
                    }

                    match byte_stream.next().await {
                        Some(Ok(bytes)) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                        }
                        Some(Err(e)) => {
                            return Some((
                                Err(CoreError::UpstreamError(format!("stream read failed: {e}"))),
                                (byte_stream, buffer, true),
                            ));
                        }
                        None => return None,
                    }
                }
            },
        )
        .filter(|item| {
            let keep = !matches!(item, Ok(s) if s.is_empty());
            async move { keep }
        })
        .boxed();

        Ok(deltas)
    }
}
