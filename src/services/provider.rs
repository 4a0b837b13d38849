//! Provider adapter: uniform generate/stream access to upstream back-ends.
//!
//! Every upstream is reached through the [`ProviderAdapter`] trait so the
//! router engine never sees transport details. Upstream failures are
//! normalized into four kinds the engine dispatches on; context-length
//! overflows are flagged so the engine can quarantine the model longer.
//!
//! The bundled [`HttpProviderAdapter`] speaks the OpenAI wire format
//! (`{base}/chat/completions`, bearer auth) against the configured
//! endpoints, with streaming via SSE line-buffered parsing of the response
//! byte stream.

use crate::api::models::{ChatMessage, Usage};
use crate::core::config::{ModelSpec, ProviderEndpointConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;

/// Normalized upstream failure taxonomy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Upstream returned 429; cooldown hint from Retry-After when present
    #[error("rate limited by upstream")]
    RateLimit { retry_after_ms: Option<u64> },

    /// Upstream account is out of quota (402)
    #[error("upstream quota exceeded")]
    QuotaExceeded,

    /// Retryable failure: 5xx, timeouts, transport errors
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Non-retryable failure: other 4xx, unknown provider, malformed reply.
    /// `context_length` marks context-window overflows.
    #[error("permanent upstream failure: {message}")]
    Permanent { message: String, context_length: bool },
}

impl ProviderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            message: message.into(),
            context_length: false,
        }
    }
}

/// Normalized non-streaming completion.
#[derive(Debug, Clone, Default)]
pub struct NormalizedResponse {
    pub text: String,
    pub tool_calls: Option<Value>,
    pub usage: Option<Usage>,
}

/// Lazy sequence of text deltas from a streaming completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Parameters of a single model invocation, post context fitting.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Value>,
    pub tool_choice: Option<Value>,
}

/// Uniform capability set every back-end exposes to the router.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Run a blocking completion.
    async fn generate(
        &self,
        model: &ModelSpec,
        request: &GenerationRequest,
    ) -> Result<NormalizedResponse, ProviderError>;

    /// Open a streaming completion and return its delta sequence.
    async fn stream(
        &self,
        model: &ModelSpec,
        request: &GenerationRequest,
    ) -> Result<DeltaStream, ProviderError>;
}

/// Classify an upstream error response into the normalized taxonomy.
///
/// 429 maps to `RateLimit` (honoring Retry-After seconds), 402 to
/// `QuotaExceeded`, 5xx to `Transient`, everything else to `Permanent`.
/// Bodies mentioning a context-window overflow set the sentinel flag.
pub fn classify_error_status(
    status: u16,
    retry_after_secs: Option<u64>,
    body: &str,
) -> ProviderError {
    match status {
        429 => ProviderError::RateLimit {
            retry_after_ms: retry_after_secs.map(|s| s * 1_000),
        },
        402 => ProviderError::QuotaExceeded,
        s if s >= 500 => ProviderError::Transient(format!("upstream status {}", s)),
        s => ProviderError::Permanent {
            message: format!("upstream status {}: {}", s, truncate(body, 200)),
            context_length: is_context_length_error(body),
        },
    }
}

/// Whether an upstream error body reports a context-window overflow.
pub fn is_context_length_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context_length_exceeded") || lower.contains("maximum context length")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

/// HTTP adapter for OpenAI-wire-compatible providers.
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    endpoints: HashMap<String, ProviderEndpointConfig>,
}

impl HttpProviderAdapter {
    /// Create an adapter over the configured provider endpoints, sharing
    /// one pooled HTTP client.
    pub fn new(client: reqwest::Client, providers: &[ProviderEndpointConfig]) -> Self {
        let endpoints = providers
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        Self { client, endpoints }
    }

    fn endpoint(&self, provider: &str) -> Result<&ProviderEndpointConfig, ProviderError> {
        self.endpoints
            .get(provider)
            .ok_or_else(|| ProviderError::permanent(format!("unknown provider: {}", provider)))
    }

    fn build_payload(model: &ModelSpec, request: &GenerationRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut payload = json!({
            "model": model.backend_model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(tools) = &request.tools {
            payload["tools"] = tools.clone();
        }
        if let Some(tool_choice) = &request.tool_choice {
            payload["tool_choice"] = tool_choice.clone();
        }

        payload
    }

    async fn send(
        &self,
        model: &ModelSpec,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let endpoint = self.endpoint(&model.provider)?;
        let url = format!("{}/chat/completions", endpoint.api_base.trim_end_matches('/'));
        let payload = Self::build_payload(model, request, stream);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let body = response.text().await.unwrap_or_default();
        Err(classify_error_status(status.as_u16(), retry_after_secs, &body))
    }
}

fn map_transport_error(error: reqwest::Error) -> ProviderError {
    // Timeouts and connection failures are retryable against another
    // candidate; nothing upstream-specific survives here.
    ProviderError::Transient(error.to_string())
}

/// Extract the flattened text of `choices[0].message.content`.
fn extract_message_text(body: &Value) -> String {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"));

    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| {
                if p.get("type").and_then(|t| t.as_str()) == Some("text") {
                    p.get("text").and_then(|t| t.as_str()).map(str::to_string)
                } else {
                    None
                }
            })
            .collect(),
        _ => String::new(),
    }
}

/// Extract the text content of a streaming chunk's first choice delta.
fn extract_delta_text(chunk: &Value) -> Option<String> {
    let delta = chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))?;

    match delta.get("content") {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

struct SseState {
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    eof: bool,
    done: bool,
}

impl SseState {
    /// Pop the next text delta out of complete buffered SSE events.
    fn next_buffered_delta(&mut self) -> Option<String> {
        loop {
            let event = if let Some(pos) = self.buffer.find("\n\n") {
                let event = self.buffer[..pos].to_string();
                self.buffer = self.buffer[pos + 2..].to_string();
                event
            } else if self.eof && !self.buffer.trim().is_empty() {
                std::mem::take(&mut self.buffer)
            } else {
                return None;
            };

            let mut collected = String::new();
            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    self.done = true;
                    break;
                }
                if let Ok(chunk) = serde_json::from_str::<Value>(data) {
                    if let Some(text) = extract_delta_text(&chunk) {
                        collected.push_str(&text);
                    }
                }
            }

            if !collected.is_empty() {
                return Some(collected);
            }
            if self.done {
                return None;
            }
        }
    }
}

/// Turn an SSE byte stream into a lazy sequence of text deltas.
fn delta_stream_from_bytes(
    stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> DeltaStream {
    let state = SseState {
        stream: Box::pin(stream),
        buffer: String::new(),
        eof: false,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.next_buffered_delta() {
                return Some((Ok(text), state));
            }
            if state.done || state.eof {
                return None;
            }

            match state.stream.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(ProviderError::Transient(e.to_string())), state));
                }
                None => {
                    state.eof = true;
                }
            }
        }
    }))
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn generate(
        &self,
        model: &ModelSpec,
        request: &GenerationRequest,
    ) -> Result<NormalizedResponse, ProviderError> {
        let response = self.send(model, request, false).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("malformed upstream body: {}", e)))?;

        let text = extract_message_text(&body);
        let tool_calls = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("tool_calls"))
            .filter(|tc| !tc.is_null())
            .cloned();
        let usage = body
            .get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
            .filter(|u| u.total_tokens > 0);

        Ok(NormalizedResponse {
            text,
            tool_calls,
            usage,
        })
    }

    async fn stream(
        &self,
        model: &ModelSpec,
        request: &GenerationRequest,
    ) -> Result<DeltaStream, ProviderError> {
        let response = self.send(model, request, true).await?;
        Ok(delta_stream_from_bytes(response.bytes_stream()))
    }
}
