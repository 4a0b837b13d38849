//! Server-Sent Events (SSE) streaming for chat completions.
//!
//! Two delivery modes exist:
//!
//! - **Buffered**: the accepted (quality-gated) response text is chunked at
//!   the configured size with a configured inter-chunk delay. The client
//!   sees a normal OpenAI stream whose concatenation is exactly the
//!   accepted text.
//! - **Passthrough**: provider deltas are forwarded in real time. The
//!   router's accounting wrapper has already been applied to the delta
//!   sequence, so evaluation runs when the stream completes.

use crate::core::config::StreamingConfig;
use crate::services::router::RoutedStream;
use axum::body::Body;
use axum::response::Response;
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;

/// Terminal SSE frame.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Build one chat-completion chunk payload.
pub fn completion_chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

/// Render a JSON payload as one SSE event.
pub fn sse_event(payload: &Value) -> String {
    format!("data: {}\n\n", payload)
}

/// Split text into chunks of at most `chunk_size` characters, preserving
/// UTF-8 boundaries and concatenation order.
pub fn split_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let size = chunk_size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn sse_response(stream: impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static) -> Response {
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Stream an already-accepted response as chunked SSE.
pub fn buffered_sse_response(
    text: &str,
    model_id: &str,
    completion_id: &str,
    created: i64,
    config: &StreamingConfig,
) -> Response {
    struct State {
        chunks: std::vec::IntoIter<String>,
        id: String,
        model: String,
        created: i64,
        delay: Duration,
        first: bool,
        finish_sent: bool,
        done_sent: bool,
    }

    let state = State {
        chunks: split_chunks(text, config.chunk_size).into_iter(),
        id: completion_id.to_string(),
        model: model_id.to_string(),
        created,
        delay: Duration::from_millis(config.chunk_delay_ms),
        first: true,
        finish_sent: false,
        done_sent: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if let Some(chunk) = state.chunks.next() {
            let delta = if state.first {
                json!({"role": "assistant", "content": chunk})
            } else {
                tokio::time::sleep(state.delay).await;
                json!({"content": chunk})
            };
            state.first = false;
            let payload = completion_chunk(&state.id, state.created, &state.model, delta, None);
            return Some((
                Ok::<Vec<u8>, std::io::Error>(sse_event(&payload).into_bytes()),
                state,
            ));
        }

        if !state.finish_sent {
            state.finish_sent = true;
            let payload = completion_chunk(
                &state.id,
                state.created,
                &state.model,
                json!({}),
                Some("stop"),
            );
            return Some((Ok(sse_event(&payload).into_bytes()), state));
        }

        if !state.done_sent {
            state.done_sent = true;
            return Some((Ok(SSE_DONE.as_bytes().to_vec()), state));
        }

        None
    });

    sse_response(stream)
}

/// Forward a passthrough provider stream as SSE in real time.
///
/// A mid-stream provider error surfaces as an SSE error event followed by
/// the terminal frame; the prefix already delivered stands.
pub fn passthrough_sse_response(
    routed: RoutedStream,
    completion_id: &str,
    created: i64,
) -> Response {
    struct State {
        routed: RoutedStream,
        id: String,
        created: i64,
        first: bool,
        closed: bool,
    }

    let state = State {
        id: completion_id.to_string(),
        created,
        routed,
        first: true,
        closed: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if state.closed {
            return None;
        }

        match state.routed.deltas.next().await {
            Some(Ok(delta)) => {
                let content = if state.first {
                    json!({"role": "assistant", "content": delta})
                } else {
                    json!({"content": delta})
                };
                state.first = false;
                let payload = completion_chunk(
                    &state.id,
                    state.created,
                    &state.routed.model_id,
                    content,
                    None,
                );
                Some((
                    Ok::<Vec<u8>, std::io::Error>(sse_event(&payload).into_bytes()),
                    state,
                ))
            }
            Some(Err(error)) => {
                tracing::error!(model = %state.routed.model_id, error = %error, "Stream error");
                state.closed = true;
                let event = json!({
                    "error": {
                        "message": error.to_string(),
                        "type": "stream_error",
                    }
                });
                let frame = format!("event: error\ndata: {}\n\n{}", event, SSE_DONE);
                Some((Ok(frame.into_bytes()), state))
            }
            None => {
                state.closed = true;
                let payload = completion_chunk(
                    &state.id,
                    state.created,
                    &state.routed.model_id,
                    json!({}),
                    Some("stop"),
                );
                let frame = format!("{}{}", sse_event(&payload), SSE_DONE);
                Some((Ok(frame.into_bytes()), state))
            }
        }
    });

    sse_response(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::task_type::TaskType;

    #[test]
    fn test_split_chunks_preserves_text() {
        let text = "The quick brown fox jumps over the lazy dog";
        let chunks = split_chunks(text, 7);
        assert_eq!(chunks.join(""), text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 7));
    }

    #[test]
    fn test_split_chunks_multibyte() {
        let text = "héllo wörld 日本語テキスト";
        let chunks = split_chunks(text, 3);
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn test_split_chunks_zero_size_clamped() {
        let chunks = split_chunks("abc", 0);
        assert_eq!(chunks, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_split_chunks_empty_text() {
        assert!(split_chunks("", 10).is_empty());
    }

    #[test]
    fn test_completion_chunk_shape() {
        let chunk = completion_chunk("id-1", 1_000, "m1", json!({"content": "hi"}), None);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "m1");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
        assert!(chunk["choices"][0]["finish_reason"].is_null());

        let last = completion_chunk("id-1", 1_000, "m1", json!({}), Some("stop"));
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_sse_event_format() {
        let event = sse_event(&json!({"x": 1}));
        assert!(event.starts_with("data: {"));
        assert!(event.ends_with("\n\n"));
    }

    async fn body_to_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn extract_stream_text(body: &str) -> String {
        let mut out = String::new();
        for line in body.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }
            let value: Value = serde_json::from_str(data).unwrap();
            if let Some(content) = value["choices"][0]["delta"]["content"].as_str() {
                out.push_str(content);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_buffered_stream_round_trips_text() {
        let config = StreamingConfig {
            chunk_size: 5,
            chunk_delay_ms: 0,
        };
        let text = "a reasonably long accepted answer";
        let response = buffered_sse_response(text, "m1", "chatcmpl-1", 1_000, &config);

        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let body = body_to_string(response).await;
        assert_eq!(extract_stream_text(&body), text);
        assert!(body.contains("data: [DONE]"));
        assert!(body.contains("\"finish_reason\":\"stop\""));
    }

    #[tokio::test]
    async fn test_buffered_stream_first_chunk_has_role() {
        let config = StreamingConfig {
            chunk_size: 100,
            chunk_delay_ms: 0,
        };
        let response = buffered_sse_response("hello", "m1", "chatcmpl-1", 1_000, &config);
        let body = body_to_string(response).await;

        let first_data = body
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap();
        let value: Value = serde_json::from_str(first_data).unwrap();
        assert_eq!(value["choices"][0]["delta"]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_passthrough_stream_forwards_deltas() {
        let deltas: Vec<Result<String, crate::services::provider::ProviderError>> =
            vec![Ok("Hel".to_string()), Ok("lo".to_string())];
        let routed = RoutedStream {
            model_id: "m1".to_string(),
            task: TaskType::Reasoning,
            attempts: vec![],
            deltas: Box::pin(futures::stream::iter(deltas)),
        };

        let response = passthrough_sse_response(routed, "chatcmpl-2", 1_000);
        let body = body_to_string(response).await;
        assert_eq!(extract_stream_text(&body), "Hello");
        assert!(body.ends_with(SSE_DONE));
    }

    #[tokio::test]
    async fn test_passthrough_stream_error_terminates() {
        let deltas: Vec<Result<String, crate::services::provider::ProviderError>> = vec![
            Ok("partial".to_string()),
            Err(crate::services::provider::ProviderError::Transient(
                "connection reset".to_string(),
            )),
        ];
        let routed = RoutedStream {
            model_id: "m1".to_string(),
            task: TaskType::Reasoning,
            attempts: vec![],
            deltas: Box::pin(futures::stream::iter(deltas)),
        };

        let response = passthrough_sse_response(routed, "chatcmpl-3", 1_000);
        let body = body_to_string(response).await;
        assert!(body.contains("event: error"));
        assert!(body.contains("connection reset"));
        assert!(body.ends_with(SSE_DONE));
        // The prefix delivered before the error stands.
        assert!(body.contains("partial"));
    }
}
