//! HTTP handlers for the OpenAI-compatible surface.
//!
//! `/v1/chat/completions` and `/v1/responses` normalize the wire payload
//! into a [`RouterRequest`], run the routing engine against the current
//! config snapshot, and shape the outcome back into OpenAI payloads
//! (JSON, buffered SSE, or passthrough SSE).

use crate::api::models::{
    normalize_messages, ChatCompletionRequest, ResponsesRequest, RouterHeaderOptions,
};
use crate::api::streaming::{buffered_sse_response, passthrough_sse_response};
use crate::core::budget_store::BudgetStore;
use crate::core::config::{RuntimeConfig, ServerConfig};
use crate::core::database::Database;
use crate::core::error::AppError;
use crate::core::health_store::HealthStore;
use crate::core::middleware::{request_id_middleware, MetricsMiddleware};
use crate::core::session_store::{AttemptRecord, SessionStore};
use crate::services::provider::ProviderAdapter;
use crate::services::router::{RouteOutcome, RoutedResponse, RouterEngine, RouterRequest};
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub health: HealthStore,
    pub budget: BudgetStore,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(
        runtime: RuntimeConfig,
        server: ServerConfig,
        adapter: Arc<dyn ProviderAdapter>,
        db: &Database,
    ) -> Self {
        Self {
            runtime,
            server,
            adapter,
            health: HealthStore::new(db),
            budget: BudgetStore::new(db),
            sessions: SessionStore::new(db),
        }
    }

    /// Build a routing engine over the current config snapshot.
    fn engine(&self) -> RouterEngine {
        RouterEngine::new(
            self.runtime.snapshot(),
            self.adapter.clone(),
            self.health.clone(),
            self.budget.clone(),
            self.sessions.clone(),
        )
    }
}

/// Build the full application router with all endpoints and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .with_state(state)
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Whether the resume path is available to this caller.
fn resume_allowed(server: &ServerConfig, token: Option<&str>) -> bool {
    if server.allow_insecure_resume {
        return true;
    }
    match (&server.admin_token, token) {
        (Some(expected), Some(provided)) => expected == provided,
        _ => false,
    }
}

/// Base64-JSON routing metadata attached as a response header in debug mode.
fn metadata_header(
    request_id: &str,
    model_id: &str,
    attempts: &[AttemptRecord],
) -> Option<HeaderValue> {
    let payload = json!({
        "request_id": request_id,
        "model": model_id,
        "attempts": attempts,
    });
    let encoded = BASE64_STANDARD.encode(payload.to_string());
    HeaderValue::from_str(&encoded).ok()
}

/// Shape a routed response as a standard chat-completion body.
fn chat_completion_body(
    completion_id: &str,
    created: i64,
    routed: &RoutedResponse,
    debug: bool,
) -> Value {
    let finish_reason = if routed.tool_calls.is_some() {
        "tool_calls"
    } else {
        "stop"
    };

    let mut message = json!({
        "role": "assistant",
        "content": routed.text,
    });
    if let Some(tool_calls) = &routed.tool_calls {
        message["tool_calls"] = tool_calls.clone();
    }

    let mut body = json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": routed.model_id,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });

    if let Some(usage) = &routed.usage {
        body["usage"] = json!(usage);
    }
    if debug {
        body["router"] = json!({
            "model": routed.model_id,
            "task": routed.task.as_str(),
            "attempts": routed.attempts,
            "eval_score": routed.eval_score,
            "resumed": routed.resumed,
        });
    }

    body
}

/// OpenAI-compatible chat completions endpoint.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    let options = RouterHeaderOptions::from_headers(&headers);

    let wire: ChatCompletionRequest = serde_json::from_value(payload)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {}", e)))?;
    if wire.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".to_string()));
    }
    let messages = normalize_messages(&wire.messages)?;

    if options.resume && !resume_allowed(&state.server, options.admin_token.as_deref()) {
        return Err(AppError::Unauthorized);
    }

    let request_id = options
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let stream_requested = wire.stream.unwrap_or(false);

    let router_request = RouterRequest {
        messages,
        task_type: options.task_type.clone(),
        quality_threshold: options.quality_threshold,
        max_wait_ms: options.max_wait_ms,
        attempt_budget: None,
        request_id: request_id.clone(),
        temperature: wire.temperature,
        top_p: wire.top_p,
        max_tokens: wire.max_tokens,
        stream: stream_requested,
        allow_degrade: options.allow_degrade,
        resume: options.resume,
        tools: wire.tools.clone(),
        tool_choice: wire.tool_choice.clone(),
    };

    let snapshot = state.runtime.snapshot();
    let outcome = state.engine().route(router_request).await?;

    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();

    match outcome {
        RouteOutcome::Streaming(routed) => {
            let metadata = options
                .debug
                .then(|| metadata_header(&request_id, &routed.model_id, &routed.attempts))
                .flatten();
            let mut response = passthrough_sse_response(routed, &completion_id, created);
            if let Some(value) = metadata {
                response.headers_mut().insert("x-router-metadata", value);
            }
            Ok(response)
        }
        RouteOutcome::Completed(routed) => {
            let metadata = options
                .debug
                .then(|| metadata_header(&request_id, &routed.model_id, &routed.attempts))
                .flatten();

            // Tool calls require whole-call delivery; streaming is disabled
            // for them regardless of the request's stream flag.
            let mut response = if stream_requested && routed.tool_calls.is_none() {
                buffered_sse_response(
                    &routed.text,
                    &routed.model_id,
                    &completion_id,
                    created,
                    &snapshot.streaming,
                )
            } else {
                Json(chat_completion_body(
                    &completion_id,
                    created,
                    &routed,
                    options.debug,
                ))
                .into_response()
            };

            if let Some(value) = metadata {
                response.headers_mut().insert("x-router-metadata", value);
            }
            Ok(response)
        }
    }
}

/// Responses API endpoint. Streaming is rejected here.
pub async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    let options = RouterHeaderOptions::from_headers(&headers);

    let wire: ResponsesRequest = serde_json::from_value(payload)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {}", e)))?;
    if wire.stream == Some(true) {
        return Err(AppError::BadRequest(
            "streaming is not supported on /v1/responses".to_string(),
        ));
    }
    let messages = wire.normalized_messages()?;
    if messages.is_empty() {
        return Err(AppError::BadRequest("input must not be empty".to_string()));
    }

    if options.resume && !resume_allowed(&state.server, options.admin_token.as_deref()) {
        return Err(AppError::Unauthorized);
    }

    let request_id = options
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let router_request = RouterRequest {
        messages,
        task_type: options.task_type.clone(),
        quality_threshold: options.quality_threshold,
        max_wait_ms: options.max_wait_ms,
        attempt_budget: None,
        request_id: request_id.clone(),
        temperature: wire.temperature,
        top_p: wire.top_p,
        max_tokens: wire.max_output_tokens,
        stream: false,
        allow_degrade: options.allow_degrade,
        resume: options.resume,
        tools: None,
        tool_choice: None,
    };

    let outcome = state.engine().route(router_request).await?;
    let RouteOutcome::Completed(routed) = outcome else {
        return Err(AppError::Internal(
            "unexpected streaming outcome on /v1/responses".to_string(),
        ));
    };

    let created = chrono::Utc::now().timestamp();
    let mut body = json!({
        "id": format!("resp_{}", Uuid::new_v4().simple()),
        "object": "response",
        "created_at": created,
        "status": "completed",
        "model": routed.model_id,
        "output": [{
            "type": "message",
            "id": format!("msg_{}", Uuid::new_v4().simple()),
            "status": "completed",
            "role": "assistant",
            "content": [{
                "type": "output_text",
                "text": routed.text,
                "annotations": [],
            }],
        }],
    });
    if let Some(usage) = &routed.usage {
        body["usage"] = json!({
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        });
    }

    let metadata = options
        .debug
        .then(|| metadata_header(&request_id, &routed.model_id, &routed.attempts))
        .flatten();
    let mut response = Json(body).into_response();
    if let Some(value) = metadata {
        response.headers_mut().insert("x-router-metadata", value);
    }
    Ok(response)
}

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok"
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Result<String, AppError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| AppError::Internal(format!("metrics are not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session_store::AttemptOutcome;
    use crate::services::task_type::TaskType;

    fn server_config(admin_token: Option<&str>, insecure: bool) -> ServerConfig {
        ServerConfig {
            admin_token: admin_token.map(str::to_string),
            allow_insecure_resume: insecure,
            ..Default::default()
        }
    }

    #[test]
    fn test_resume_allowed_with_matching_token() {
        let server = server_config(Some("secret"), false);
        assert!(resume_allowed(&server, Some("secret")));
        assert!(!resume_allowed(&server, Some("wrong")));
        assert!(!resume_allowed(&server, None));
    }

    #[test]
    fn test_resume_allowed_with_insecure_flag() {
        let server = server_config(None, true);
        assert!(resume_allowed(&server, None));
    }

    #[test]
    fn test_resume_denied_without_configuration() {
        let server = server_config(None, false);
        assert!(!resume_allowed(&server, Some("anything")));
    }

    fn routed(text: &str, tool_calls: Option<Value>) -> RoutedResponse {
        RoutedResponse {
            text: text.to_string(),
            tool_calls,
            model_id: "m1".to_string(),
            task: TaskType::Code,
            attempts: vec![AttemptRecord {
                model_id: "m1".to_string(),
                outcome: AttemptOutcome::Success,
                score: Some(0.9),
            }],
            eval_score: Some(0.9),
            usage: None,
            resumed: false,
        }
    }

    #[test]
    fn test_chat_completion_body_shape() {
        let body = chat_completion_body("chatcmpl-1", 1_000, &routed("hello", None), false);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body.get("router").is_none());
    }

    #[test]
    fn test_chat_completion_body_with_tool_calls() {
        let tool_calls = json!([{"id": "call_1", "type": "function",
            "function": {"name": "f", "arguments": "{}"}}]);
        let body =
            chat_completion_body("chatcmpl-1", 1_000, &routed("", Some(tool_calls)), false);
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert!(body["choices"][0]["message"]["tool_calls"].is_array());
    }

    #[test]
    fn test_chat_completion_body_debug_attaches_attempt_log() {
        let body = chat_completion_body("chatcmpl-1", 1_000, &routed("hello", None), true);
        assert_eq!(body["router"]["model"], "m1");
        assert_eq!(body["router"]["attempts"][0]["outcome"], "success");
    }

    #[test]
    fn test_metadata_header_is_base64_json() {
        let attempts = vec![AttemptRecord {
            model_id: "m1".to_string(),
            outcome: AttemptOutcome::RateLimit,
            score: None,
        }];
        let header = metadata_header("req-1", "m1", &attempts).unwrap();
        let decoded = BASE64_STANDARD.decode(header.to_str().unwrap()).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["attempts"][0]["outcome"], "rate_limit");
    }
}
