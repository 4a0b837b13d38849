//! API request and response models.
//!
//! This module defines the OpenAI-compatible wire structures, the internal
//! flattened message representation, and parsing of the `x-router-*`
//! request headers.

use crate::core::config::str_to_bool;
use crate::core::error::AppError;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversation message with flattened text content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Chat completion request following the OpenAI API format.
///
/// `content` may be a plain string or an array of typed parts; both are
/// collapsed to flat text during normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model identifier (advisory; routing picks the actual back-end)
    #[serde(default)]
    pub model: Option<String>,

    /// Conversation messages
    pub messages: Vec<IncomingMessage>,

    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Nucleus sampling parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Tool schemas, passed through opaquely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,

    /// Tool choice directive, passed through opaquely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

/// Inbound message before content flattening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl IncomingMessage {
    /// Collapse the message into the internal flat-text representation.
    ///
    /// String content passes through; arrays of parts keep their `text`
    /// parts concatenated and discard everything else.
    pub fn normalize(&self) -> Result<ChatMessage, AppError> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| AppError::BadRequest(format!("unknown message role: {}", self.role)))?;
        Ok(ChatMessage::new(role, flatten_content(&self.content)))
    }
}

/// Collapse structured message content to flat text.
pub fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    Value::String(text) => out.push_str(text),
                    Value::Object(obj) => {
                        if obj.get("type").and_then(|t| t.as_str()) == Some("text") {
                            if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                                out.push_str(text);
                            }
                        }
                    }
                    _ => {}
                }
            }
            out
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Normalize a list of inbound messages, rejecting unknown roles.
pub fn normalize_messages(messages: &[IncomingMessage]) -> Result<Vec<ChatMessage>, AppError> {
    messages.iter().map(|m| m.normalize()).collect()
}

/// Responses API request (`input` is a string or an array of messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: Option<String>,

    pub input: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ResponsesRequest {
    /// Convert the `input` field into the internal message list.
    pub fn normalized_messages(&self) -> Result<Vec<ChatMessage>, AppError> {
        match &self.input {
            Value::String(text) => Ok(vec![ChatMessage::user(text.clone())]),
            Value::Array(items) => {
                let incoming: Vec<IncomingMessage> =
                    serde_json::from_value(Value::Array(items.clone())).map_err(|e| {
                        AppError::BadRequest(format!("invalid input messages: {}", e))
                    })?;
                normalize_messages(&incoming)
            }
            _ => Err(AppError::BadRequest(
                "input must be a string or an array of messages".to_string(),
            )),
        }
    }
}

/// Routing options carried in `x-router-*` request headers.
#[derive(Debug, Clone, Default)]
pub struct RouterHeaderOptions {
    pub task_type: Option<String>,
    pub quality_threshold: Option<f64>,
    pub max_wait_ms: Option<u64>,
    pub allow_degrade: bool,
    pub request_id: Option<String>,
    pub resume: bool,
    pub debug: bool,
    pub admin_token: Option<String>,
}

impl RouterHeaderOptions {
    /// Parse routing options from request headers. Unparseable numeric
    /// values are ignored rather than rejected.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header_str = |name: &str| -> Option<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let quality_threshold = header_str("x-router-quality-threshold")
            .and_then(|v| v.parse::<f64>().ok())
            .map(normalize_threshold);

        let max_wait_ms =
            header_str("x-router-max-wait-ms").and_then(|v| v.parse::<u64>().ok());

        Self {
            task_type: header_str("x-router-task-type"),
            quality_threshold,
            max_wait_ms,
            allow_degrade: header_str("x-router-allow-degrade")
                .map(|v| str_to_bool(&v))
                .unwrap_or(false),
            request_id: header_str("x-router-request-id"),
            resume: header_str("x-router-resume")
                .map(|v| str_to_bool(&v))
                .unwrap_or(false),
            debug: header_str("x-router-debug")
                .map(|v| str_to_bool(&v))
                .unwrap_or(false),
            admin_token: header_str("x-router-admin-token"),
        }
    }
}

/// Normalize a threshold header value: values on the 1-5 scale are divided
/// by 5, then clamped to [0, 1].
pub fn normalize_threshold(value: f64) -> f64 {
    let scaled = if value > 1.0 { value / 5.0 } else { value };
    scaled.clamp(0.0, 1.0)
}

/// Token usage block of a chat completion response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("function"), None);
    }

    #[test]
    fn test_flatten_string_content() {
        assert_eq!(flatten_content(&json!("hello")), "hello");
    }

    #[test]
    fn test_flatten_part_array() {
        let content = json!([
            {"type": "text", "text": "first "},
            {"type": "image_url", "image_url": {"url": "https://example.com/x.png"}},
            {"type": "text", "text": "second"}
        ]);
        assert_eq!(flatten_content(&content), "first second");
    }

    #[test]
    fn test_flatten_null_content() {
        assert_eq!(flatten_content(&Value::Null), "");
    }

    #[test]
    fn test_normalize_rejects_unknown_role() {
        let message = IncomingMessage {
            role: "narrator".to_string(),
            content: json!("hi"),
        };
        assert!(message.normalize().is_err());
    }

    #[test]
    fn test_normalize_messages() {
        let messages = vec![
            IncomingMessage {
                role: "system".to_string(),
                content: json!("be terse"),
            },
            IncomingMessage {
                role: "user".to_string(),
                content: json!([{"type": "text", "text": "hello"}]),
            },
        ];
        let normalized = normalize_messages(&messages).unwrap();
        assert_eq!(normalized[0], ChatMessage::system("be terse"));
        assert_eq!(normalized[1], ChatMessage::user("hello"));
    }

    #[test]
    fn test_responses_input_string() {
        let request = ResponsesRequest {
            model: None,
            input: json!("what is rust?"),
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            stream: None,
        };
        let messages = request.normalized_messages().unwrap();
        assert_eq!(messages, vec![ChatMessage::user("what is rust?")]);
    }

    #[test]
    fn test_responses_input_message_array() {
        let request = ResponsesRequest {
            model: None,
            input: json!([
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "hi"}
            ]),
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            stream: None,
        };
        let messages = request.normalized_messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn test_responses_input_number_rejected() {
        let request = ResponsesRequest {
            model: None,
            input: json!(42),
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            stream: None,
        };
        assert!(request.normalized_messages().is_err());
    }

    #[test]
    fn test_normalize_threshold_scales() {
        assert!((normalize_threshold(0.75) - 0.75).abs() < f64::EPSILON);
        assert!((normalize_threshold(4.0) - 0.8).abs() < f64::EPSILON);
        assert!((normalize_threshold(5.0) - 1.0).abs() < f64::EPSILON);
        assert!((normalize_threshold(-0.5) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_header_options_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-router-task-type", "code".parse().unwrap());
        headers.insert("x-router-quality-threshold", "4".parse().unwrap());
        headers.insert("x-router-max-wait-ms", "2500".parse().unwrap());
        headers.insert("x-router-allow-degrade", "true".parse().unwrap());
        headers.insert("x-router-request-id", "req-9".parse().unwrap());
        headers.insert("x-router-resume", "1".parse().unwrap());
        headers.insert("x-router-debug", "yes".parse().unwrap());

        let options = RouterHeaderOptions::from_headers(&headers);
        assert_eq!(options.task_type.as_deref(), Some("code"));
        assert!((options.quality_threshold.unwrap() - 0.8).abs() < f64::EPSILON);
        assert_eq!(options.max_wait_ms, Some(2500));
        assert!(options.allow_degrade);
        assert_eq!(options.request_id.as_deref(), Some("req-9"));
        assert!(options.resume);
        assert!(options.debug);
    }

    #[test]
    fn test_header_options_defaults() {
        let headers = HeaderMap::new();
        let options = RouterHeaderOptions::from_headers(&headers);
        assert!(options.task_type.is_none());
        assert!(options.quality_threshold.is_none());
        assert!(!options.allow_degrade);
        assert!(!options.resume);
        assert!(!options.debug);
    }

    #[test]
    fn test_header_options_ignore_invalid_numbers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-router-quality-threshold", "high".parse().unwrap());
        headers.insert("x-router-max-wait-ms", "soon".parse().unwrap());

        let options = RouterHeaderOptions::from_headers(&headers);
        assert!(options.quality_threshold.is_none());
        assert!(options.max_wait_ms.is_none());
    }

    #[test]
    fn test_chat_completion_request_deserialization() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hello"}],
            "temperature": 0.7,
            "stream": true
        });
        let request: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.model.as_deref(), Some("gpt-4"));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.stream, Some(true));
        assert!(request.tools.is_none());
    }
}
