//! Error types and handling for the routing gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps the
//! error sources of the request path and implements proper HTTP response
//! conversion. Response bodies follow the OpenAI error envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors crossing the HTTP boundary are converted to this type for
/// consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Malformed client requests (bad JSON shape, unknown roles, ...)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Authentication/authorization failures
    #[error("Unauthorized")]
    Unauthorized,

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// State database errors
    #[error("State store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The routing deadline elapsed without any model clearing the quality gate
    #[error("No suitable model available")]
    NoSuitableModel { retry_after_ms: u64 },

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NoSuitableModel { retry_after_ms } => {
                let body = Json(json!({
                    "error": {
                        "message": "no model produced an acceptable response within the wait budget",
                        "type": "error",
                        "code": "no_suitable_model_available",
                        "retry_after_ms": retry_after_ms
                    }
                }));
                (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
            }
            other => {
                let (status, error_message) = match other {
                    AppError::Config(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
                    AppError::Unauthorized => {
                        (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
                    }
                    AppError::Serialization(e) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                    }
                    AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
                    AppError::NoSuitableModel { .. } => unreachable!(),
                };

                let body = Json(json!({
                    "error": {
                        "message": error_message,
                        "type": "error",
                        "code": status.as_u16()
                    }
                }));

                (status, body).into_response()
            }
        }
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
