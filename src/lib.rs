//! LLM Routing Gateway - a quality-gated router for OpenAI-compatible back-ends
//!
//! This library provides an OpenAI-compatible HTTP gateway that routes each
//! chat-completion request across a fleet of heterogeneous LLM back-ends:
//!
//! - **Quality gating**: every candidate output is scored and only answers
//!   clearing the configured threshold are returned
//! - **Retry/wait loop**: rate-limited or low-quality models are retried and
//!   re-filtered each cycle until the per-request wall-clock budget runs out
//! - **Health & budget tracking**: per-model cooldowns, degradation, rolling
//!   EMAs, and per-provider token budgets in an embedded SQLite state file
//! - **Streaming Support**: buffered chunked SSE with quality gating, or
//!   real-time passthrough with post-hoc evaluation
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, errors, metrics, state stores)
//! - [`services`]: Business logic (router engine, evaluator, provider adapter)
//! - [`api`]: HTTP handlers and request/response models
//!
//! # Example
//!
//! ```no_run
//! use llm_router_rust::{
//!     api::{build_router, AppState},
//!     core::{Database, RouterConfig, RuntimeConfig, ServerConfig},
//!     services::HttpProviderAdapter,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RouterConfig::load("config.yaml")?;
//!     let server = ServerConfig::from_env()?;
//!     let db = Database::connect(&server.state_db_path).await?;
//!     let adapter = Arc::new(HttpProviderAdapter::new(
//!         reqwest::Client::new(),
//!         &config.providers,
//!     ));
//!     let state = Arc::new(AppState::new(
//!         RuntimeConfig::new(config),
//!         server,
//!         adapter,
//!         &db,
//!     ));
//!     let app = build_router(state);
//!     // Bind and serve...
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState};
pub use core::{AppError, Database, Result, RouterConfig, RuntimeConfig, ServerConfig};
pub use services::{RouterEngine, RouterRequest};
