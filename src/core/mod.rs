//! Core functionality: configuration, errors, metrics, state stores, and
//! middleware.

pub mod budget_store;
pub mod config;
pub mod database;
pub mod error;
pub mod health_store;
pub mod metrics;
pub mod middleware;
pub mod session_store;
pub mod utils;

pub use budget_store::{BudgetStore, ProviderBudget};
pub use config::{
    ModelSpec, ProviderEndpointConfig, RouterConfig, RoutingPolicy, RuntimeConfig, ServerConfig,
    StreamingConfig,
};
pub use database::Database;
pub use error::{AppError, Result};
pub use health_store::{HealthStore, ModelHealth};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware};
pub use session_store::{AttemptOutcome, AttemptRecord, RequestSession, SessionStatus, SessionStore};
pub use utils::{epoch_ms, estimate_tokens};
