//! LLM Routing Gateway - Main entry point
//!
//! This binary loads the model registry and routing policies, opens the
//! embedded state database, and runs the HTTP server with all configured
//! routes and middleware.

use anyhow::Result;
use chrono::Local;
use llm_router_rust::{
    api::{build_router, AppState},
    core::{init_metrics, Database, RouterConfig, RuntimeConfig, ServerConfig},
    services::HttpProviderAdapter,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

async fn async_main() -> Result<()> {
    // Check if NO_COLOR environment variable is set (for file logging without ANSI codes)
    let no_color = std::env::var("NO_COLOR").is_ok();

    // Always append noise-suppression filters for hyper/h2/reqwest: if
    // RUST_LOG is set to just "info" or "trace" it would otherwise override
    // the defaults and let noisy transport logs through.
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,llm_router_rust=debug".to_string());
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    );
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    if no_color {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
            .init();
    }

    // Initialize metrics
    init_metrics();

    // Server settings from the environment, routing config from YAML
    let server = ServerConfig::from_env()?;
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    tracing::info!("Loading routing configuration from {}", config_path);
    let config = RouterConfig::load(&config_path)?;
    tracing::info!(
        "Configuration loaded: {} models, {} providers, {} policies",
        config.models.len(),
        config.providers.len(),
        config.policies.len()
    );
    log_registry(&config);

    // Open the embedded state database
    tracing::info!("Opening state database at {}", server.state_db_path);
    let db = Database::connect(&server.state_db_path).await?;

    // Seed provider budget limits from configuration, preserving usage
    let state = {
        let http_client = create_http_client(&server);
        let adapter = Arc::new(HttpProviderAdapter::new(http_client, &config.providers));
        let state = AppState::new(RuntimeConfig::new(config.clone()), server.clone(), adapter, &db);
        for provider in &config.providers {
            state
                .budget
                .ensure_limits(
                    &provider.name,
                    provider.soft_limit_tokens,
                    provider.hard_limit_tokens,
                )
                .await?;
        }
        Arc::new(state)
    };

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], server.port));
    tracing::info!("Starting LLM Routing Gateway on {}", addr);
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/responses");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Log the model registry at startup.
fn log_registry(config: &RouterConfig) {
    for model in &config.models {
        tracing::info!(
            "  - {} via {} ({}), context={} cost={} enabled={}",
            model.id,
            model.provider,
            model.backend_model,
            model.context_tokens,
            model.cost_weight,
            model.enabled
        );
    }
}

/// Create HTTP client with connection pooling
fn create_http_client(server: &llm_router_rust::core::ServerConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(server.request_timeout_secs))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .http2_keep_alive_interval(std::time::Duration::from_secs(30))
        .http2_keep_alive_timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("Failed to build HTTP client")
}
