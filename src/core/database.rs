//! Embedded state database for routing state.
//!
//! A single SQLite file (default `data/state.sqlite`, `STATE_DB_PATH`
//! overridable) holds the three routing-state tables: `model_health`,
//! `provider_budget`, and `request_sessions`. The schema is created on
//! connect; there is no external migration step.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

/// Statements executed on every connect; idempotent by construction.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS model_health (
    model_id            TEXT PRIMARY KEY,
    cooldown_until      INTEGER NOT NULL DEFAULT 0,
    degraded_until      INTEGER NOT NULL DEFAULT 0,
    rate_limit_strikes  INTEGER NOT NULL DEFAULT 0,
    last_rate_limit_at  INTEGER NOT NULL DEFAULT 0,
    rolling_latency_ms  REAL NOT NULL DEFAULT 0,
    rolling_success_rate REAL NOT NULL DEFAULT 1.0
);

CREATE TABLE IF NOT EXISTS provider_budget (
    provider            TEXT PRIMARY KEY,
    used_tokens         INTEGER NOT NULL DEFAULT 0,
    soft_limit_tokens   INTEGER,
    hard_limit_tokens   INTEGER
);

CREATE TABLE IF NOT EXISTS request_sessions (
    request_id          TEXT PRIMARY KEY,
    task_type           TEXT NOT NULL,
    status              TEXT NOT NULL,
    model_id            TEXT,
    response_text       TEXT,
    attempts            TEXT NOT NULL DEFAULT '[]',
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
"#;

/// Connection manager for the embedded state database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if necessary) the state database at `path` and ensure
    /// the schema exists.
    pub async fn connect(path: &str) -> Result<Self, sqlx::Error> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    sqlx::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("failed to create state directory: {}", e),
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
