//! Request sessions: the attempt log and at-most-one persisted response.
//!
//! One row per request id in the `request_sessions` table. A session is
//! created `pending` on the first recorded attempt and transitions to
//! `complete` exactly once; there is no rollback. Completed sessions back
//! the idempotent resume path.

use crate::core::database::Database;
use crate::core::utils::epoch_ms;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;

/// Outcome of a single model attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    EvalFail,
    RateLimit,
    Transient,
    Quota,
    Permanent,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::EvalFail => "eval_fail",
            AttemptOutcome::RateLimit => "rate_limit",
            AttemptOutcome::Transient => "transient",
            AttemptOutcome::Quota => "quota",
            AttemptOutcome::Permanent => "permanent",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a session's attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub model_id: String,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Complete,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Complete => "complete",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "complete" => SessionStatus::Complete,
            _ => SessionStatus::Pending,
        }
    }
}

/// A persisted request session.
#[derive(Debug, Clone)]
pub struct RequestSession {
    pub request_id: String,
    pub task_type: String,
    pub status: SessionStatus,
    pub model_id: Option<String>,
    pub response_text: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    request_id: String,
    task_type: String,
    status: String,
    model_id: Option<String>,
    response_text: Option<String>,
    attempts: String,
    created_at: i64,
    updated_at: i64,
}

impl SessionRow {
    fn into_session(self) -> RequestSession {
        let attempts = serde_json::from_str(&self.attempts).unwrap_or_default();
        RequestSession {
            request_id: self.request_id,
            task_type: self.task_type,
            status: SessionStatus::parse(&self.status),
            model_id: self.model_id,
            response_text: self.response_text,
            attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Store for request sessions.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Look up a session by request id.
    pub async fn get(&self, request_id: &str) -> Result<Option<RequestSession>, sqlx::Error> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"SELECT request_id, task_type, status, model_id, response_text,
                      attempts, created_at, updated_at
               FROM request_sessions WHERE request_id = ?1"#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SessionRow::into_session))
    }

    /// Append an attempt to the session's log, creating a pending session if
    /// none exists yet.
    pub async fn record_attempt(
        &self,
        request_id: &str,
        task_type: &str,
        attempt: AttemptRecord,
    ) -> Result<(), sqlx::Error> {
        let now = epoch_ms();

        match self.get(request_id).await? {
            Some(mut session) => {
                session.attempts.push(attempt);
                let attempts_json = serde_json::to_string(&session.attempts)
                    .unwrap_or_else(|_| "[]".to_string());

                sqlx::query(
                    r#"UPDATE request_sessions
                       SET attempts = ?2, updated_at = ?3
                       WHERE request_id = ?1"#,
                )
                .bind(request_id)
                .bind(attempts_json)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            None => {
                let attempts_json =
                    serde_json::to_string(&vec![attempt]).unwrap_or_else(|_| "[]".to_string());

                sqlx::query(
                    r#"INSERT INTO request_sessions
                       (request_id, task_type, status, attempts, created_at, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?5)"#,
                )
                .bind(request_id)
                .bind(task_type)
                .bind(SessionStatus::Pending.as_str())
                .bind(attempts_json)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Transition the session to `complete` and store the final response.
    pub async fn record_result(
        &self,
        request_id: &str,
        task_type: &str,
        model_id: &str,
        text: &str,
    ) -> Result<(), sqlx::Error> {
        let now = epoch_ms();

        sqlx::query(
            r#"INSERT INTO request_sessions
               (request_id, task_type, status, model_id, response_text, attempts, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?6)
               ON CONFLICT(request_id) DO UPDATE SET
                   status = excluded.status,
                   model_id = excluded.model_id,
                   response_text = excluded.response_text,
                   updated_at = excluded.updated_at"#,
        )
        .bind(request_id)
        .bind(task_type)
        .bind(SessionStatus::Complete.as_str())
        .bind(model_id)
        .bind(text)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
