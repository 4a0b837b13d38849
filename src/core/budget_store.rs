//! Per-provider token accounting with soft and hard limits.
//!
//! One row per provider tag in the `provider_budget` table. Usage only ever
//! grows; an external operator may zero it directly in the database.

use crate::core::database::Database;
use sqlx::SqlitePool;

/// Budget snapshot for one provider.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct ProviderBudget {
    /// Cumulative tokens consumed across all models of this provider
    pub used_tokens: i64,

    /// Soft limit; models are score-penalized from 90% of this value
    pub soft_limit_tokens: Option<i64>,

    /// Hard limit; models are excluded once usage reaches this value
    pub hard_limit_tokens: Option<i64>,
}

impl ProviderBudget {
    /// Whether the provider has exhausted its hard budget.
    pub fn at_hard_limit(&self) -> bool {
        matches!(self.hard_limit_tokens, Some(hard) if self.used_tokens >= hard)
    }

    /// Whether usage is at or beyond 90% of the soft limit.
    pub fn near_soft_limit(&self) -> bool {
        matches!(self.soft_limit_tokens, Some(soft) if self.used_tokens as f64 >= 0.9 * soft as f64)
    }
}

/// Store for per-provider budgets.
#[derive(Clone)]
pub struct BudgetStore {
    pool: SqlitePool,
}

impl BudgetStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Budget for a provider, zeroed when no usage has been recorded.
    pub async fn get(&self, provider: &str) -> Result<ProviderBudget, sqlx::Error> {
        let row = sqlx::query_as::<_, ProviderBudget>(
            r#"SELECT used_tokens, soft_limit_tokens, hard_limit_tokens
               FROM provider_budget WHERE provider = ?1"#,
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.unwrap_or_default())
    }

    /// Add `tokens` to the provider's cumulative usage.
    pub async fn record(&self, provider: &str, tokens: u64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO provider_budget (provider, used_tokens)
               VALUES (?1, ?2)
               ON CONFLICT(provider) DO UPDATE SET
                   used_tokens = used_tokens + excluded.used_tokens"#,
        )
        .bind(provider)
        .bind(tokens as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite the provider's limits, preserving accumulated usage.
    pub async fn ensure_limits(
        &self,
        provider: &str,
        soft: Option<u64>,
        hard: Option<u64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO provider_budget (provider, used_tokens, soft_limit_tokens, hard_limit_tokens)
               VALUES (?1, 0, ?2, ?3)
               ON CONFLICT(provider) DO UPDATE SET
                   soft_limit_tokens = excluded.soft_limit_tokens,
                   hard_limit_tokens = excluded.hard_limit_tokens"#,
        )
        .bind(provider)
        .bind(soft.map(|v| v as i64))
        .bind(hard.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
