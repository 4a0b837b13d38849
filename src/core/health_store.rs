//! Per-model health tracking: cooldowns, degradation, and rolling EMAs.
//!
//! One row per model id in the `model_health` table. All operations are
//! single UPSERT statements, so they are atomic per model id; concurrent
//! writers against the same model are last-write-wins on the deadline and
//! strike columns, which is acceptable because either observation warrants
//! at least the later cooldown.

use crate::core::database::Database;
use crate::core::utils::epoch_ms;
use sqlx::SqlitePool;

/// Smoothing factor for the success-rate and latency EMAs.
const EMA_ALPHA: f64 = 0.2;

/// Health snapshot for one model.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ModelHealth {
    /// Epoch-ms until which the model is skipped entirely (rate limited)
    pub cooldown_until: i64,

    /// Epoch-ms until which the model is score-penalized (quality quarantine)
    pub degraded_until: i64,

    /// Consecutive rate-limit strikes inside the sliding window
    pub rate_limit_strikes: i64,

    /// Epoch-ms of the most recent rate-limit event
    pub last_rate_limit_at: i64,

    /// Exponential moving average of observed latency in milliseconds
    pub rolling_latency_ms: f64,

    /// Exponential moving average of call success, 0.0-1.0
    pub rolling_success_rate: f64,
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self {
            cooldown_until: 0,
            degraded_until: 0,
            rate_limit_strikes: 0,
            last_rate_limit_at: 0,
            rolling_latency_ms: 0.0,
            // A model nobody has observed yet is assumed reliable.
            rolling_success_rate: 1.0,
        }
    }
}

impl ModelHealth {
    /// Whether the model is inside a rate-limit cooldown at `now_ms`.
    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until > now_ms
    }

    /// Whether the model is inside a quality quarantine at `now_ms`.
    pub fn is_degraded(&self, now_ms: i64) -> bool {
        self.degraded_until > now_ms
    }
}

/// Store for per-model health state.
#[derive(Clone)]
pub struct HealthStore {
    pool: SqlitePool,
}

impl HealthStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Health for a model, default-initialized when the model has never been
    /// observed.
    pub async fn get(&self, model_id: &str) -> Result<ModelHealth, sqlx::Error> {
        let row = sqlx::query_as::<_, ModelHealth>(
            r#"SELECT cooldown_until, degraded_until, rate_limit_strikes,
                      last_rate_limit_at, rolling_latency_ms, rolling_success_rate
               FROM model_health WHERE model_id = ?1"#,
        )
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.unwrap_or_default())
    }

    /// Put the model into cooldown for `cooldown_ms` and overwrite the strike
    /// counters. Other health fields are preserved.
    pub async fn mark_rate_limited(
        &self,
        model_id: &str,
        cooldown_ms: u64,
        strikes: u32,
        last_rate_limit_at: i64,
    ) -> Result<(), sqlx::Error> {
        let cooldown_until = epoch_ms() + cooldown_ms as i64;

        sqlx::query(
            r#"INSERT INTO model_health (model_id, cooldown_until, rate_limit_strikes, last_rate_limit_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(model_id) DO UPDATE SET
                   cooldown_until = excluded.cooldown_until,
                   rate_limit_strikes = excluded.rate_limit_strikes,
                   last_rate_limit_at = excluded.last_rate_limit_at"#,
        )
        .bind(model_id)
        .bind(cooldown_until)
        .bind(strikes as i64)
        .bind(last_rate_limit_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Put the model into quality quarantine for `degrade_ms`. The cooldown
    /// deadline is preserved.
    pub async fn mark_degraded(&self, model_id: &str, degrade_ms: u64) -> Result<(), sqlx::Error> {
        let degraded_until = epoch_ms() + degrade_ms as i64;

        sqlx::query(
            r#"INSERT INTO model_health (model_id, degraded_until)
               VALUES (?1, ?2)
               ON CONFLICT(model_id) DO UPDATE SET
                   degraded_until = excluded.degraded_until"#,
        )
        .bind(model_id)
        .bind(degraded_until)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fold an observation into the rolling EMAs.
    ///
    /// `new = old * 0.8 + observed * 0.2`. A `None` latency leaves the
    /// latency EMA unchanged; missing priors default to success-rate 1.0 and
    /// latency 0.
    pub async fn record_result(
        &self,
        model_id: &str,
        success: bool,
        latency_ms: Option<f64>,
    ) -> Result<(), sqlx::Error> {
        let success_obs = if success { 1.0_f64 } else { 0.0_f64 };
        let latency_obs = latency_ms.unwrap_or(0.0);
        let has_latency = latency_ms.is_some();

        // Insert values are the EMA applied to the column defaults, so a
        // fresh row and an upserted row follow the same recurrence.
        let initial_success = 1.0 * (1.0 - EMA_ALPHA) + success_obs * EMA_ALPHA;
        let initial_latency = if has_latency {
            latency_obs * EMA_ALPHA
        } else {
            0.0
        };

        sqlx::query(
            r#"INSERT INTO model_health (model_id, rolling_latency_ms, rolling_success_rate)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(model_id) DO UPDATE SET
                   rolling_success_rate = rolling_success_rate * 0.8 + ?4 * 0.2,
                   rolling_latency_ms = CASE WHEN ?5
                       THEN rolling_latency_ms * 0.8 + ?6 * 0.2
                       ELSE rolling_latency_ms END"#,
        )
        .bind(model_id)
        .bind(initial_latency)
        .bind(initial_success)
        .bind(success_obs)
        .bind(has_latency)
        .bind(latency_obs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (HealthStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        let db = Database::connect(path.to_str().unwrap()).await.unwrap();
        (HealthStore::new(&db), dir)
    }

    #[tokio::test]
    async fn test_get_returns_default_for_unknown_model() {
        let (store, _dir) = temp_store().await;
        let health = store.get("never-seen").await.unwrap();

        assert_eq!(health.cooldown_until, 0);
        assert_eq!(health.degraded_until, 0);
        assert_eq!(health.rate_limit_strikes, 0);
        assert!((health.rolling_success_rate - 1.0).abs() < f64::EPSILON);
        assert!((health.rolling_latency_ms - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_mark_rate_limited_sets_cooldown_and_strikes() {
        let (store, _dir) = temp_store().await;
        let before = epoch_ms();

        store.mark_rate_limited("m1", 10_000, 3, before).await.unwrap();

        let health = store.get("m1").await.unwrap();
        assert!(health.cooldown_until >= before + 10_000);
        assert_eq!(health.rate_limit_strikes, 3);
        assert_eq!(health.last_rate_limit_at, before);
        assert!(health.in_cooldown(before + 5_000));
        assert!(!health.in_cooldown(health.cooldown_until + 1));
    }

    #[tokio::test]
    async fn test_mark_rate_limited_preserves_other_fields() {
        let (store, _dir) = temp_store().await;

        store.record_result("m1", false, Some(100.0)).await.unwrap();
        let ema_before = store.get("m1").await.unwrap();

        store.mark_rate_limited("m1", 5_000, 1, epoch_ms()).await.unwrap();
        let after = store.get("m1").await.unwrap();

        assert!((after.rolling_success_rate - ema_before.rolling_success_rate).abs() < 1e-9);
        assert!((after.rolling_latency_ms - ema_before.rolling_latency_ms).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mark_degraded_preserves_cooldown() {
        let (store, _dir) = temp_store().await;

        store.mark_rate_limited("m1", 30_000, 1, epoch_ms()).await.unwrap();
        let cooldown_before = store.get("m1").await.unwrap().cooldown_until;

        store.mark_degraded("m1", 30_000).await.unwrap();

        let health = store.get("m1").await.unwrap();
        assert_eq!(health.cooldown_until, cooldown_before);
        assert!(health.is_degraded(epoch_ms()));
    }

    #[tokio::test]
    async fn test_record_result_ema_from_defaults() {
        let (store, _dir) = temp_store().await;

        // Prior success defaults to 1.0: 1.0*0.8 + 0.0*0.2 = 0.8
        store.record_result("m1", false, Some(500.0)).await.unwrap();
        let health = store.get("m1").await.unwrap();
        assert!((health.rolling_success_rate - 0.8).abs() < 1e-9);
        // Prior latency defaults to 0: 0*0.8 + 500*0.2 = 100
        assert!((health.rolling_latency_ms - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_record_result_ema_sequence() {
        let (store, _dir) = temp_store().await;

        store.record_result("m1", true, Some(100.0)).await.unwrap();
        store.record_result("m1", false, Some(300.0)).await.unwrap();

        let health = store.get("m1").await.unwrap();
        // success: 1.0 -> 1.0 -> 0.8
        assert!((health.rolling_success_rate - 0.8).abs() < 1e-9);
        // latency: 0 -> 20 -> 20*0.8 + 300*0.2 = 76
        assert!((health.rolling_latency_ms - 76.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_record_result_without_latency_keeps_latency_ema() {
        let (store, _dir) = temp_store().await;

        store.record_result("m1", true, Some(200.0)).await.unwrap();
        let latency_before = store.get("m1").await.unwrap().rolling_latency_ms;

        store.record_result("m1", false, None).await.unwrap();

        let health = store.get("m1").await.unwrap();
        assert!((health.rolling_latency_ms - latency_before).abs() < 1e-9);
        // Success EMA still moved.
        assert!(health.rolling_success_rate < 1.0);
    }

    #[tokio::test]
    async fn test_success_rate_stays_in_unit_interval() {
        let (store, _dir) = temp_store().await;

        for _ in 0..20 {
            store.record_result("m1", false, None).await.unwrap();
        }
        let health = store.get("m1").await.unwrap();
        assert!(health.rolling_success_rate >= 0.0);
        assert!(health.rolling_success_rate <= 1.0);

        for _ in 0..20 {
            store.record_result("m1", true, None).await.unwrap();
        }
        let health = store.get("m1").await.unwrap();
        assert!(health.rolling_success_rate <= 1.0);
        assert!(health.rolling_success_rate > 0.9);
    }

    #[tokio::test]
    async fn test_models_are_independent() {
        let (store, _dir) = temp_store().await;

        store.mark_rate_limited("m1", 60_000, 2, epoch_ms()).await.unwrap();
        let other = store.get("m2").await.unwrap();
        assert_eq!(other.cooldown_until, 0);
        assert_eq!(other.rate_limit_strikes, 0);
    }
}
