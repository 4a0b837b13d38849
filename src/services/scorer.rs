//! Candidate scoring.
//!
//! Each eligible model gets a weighted score combining task capability,
//! rolling reliability, cost, latency, and penalties for degradation and
//! near-exhausted provider budgets. Candidates are attempted in descending
//! score order.

use crate::core::budget_store::ProviderBudget;
use crate::core::config::{ModelSpec, ScoreWeightOverrides};
use crate::core::health_store::ModelHealth;
use crate::services::task_type::TaskType;

/// Latency is capped at this many seconds before weighting, so one slow
/// observation cannot dominate the score.
const LATENCY_CAP_SECS: f64 = 5.0;

/// Effective scorer weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreWeights {
    pub capability: f64,
    pub reliability: f64,
    pub cost: f64,
    pub latency: f64,
    pub degrade: f64,
    pub budget: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capability: 1.0,
            reliability: 0.5,
            cost: 0.5,
            latency: 0.2,
            degrade: 1.5,
            budget: 1.0,
        }
    }
}

impl ScoreWeights {
    /// Defaults with per-policy overrides merged on top.
    pub fn with_overrides(overrides: &ScoreWeightOverrides) -> Self {
        let defaults = Self::default();
        Self {
            capability: overrides.capability.unwrap_or(defaults.capability),
            reliability: overrides.reliability.unwrap_or(defaults.reliability),
            cost: overrides.cost.unwrap_or(defaults.cost),
            latency: overrides.latency.unwrap_or(defaults.latency),
            degrade: overrides.degrade.unwrap_or(defaults.degrade),
            budget: overrides.budget.unwrap_or(defaults.budget),
        }
    }
}

/// Score a candidate model for ordering within a cycle.
pub fn score_model(
    model: &ModelSpec,
    task: TaskType,
    health: &ModelHealth,
    budget: &ProviderBudget,
    weights: &ScoreWeights,
    now_ms: i64,
) -> f64 {
    let capability = model.capability(task.as_str()) as f64;
    let latency_secs = (health.rolling_latency_ms / 1_000.0).min(LATENCY_CAP_SECS);

    let mut score = weights.capability * capability - weights.cost * model.cost_weight
        + weights.reliability * health.rolling_success_rate
        - weights.latency * latency_secs;

    if health.is_degraded(now_ms) {
        score -= weights.degrade;
    }
    if budget.near_soft_limit() {
        score -= weights.budget;
    }

    score
}
