//! The routing engine.
//!
//! One routing task runs per incoming request: filter the registry against
//! policy, cooldowns, and budgets; score and order the survivors; attempt
//! them in order through the provider adapter; evaluate each output against
//! the quality gate; and keep cycling (with a poll-interval sleep between
//! cycles) until something clears the bar or the wall-clock budget runs
//! out. Clients never observe individual back-end failures, only the final
//! response or a bounded timeout.

use crate::api::models::{ChatMessage, Role, Usage};
use crate::core::budget_store::BudgetStore;
use crate::core::config::{ModelSpec, RouterConfig, RoutingPolicy};
use crate::core::error::AppError;
use crate::core::health_store::{HealthStore, ModelHealth};
use crate::core::metrics::get_metrics;
use crate::core::session_store::{AttemptOutcome, AttemptRecord, SessionStatus, SessionStore};
use crate::core::utils::{epoch_ms, estimate_tokens};
use crate::services::context;
use crate::services::evaluator;
use crate::services::provider::{
    DeltaStream, GenerationRequest, NormalizedResponse, ProviderAdapter, ProviderError,
};
use crate::services::scorer::{score_model, ScoreWeights};
use crate::services::task_type::{resolve_task_type, TaskType};
use futures::StreamExt;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// First rate-limit cooldown when the upstream gives no Retry-After.
const RATE_LIMIT_BASE_COOLDOWN_MS: u64 = 2_000;

/// Upper bound on the exponential rate-limit cooldown.
const RATE_LIMIT_COOLDOWN_CAP_MS: u64 = 60_000;

/// Strikes accumulate while rate limits recur inside this window.
const STRIKE_WINDOW_MS: i64 = 60_000;

/// Strike growth is capped so sustained rate limiting cannot overflow the
/// backoff computation.
const MAX_STRIKES: u32 = 6;

/// Quarantine applied when a model rejects the request for context length.
const CONTEXT_OVERFLOW_DEGRADE_MS: u64 = 60_000;

/// Retry hint returned with the timeout error.
const NO_MODEL_RETRY_AFTER_MS: u64 = 10_000;

/// Output reservation used for context fitting when the request does not
/// set max_tokens.
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1_024;

/// A fully normalized routing request.
#[derive(Debug, Clone)]
pub struct RouterRequest {
    pub messages: Vec<ChatMessage>,
    /// Task type as declared by the caller; values outside the known set
    /// fall back to inference.
    pub task_type: Option<String>,
    pub quality_threshold: Option<f64>,
    pub max_wait_ms: Option<u64>,
    pub attempt_budget: Option<usize>,
    pub request_id: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub allow_degrade: bool,
    pub resume: bool,
    pub tools: Option<Value>,
    pub tool_choice: Option<Value>,
}

impl RouterRequest {
    /// A request with everything defaulted except messages and id.
    pub fn new(request_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            task_type: None,
            quality_threshold: None,
            max_wait_ms: None,
            attempt_budget: None,
            request_id: request_id.into(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            allow_degrade: false,
            resume: false,
            tools: None,
            tool_choice: None,
        }
    }
}

/// An accepted (or resumed) response.
#[derive(Debug)]
pub struct RoutedResponse {
    pub text: String,
    pub tool_calls: Option<Value>,
    pub model_id: String,
    pub task: TaskType,
    pub attempts: Vec<AttemptRecord>,
    pub eval_score: Option<f64>,
    pub usage: Option<Usage>,
    pub resumed: bool,
}

/// A live provider stream handed back for passthrough delivery.
///
/// Evaluation and accounting run inside the stream once the final delta
/// has been produced.
pub struct RoutedStream {
    pub model_id: String,
    pub task: TaskType,
    pub attempts: Vec<AttemptRecord>,
    pub deltas: DeltaStream,
}

/// What the engine hands back to the HTTP layer.
pub enum RouteOutcome {
    Completed(RoutedResponse),
    Streaming(RoutedStream),
}

impl std::fmt::Debug for RouteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteOutcome::Completed(resp) => f.debug_tuple("Completed").field(resp).finish(),
            RouteOutcome::Streaming(_) => f.debug_tuple("Streaming").field(&"<stream>").finish(),
        }
    }
}

struct Candidate {
    model: ModelSpec,
    score: f64,
}

/// Compute the next strike count and cooldown for a rate-limited model.
///
/// Strikes increment while the previous rate limit was inside the sliding
/// window, reset to 1 otherwise, and never exceed [`MAX_STRIKES`]. The
/// upstream Retry-After hint overrides the exponential backoff.
fn rate_limit_backoff(
    prior: &ModelHealth,
    retry_after_ms: Option<u64>,
    now_ms: i64,
) -> (u32, u64) {
    let strikes = if prior.last_rate_limit_at > 0
        && now_ms - prior.last_rate_limit_at <= STRIKE_WINDOW_MS
    {
        ((prior.rate_limit_strikes as u32) + 1).min(MAX_STRIKES)
    } else {
        1
    };

    let cooldown_ms = retry_after_ms.unwrap_or_else(|| {
        RATE_LIMIT_BASE_COOLDOWN_MS
            .saturating_mul(1u64 << (strikes - 1))
            .min(RATE_LIMIT_COOLDOWN_CAP_MS)
    });

    (strikes, cooldown_ms)
}

/// The routing engine. One instance is built per request from the config
/// snapshot taken at request arrival.
pub struct RouterEngine {
    config: Arc<RouterConfig>,
    adapter: Arc<dyn ProviderAdapter>,
    health: HealthStore,
    budget: BudgetStore,
    sessions: SessionStore,
}

impl RouterEngine {
    pub fn new(
        config: Arc<RouterConfig>,
        adapter: Arc<dyn ProviderAdapter>,
        health: HealthStore,
        budget: BudgetStore,
        sessions: SessionStore,
    ) -> Self {
        Self {
            config,
            adapter,
            health,
            budget,
            sessions,
        }
    }

    /// Route a request to completion.
    ///
    /// Returns the accepted response, a passthrough stream, or
    /// [`AppError::NoSuitableModel`] once the wall-clock budget is spent.
    pub async fn route(&self, request: RouterRequest) -> Result<RouteOutcome, AppError> {
        let task = resolve_task_type(request.task_type.as_deref(), &request.messages);
        let policy = self.config.policy_for(task.as_str());
        let threshold = request
            .quality_threshold
            .unwrap_or(policy.quality_threshold);
        let max_wait_ms = request.max_wait_ms.unwrap_or(policy.max_wait_ms);
        let attempt_budget = request
            .attempt_budget
            .unwrap_or(policy.max_attempts_per_cycle)
            .max(1);

        if request.resume {
            if let Some(response) = self.resumed_response(&request, task).await? {
                return Ok(RouteOutcome::Completed(response));
            }
        }

        let started = Instant::now();
        let deadline = started + Duration::from_millis(max_wait_ms);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut cycle = 0u32;

        while Instant::now() < deadline {
            cycle += 1;
            let candidates = self.collect_candidates(task, &policy).await?;
            tracing::debug!(
                request_id = %request.request_id,
                task = %task,
                cycle,
                candidates = candidates.len(),
                "Routing cycle"
            );

            for candidate in candidates.into_iter().take(attempt_budget) {
                if let Some(outcome) = self
                    .try_candidate(
                        &request,
                        task,
                        &policy,
                        threshold,
                        candidate,
                        started,
                        &mut attempts,
                    )
                    .await?
                {
                    return Ok(outcome);
                }
            }

            // Deadline is re-checked after the last attempt of the cycle so
            // a full sleep is never spent on an already-expired request.
            if Instant::now() >= deadline {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let nap = Duration::from_millis(policy.poll_interval_ms).min(remaining);
            tokio::time::sleep(nap).await;
        }

        tracing::warn!(
            request_id = %request.request_id,
            task = %task,
            cycles = cycle,
            attempts = attempts.len(),
            "No model cleared the quality gate within the wait budget"
        );
        Err(AppError::NoSuitableModel {
            retry_after_ms: NO_MODEL_RETRY_AFTER_MS,
        })
    }

    /// Replay a completed session without touching any adapter.
    async fn resumed_response(
        &self,
        request: &RouterRequest,
        task: TaskType,
    ) -> Result<Option<RoutedResponse>, AppError> {
        let Some(session) = self.sessions.get(&request.request_id).await? else {
            return Ok(None);
        };
        if session.status != SessionStatus::Complete {
            return Ok(None);
        }
        let Some(text) = session.response_text else {
            return Ok(None);
        };

        get_metrics()
            .sessions_resumed_total
            .with_label_values(&[task.as_str()])
            .inc();
        tracing::info!(
            request_id = %request.request_id,
            model = %session.model_id.as_deref().unwrap_or("unknown"),
            "Resuming completed session"
        );

        Ok(Some(RoutedResponse {
            text,
            tool_calls: None,
            model_id: session.model_id.unwrap_or_default(),
            task,
            attempts: session.attempts,
            eval_score: None,
            usage: None,
            resumed: true,
        }))
    }

    /// Filter, score, and order the registry for one cycle.
    ///
    /// Health and budget reads fan out concurrently; both stores expose
    /// atomic reads, so a cycle sees a consistent-enough snapshot.
    async fn collect_candidates(
        &self,
        task: TaskType,
        policy: &RoutingPolicy,
    ) -> Result<Vec<Candidate>, AppError> {
        let now = epoch_ms();
        let weights = ScoreWeights::with_overrides(&policy.weights);

        let eligible: Vec<&ModelSpec> = self
            .config
            .models
            .iter()
            .filter(|m| m.enabled)
            .filter(|m| policy.preferred.is_empty() || policy.preferred.contains(&m.id))
            .filter(|m| m.capability(task.as_str()) >= policy.min_capability)
            .collect();

        let reads = eligible.into_iter().map(|model| {
            let weights = &weights;
            async move {
                let health = self.health.get(&model.id).await?;
                if health.in_cooldown(now) {
                    return Ok::<Option<Candidate>, sqlx::Error>(None);
                }
                let budget = self.budget.get(&model.provider).await?;
                if budget.at_hard_limit() {
                    return Ok(None);
                }
                let score = score_model(model, task, &health, &budget, weights, now);
                Ok(Some(Candidate {
                    model: model.clone(),
                    score,
                }))
            }
        });

        let mut candidates: Vec<Candidate> = futures::future::join_all(reads)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();

        let preferred_rank = |id: &str| {
            policy
                .preferred
                .iter()
                .position(|p| p == id)
                .unwrap_or(usize::MAX)
        };
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| preferred_rank(&a.model.id).cmp(&preferred_rank(&b.model.id)))
        });

        Ok(candidates)
    }

    /// Attempt one candidate. Returns `Some(outcome)` when the request is
    /// finished, `None` to continue with the next candidate.
    #[allow(clippy::too_many_arguments)]
    async fn try_candidate(
        &self,
        request: &RouterRequest,
        task: TaskType,
        policy: &RoutingPolicy,
        threshold: f64,
        candidate: Candidate,
        started: Instant,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<Option<RouteOutcome>, AppError> {
        let model = candidate.model;
        let max_output = request.max_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);

        let Some(fitted) = context::fit(&request.messages, model.context_tokens, max_output)
        else {
            tracing::warn!(
                request_id = %request.request_id,
                model = %model.id,
                "Conversation cannot fit the model's context window"
            );
            self.push_attempt(
                request,
                task,
                attempts,
                AttemptRecord {
                    model_id: model.id.clone(),
                    outcome: AttemptOutcome::Permanent,
                    score: None,
                },
            )
            .await?;
            return Ok(None);
        };
        if fitted.trimmed > 0 {
            tracing::debug!(
                request_id = %request.request_id,
                model = %model.id,
                trimmed = fitted.trimmed,
                "Trimmed oldest messages to fit context window"
            );
        }

        let generation = GenerationRequest {
            messages: fitted.messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        };

        // Passthrough streaming: forward deltas immediately, evaluate and
        // account once the stream completes.
        if request.stream && request.allow_degrade {
            match self.adapter.stream(&model, &generation).await {
                Ok(deltas) => {
                    let wrapped = self.wrap_stream_with_accounting(
                        deltas,
                        StreamAccounting {
                            health: self.health.clone(),
                            budget: self.budget.clone(),
                            sessions: self.sessions.clone(),
                            config: self.config.clone(),
                            model: model.clone(),
                            task,
                            threshold,
                            request_id: request.request_id.clone(),
                            input_tokens: input_token_estimate(&generation.messages),
                            started,
                        },
                    );
                    return Ok(Some(RouteOutcome::Streaming(RoutedStream {
                        model_id: model.id,
                        task,
                        attempts: attempts.clone(),
                        deltas: wrapped,
                    })));
                }
                Err(error) => {
                    self.handle_provider_error(request, task, &model, error, attempts)
                        .await?;
                    return Ok(None);
                }
            }
        }

        let attempt_start = Instant::now();
        match self.adapter.generate(&model, &generation).await {
            Ok(response) => {
                let latency_ms = attempt_start.elapsed().as_millis() as f64;
                get_metrics()
                    .provider_latency
                    .with_label_values(&[&model.provider])
                    .observe(latency_ms / 1_000.0);

                self.judge_and_finalize(
                    request, task, policy, threshold, &model, response, latency_ms, started,
                    attempts,
                )
                .await
            }
            Err(error) => {
                self.handle_provider_error(request, task, &model, error, attempts)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Evaluate a generated response, consult the judge for borderline
    /// scores, and either finalize or record the quality failure.
    #[allow(clippy::too_many_arguments)]
    async fn judge_and_finalize(
        &self,
        request: &RouterRequest,
        task: TaskType,
        policy: &RoutingPolicy,
        threshold: f64,
        model: &ModelSpec,
        response: NormalizedResponse,
        latency_ms: f64,
        started: Instant,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<Option<RouteOutcome>, AppError> {
        let has_tool_calls = response.tool_calls.is_some();
        let evaluation = evaluator::evaluate(
            &response.text,
            task.as_str(),
            has_tool_calls,
            self.config.code_eval.as_ref(),
        )
        .await;
        let mut score = evaluation.score;

        let mut accepted = request.allow_degrade || score >= threshold;

        if !accepted {
            if let Some(judge_config) = &self.config.judge {
                let judge_min = judge_config.min_score.unwrap_or(threshold - 0.2);
                if model.id != judge_config.model_id && score >= judge_min {
                    if let Some(judge_model) = self.config.model(&judge_config.model_id) {
                        let question = last_user_content(&request.messages);
                        if let Some(judged) = evaluator::judge_score(
                            self.adapter.as_ref(),
                            judge_model,
                            &question,
                            &response.text,
                        )
                        .await
                        {
                            tracing::debug!(
                                request_id = %request.request_id,
                                model = %model.id,
                                heuristic = score,
                                judged,
                                "Judge re-scored borderline response"
                            );
                            score = judged;
                            accepted = score >= threshold;
                        }
                    }
                }
            }
        }

        get_metrics()
            .eval_score
            .with_label_values(&[&model.id, task.as_str()])
            .observe(score);

        if accepted {
            self.finalize_success(
                request, task, model, &response, score, latency_ms, started, attempts,
            )
            .await?;
            return Ok(Some(RouteOutcome::Completed(RoutedResponse {
                text: response.text,
                tool_calls: response.tool_calls,
                model_id: model.id.clone(),
                task,
                attempts: attempts.clone(),
                eval_score: Some(score),
                usage: response.usage,
                resumed: false,
            })));
        }

        // Quality gate failure: EMA failure, soft quarantine, next candidate.
        tracing::info!(
            request_id = %request.request_id,
            model = %model.id,
            score,
            threshold,
            "Response below quality gate"
        );
        self.health
            .record_result(&model.id, false, Some(latency_ms))
            .await?;
        self.health.mark_degraded(&model.id, policy.degrade_ms).await?;
        get_metrics()
            .model_calls_total
            .with_label_values(&[&model.id, AttemptOutcome::EvalFail.as_str()])
            .inc();
        self.push_attempt(
            request,
            task,
            attempts,
            AttemptRecord {
                model_id: model.id.clone(),
                outcome: AttemptOutcome::EvalFail,
                score: Some(score),
            },
        )
        .await?;

        Ok(None)
    }

    /// Side effects of an accepted response: EMA success, budget tokens,
    /// session completion, metrics.
    #[allow(clippy::too_many_arguments)]
    async fn finalize_success(
        &self,
        request: &RouterRequest,
        task: TaskType,
        model: &ModelSpec,
        response: &NormalizedResponse,
        score: f64,
        latency_ms: f64,
        started: Instant,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<(), AppError> {
        self.health
            .record_result(&model.id, true, Some(latency_ms))
            .await?;

        let tokens = match &response.usage {
            Some(usage) if usage.total_tokens > 0 => usage.total_tokens as u64,
            _ => input_token_estimate(&request.messages) + estimate_tokens(&response.text),
        };
        self.budget.record(&model.provider, tokens).await?;

        self.push_attempt(
            request,
            task,
            attempts,
            AttemptRecord {
                model_id: model.id.clone(),
                outcome: AttemptOutcome::Success,
                score: Some(score),
            },
        )
        .await?;
        self.sessions
            .record_result(&request.request_id, task.as_str(), &model.id, &response.text)
            .await?;

        let metrics = get_metrics();
        metrics
            .model_calls_total
            .with_label_values(&[&model.id, AttemptOutcome::Success.as_str()])
            .inc();
        metrics
            .wait_time_ms
            .with_label_values(&[task.as_str()])
            .observe(started.elapsed().as_millis() as f64);

        tracing::info!(
            request_id = %request.request_id,
            model = %model.id,
            score,
            tokens,
            "Request routed successfully"
        );
        Ok(())
    }

    /// Dispatch a normalized provider error: cooldowns for rate limits,
    /// quarantine for context overflows, EMA failure for everything.
    async fn handle_provider_error(
        &self,
        request: &RouterRequest,
        task: TaskType,
        model: &ModelSpec,
        error: ProviderError,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<(), AppError> {
        let outcome = match error {
            ProviderError::RateLimit { retry_after_ms } => {
                let now = epoch_ms();
                let prior = self.health.get(&model.id).await?;
                let (strikes, cooldown_ms) = rate_limit_backoff(&prior, retry_after_ms, now);

                self.health
                    .mark_rate_limited(&model.id, cooldown_ms, strikes, now)
                    .await?;
                get_metrics()
                    .rate_limits_total
                    .with_label_values(&[&model.id])
                    .inc();
                tracing::warn!(
                    request_id = %request.request_id,
                    model = %model.id,
                    strikes,
                    cooldown_ms,
                    "Model rate limited, cooling down"
                );
                AttemptOutcome::RateLimit
            }
            ProviderError::QuotaExceeded => {
                tracing::warn!(
                    request_id = %request.request_id,
                    model = %model.id,
                    "Provider quota exceeded"
                );
                AttemptOutcome::Quota
            }
            ProviderError::Transient(message) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    model = %model.id,
                    error = %message,
                    "Transient provider failure"
                );
                AttemptOutcome::Transient
            }
            ProviderError::Permanent {
                message,
                context_length,
            } => {
                if context_length {
                    // Context overflows will not self-resolve; quarantine
                    // longer than a quality failure.
                    self.health
                        .mark_degraded(&model.id, CONTEXT_OVERFLOW_DEGRADE_MS)
                        .await?;
                }
                tracing::warn!(
                    request_id = %request.request_id,
                    model = %model.id,
                    context_length,
                    error = %message,
                    "Permanent provider failure"
                );
                AttemptOutcome::Permanent
            }
        };

        self.health.record_result(&model.id, false, None).await?;
        get_metrics()
            .model_calls_total
            .with_label_values(&[&model.id, outcome.as_str()])
            .inc();
        self.push_attempt(
            request,
            task,
            attempts,
            AttemptRecord {
                model_id: model.id.clone(),
                outcome,
                score: None,
            },
        )
        .await?;
        Ok(())
    }

    /// Append an attempt to both the in-memory log and the session store.
    async fn push_attempt(
        &self,
        request: &RouterRequest,
        task: TaskType,
        attempts: &mut Vec<AttemptRecord>,
        attempt: AttemptRecord,
    ) -> Result<(), AppError> {
        self.sessions
            .record_attempt(&request.request_id, task.as_str(), attempt.clone())
            .await?;
        attempts.push(attempt);
        Ok(())
    }

    /// Wrap a provider delta stream so evaluation and accounting run after
    /// the final delta.
    fn wrap_stream_with_accounting(
        &self,
        deltas: DeltaStream,
        accounting: StreamAccounting,
    ) -> DeltaStream {
        struct State {
            inner: DeltaStream,
            accounting: Option<StreamAccounting>,
            collected: String,
        }

        let state = State {
            inner: deltas,
            accounting: Some(accounting),
            collected: String::new(),
        };

        Box::pin(futures::stream::unfold(state, |mut state| async move {
            match state.inner.next().await {
                Some(Ok(delta)) => {
                    state.collected.push_str(&delta);
                    Some((Ok(delta), state))
                }
                Some(Err(error)) => {
                    if let Some(accounting) = state.accounting.take() {
                        finalize_stream_error(accounting).await;
                    }
                    Some((Err(error), state))
                }
                None => {
                    if let Some(accounting) = state.accounting.take() {
                        let text = std::mem::take(&mut state.collected);
                        finalize_stream_success(accounting, text).await;
                    }
                    None
                }
            }
        }))
    }
}

/// Per-stream context for post-hoc accounting.
struct StreamAccounting {
    health: HealthStore,
    budget: BudgetStore,
    sessions: SessionStore,
    config: Arc<RouterConfig>,
    model: ModelSpec,
    task: TaskType,
    threshold: f64,
    request_id: String,
    input_tokens: u64,
    started: Instant,
}

/// Accounting for a passthrough stream that ran to completion. The client
/// has already received the text; evaluation feeds health, budget, session,
/// and metrics only.
async fn finalize_stream_success(accounting: StreamAccounting, text: String) {
    let latency_ms = accounting.started.elapsed().as_millis() as f64;
    let evaluation = evaluator::evaluate(
        &text,
        accounting.task.as_str(),
        false,
        accounting.config.code_eval.as_ref(),
    )
    .await;
    let met_threshold = evaluation.score >= accounting.threshold;

    if let Err(e) = accounting
        .health
        .record_result(&accounting.model.id, met_threshold, Some(latency_ms))
        .await
    {
        tracing::error!(error = %e, "Failed to record stream health result");
    }

    let tokens = accounting.input_tokens + estimate_tokens(&text);
    if let Err(e) = accounting
        .budget
        .record(&accounting.model.provider, tokens)
        .await
    {
        tracing::error!(error = %e, "Failed to record stream budget usage");
    }

    let attempt = AttemptRecord {
        model_id: accounting.model.id.clone(),
        outcome: AttemptOutcome::Success,
        score: Some(evaluation.score),
    };
    if let Err(e) = accounting
        .sessions
        .record_attempt(&accounting.request_id, accounting.task.as_str(), attempt)
        .await
    {
        tracing::error!(error = %e, "Failed to record stream attempt");
    }
    if let Err(e) = accounting
        .sessions
        .record_result(
            &accounting.request_id,
            accounting.task.as_str(),
            &accounting.model.id,
            &text,
        )
        .await
    {
        tracing::error!(error = %e, "Failed to record stream result");
    }

    let metrics = get_metrics();
    metrics
        .model_calls_total
        .with_label_values(&[&accounting.model.id, AttemptOutcome::Success.as_str()])
        .inc();
    metrics
        .eval_score
        .with_label_values(&[&accounting.model.id, accounting.task.as_str()])
        .observe(evaluation.score);
    metrics
        .wait_time_ms
        .with_label_values(&[accounting.task.as_str()])
        .observe(latency_ms);

    tracing::info!(
        request_id = %accounting.request_id,
        model = %accounting.model.id,
        score = evaluation.score,
        tokens,
        "Passthrough stream completed"
    );
}

/// Accounting for a passthrough stream that died mid-flight.
async fn finalize_stream_error(accounting: StreamAccounting) {
    if let Err(e) = accounting
        .health
        .record_result(&accounting.model.id, false, None)
        .await
    {
        tracing::error!(error = %e, "Failed to record stream health result");
    }
    let attempt = AttemptRecord {
        model_id: accounting.model.id.clone(),
        outcome: AttemptOutcome::Transient,
        score: None,
    };
    if let Err(e) = accounting
        .sessions
        .record_attempt(&accounting.request_id, accounting.task.as_str(), attempt)
        .await
    {
        tracing::error!(error = %e, "Failed to record stream attempt");
    }
    get_metrics()
        .model_calls_total
        .with_label_values(&[&accounting.model.id, AttemptOutcome::Transient.as_str()])
        .inc();
}

/// Estimated input tokens of a message list.
fn input_token_estimate(messages: &[ChatMessage]) -> u64 {
    context::estimate_request_tokens(messages, 0)
}

/// The most recent user message, used as the judge's question.
fn last_user_content(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health_with(strikes: i64, last_at: i64) -> ModelHealth {
        ModelHealth {
            rate_limit_strikes: strikes,
            last_rate_limit_at: last_at,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_first_strike() {
        let (strikes, cooldown) = rate_limit_backoff(&ModelHealth::default(), None, 100_000);
        assert_eq!(strikes, 1);
        assert_eq!(cooldown, 2_000);
    }

    #[test]
    fn test_backoff_doubles_inside_window() {
        let now = 100_000;
        let (strikes, cooldown) = rate_limit_backoff(&health_with(1, now - 10_000), None, now);
        assert_eq!(strikes, 2);
        assert_eq!(cooldown, 4_000);

        let (strikes, cooldown) = rate_limit_backoff(&health_with(3, now - 10_000), None, now);
        assert_eq!(strikes, 4);
        assert_eq!(cooldown, 16_000);
    }

    #[test]
    fn test_backoff_resets_outside_window() {
        let now = 500_000;
        let (strikes, cooldown) = rate_limit_backoff(&health_with(5, now - 61_000), None, now);
        assert_eq!(strikes, 1);
        assert_eq!(cooldown, 2_000);
    }

    #[test]
    fn test_backoff_capped() {
        let now = 100_000;
        // Strike 6 would be 2000 * 2^5 = 64000; the cap clamps it.
        let (strikes, cooldown) = rate_limit_backoff(&health_with(5, now - 1_000), None, now);
        assert_eq!(strikes, 6);
        assert_eq!(cooldown, 60_000);

        // Strikes never grow past the cap either.
        let (strikes, _) = rate_limit_backoff(&health_with(6, now - 1_000), None, now);
        assert_eq!(strikes, 6);
    }

    #[test]
    fn test_backoff_honors_retry_after() {
        let (_, cooldown) =
            rate_limit_backoff(&ModelHealth::default(), Some(10_000), 100_000);
        assert_eq!(cooldown, 10_000);
    }

    #[test]
    fn test_last_user_content() {
        let messages = vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("first"),
            ChatMessage::assistant("answer"),
            ChatMessage::user("second"),
        ];
        assert_eq!(last_user_content(&messages), "second");
        assert_eq!(last_user_content(&[]), "");
    }

    #[test]
    fn test_router_request_defaults() {
        let request = RouterRequest::new("req-1", vec![ChatMessage::user("hi")]);
        assert!(!request.stream);
        assert!(!request.allow_degrade);
        assert!(!request.resume);
        assert!(request.task_type.is_none());
        assert!(request.quality_threshold.is_none());
    }
}
