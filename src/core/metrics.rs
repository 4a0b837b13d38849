//! Prometheus metrics for monitoring the routing gateway.
//!
//! This module provides a centralized metrics registry with counters,
//! gauges, and histograms covering routing attempts, evaluation scores,
//! wait times, and provider latency. The `/metrics` endpoint renders the
//! default registry in Prometheus text format.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of HTTP requests by method, endpoint, and status
    pub request_count: IntCounterVec,

    /// HTTP request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Model invocation outcomes by model id and attempt outcome
    pub model_calls_total: IntCounterVec,

    /// Rate-limit events observed per model
    pub rate_limits_total: IntCounterVec,

    /// Evaluator score distribution by model and task type
    pub eval_score: HistogramVec,

    /// End-to-end wait until an accepted response, per task type
    pub wait_time_ms: HistogramVec,

    /// Provider call latency histogram in seconds
    pub provider_latency: HistogramVec,

    /// Completed sessions replayed through the resume path
    pub sessions_resumed_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
///
/// # Examples
///
/// ```no_run
/// use llm_router_rust::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.model_calls_total.with_label_values(&["fast-coder", "success"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_router_requests_total",
            "Total number of HTTP requests",
            &["method", "endpoint", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_router_request_duration_seconds",
            "HTTP request duration in seconds",
            &["method", "endpoint"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "llm_router_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let model_calls_total = register_int_counter_vec!(
            "llm_router_model_calls_total",
            "Model invocation outcomes",
            &["model", "outcome"]
        )
        .expect("Failed to register model_calls_total metric");

        let rate_limits_total = register_int_counter_vec!(
            "llm_router_rate_limits_total",
            "Rate-limit events observed per model",
            &["model"]
        )
        .expect("Failed to register rate_limits_total metric");

        let eval_score = register_histogram_vec!(
            "llm_router_eval_score",
            "Evaluator score distribution",
            &["model", "task"],
            vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]
        )
        .expect("Failed to register eval_score metric");

        let wait_time_ms = register_histogram_vec!(
            "llm_router_wait_time_ms",
            "Wall-clock wait until an accepted response in milliseconds",
            &["task"],
            vec![
                50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0
            ]
        )
        .expect("Failed to register wait_time_ms metric");

        let provider_latency = register_histogram_vec!(
            "llm_router_provider_latency_seconds",
            "Provider response latency in seconds",
            &["provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register provider_latency metric");

        let sessions_resumed_total = register_int_counter_vec!(
            "llm_router_sessions_resumed_total",
            "Completed sessions replayed through the resume path",
            &["task"]
        )
        .expect("Failed to register sessions_resumed_total metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            model_calls_total,
            rate_limits_total,
            eval_score,
            wait_time_ms,
            provider_latency,
            sessions_resumed_total,
        }
    })
}

/// Get the global metrics instance.
///
/// # Panics
///
/// Panics if metrics have not been initialized via [`init_metrics`].
pub fn get_metrics() -> &'static Metrics {
    METRICS.get().expect("Metrics not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = init_metrics();

        metrics
            .model_calls_total
            .with_label_values(&["test-model", "success"])
            .inc();

        // Verify the same instance is returned
        let metrics2 = get_metrics();
        assert!(std::ptr::eq(metrics, metrics2));
    }

    #[test]
    fn test_model_calls_counter() {
        let metrics = init_metrics();

        let initial = metrics
            .model_calls_total
            .with_label_values(&["unique-model-a", "eval_fail"])
            .get();

        metrics
            .model_calls_total
            .with_label_values(&["unique-model-a", "eval_fail"])
            .inc();

        let after = metrics
            .model_calls_total
            .with_label_values(&["unique-model-a", "eval_fail"])
            .get();

        assert_eq!(after, initial + 1);
    }

    #[test]
    fn test_eval_score_histogram() {
        let metrics = init_metrics();

        metrics
            .eval_score
            .with_label_values(&["unique-model-b", "code"])
            .observe(0.82);

        let metric = metrics
            .eval_score
            .with_label_values(&["unique-model-b", "code"]);
        assert!(metric.get_sample_count() >= 1);
    }

    #[test]
    fn test_wait_time_histogram() {
        let metrics = init_metrics();

        metrics.wait_time_ms.with_label_values(&["code"]).observe(125.0);

        let metric = metrics.wait_time_ms.with_label_values(&["code"]);
        assert!(metric.get_sample_count() >= 1);
    }

    #[test]
    fn test_active_requests_gauge() {
        let metrics = init_metrics();

        let initial = metrics
            .active_requests
            .with_label_values(&["/v1/chat/completions"])
            .get();

        metrics
            .active_requests
            .with_label_values(&["/v1/chat/completions"])
            .inc();

        assert_eq!(
            metrics
                .active_requests
                .with_label_values(&["/v1/chat/completions"])
                .get(),
            initial + 1.0
        );

        metrics
            .active_requests
            .with_label_values(&["/v1/chat/completions"])
            .dec();

        assert_eq!(
            metrics
                .active_requests
                .with_label_values(&["/v1/chat/completions"])
                .get(),
            initial
        );
    }

    #[test]
    fn test_rate_limits_counter() {
        let metrics = init_metrics();

        let initial = metrics
            .rate_limits_total
            .with_label_values(&["unique-model-c"])
            .get();

        metrics
            .rate_limits_total
            .with_label_values(&["unique-model-c"])
            .inc();

        assert_eq!(
            metrics
                .rate_limits_total
                .with_label_values(&["unique-model-c"])
                .get(),
            initial + 1
        );
    }
}
