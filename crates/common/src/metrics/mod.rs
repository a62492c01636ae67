//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with standardized naming conventions for
//! the request path: quota admission, safety verdicts, collaborator calls
//! and refinement outcomes.

use crate::ratelimit::QuotaScope;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all NutriSage metrics
pub const METRICS_PREFIX: &str = "nutrisage";

/// Buckets for collaborator call latency (LLM calls are slow)
pub const UPSTREAM_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Buckets for whole chat requests, which span several rounds
pub const CHAT_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0, 120.0];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        format!("{}_admissions_total", METRICS_PREFIX),
        Unit::Count,
        "Quota decisions by result and scope"
    );

    describe_counter!(
        format!("{}_safety_verdicts_total", METRICS_PREFIX),
        Unit::Count,
        "Safety gate verdicts by direction"
    );

    describe_counter!(
        format!("{}_upstream_calls_total", METRICS_PREFIX),
        Unit::Count,
        "Collaborator calls by service and status"
    );

    describe_histogram!(
        format!("{}_upstream_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Collaborator call latency in seconds"
    );

    describe_counter!(
        format!("{}_refinements_total", METRICS_PREFIX),
        Unit::Count,
        "Refinement controller runs by outcome"
    );

    describe_histogram!(
        format!("{}_refinement_rounds", METRICS_PREFIX),
        Unit::Count,
        "Rounds consumed per refinement run"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record a quota decision; `None` means admitted
pub fn record_admission(denied: Option<QuotaScope>) {
    let (result, scope) = match denied {
        None => ("allowed", "none".to_string()),
        Some(scope) => ("denied", scope.to_string()),
    };

    counter!(
        format!("{}_admissions_total", METRICS_PREFIX),
        "result" => result,
        "scope" => scope
    )
    .increment(1);
}

/// Record a safety verdict
pub fn record_safety(direction: &str, safe: bool) {
    counter!(
        format!("{}_safety_verdicts_total", METRICS_PREFIX),
        "direction" => direction.to_string(),
        "verdict" => if safe { "safe" } else { "unsafe" }
    )
    .increment(1);
}

/// Record one collaborator call
pub fn record_upstream(service: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_upstream_calls_total", METRICS_PREFIX),
        "service" => service.to_string(),
        "status" => status
    )
    .increment(1);

    histogram!(
        format!("{}_upstream_duration_seconds", METRICS_PREFIX),
        "service" => service.to_string()
    )
    .record(duration_secs);
}

/// Record a finished refinement run
pub fn record_refinement(outcome: &str, rounds: u32) {
    counter!(
        format!("{}_refinements_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(format!("{}_refinement_rounds", METRICS_PREFIX)).record(rounds as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [UPSTREAM_BUCKETS, CHAT_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls must be no-ops
        record_admission(Some(QuotaScope::Hour));
        record_safety("input", false);
        record_upstream("llm", 0.2, true);
        record_refinement("accepted", 1);
        RequestMetrics::start("POST", "/v1/chat").finish(200);
    }
}
