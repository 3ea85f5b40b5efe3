//! Metrics definitions for the Rollout Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: HTTP methods
//! - `endpoint`: the three routes plus `/other`
//! - `status`: success, error, timeout
//! - `outcome`: deployed, replaced, failed, unknown_repository, no_matching_prefix
//! - `reason`: bounded by the auth middleware's failure branches

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder and return the handle used to
/// render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("rc_http".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
                30.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP buckets: {e}"))?
        // Rollouts include image pulls, which can take minutes
        .set_buckets_for_metric(
            Matcher::Prefix("rc_rollout".to_string()),
            &[
                0.001, 0.100, 0.500, 1.000, 5.000, 10.000, 30.000, 60.000, 120.000, 300.000,
                600.000,
            ],
        )
        .map_err(|e| format!("Failed to set rollout buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("rc_registry_token_refresh".to_string()),
            &[0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set registry refresh buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion
///
/// Metric: `rc_http_requests_total`, `rc_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
///
/// Captures every response, including framework-level rejections such as
/// 404, 405 and 415 that never reach a handler.
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("rc_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("rc_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Categorize HTTP status code into success/error/timeout
fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Map a request path onto a bounded label set.
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/update" => "/update",
        "/health" => "/health",
        "/metrics" => "/metrics",
        _ => "/other",
    }
}

// ============================================================================
// Rollout Metrics
// ============================================================================

/// Record a handled update event
///
/// Metric: `rc_rollouts_total`, `rc_rollout_duration_seconds`
/// Labels: `outcome`
///
/// Duration includes time spent waiting for the engine lock.
pub fn record_rollout(outcome: &'static str, duration: Duration) {
    histogram!("rc_rollout_duration_seconds",
        "outcome" => outcome
    )
    .record(duration.as_secs_f64());

    counter!("rc_rollouts_total",
        "outcome" => outcome
    )
    .increment(1);
}

// ============================================================================
// Admission and Authentication Metrics
// ============================================================================

/// Record a request rejected by the admission limiter
///
/// Metric: `rc_admission_denied_total`
pub fn record_admission_denied() {
    counter!("rc_admission_denied_total").increment(1);
}

/// Record a rejected webhook bearer token
///
/// Metric: `rc_auth_failures_total`
/// Labels: `reason` (missing_header, malformed_header, invalid_token)
pub fn record_auth_failure(reason: &'static str) {
    counter!("rc_auth_failures_total",
        "reason" => reason
    )
    .increment(1);
}

/// Set the number of identities tracked by the admission limiter
///
/// Metric: `rc_rate_limit_entries`
pub fn set_rate_limit_entries(count: usize) {
    gauge!("rc_rate_limit_entries").set(count as f64);
}

// ============================================================================
// Credential Metrics
// ============================================================================

/// Record a webhook key rotation attempt
///
/// Metric: `rc_key_rotations_total`
/// Labels: `status` (success, error)
pub fn record_key_rotation(status: &'static str) {
    counter!("rc_key_rotations_total",
        "status" => status
    )
    .increment(1);
}

/// Record a registry token refresh attempt
///
/// Metric: `rc_registry_token_refresh_total`, `rc_registry_token_refresh_duration_seconds`
/// Labels: `status` (success, error)
pub fn record_registry_token_refresh(status: &'static str, duration: Duration) {
    histogram!("rc_registry_token_refresh_duration_seconds").record(duration.as_secs_f64());

    counter!("rc_registry_token_refresh_total",
        "status" => status
    )
    .increment(1);
}

// ============================================================================
// Tests
// ============================================================================
