//! Self-instrumentation metrics for the hub.
//!
//! All metrics follow Prometheus naming conventions:
//! - `hub_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: HTTP methods
//! - `endpoint`: the four served paths plus `/other`
//! - `status`: success, error, timeout, duplicate
//! - `status_code`: HTTP status codes
//! - `reason`: busy, circuit_open
//! - `outcome`: completed, timed_out
//! - `service`: the configured allow-list
//!
//! Per-service gauges (registered services, uptime, service up) are rendered
//! by the collector's meta registry, not here.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle whose render
/// output is appended to the scrape body.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("hub_http_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("hub_health_poll".to_string()),
            &[0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.000, 5.000],
        )
        .map_err(|e| format!("Failed to set health poll buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `hub_http_requests_total`, `hub_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("hub_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("hub_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Record a request rejected by the guard.
///
/// Metric: `hub_requests_rejected_total`
/// Labels: `reason` (`busy`, `circuit_open`)
pub fn record_request_rejected(reason: &'static str) {
    counter!("hub_requests_rejected_total", "reason" => reason).increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/metrics" => "/metrics",
        "/health" => "/health",
        "/services" => "/services",
        "/ready" => "/ready",
        _ => "/other",
    }
}

// ============================================================================
// Health Polling Metrics
// ============================================================================

/// Record one health polling cycle.
///
/// Metric: `hub_health_poll_duration_seconds`, `hub_health_poll_failures_total`
/// Labels: none on the histogram, `service` on failures (bounded by the allow-list)
pub fn record_health_poll(duration: Duration, failed_services: &[String]) {
    histogram!("hub_health_poll_duration_seconds").record(duration.as_secs_f64());

    for service in failed_services {
        counter!("hub_health_poll_failures_total",
            "service" => service.clone()
        )
        .increment(1);
    }
}

// ============================================================================
// Bridge Metrics
// ============================================================================

/// Record a bridge push attempt.
///
/// Metric: `hub_bridge_pushes_total`
/// Labels: `service`, `status` (success, error)
pub fn record_bridge_push(service: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("hub_bridge_pushes_total",
        "service" => service.to_string(),
        "status" => status
    )
    .increment(1);
}

// ============================================================================
// Lifecycle Metrics
// ============================================================================

/// Record the outcome of an orchestrator shutdown.
///
/// Metric: `hub_shutdowns_total`
/// Labels: `outcome` (completed, timed_out)
pub fn record_shutdown(timed_out: bool) {
    let outcome = if timed_out { "timed_out" } else { "completed" };
    counter!("hub_shutdowns_total", "outcome" => outcome).increment(1);
}

/// Record a service registration attempt.
///
/// Metric: `hub_registrations_total`
/// Labels: `status` (success, duplicate, timeout, error)
pub fn record_registration(status: &'static str) {
    counter!("hub_registrations_total", "status" => status).increment(1);
}
