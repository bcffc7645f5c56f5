//! Aggregated scrape endpoint.
//!
//! # Security
//!
//! Unauthenticated so Prometheus can scrape. Failure reasons of individual
//! services are logged, never rendered.

use crate::collector::guard::Evaluation;
use crate::collector::UnifiedCollector;
use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Handler for GET /metrics
///
/// Returns 200 with every registered service's snapshot followed by the
/// hub meta metrics:
/// ```text
/// # HELP reply_bot_operations_total Total tracked operations
/// # TYPE reply_bot_operations_total counter
/// reply_bot_operations_total{component="trigger",...,status="success"} 42
/// # scrape_error service="memory_service"
/// # HELP hub_registered_services Number of services registered with the collector
/// ```
#[tracing::instrument(skip_all, name = "hub.metrics.scrape")]
pub async fn metrics_handler(State(collector): State<Arc<UnifiedCollector>>) -> Response {
    match collector.scrape().await {
        Ok(report) => {
            let mut response =
                ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], report.body).into_response();
            response
                .extensions_mut()
                .insert(Evaluation::from_failures(report.failures.len()));
            response
        }
        Err(e) => {
            let mut response = e.into_response();
            response
                .extensions_mut()
                .insert(Evaluation::Failed { failures: 1 });
            response
        }
    }
}
