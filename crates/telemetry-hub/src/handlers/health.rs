//! Health, readiness and listing handlers.
//!
//! - `/health`: aggregated service health, 503 when any service is unhealthy
//! - `/ready`: 200 once the collector is serving
//! - `/services`: registered names with last activity

use crate::collector::guard::Evaluation;
use crate::collector::{ServiceListing, UnifiedCollector};
use crate::health::HealthState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

/// Handler for GET /health
///
/// Body is `{status, services}`. Healthy and degraded map to 200.
#[tracing::instrument(skip_all, name = "hub.health.aggregate")]
pub async fn health_handler(State(collector): State<Arc<UnifiedCollector>>) -> Response {
    let health = collector.health().await;

    let status = match health.status {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let evaluation = Evaluation::from_failures(health.failures);

    let mut response = (status, Json(health)).into_response();
    response.extensions_mut().insert(evaluation);
    response
}

/// Handler for GET /services
pub async fn services_handler(
    State(collector): State<Arc<UnifiedCollector>>,
) -> Json<Vec<ServiceListing>> {
    Json(collector.services())
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub services: usize,
}

/// Handler for GET /ready
pub async fn readiness_handler(State(collector): State<Arc<UnifiedCollector>>) -> Response {
    let services = collector.service_names().len();

    if collector.local_addr().is_some() {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                services,
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                services,
            }),
        )
            .into_response()
    }
}
