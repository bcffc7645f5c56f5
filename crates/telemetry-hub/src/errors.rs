//! Telemetry Hub error types.
//!
//! All errors map to appropriate HTTP status codes via the `IntoResponse` impl.
//! Error messages returned to scrapers are intentionally generic; the actual
//! failure is logged server-side.

use crate::config::ConfigError;
use crate::registry::RegistryError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Telemetry Hub error type.
///
/// Maps to HTTP status codes:
/// - Busy, CircuitOpen: 503 Service Unavailable
/// - UnknownService: 404 Not Found
/// - Conflict, InvalidTransition: 409 Conflict
/// - everything else: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum HubError {
    /// A metric definition or observation was rejected by a registry.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Registration attempted for a name outside the configured allow-list.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Registration did not complete within the configured deadline.
    #[error("Registration of {service} timed out after {timeout_secs}s")]
    RegistrationTimeout { service: String, timeout_secs: u64 },

    /// One service's snapshot or health query failed.
    #[error("Scrape failure for {service}: {reason}")]
    ScrapeFailure { service: String, reason: String },

    /// Per-service shutdown did not finish before the deadline (informational).
    #[error("Shutdown timeout exceeded after {timeout_secs}s")]
    ShutdownTimeoutExceeded { timeout_secs: u64 },

    /// The service has been shut down and released its registry.
    #[error("Service is shut down: {0}")]
    ServiceShutDown(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Registration conflicts with an existing record.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Concurrency cap reached.
    #[error("Collector busy")]
    Busy,

    /// Circuit breaker is open.
    #[error("Circuit breaker open")]
    CircuitOpen,

    /// Listener could not be bound.
    #[error("Bind error: {0}")]
    Bind(String),

    /// Invalid configuration detected at initialization.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// External bridge push failed.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Returns the HTTP status code for this error (for metrics recording).
    pub fn status_code(&self) -> u16 {
        match self {
            HubError::Busy | HubError::CircuitOpen => 503,
            HubError::UnknownService(_) => 404,
            HubError::Conflict(_) | HubError::InvalidTransition { .. } => 409,
            _ => 500,
        }
    }

    /// Bounded error category used as a metric label value.
    pub fn error_type(&self) -> &'static str {
        match self {
            HubError::Registry(RegistryError::DuplicateMetric(_)) => "duplicate_metric",
            HubError::Registry(RegistryError::LabelMismatch { .. }) => "label_mismatch",
            HubError::Registry(_) => "registry",
            HubError::UnknownService(_) => "unknown_service",
            HubError::RegistrationTimeout { .. } => "registration_timeout",
            HubError::ScrapeFailure { .. } => "scrape_failure",
            HubError::ShutdownTimeoutExceeded { .. } => "shutdown_timeout",
            HubError::ServiceShutDown(_) => "service_shut_down",
            HubError::InvalidTransition { .. } => "invalid_transition",
            HubError::Conflict(_) => "conflict",
            HubError::Busy => "busy",
            HubError::CircuitOpen => "circuit_open",
            HubError::Bind(_) => "bind",
            HubError::Config(_) => "config",
            HubError::Bridge(_) => "bridge",
            HubError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            HubError::Busy => (
                StatusCode::SERVICE_UNAVAILABLE,
                "BUSY",
                "Too many concurrent requests. Please retry shortly.".to_string(),
            ),
            HubError::CircuitOpen => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CIRCUIT_OPEN",
                "Collector is cooling down after repeated internal errors".to_string(),
            ),
            HubError::UnknownService(name) => (
                StatusCode::NOT_FOUND,
                "UNKNOWN_SERVICE",
                format!("Service not registered: {name}"),
            ),
            HubError::Conflict(reason) => (StatusCode::CONFLICT, "CONFLICT", reason.clone()),
            HubError::InvalidTransition { .. } => (
                StatusCode::CONFLICT,
                "INVALID_STATE",
                "Operation not allowed in the current lifecycle state".to_string(),
            ),
            other => {
                // Log actual error server-side, return generic message to client
                tracing::error!(target: "hub.errors", error = %other, "Internal failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(error_response)).into_response()
    }
}
