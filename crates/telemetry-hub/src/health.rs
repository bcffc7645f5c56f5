//! Health state derivation.
//!
//! Component health is a pure function of error rate and smoothed latency.
//! Service and collector health aggregate worst-wins over their members.

use serde::{Deserialize, Serialize};

/// Error rate above which a component is unhealthy.
pub const UNHEALTHY_ERROR_RATE: f64 = 0.10;

/// Error rate above which a component is degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.05;

/// Average latency (ms) above which a component is unhealthy.
pub const UNHEALTHY_LATENCY_MS: f64 = 5000.0;

/// Average latency (ms) above which a component is degraded.
pub const DEGRADED_LATENCY_MS: f64 = 2000.0;

/// Health of a component, service or the whole collector.
///
/// Variants are ordered by severity so `max` yields the worst state.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Derive component health from its running statistics.
    ///
    /// Zero operations counts as a zero error rate.
    #[must_use]
    pub fn from_stats(operations: u64, errors: u64, avg_latency_ms: f64) -> Self {
        let error_rate = error_rate(operations, errors);

        if error_rate > UNHEALTHY_ERROR_RATE || avg_latency_ms > UNHEALTHY_LATENCY_MS {
            HealthState::Unhealthy
        } else if error_rate > DEGRADED_ERROR_RATE || avg_latency_ms > DEGRADED_LATENCY_MS {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    /// Worst-wins aggregation. An empty input is healthy.
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = HealthState>,
    {
        states.into_iter().max().unwrap_or(HealthState::Healthy)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }

    /// Numeric encoding used by health gauges (0 healthy, 1 degraded, 2 unhealthy).
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            HealthState::Healthy => 0.0,
            HealthState::Degraded => 1.0,
            HealthState::Unhealthy => 2.0,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors divided by operations, 0 when nothing has been recorded.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn error_rate(operations: u64, errors: u64) -> f64 {
    if operations == 0 {
        0.0
    } else {
        errors as f64 / operations as f64
    }
}
