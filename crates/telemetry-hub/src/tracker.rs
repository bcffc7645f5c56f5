//! Per-component rolling statistics.

use crate::health::{error_rate, HealthState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read-only copy of a component's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub component: String,
    pub last_activity: DateTime<Utc>,
    pub operation_count: u64,
    pub error_count: u64,
    pub average_latency_ms: f64,
    pub health: HealthState,
}

impl ComponentRecord {
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        error_rate(self.operation_count, self.error_count)
    }
}

/// Tracks operations for one component of one service.
///
/// Latency is smoothed as `next = (prev + observed) / 2`, seeded at 0.
/// Health is recomputed after every recorded operation.
#[derive(Debug, Clone)]
pub struct ComponentTracker {
    record: ComponentRecord,
}

impl ComponentTracker {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            record: ComponentRecord {
                component: component.into(),
                last_activity: Utc::now(),
                operation_count: 0,
                error_count: 0,
                average_latency_ms: 0.0,
                health: HealthState::Healthy,
            },
        }
    }

    /// Record one operation and return the updated record.
    ///
    /// Negative or non-finite durations are treated as 0. A missing duration
    /// leaves the latency average untouched.
    pub fn record_operation(&mut self, duration_ms: Option<f64>, success: bool) -> ComponentRecord {
        let record = &mut self.record;

        record.operation_count = record.operation_count.saturating_add(1);
        if !success {
            record.error_count = record.error_count.saturating_add(1);
        }

        if let Some(duration) = duration_ms {
            let duration = if duration.is_finite() {
                duration.max(0.0)
            } else {
                0.0
            };
            record.average_latency_ms = (record.average_latency_ms + duration) / 2.0;
        }

        record.last_activity = Utc::now();
        record.health = HealthState::from_stats(
            record.operation_count,
            record.error_count,
            record.average_latency_ms,
        );

        record.clone()
    }

    /// Override the derived health state. The next recorded operation
    /// recomputes it from the statistics again.
    pub fn set_health(&mut self, state: HealthState) -> ComponentRecord {
        self.record.health = state;
        self.record.last_activity = Utc::now();
        self.record.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> ComponentRecord {
        self.record.clone()
    }

    #[must_use]
    pub fn health(&self) -> HealthState {
        self.record.health
    }
}
