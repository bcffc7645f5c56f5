//! Lifecycle events broadcast by the orchestrator.
//!
//! Delivery is fire-and-forget over a `tokio::sync::broadcast` channel: any
//! number of subscribers, no back-pressure, slow subscribers observe
//! `RecvError::Lagged` rather than blocking the hub.

use crate::facade::ServiceHealthSummary;
use crate::health::HealthState;
use crate::orchestrator::LifecycleState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Health of one component as reported in a polling cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthState,
    pub last_activity: DateTime<Utc>,
    pub operation_count: u64,
    pub error_rate: f64,
}

/// Outcome of polling one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub status: HealthState,
    pub components: Vec<ComponentHealth>,
    /// Set when the health query itself failed.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn from_summary(summary: &ServiceHealthSummary) -> Self {
        let components = summary
            .components
            .values()
            .map(|record| ComponentHealth {
                component: record.component.clone(),
                status: record.health,
                last_activity: record.last_activity,
                operation_count: record.operation_count,
                error_rate: record.error_rate(),
            })
            .collect();

        Self {
            service: summary.service.clone(),
            status: summary.status,
            components,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A failed query marks the service unhealthy for the cycle.
    pub fn failed(service: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: HealthState::Unhealthy,
            components: Vec::new(),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Events emitted over the orchestrator's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    Initialized {
        address: SocketAddr,
        services: Vec<String>,
    },
    ServiceRegistered {
        service: String,
        registered_at: DateTime<Utc>,
    },
    HealthChecked(HealthCheckResult),
    ShutdownComplete {
        timed_out: bool,
    },
}
