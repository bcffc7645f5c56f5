//! Service metrics facade.
//!
//! One [`ServiceMetrics`] per registered service binds a [`MetricRegistry`]
//! and a map of [`ComponentTracker`]s under a single service identity. It is
//! the entry point collaborators instrument their code with.
//!
//! # Tracking never fails
//!
//! `track_*` and `update_component_health` are synchronous and return
//! nothing. Registry errors are logged under `hub.facade` and swallowed so
//! instrumentation cannot break the caller.
//!
//! # Standard metrics
//!
//! Every facade defines, under its service prefix:
//! - `operations_total{component,operation,status}`
//! - `operation_duration_seconds{component,operation,status}`
//! - `operation_errors_total{component,operation,error_type}`
//! - `component_last_activity_timestamp_seconds{component}`
//! - `component_health{component}` (0 healthy, 1 degraded, 2 unhealthy)
//! - `messages_total{triggered,responded}`

mod message_flow;
mod source;

pub use message_flow::{MessageFlow, OperationMetadata, DEFAULT_FLOW_OPERATION};
pub use source::TelemetrySource;

use crate::errors::HubError;
use crate::health::HealthState;
use crate::registry::{
    CounterHandle, GaugeHandle, HistogramHandle, MetricRegistry, RegistryError, RegistryLabels,
    DEFAULT_DURATION_BUCKETS,
};
use crate::tracker::{ComponentRecord, ComponentTracker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Component that message-flow tracking is attributed to by default.
pub const DEFAULT_MESSAGE_FLOW_COMPONENT: &str = "reply_bot";

/// Error type recorded when a failure carries no metadata.
pub const UNKNOWN_ERROR_TYPE: &str = "unknown";

/// Point-in-time health of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthSummary {
    pub service: String,
    pub status: HealthState,
    pub components: BTreeMap<String, ComponentRecord>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceHealthSummary {
    /// Build a summary, deriving the status from the components.
    pub fn from_components(
        service: impl Into<String>,
        components: BTreeMap<String, ComponentRecord>,
    ) -> Self {
        let status = HealthState::aggregate(components.values().map(|c| c.health));
        Self {
            service: service.into(),
            status,
            components,
            timestamp: Utc::now(),
        }
    }
}

/// Standard metric handles for one service.
struct FacadeMetrics {
    registry: MetricRegistry,
    operations: CounterHandle,
    durations: HistogramHandle,
    errors: CounterHandle,
    last_activity: GaugeHandle,
    component_health: GaugeHandle,
    messages: CounterHandle,
}

impl FacadeMetrics {
    fn define(registry: MetricRegistry) -> Result<Self, RegistryError> {
        let operations = registry.define_counter(
            "operations_total",
            "Total tracked operations",
            &["component", "operation", "status"],
        )?;
        let durations = registry.define_histogram(
            "operation_duration_seconds",
            "Tracked operation duration in seconds",
            &["component", "operation", "status"],
            &DEFAULT_DURATION_BUCKETS,
        )?;
        let errors = registry.define_counter(
            "operation_errors_total",
            "Total failed operations by error type",
            &["component", "operation", "error_type"],
        )?;
        let last_activity = registry.define_gauge(
            "component_last_activity_timestamp_seconds",
            "Unix time of the last activity per component",
            &["component"],
        )?;
        let component_health = registry.define_gauge(
            "component_health",
            "Component health (0 healthy, 1 degraded, 2 unhealthy)",
            &["component"],
        )?;
        let messages = registry.define_counter(
            "messages_total",
            "Processed messages by trigger and response outcome",
            &["triggered", "responded"],
        )?;

        Ok(Self {
            registry,
            operations,
            durations,
            errors,
            last_activity,
            component_health,
            messages,
        })
    }

    fn observe_component(&self, record: &ComponentRecord) -> Result<(), RegistryError> {
        #[allow(clippy::cast_precision_loss)]
        let seconds = record.last_activity.timestamp_millis() as f64 / 1000.0;
        let labels = [("component", record.component.as_str())];
        self.last_activity.set(&labels, seconds)?;
        self.component_health.set(&labels, record.health.as_gauge())
    }
}

/// Metrics and component health for one service.
pub struct ServiceMetrics {
    service: String,
    message_flow_component: String,
    metrics: RwLock<Option<FacadeMetrics>>,
    trackers: DashMap<String, ComponentTracker>,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    shutting_down: AtomicBool,
    late_operations: AtomicU64,
}

impl std::fmt::Debug for ServiceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMetrics")
            .field("service", &self.service)
            .field("components", &self.trackers.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl ServiceMetrics {
    /// Create a facade and define its standard metrics.
    pub fn new(labels: RegistryLabels) -> Result<Self, RegistryError> {
        let service = labels.service.clone();
        let registry = MetricRegistry::new(labels)?;
        let metrics = FacadeMetrics::define(registry)?;

        Ok(Self {
            service,
            message_flow_component: DEFAULT_MESSAGE_FLOW_COMPONENT.to_string(),
            metrics: RwLock::new(Some(metrics)),
            trackers: DashMap::new(),
            last_activity: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            late_operations: AtomicU64::new(0),
        })
    }

    /// Attribute message-flow tracking to a different component.
    #[must_use]
    pub fn with_message_flow_component(mut self, component: impl Into<String>) -> Self {
        self.message_flow_component = component.into();
        self
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Pre-declare known components so they appear in health output before
    /// their first operation.
    pub fn register_components(&self, components: &[&str]) {
        for component in components {
            let record = self
                .trackers
                .entry((*component).to_string())
                .or_insert_with(|| ComponentTracker::new(*component))
                .snapshot();
            self.observe_component(&record);
        }
    }

    /// Track one operation of a component.
    ///
    /// Unknown components are created on first use. After shutdown the call
    /// is counted as a late operation and otherwise ignored.
    pub fn track_operation(
        &self,
        component: &str,
        operation: &str,
        duration_ms: Option<f64>,
        success: bool,
        metadata: Option<&OperationMetadata>,
    ) {
        if self.is_shutting_down() {
            self.record_late_operation(component, operation);
            return;
        }

        let status = if success { "success" } else { "error" };
        let guard = self.metrics.read();
        if let Some(metrics) = guard.as_ref() {
            let labels = [
                ("component", component),
                ("operation", operation),
                ("status", status),
            ];
            let mut outcome = metrics.operations.increment(&labels, None);

            if let Some(duration) = duration_ms {
                let seconds = if duration.is_finite() {
                    duration.max(0.0) / 1000.0
                } else {
                    0.0
                };
                outcome = outcome.and(metrics.durations.observe(&labels, seconds));
            }

            if !success {
                let error_type = metadata
                    .and_then(|m| m.error_type.as_deref())
                    .unwrap_or(UNKNOWN_ERROR_TYPE);
                outcome = outcome.and(metrics.errors.increment(
                    &[
                        ("component", component),
                        ("operation", operation),
                        ("error_type", error_type),
                    ],
                    None,
                ));
            }

            if let Err(e) = outcome {
                tracing::warn!(
                    target: "hub.facade",
                    service = %self.service,
                    component = %component,
                    error = %e,
                    "Failed to record operation metrics"
                );
            }
        }
        drop(guard);

        let record = {
            let mut tracker = self
                .trackers
                .entry(component.to_string())
                .or_insert_with(|| ComponentTracker::new(component));
            let record = tracker.record_operation(duration_ms, success);
            self.observe_component(&record);
            record
        };
        self.touch(record.last_activity);
    }

    /// Override a component's health, creating the component if needed.
    pub fn update_component_health(&self, component: &str, state: HealthState) {
        if self.is_shutting_down() {
            self.record_late_operation(component, "update_health");
            return;
        }

        let record = {
            let mut tracker = self
                .trackers
                .entry(component.to_string())
                .or_insert_with(|| ComponentTracker::new(component));
            let record = tracker.set_health(state);
            self.observe_component(&record);
            record
        };
        self.touch(record.last_activity);

        tracing::debug!(
            target: "hub.facade",
            service = %self.service,
            component = %component,
            health = %state,
            "Component health overridden"
        );
    }

    /// Track a message-flow payload as one operation of the message-flow
    /// component. Success means the message triggered a response path.
    pub fn track_message_flow(&self, flow: &MessageFlow) {
        if !self.is_shutting_down() {
            let guard = self.metrics.read();
            if let Some(metrics) = guard.as_ref() {
                let triggered = if flow.triggered { "true" } else { "false" };
                let responded = if flow.response_generated {
                    "true"
                } else {
                    "false"
                };
                if let Err(e) = metrics.messages.increment(
                    &[("triggered", triggered), ("responded", responded)],
                    None,
                ) {
                    tracing::warn!(
                        target: "hub.facade",
                        service = %self.service,
                        error = %e,
                        "Failed to record message flow"
                    );
                }
            }
        }

        let metadata = OperationMetadata {
            error_type: flow.error_type.clone(),
        };
        self.track_operation(
            &self.message_flow_component,
            flow.operation(),
            flow.processing_time_ms,
            flow.triggered,
            Some(&metadata),
        );
    }

    /// Current health of the service and each component. Never cached.
    #[must_use]
    pub fn health_summary(&self) -> ServiceHealthSummary {
        let components: BTreeMap<String, ComponentRecord> = self
            .trackers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        ServiceHealthSummary::from_components(self.service.clone(), components)
    }

    /// Snapshot of one component, if tracked.
    #[must_use]
    pub fn component(&self, component: &str) -> Option<ComponentRecord> {
        self.trackers.get(component).map(|t| t.snapshot())
    }

    /// Prometheus text snapshot of the service's registry.
    pub fn metrics_snapshot(&self) -> Result<String, HubError> {
        match self.metrics.read().as_ref() {
            Some(metrics) => Ok(metrics.registry.snapshot()?),
            None => Err(HubError::ServiceShutDown(self.service.clone())),
        }
    }

    #[must_use]
    pub fn metrics_count(&self) -> usize {
        self.metrics
            .read()
            .as_ref()
            .map_or(0, |m| m.registry.metrics_count())
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.trackers.len()
    }

    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.last_activity.lock()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Tracking calls received after shutdown.
    #[must_use]
    pub fn late_operation_count(&self) -> u64 {
        self.late_operations.load(Ordering::Relaxed)
    }

    /// Mark shutting down, clear trackers and release the registry.
    /// Repeated calls are no-ops.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let components = self.trackers.len();
        self.trackers.clear();
        *self.metrics.write() = None;

        tracing::info!(
            target: "hub.facade",
            service = %self.service,
            components = components,
            "Service metrics shut down"
        );
    }

    fn observe_component(&self, record: &ComponentRecord) {
        if let Some(metrics) = self.metrics.read().as_ref() {
            if let Err(e) = metrics.observe_component(record) {
                tracing::warn!(
                    target: "hub.facade",
                    service = %self.service,
                    component = %record.component,
                    error = %e,
                    "Failed to update component gauges"
                );
            }
        }
    }

    fn touch(&self, at: DateTime<Utc>) {
        let mut last = self.last_activity.lock();
        if last.map_or(true, |prev| at > prev) {
            *last = Some(at);
        }
    }

    fn record_late_operation(&self, component: &str, operation: &str) {
        let late = self.late_operations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            target: "hub.facade",
            service = %self.service,
            component = %component,
            operation = %operation,
            late_operations = late,
            "Tracking call after shutdown"
        );
    }
}

#[async_trait]
impl TelemetrySource for ServiceMetrics {
    fn service_name(&self) -> &str {
        &self.service
    }

    async fn health_summary(&self) -> Result<ServiceHealthSummary, HubError> {
        Ok(ServiceMetrics::health_summary(self))
    }

    async fn metrics_snapshot(&self) -> Result<String, HubError> {
        ServiceMetrics::metrics_snapshot(self)
    }

    fn metrics_count(&self) -> usize {
        ServiceMetrics::metrics_count(self)
    }

    fn component_count(&self) -> usize {
        ServiceMetrics::component_count(self)
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        ServiceMetrics::last_activity(self)
    }

    async fn shutdown(&self) {
        ServiceMetrics::shutdown(self);
    }
}
