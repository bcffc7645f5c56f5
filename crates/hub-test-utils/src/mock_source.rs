//! Scriptable telemetry source.
//!
//! `MockSource` implements [`TelemetrySource`] with behavior a test can
//! change at any time: fixed component health, failing health queries,
//! failing snapshots, slow health queries and slow shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! use hub_test_utils::MockSource;
//!
//! let source = MockSource::new("admin_api")
//!     .with_component("auth", HealthState::Degraded)
//!     .with_shutdown_delay(Duration::from_secs(60));
//!
//! orchestrator.register_source("admin_api", source.clone()).await?;
//! source.fail_snapshots(true);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_hub::facade::{ServiceHealthSummary, TelemetrySource};
use telemetry_hub::tracker::ComponentTracker;
use telemetry_hub::{HealthState, HubError};

/// Mock telemetry source for collector and orchestrator tests.
#[derive(Debug)]
pub struct MockSource {
    name: String,
    components: Mutex<BTreeMap<String, HealthState>>,
    fail_health: AtomicBool,
    fail_snapshot: AtomicBool,
    health_delay: Mutex<Duration>,
    shutdown_delay: Mutex<Duration>,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    health_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
    shutdown_completed: AtomicBool,
}

impl MockSource {
    /// Create a healthy source with no components.
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            components: Mutex::new(BTreeMap::new()),
            fail_health: AtomicBool::new(false),
            fail_snapshot: AtomicBool::new(false),
            health_delay: Mutex::new(Duration::ZERO),
            shutdown_delay: Mutex::new(Duration::ZERO),
            last_activity: Mutex::new(None),
            health_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
            shutdown_completed: AtomicBool::new(false),
        })
    }

    /// Add a component with a fixed health state.
    #[must_use]
    pub fn with_component(self: Arc<Self>, component: &str, state: HealthState) -> Arc<Self> {
        self.set_component(component, state);
        self
    }

    /// Delay every shutdown call.
    #[must_use]
    pub fn with_shutdown_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.shutdown_delay.lock() = delay;
        self
    }

    /// Delay every health query.
    #[must_use]
    pub fn with_health_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.health_delay.lock() = delay;
        self
    }

    pub fn set_component(&self, component: &str, state: HealthState) {
        self.components.lock().insert(component.to_string(), state);
        *self.last_activity.lock() = Some(Utc::now());
    }

    /// Make health queries fail (or succeed again).
    pub fn fail_health(&self, fail: bool) {
        self.fail_health.store(fail, Ordering::SeqCst);
    }

    /// Make snapshots fail (or succeed again).
    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }

    /// Number of health queries served so far, failed ones included.
    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    /// Number of times shutdown was started.
    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Whether a shutdown call ran to completion.
    pub fn shutdown_completed(&self) -> bool {
        self.shutdown_completed.load(Ordering::SeqCst)
    }

    /// Metric line the snapshot always contains.
    pub fn snapshot_marker(&self) -> String {
        format!("{}_mock_up 1", self.name)
    }
}

#[async_trait]
impl TelemetrySource for MockSource {
    fn service_name(&self) -> &str {
        &self.name
    }

    async fn health_summary(&self) -> Result<ServiceHealthSummary, HubError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.health_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_health.load(Ordering::SeqCst) {
            return Err(HubError::Internal(format!(
                "{} health backend unavailable",
                self.name
            )));
        }

        let components = self
            .components
            .lock()
            .iter()
            .map(|(component, state)| {
                let mut tracker = ComponentTracker::new(component.clone());
                (component.clone(), tracker.set_health(*state))
            })
            .collect();

        Ok(ServiceHealthSummary::from_components(
            self.name.clone(),
            components,
        ))
    }

    async fn metrics_snapshot(&self) -> Result<String, HubError> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(HubError::ScrapeFailure {
                service: self.name.clone(),
                reason: "mock snapshot failure".to_string(),
            });
        }

        Ok(format!(
            "# HELP {name}_mock_up Mock source liveness\n# TYPE {name}_mock_up gauge\n{marker}\n",
            name = self.name,
            marker = self.snapshot_marker(),
        ))
    }

    fn metrics_count(&self) -> usize {
        1
    }

    fn component_count(&self) -> usize {
        self.components.lock().len()
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.last_activity.lock()
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.shutdown_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.shutdown_completed.store(true, Ordering::SeqCst);
    }
}
