//! Observability orchestrator.
//!
//! Owns the hub lifecycle: starts the collector, registers services,
//! runs the health poller and the optional metrics bridge, and performs
//! the ordered shutdown sequence. Exactly one orchestrator is constructed
//! per process and passed down explicitly.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized -> Initializing -> Running -> ShuttingDown -> Stopped
//!        ^               |
//!        +---- error ----+
//! ```
//!
//! Every transition is broadcast as [`HubEvent::StateChanged`]. `Stopped`
//! is terminal.

pub mod bridge;
pub mod events;
pub mod poller;

use crate::collector::UnifiedCollector;
use crate::config::Config;
use crate::errors::HubError;
use crate::facade::{ServiceMetrics, TelemetrySource};
use crate::health::HealthState;
use crate::observability::metrics;
use bridge::{MetricsSink, RedisMetricsSink};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use events::{HealthCheckResult, HubEvent, EVENT_CHANNEL_CAPACITY};
use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::{Mutex, RwLock};
use secrecy::ExposeSecret;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        }
    }

    /// Whether `self -> next` is a legal transition. No state may be skipped.
    #[must_use]
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::Uninitialized, LifecycleState::Initializing)
                | (LifecycleState::Initializing, LifecycleState::Running)
                | (LifecycleState::Initializing, LifecycleState::Uninitialized)
                | (LifecycleState::Running, LifecycleState::ShuttingDown)
                | (LifecycleState::ShuttingDown, LifecycleState::Stopped)
        )
    }

    /// Registrations are accepted while starting up or running.
    #[must_use]
    pub fn accepts_registrations(&self) -> bool {
        matches!(
            self,
            LifecycleState::Initializing | LifecycleState::Running
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration record for one service, kept for the life of the hub.
#[derive(Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub source: Arc<dyn TelemetrySource>,
    /// Set when the hub created the facade itself.
    pub facade: Option<Arc<ServiceMetrics>>,
    pub registered_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub health: HealthState,
    pub component_count: usize,
    pub metrics_count: usize,
    /// Time of the most recent polling cycle that covered this service.
    pub last_checked: Option<DateTime<Utc>>,
}

impl fmt::Debug for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRecord")
            .field("name", &self.name)
            .field("registered_at", &self.registered_at)
            .field("last_activity", &self.last_activity)
            .field("health", &self.health)
            .field("component_count", &self.component_count)
            .field("metrics_count", &self.metrics_count)
            .field("last_checked", &self.last_checked)
            .finish_non_exhaustive()
    }
}

/// Registration records keyed by service name.
pub type ServiceRecords = Arc<DashMap<String, ServiceRecord>>;

/// Outcome of [`Orchestrator::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// At least one service did not finish shutting down in time.
    pub timed_out: bool,
    /// Services that were shut down by this call.
    pub services: usize,
}

struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Coordinates the collector, service registrations and background loops.
pub struct Orchestrator {
    config: Config,
    collector: Arc<UnifiedCollector>,
    state: RwLock<LifecycleState>,
    records: ServiceRecords,
    events: broadcast::Sender<HubEvent>,
    background: Mutex<Option<BackgroundTasks>>,
    bridge_sink: Option<Arc<dyn MetricsSink>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("services", &self.records.len())
            .field("collector", &self.collector)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator in `Uninitialized`. Nothing is bound yet.
    ///
    /// `process_metrics` is the hub's own Prometheus recorder handle; its
    /// output is appended to every scrape.
    pub fn new(config: Config, process_metrics: Option<PrometheusHandle>) -> Self {
        let collector = Arc::new(UnifiedCollector::new(
            config.collector_config(),
            process_metrics,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            collector,
            state: RwLock::new(LifecycleState::Uninitialized),
            records: Arc::new(DashMap::new()),
            events,
            background: Mutex::new(None),
            bridge_sink: None,
        }
    }

    /// Use `sink` for the metrics bridge instead of connecting to the
    /// configured store. The bridge still only runs when configured.
    #[must_use]
    pub fn with_bridge_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.bridge_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn collector(&self) -> Arc<UnifiedCollector> {
        Arc::clone(&self.collector)
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Address the collector listens on, while serving.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.collector.local_addr()
    }

    /// Subscribe to lifecycle events. Only events sent after this call are
    /// observed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<ServiceRecord> {
        self.records.get(name).map(|r| r.value().clone())
    }

    /// Every registration record, sorted by service name.
    #[must_use]
    pub fn records(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Run one polling cycle immediately.
    pub async fn poll_now(&self) -> Vec<HealthCheckResult> {
        poller::poll_once(&self.records, &self.events).await
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, to: LifecycleState) -> Result<(), HubError> {
        let mut state = self.state.write();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(HubError::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        *state = to;
        drop(state);

        self.announce_transition(from, to);
        Ok(())
    }

    fn announce_transition(&self, from: LifecycleState, to: LifecycleState) {
        tracing::info!(
            target: "hub.orchestrator",
            from = %from,
            to = %to,
            "Lifecycle state changed"
        );
        self.emit(HubEvent::StateChanged { from, to });
    }

    /// Start the collector, auto-register available services and spawn the
    /// background loops. Returns the bound address.
    ///
    /// Calling `initialize` while running is a no-op. A failure returns the
    /// orchestrator to `Uninitialized` and propagates.
    #[tracing::instrument(skip_all, name = "hub.orchestrator.initialize")]
    pub async fn initialize(&self) -> Result<SocketAddr, HubError> {
        {
            let mut state = self.state.write();
            let current = *state;
            match current {
                LifecycleState::Running => {
                    drop(state);
                    return self.local_addr().ok_or_else(|| {
                        HubError::Internal("running without a listener".to_string())
                    });
                }
                LifecycleState::Uninitialized => *state = LifecycleState::Initializing,
                other => {
                    return Err(HubError::InvalidTransition {
                        from: other.as_str(),
                        to: LifecycleState::Initializing.as_str(),
                    })
                }
            }
        }
        self.announce_transition(LifecycleState::Uninitialized, LifecycleState::Initializing);

        match self.start_up().await {
            Ok(address) => {
                self.transition(LifecycleState::Running)?;

                let services: Vec<String> =
                    self.records().into_iter().map(|r| r.name).collect();
                tracing::info!(
                    target: "hub.orchestrator",
                    address = %address,
                    services = ?services,
                    "Telemetry hub initialized"
                );
                self.emit(HubEvent::Initialized { address, services });
                Ok(address)
            }
            Err(e) => {
                tracing::error!(
                    target: "hub.orchestrator",
                    error = %e,
                    "Initialization failed, rolling back"
                );
                self.stop_background().await;
                self.collector.stop().await;
                self.collector.clear();
                self.records.clear();
                self.transition(LifecycleState::Uninitialized)?;
                Err(e)
            }
        }
    }

    async fn start_up(&self) -> Result<SocketAddr, HubError> {
        let address = self.collector.start(self.config.bind_address).await?;

        if self.config.auto_discovery {
            for known in self.config.known_services.iter().filter(|s| s.available) {
                match self.register_service(&known.name).await {
                    Ok(_) => {
                        tracing::debug!(
                            target: "hub.orchestrator",
                            service = %known.name,
                            "Auto-discovered service"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "hub.orchestrator",
                            service = %known.name,
                            error = %e,
                            "Auto-discovery registration failed, skipping"
                        );
                    }
                }
            }
        }

        self.spawn_background();
        Ok(address)
    }

    fn spawn_background(&self) {
        let cancel = CancellationToken::new();
        let mut handles = vec![(
            "poller",
            poller::spawn_health_poller(
                Arc::clone(&self.records),
                self.events.clone(),
                self.config.health_poll_interval,
                cancel.child_token(),
            ),
        )];

        if let Some(bridge_config) = &self.config.bridge {
            let sink = match &self.bridge_sink {
                Some(sink) => Some(Arc::clone(sink)),
                None => match RedisMetricsSink::new(bridge_config.redis_url.expose_secret()) {
                    Ok(sink) => Some(Arc::new(sink) as Arc<dyn MetricsSink>),
                    Err(e) => {
                        tracing::warn!(
                            target: "hub.orchestrator",
                            service = %bridge_config.service,
                            error = %e,
                            "Metrics bridge disabled"
                        );
                        None
                    }
                },
            };

            if let Some(sink) = sink {
                handles.push((
                    "bridge",
                    bridge::spawn_bridge(
                        bridge_config.service.clone(),
                        Arc::clone(&self.records),
                        sink,
                        bridge_config.interval,
                        cancel.child_token(),
                    ),
                ));
            }
        }

        *self.background.lock() = Some(BackgroundTasks { cancel, handles });
    }

    async fn stop_background(&self) {
        let Some(background) = self.background.lock().take() else {
            return;
        };

        background.cancel.cancel();
        for (name, handle) in background.handles {
            if let Err(e) = handle.await {
                tracing::warn!(
                    target: "hub.orchestrator",
                    task = name,
                    error = %e,
                    "Background task ended abnormally"
                );
            }
        }
    }

    fn ensure_accepting(&self, name: &str) -> Result<(), HubError> {
        let state = self.state();
        if !state.accepts_registrations() {
            return Err(HubError::Conflict(format!(
                "cannot register {name} while {state}"
            )));
        }
        if !self.collector.is_allowed(name) {
            return Err(HubError::UnknownService(name.to_string()));
        }
        Ok(())
    }

    /// Register `name` with a hub-created facade, or return the facade
    /// already registered under that name.
    #[tracing::instrument(skip(self), name = "hub.orchestrator.register_service")]
    pub async fn register_service(&self, name: &str) -> Result<Arc<ServiceMetrics>, HubError> {
        self.ensure_accepting(name)?;

        if let Some(record) = self.records.get(name) {
            return existing_facade(&record);
        }

        let facade = Arc::new(ServiceMetrics::new(self.config.labels_for(name))?);
        let source: Arc<dyn TelemetrySource> = facade.clone();
        let record = self.admit(name, source, Some(facade)).await?;
        existing_facade(&record)
    }

    /// Register an externally implemented source.
    ///
    /// Returns `Ok(false)` when this exact source is already registered and
    /// `Conflict` when a different source holds the name.
    #[tracing::instrument(skip(self, source), name = "hub.orchestrator.register_source")]
    pub async fn register_source(
        &self,
        name: &str,
        source: Arc<dyn TelemetrySource>,
    ) -> Result<bool, HubError> {
        self.ensure_accepting(name)?;

        if let Some(record) = self.records.get(name) {
            return same_source(&record, &source);
        }

        let record = self.admit(name, Arc::clone(&source), None).await?;
        if same_source(&record, &source)? {
            // Registered by this call
            return Ok(true);
        }
        Ok(false)
    }

    /// Seed the record, insert it unless another registration won the race,
    /// and hand the source to the collector.
    async fn admit(
        &self,
        name: &str,
        source: Arc<dyn TelemetrySource>,
        facade: Option<Arc<ServiceMetrics>>,
    ) -> Result<ServiceRecord, HubError> {
        let timeout = self.config.registration_timeout;
        let seed = tokio::time::timeout(timeout, source.health_summary())
            .await
            .map_err(|_| {
                metrics::record_registration("timeout");
                HubError::RegistrationTimeout {
                    service: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                }
            })?;

        let health = match seed {
            Ok(summary) => summary.status,
            Err(e) => {
                tracing::warn!(
                    target: "hub.orchestrator",
                    service = %name,
                    error = %e,
                    "Initial health query failed, registering as unhealthy"
                );
                HealthState::Unhealthy
            }
        };

        let record = match self.records.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                metrics::record_registration("duplicate");
                return Ok(existing.get().clone());
            }
            Entry::Vacant(slot) => {
                let record = ServiceRecord {
                    name: name.to_string(),
                    source: Arc::clone(&source),
                    facade,
                    registered_at: Utc::now(),
                    last_activity: source.last_activity(),
                    health,
                    component_count: source.component_count(),
                    metrics_count: source.metrics_count(),
                    last_checked: None,
                };
                slot.insert(record.clone());
                record
            }
        };

        if let Err(e) = self.collector.register_service(name, Arc::clone(&source)) {
            self.records.remove(name);
            metrics::record_registration("error");
            return Err(e);
        }

        // Lost a race with shutdown; undo so nothing outlives the clear
        let state = self.state();
        if !state.accepts_registrations() {
            self.records.remove(name);
            self.collector.deregister_service(name);
            source.shutdown().await;
            metrics::record_registration("error");
            return Err(HubError::Conflict(format!(
                "cannot register {name} while {state}"
            )));
        }

        metrics::record_registration("success");
        tracing::info!(
            target: "hub.orchestrator",
            service = %name,
            health = %health,
            "Service registered"
        );
        self.emit(HubEvent::ServiceRegistered {
            service: name.to_string(),
            registered_at: record.registered_at,
        });

        Ok(record)
    }

    /// Stop background loops, shut every service down concurrently within
    /// the configured timeout, stop the collector and clear all records.
    ///
    /// Idempotent: calling again while shutting down or stopped, or before
    /// initialize, returns an empty report.
    #[tracing::instrument(skip_all, name = "hub.orchestrator.shutdown")]
    pub async fn shutdown(&self) -> Result<ShutdownReport, HubError> {
        {
            let mut state = self.state.write();
            let current = *state;
            match current {
                LifecycleState::Running => *state = LifecycleState::ShuttingDown,
                LifecycleState::Initializing => {
                    return Err(HubError::InvalidTransition {
                        from: LifecycleState::Initializing.as_str(),
                        to: LifecycleState::ShuttingDown.as_str(),
                    })
                }
                _ => {
                    return Ok(ShutdownReport {
                        timed_out: false,
                        services: 0,
                    })
                }
            }
        }
        self.announce_transition(LifecycleState::Running, LifecycleState::ShuttingDown);

        let start = Instant::now();
        self.stop_background().await;

        let sources: Vec<(String, Arc<dyn TelemetrySource>)> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(&r.value().source)))
            .collect();
        let services = sources.len();

        // Spawned so slow shutdowns are abandoned rather than cancelled
        let handles: Vec<JoinHandle<()>> = sources
            .into_iter()
            .map(|(_, source)| tokio::spawn(async move { source.shutdown().await }))
            .collect();

        let timeout = self.config.shutdown_timeout;
        let timed_out = tokio::time::timeout(timeout, join_all(handles))
            .await
            .is_err();
        if timed_out {
            let e = HubError::ShutdownTimeoutExceeded {
                timeout_secs: timeout.as_secs(),
            };
            tracing::warn!(
                target: "hub.orchestrator",
                error = %e,
                "Abandoning services that did not shut down in time"
            );
        }

        self.collector.stop().await;
        self.collector.clear();
        self.records.clear();

        self.transition(LifecycleState::Stopped)?;
        metrics::record_shutdown(timed_out);

        tracing::info!(
            target: "hub.orchestrator",
            services = services,
            timed_out = timed_out,
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Telemetry hub stopped"
        );
        self.emit(HubEvent::ShutdownComplete { timed_out });

        Ok(ShutdownReport {
            timed_out,
            services,
        })
    }
}

fn existing_facade(record: &ServiceRecord) -> Result<Arc<ServiceMetrics>, HubError> {
    record.facade.clone().ok_or_else(|| {
        HubError::Conflict(format!(
            "{} is registered with a custom telemetry source",
            record.name
        ))
    })
}

fn same_source(record: &ServiceRecord, source: &Arc<dyn TelemetrySource>) -> Result<bool, HubError> {
    let registered = Arc::as_ptr(&record.source).cast::<()>();
    let offered = Arc::as_ptr(source).cast::<()>();
    if registered == offered {
        Ok(false)
    } else {
        Err(HubError::Conflict(format!(
            "{} is already registered with a different telemetry source",
            record.name
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::facade::ServiceHealthSummary;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<String, String> = [
            ("HUB_BIND_ADDRESS", "127.0.0.1:0"),
            ("HUB_KNOWN_SERVICES", "a,b"),
            ("HUB_AUTO_DISCOVERY", "false"),
            ("HUB_INSTANCE_ID", "hub-test"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
        for (k, v) in pairs {
            vars.insert((*k).to_string(), (*v).to_string());
        }
        Config::from_vars(&vars).unwrap()
    }

    /// Source whose health and snapshot queries always fail.
    struct BrokenSource;

    #[async_trait]
    impl TelemetrySource for BrokenSource {
        fn service_name(&self) -> &str {
            "b"
        }

        async fn health_summary(&self) -> Result<ServiceHealthSummary, HubError> {
            Err(HubError::Internal("health backend down".to_string()))
        }

        async fn metrics_snapshot(&self) -> Result<String, HubError> {
            Err(HubError::Internal("snapshot backend down".to_string()))
        }

        fn metrics_count(&self) -> usize {
            0
        }

        fn component_count(&self) -> usize {
            0
        }

        fn last_activity(&self) -> Option<DateTime<Utc>> {
            None
        }

        async fn shutdown(&self) {}
    }

    /// Source that stalls on health queries and shutdown.
    struct StalledSource {
        stall: Duration,
    }

    #[async_trait]
    impl TelemetrySource for StalledSource {
        fn service_name(&self) -> &str {
            "b"
        }

        async fn health_summary(&self) -> Result<ServiceHealthSummary, HubError> {
            tokio::time::sleep(self.stall).await;
            Ok(ServiceHealthSummary::from_components("b", Default::default()))
        }

        async fn metrics_snapshot(&self) -> Result<String, HubError> {
            Ok(String::new())
        }

        fn metrics_count(&self) -> usize {
            0
        }

        fn component_count(&self) -> usize {
            0
        }

        fn last_activity(&self) -> Option<DateTime<Utc>> {
            None
        }

        async fn shutdown(&self) {
            tokio::time::sleep(self.stall).await;
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;

        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Uninitialized));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Stopped));

        assert!(!Uninitialized.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Initializing));
        assert!(!Stopped.can_transition_to(Uninitialized));
    }

    #[tokio::test]
    async fn test_register_before_initialize_is_conflict() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        let result = orchestrator.register_service("a").await;
        assert!(matches!(result, Err(HubError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_double_registration_returns_same_facade() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        orchestrator.initialize().await.unwrap();
        let mut events = orchestrator.subscribe();

        let first = orchestrator.register_service("a").await.unwrap();
        let second = orchestrator.register_service("a").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(orchestrator.records().len(), 1);
        assert_eq!(orchestrator.collector().service_names(), vec!["a"]);

        let event = events.try_recv().unwrap();
        assert!(matches!(event, HubEvent::ServiceRegistered { service, .. } if service == "a"));
        assert!(events.try_recv().is_err());

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_service_rejected() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        orchestrator.initialize().await.unwrap();

        let result = orchestrator.register_service("rogue").await;
        assert!(matches!(result, Err(HubError::UnknownService(name)) if name == "rogue"));
        assert!(orchestrator.records().is_empty());

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_source_conflicts() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        orchestrator.initialize().await.unwrap();

        let source: Arc<dyn TelemetrySource> = Arc::new(BrokenSource);
        assert!(orchestrator
            .register_source("b", Arc::clone(&source))
            .await
            .unwrap());
        assert!(!orchestrator.register_source("b", source).await.unwrap());

        let other: Arc<dyn TelemetrySource> = Arc::new(BrokenSource);
        assert!(matches!(
            orchestrator.register_source("b", other).await,
            Err(HubError::Conflict(_))
        ));
        assert!(matches!(
            orchestrator.register_service("b").await,
            Err(HubError::Conflict(_))
        ));

        // Failed seed query registers the service as unhealthy
        assert_eq!(
            orchestrator.service("b").unwrap().health,
            HealthState::Unhealthy
        );

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_timeout() {
        let mut config = config(&[]);
        config.registration_timeout = Duration::from_millis(50);
        let orchestrator = Orchestrator::new(config, None);
        orchestrator.initialize().await.unwrap();

        let result = orchestrator
            .register_source(
                "b",
                Arc::new(StalledSource {
                    stall: Duration::from_secs(60),
                }),
            )
            .await;
        assert!(matches!(
            result,
            Err(HubError::RegistrationTimeout { service, .. }) if service == "b"
        ));
        assert!(orchestrator.service("b").is_none());

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_emits_transitions() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        let mut events = orchestrator.subscribe();

        let address = orchestrator.initialize().await.unwrap();
        assert_eq!(orchestrator.state(), LifecycleState::Running);
        assert_eq!(orchestrator.local_addr(), Some(address));

        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::StateChanged {
                from: LifecycleState::Uninitialized,
                to: LifecycleState::Initializing,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::StateChanged {
                from: LifecycleState::Initializing,
                to: LifecycleState::Running,
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            HubEvent::Initialized {
                address,
                services: Vec::new(),
            }
        );

        // Second initialize is a no-op
        assert_eq!(orchestrator.initialize().await.unwrap(), address);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_discovery_registers_available_services() {
        let orchestrator = Orchestrator::new(
            config(&[
                ("HUB_AUTO_DISCOVERY", "true"),
                ("HUB_SERVICE_A_MARKERS", "A_KEY"),
                ("A_KEY", "present"),
                ("HUB_SERVICE_B_MARKERS", "B_KEY"),
            ]),
            None,
        );
        orchestrator.initialize().await.unwrap();

        let names: Vec<String> = orchestrator.records().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a"]);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_failure_returns_to_uninitialized() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = occupied.local_addr().unwrap().to_string();
        let orchestrator = Orchestrator::new(config(&[("HUB_BIND_ADDRESS", &address)]), None);

        let result = orchestrator.initialize().await;
        assert!(matches!(result, Err(HubError::Bind(_))));
        assert_eq!(orchestrator.state(), LifecycleState::Uninitialized);
        assert!(orchestrator.local_addr().is_none());

        drop(occupied);
    }

    #[tokio::test]
    async fn test_shutdown_twice_leaves_no_services() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        orchestrator.initialize().await.unwrap();
        let facade = orchestrator.register_service("a").await.unwrap();
        orchestrator
            .register_source("b", Arc::new(BrokenSource))
            .await
            .unwrap();

        let first = orchestrator.shutdown().await.unwrap();
        assert_eq!(first.services, 2);
        assert!(!first.timed_out);

        let second = orchestrator.shutdown().await.unwrap();
        assert_eq!(second.services, 0);

        assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        assert!(orchestrator.records().is_empty());
        assert!(orchestrator.collector().service_names().is_empty());
        assert!(orchestrator.local_addr().is_none());
        assert!(facade.is_shutting_down());

        // Stopped is terminal
        assert!(matches!(
            orchestrator.initialize().await,
            Err(HubError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orchestrator.register_service("a").await,
            Err(HubError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize_is_noop() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        let report = orchestrator.shutdown().await.unwrap();
        assert_eq!(report.services, 0);
        assert_eq!(orchestrator.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_reported() {
        let mut config = config(&[]);
        config.shutdown_timeout = Duration::from_millis(100);
        config.registration_timeout = Duration::from_secs(5);
        let orchestrator = Orchestrator::new(config, None);
        orchestrator.initialize().await.unwrap();
        orchestrator
            .register_source(
                "b",
                Arc::new(StalledSource {
                    stall: Duration::from_millis(300),
                }),
            )
            .await
            .unwrap();

        let started = Instant::now();
        let report = orchestrator.shutdown().await.unwrap();
        assert!(report.timed_out);
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        assert!(orchestrator.records().is_empty());
    }

    #[tokio::test]
    async fn test_poll_marks_failing_service_unhealthy() {
        let orchestrator = Orchestrator::new(config(&[]), None);
        orchestrator.initialize().await.unwrap();
        let a = orchestrator.register_service("a").await.unwrap();
        a.track_operation("x", "op", Some(10.0), true, None);
        orchestrator
            .register_source("b", Arc::new(BrokenSource))
            .await
            .unwrap();

        let mut events = orchestrator.subscribe();
        let results = orchestrator.poll_now().await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].service, "a");
        assert_eq!(results[0].status, HealthState::Healthy);
        assert_eq!(results[0].components.len(), 1);
        assert_eq!(results[1].service, "b");
        assert_eq!(results[1].status, HealthState::Unhealthy);
        assert!(results[1].is_failure());

        let a_record = orchestrator.service("a").unwrap();
        assert!(a_record.last_checked.is_some());
        assert!(a_record.last_activity.is_some());
        assert_eq!(a_record.component_count, 1);
        assert_eq!(
            orchestrator.service("b").unwrap().health,
            HealthState::Unhealthy
        );

        let mut checked = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HubEvent::HealthChecked(_)) {
                checked += 1;
            }
        }
        assert_eq!(checked, 2);

        orchestrator.shutdown().await.unwrap();
    }
}
