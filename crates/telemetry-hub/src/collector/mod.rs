//! Unified collector.
//!
//! Process-wide registry of telemetry sources behind one scrape, health and
//! listing surface. A failing source never fails the aggregate: its section
//! is omitted from the scrape and flagged, and its health is reported as
//! unhealthy.

pub mod guard;

use crate::errors::HubError;
use crate::facade::{ServiceHealthSummary, TelemetrySource};
use crate::health::HealthState;
use crate::registry::{MetricRegistry, RegistryError, RegistryLabels};
use crate::routes::build_routes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use guard::RequestGuard;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Metric prefix of the collector's own meta metrics.
pub const META_PREFIX: &str = "hub";

/// How long `stop()` waits for the server task to drain.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Service names allowed to register.
    pub allowed_services: BTreeSet<String>,
    pub max_concurrent_requests: usize,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Default labels for the meta metrics.
    pub labels: RegistryLabels,
}

/// One source that failed during a scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeFailure {
    pub service: String,
    pub reason: String,
}

/// Result of an aggregated scrape.
#[derive(Debug, Clone)]
pub struct ScrapeReport {
    /// Prometheus text of every healthy section plus meta metrics.
    pub body: String,
    pub failures: Vec<ScrapeFailure>,
}

/// Health entry for one service in the aggregated view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceHealthEntry {
    Reported(ServiceHealthSummary),
    Failed { status: HealthState, error: String },
}

impl ServiceHealthEntry {
    #[must_use]
    pub fn status(&self) -> HealthState {
        match self {
            ServiceHealthEntry::Reported(summary) => summary.status,
            ServiceHealthEntry::Failed { status, .. } => *status,
        }
    }
}

/// Aggregated health across every registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub status: HealthState,
    pub services: BTreeMap<String, ServiceHealthEntry>,
    #[serde(skip)]
    pub failures: usize,
}

/// Entry of the service listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub name: String,
    pub last_activity: Option<DateTime<Utc>>,
}

struct ServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The single externally reachable aggregation point.
pub struct UnifiedCollector {
    config: CollectorConfig,
    sources: RwLock<BTreeMap<String, Arc<dyn TelemetrySource>>>,
    guard: Arc<RequestGuard>,
    process_metrics: Option<PrometheusHandle>,
    started_at: Instant,
    server: Mutex<Option<ServerHandle>>,
}

impl std::fmt::Debug for UnifiedCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedCollector")
            .field("services", &self.service_names())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl UnifiedCollector {
    pub fn new(config: CollectorConfig, process_metrics: Option<PrometheusHandle>) -> Self {
        let guard = Arc::new(RequestGuard::new(
            config.max_concurrent_requests,
            config.breaker_threshold,
            config.breaker_cooldown,
        ));

        Self {
            config,
            sources: RwLock::new(BTreeMap::new()),
            guard,
            process_metrics,
            started_at: Instant::now(),
            server: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    #[must_use]
    pub fn guard(&self) -> Arc<RequestGuard> {
        Arc::clone(&self.guard)
    }

    #[must_use]
    pub fn is_allowed(&self, name: &str) -> bool {
        self.config.allowed_services.contains(name)
    }

    /// Register a source under `name`.
    ///
    /// Returns `Ok(false)` and keeps the existing source when the name is
    /// already registered.
    pub fn register_service(
        &self,
        name: &str,
        source: Arc<dyn TelemetrySource>,
    ) -> Result<bool, HubError> {
        if !self.is_allowed(name) {
            tracing::warn!(
                target: "hub.collector",
                service = %name,
                "Rejected registration outside allow-list"
            );
            return Err(HubError::UnknownService(name.to_string()));
        }

        let mut sources = self.sources.write();
        if sources.contains_key(name) {
            return Ok(false);
        }
        sources.insert(name.to_string(), source);
        drop(sources);

        tracing::info!(target: "hub.collector", service = %name, "Service registered with collector");
        Ok(true)
    }

    pub fn deregister_service(&self, name: &str) -> Option<Arc<dyn TelemetrySource>> {
        self.sources.write().remove(name)
    }

    /// Drop every registered source.
    pub fn clear(&self) {
        self.sources.write().clear();
    }

    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.sources.read().contains_key(name)
    }

    #[must_use]
    pub fn source(&self, name: &str) -> Option<Arc<dyn TelemetrySource>> {
        self.sources.read().get(name).cloned()
    }

    fn snapshot_sources(&self) -> Vec<(String, Arc<dyn TelemetrySource>)> {
        self.sources
            .read()
            .iter()
            .map(|(name, source)| (name.clone(), Arc::clone(source)))
            .collect()
    }

    /// Aggregate every source's snapshot plus meta metrics.
    ///
    /// Sections appear in service name order. Failing sources are omitted
    /// and flagged with a `# scrape_error` comment and `hub_service_up 0`.
    #[tracing::instrument(skip_all, name = "hub.collector.scrape")]
    pub async fn scrape(&self) -> Result<ScrapeReport, HubError> {
        let sources = self.snapshot_sources();
        let results = join_all(
            sources
                .iter()
                .map(|(_, source)| async move { source.metrics_snapshot().await }),
        )
        .await;

        let mut body = String::new();
        let mut failures = Vec::new();
        let mut up = Vec::with_capacity(sources.len());

        for ((name, _), result) in sources.iter().zip(results) {
            match result {
                Ok(text) => {
                    body.push_str(&text);
                    up.push((name.as_str(), true));
                }
                Err(e) => {
                    tracing::warn!(
                        target: "hub.collector",
                        service = %name,
                        error = %e,
                        "Service snapshot failed, omitting from scrape"
                    );
                    body.push_str(&format!("# scrape_error service=\"{name}\"\n"));
                    up.push((name.as_str(), false));
                    failures.push(ScrapeFailure {
                        service: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        body.push_str(&self.render_meta(&up)?);

        if let Some(handle) = &self.process_metrics {
            body.push_str(&handle.render());
        }

        Ok(ScrapeReport { body, failures })
    }

    /// Render the meta metrics into a fresh registry so series of
    /// deregistered services disappear.
    fn render_meta(&self, up: &[(&str, bool)]) -> Result<String, RegistryError> {
        let registry = MetricRegistry::with_prefix(META_PREFIX, self.config.labels.clone())?;

        let registered = registry.define_gauge(
            "registered_services",
            "Number of services registered with the collector",
            &[],
        )?;
        let uptime = registry.define_gauge(
            "uptime_seconds",
            "Seconds since the collector was created",
            &[],
        )?;
        let service_up = registry.define_gauge(
            "service_up",
            "Whether the last scrape of a service succeeded",
            &["target"],
        )?;

        registered.set(&[], up.len() as f64)?;
        uptime.set(&[], self.started_at.elapsed().as_secs_f64())?;
        for (name, ok) in up {
            service_up.set(&[("target", name)], if *ok { 1.0 } else { 0.0 })?;
        }

        registry.snapshot()
    }

    /// Aggregate every source's health summary, worst-wins.
    #[tracing::instrument(skip_all, name = "hub.collector.health")]
    pub async fn health(&self) -> CollectorHealth {
        let sources = self.snapshot_sources();
        let results = join_all(
            sources
                .iter()
                .map(|(_, source)| async move { source.health_summary().await }),
        )
        .await;

        let mut services = BTreeMap::new();
        let mut failures = 0;

        for ((name, _), result) in sources.into_iter().zip(results) {
            let entry = match result {
                Ok(summary) => ServiceHealthEntry::Reported(summary),
                Err(e) => {
                    tracing::warn!(
                        target: "hub.collector",
                        service = %name,
                        error = %e,
                        "Service health query failed"
                    );
                    failures += 1;
                    ServiceHealthEntry::Failed {
                        status: HealthState::Unhealthy,
                        error: "health query failed".to_string(),
                    }
                }
            };
            services.insert(name, entry);
        }

        CollectorHealth {
            status: HealthState::aggregate(services.values().map(ServiceHealthEntry::status)),
            services,
            failures,
        }
    }

    /// Registered names with their last activity.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceListing> {
        self.sources
            .read()
            .iter()
            .map(|(name, source)| ServiceListing {
                name: name.clone(),
                last_activity: source.last_activity(),
            })
            .collect()
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Address the listener is bound to, while serving.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.addr)
    }

    /// Bind the listener and serve the HTTP surface.
    ///
    /// Calling `start` while already serving returns the bound address.
    pub async fn start(self: &Arc<Self>, bind: SocketAddr) -> Result<SocketAddr, HubError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| HubError::Bind(format!("{bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HubError::Bind(format!("{bind}: {e}")))?;

        let shutdown = CancellationToken::new();
        let router = build_routes(Arc::clone(self));
        let signal = shutdown.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
            {
                tracing::error!(target: "hub.collector", error = %e, "Collector server error");
            }
        });

        let mut server = self.server.lock();
        if let Some(existing) = server.as_ref() {
            // Lost a concurrent start; keep the first listener.
            let existing_addr = existing.addr;
            shutdown.cancel();
            task.abort();
            return Ok(existing_addr);
        }
        *server = Some(ServerHandle {
            addr,
            shutdown,
            task,
        });
        drop(server);

        tracing::info!(target: "hub.collector", address = %addr, "Collector listening");
        Ok(addr)
    }

    /// Release the listener. Safe to call repeatedly or before `start`.
    pub async fn stop(&self) {
        let Some(server) = self.server.lock().take() else {
            return;
        };

        server.shutdown.cancel();
        let mut task = server.task;
        if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            tracing::warn!(
                target: "hub.collector",
                "Collector server did not drain in time, aborting"
            );
            task.abort();
        }

        tracing::info!(target: "hub.collector", address = %server.addr, "Collector stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::facade::ServiceMetrics;

    fn labels(service: &str) -> RegistryLabels {
        RegistryLabels {
            service: service.to_string(),
            environment: "test".to_string(),
            version: "0.1.0".to_string(),
            instance: "hub-test".to_string(),
        }
    }

    fn collector(allowed: &[&str]) -> Arc<UnifiedCollector> {
        Arc::new(UnifiedCollector::new(
            CollectorConfig {
                allowed_services: allowed.iter().map(|s| (*s).to_string()).collect(),
                max_concurrent_requests: 8,
                breaker_threshold: 3,
                breaker_cooldown: Duration::from_secs(30),
                labels: labels("telemetry_hub"),
            },
            None,
        ))
    }

    fn facade(service: &str) -> Arc<ServiceMetrics> {
        Arc::new(ServiceMetrics::new(labels(service)).unwrap())
    }

    #[test]
    fn test_register_rejects_unknown_service() {
        let collector = collector(&["a"]);
        let result = collector.register_service("rogue", facade("rogue"));
        assert!(matches!(result, Err(HubError::UnknownService(name)) if name == "rogue"));
        assert!(collector.service_names().is_empty());
    }

    #[test]
    fn test_register_keeps_existing_source() {
        let collector = collector(&["a"]);
        let first = facade("a");
        assert!(collector.register_service("a", first.clone()).unwrap());
        assert!(!collector.register_service("a", facade("a")).unwrap());

        first.track_operation("x", "op", None, true, None);
        let kept = collector.source("a").unwrap();
        assert_eq!(kept.component_count(), 1);
    }

    #[tokio::test]
    async fn test_health_scenarios_aggregate_unhealthy() {
        let collector = collector(&["a", "b"]);
        let a = facade("a");
        a.update_component_health("x", HealthState::Healthy);
        a.update_component_health("y", HealthState::Unhealthy);
        let b = facade("b");
        b.update_component_health("z", HealthState::Degraded);

        collector.register_service("a", a).unwrap();
        collector.register_service("b", b).unwrap();

        let health = collector.health().await;
        assert_eq!(health.status, HealthState::Unhealthy);
        assert_eq!(health.services["a"].status(), HealthState::Unhealthy);
        assert_eq!(health.services["b"].status(), HealthState::Degraded);
        assert_eq!(health.failures, 0);
    }

    #[tokio::test]
    async fn test_scrape_concatenates_services_and_meta() {
        let collector = collector(&["a", "b"]);
        let a = facade("a");
        a.track_operation("x", "op", Some(10.0), true, None);
        collector.register_service("a", a).unwrap();
        collector.register_service("b", facade("b")).unwrap();

        let report = collector.scrape().await.unwrap();
        assert!(report.failures.is_empty());
        assert!(report.body.contains("a_operations_total"));
        assert!(report.body.contains("b_operations_total"));
        assert!(report.body.contains("hub_registered_services"));
        assert!(report.body.contains("hub_uptime_seconds"));
        assert!(report.body.contains("hub_service_up"));

        let a_pos = report.body.find("# TYPE a_").unwrap();
        let b_pos = report.body.find("# TYPE b_").unwrap();
        assert!(a_pos < b_pos);
    }

    #[tokio::test]
    async fn test_scrape_flags_shut_down_service() {
        let collector = collector(&["a", "b"]);
        let a = facade("a");
        collector.register_service("a", a.clone()).unwrap();
        collector.register_service("b", facade("b")).unwrap();
        a.shutdown();

        let report = collector.scrape().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].service, "a");
        assert!(report.body.contains("# scrape_error service=\"a\""));
        assert!(report.body.contains("b_operations_total"));
        assert!(!report.body.contains("# TYPE a_operations_total"));
    }

    #[test]
    fn test_services_listing() {
        let collector = collector(&["a", "b"]);
        let a = facade("a");
        a.track_operation("x", "op", None, true, None);
        collector.register_service("b", facade("b")).unwrap();
        collector.register_service("a", a).unwrap();

        let listing = collector.services();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].name, "a");
        assert!(listing[0].last_activity.is_some());
        assert_eq!(listing[1].name, "b");
        assert!(listing[1].last_activity.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_before_start() {
        let collector = collector(&[]);
        collector.stop().await;

        let addr = collector
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(collector.local_addr(), Some(addr));
        assert_eq!(
            collector.start("127.0.0.1:0".parse().unwrap()).await.unwrap(),
            addr
        );

        collector.stop().await;
        collector.stop().await;
        assert!(collector.local_addr().is_none());
    }

    #[test]
    fn test_deregister_and_clear() {
        let collector = collector(&["a", "b"]);
        collector.register_service("a", facade("a")).unwrap();
        collector.register_service("b", facade("b")).unwrap();

        assert!(collector.deregister_service("a").is_some());
        assert!(!collector.is_registered("a"));

        collector.clear();
        assert!(collector.service_names().is_empty());
    }
}
