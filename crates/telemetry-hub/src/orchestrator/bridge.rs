//! External metrics bridge.
//!
//! Periodically pushes one designated service's snapshot and health summary
//! into a key-value store. Push failures are logged and counted; they never
//! affect the local scrape surface.
//!
//! # Key Patterns
//!
//! - `hub:metrics:{service}` - Prometheus text snapshot, expires after three intervals
//! - `hub:health:{service}` - health summary (JSON)

use crate::errors::HubError;
use crate::facade::ServiceHealthSummary;
use crate::observability::metrics;
use crate::orchestrator::ServiceRecords;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Snapshot keys expire after this many push intervals.
pub const SNAPSHOT_TTL_INTERVALS: u32 = 3;

/// Destination of bridged metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn push_metrics(
        &self,
        service: &str,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<(), HubError>;

    async fn push_health(
        &self,
        service: &str,
        summary: &ServiceHealthSummary,
    ) -> Result<(), HubError>;
}

#[must_use]
pub fn metrics_key(service: &str) -> String {
    format!("hub:metrics:{service}")
}

#[must_use]
pub fn health_key(service: &str) -> String {
    format!("hub:health:{service}")
}

/// Redis-backed sink. Connects lazily on first push and retries the
/// connection on later pushes if it failed.
pub struct RedisMetricsSink {
    client: Client,
    connection: OnceCell<MultiplexedConnection>,
}

impl RedisMetricsSink {
    /// Parse the store URL. Does not connect.
    pub fn new(redis_url: &str) -> Result<Self, HubError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log the URL; it may carry credentials
            tracing::error!(target: "hub.bridge", error = %e, "Failed to open Redis client");
            HubError::Bridge(format!("Failed to open Redis client: {e}"))
        })?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, HubError> {
        self.connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| HubError::Bridge(format!("Failed to connect to Redis: {e}")))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl MetricsSink for RedisMetricsSink {
    async fn push_metrics(
        &self,
        service: &str,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<(), HubError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(metrics_key(service), snapshot, ttl.as_secs().max(1))
            .await
            .map_err(|e| HubError::Bridge(format!("SET {}: {e}", metrics_key(service))))
    }

    async fn push_health(
        &self,
        service: &str,
        summary: &ServiceHealthSummary,
    ) -> Result<(), HubError> {
        let json = serde_json::to_string(summary)
            .map_err(|e| HubError::Bridge(format!("Failed to encode health summary: {e}")))?;
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(health_key(service), json)
            .await
            .map_err(|e| HubError::Bridge(format!("SET {}: {e}", health_key(service))))
    }
}

/// Push the bridged service once.
///
/// Returns `Ok(false)` when the service is not registered (yet).
pub async fn push_once(
    service: &str,
    records: &ServiceRecords,
    sink: &dyn MetricsSink,
    interval: Duration,
) -> Result<bool, HubError> {
    let Some(source) = records.get(service).map(|r| r.source.clone()) else {
        return Ok(false);
    };

    let snapshot = source.metrics_snapshot().await?;
    sink.push_metrics(service, &snapshot, interval * SNAPSHOT_TTL_INTERVALS)
        .await?;

    let summary = source.health_summary().await?;
    sink.push_health(service, &summary).await?;

    Ok(true)
}

/// Spawn the bridge loop for `service`. The first push happens one
/// `interval` after spawn.
pub fn spawn_bridge(
    service: String,
    records: ServiceRecords,
    sink: std::sync::Arc<dyn MetricsSink>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            tracing::info!(
                target: "hub.bridge",
                service = %service,
                interval_secs = interval.as_secs(),
                "Metrics bridge started"
            );

            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = tokio::select! {
                            biased;
                            () = cancel_token.cancelled() => break,
                            outcome = push_once(&service, &records, sink.as_ref(), interval) => outcome,
                        };

                        match outcome {
                            Ok(true) => metrics::record_bridge_push(&service, true),
                            Ok(false) => {
                                tracing::debug!(
                                    target: "hub.bridge",
                                    service = %service,
                                    "Bridged service not registered, skipping push"
                                );
                            }
                            Err(e) => {
                                metrics::record_bridge_push(&service, false);
                                tracing::warn!(
                                    target: "hub.bridge",
                                    service = %service,
                                    error = %e,
                                    "Metrics bridge push failed"
                                );
                            }
                        }
                    }
                }
            }

            tracing::info!(
                target: "hub.bridge",
                service = %service,
                "Metrics bridge received shutdown signal, exiting"
            );
        }
        .instrument(tracing::info_span!("hub.bridge")),
    )
}
