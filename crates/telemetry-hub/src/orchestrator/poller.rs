//! Periodic health polling.
//!
//! Each cycle queries every registered service's health summary, folds the
//! outcome into its registration record and broadcasts one
//! [`HubEvent::HealthChecked`] per service. A failing query marks only that
//! service unhealthy for the cycle.
//!
//! # Graceful Shutdown
//!
//! The loop exits when its cancellation token fires, including in the middle
//! of a cycle, so shutdown never waits on a hung health query.

use crate::facade::TelemetrySource;
use crate::observability::metrics;
use crate::orchestrator::events::{HealthCheckResult, HubEvent};
use crate::orchestrator::ServiceRecords;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Query every source once. Results keep the input order.
pub async fn run_health_cycle(
    sources: &[(String, Arc<dyn TelemetrySource>)],
) -> Vec<HealthCheckResult> {
    join_all(sources.iter().map(|(name, source)| async move {
        match source.health_summary().await {
            Ok(summary) => HealthCheckResult::from_summary(&summary),
            Err(e) => {
                tracing::warn!(
                    target: "hub.poller",
                    service = %name,
                    error = %e,
                    "Health query failed, marking unhealthy for this cycle"
                );
                HealthCheckResult::failed(name.clone(), e.to_string())
            }
        }
    }))
    .await
}

/// Fold cycle results into the registration records.
pub fn apply_health_results(records: &ServiceRecords, results: &[HealthCheckResult]) {
    for result in results {
        if let Some(mut record) = records.get_mut(&result.service) {
            record.health = result.status;
            record.last_checked = Some(result.timestamp);
            record.metrics_count = record.source.metrics_count();
            record.component_count = record.source.component_count();
            if let Some(activity) = record.source.last_activity() {
                record.last_activity = Some(activity);
            }
        }
    }
}

/// Run one full polling cycle: query, update records, emit events.
pub async fn poll_once(
    records: &ServiceRecords,
    events: &broadcast::Sender<HubEvent>,
) -> Vec<HealthCheckResult> {
    let start = Instant::now();
    let mut sources: Vec<(String, Arc<dyn TelemetrySource>)> = records
        .iter()
        .map(|entry| (entry.key().clone(), Arc::clone(&entry.value().source)))
        .collect();
    sources.sort_by(|a, b| a.0.cmp(&b.0));

    let results = run_health_cycle(&sources).await;
    apply_health_results(records, &results);

    let failed: Vec<String> = results
        .iter()
        .filter(|r| r.is_failure())
        .map(|r| r.service.clone())
        .collect();
    metrics::record_health_poll(start.elapsed(), &failed);

    for result in &results {
        tracing::debug!(
            target: "hub.poller",
            service = %result.service,
            status = %result.status,
            components = result.components.len(),
            "Health checked"
        );
        // No subscribers is fine
        let _ = events.send(HubEvent::HealthChecked(result.clone()));
    }

    tracing::debug!(
        target: "hub.poller",
        services = results.len(),
        failures = failed.len(),
        at = %Utc::now(),
        "Health cycle complete"
    );

    results
}

/// Spawn the polling loop. The first cycle runs one `period` after spawn.
pub fn spawn_health_poller(
    records: ServiceRecords,
    events: broadcast::Sender<HubEvent>,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            tracing::info!(
                target: "hub.poller",
                interval_secs = period.as_secs(),
                "Health poller started"
            );

            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            biased;
                            () = cancel_token.cancelled() => break,
                            _ = poll_once(&records, &events) => {}
                        }
                    }
                }
            }

            tracing::info!(
                target: "hub.poller",
                "Health poller received shutdown signal, exiting"
            );
        }
        .instrument(tracing::info_span!("hub.poller")),
    )
}
