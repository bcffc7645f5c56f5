//! The query seam between services and the hub.

use crate::errors::HubError;
use crate::facade::ServiceHealthSummary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Anything the collector can scrape and the orchestrator can poll.
///
/// [`ServiceMetrics`](crate::facade::ServiceMetrics) is the in-process
/// implementation. Query methods may fail; the collector and poller isolate
/// such failures to the one service.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Name the source registers under.
    fn service_name(&self) -> &str;

    /// Current aggregate and per-component health. Never cached.
    async fn health_summary(&self) -> Result<ServiceHealthSummary, HubError>;

    /// Prometheus text snapshot of every metric the source owns.
    async fn metrics_snapshot(&self) -> Result<String, HubError>;

    /// Number of metric families defined.
    fn metrics_count(&self) -> usize;

    /// Number of tracked components.
    fn component_count(&self) -> usize;

    /// Time of the most recent tracked activity, if any.
    fn last_activity(&self) -> Option<DateTime<Utc>>;

    /// Release resources. Further tracking is accepted but not recorded.
    async fn shutdown(&self);
}
