//! In-memory metrics bridge sink.
//!
//! Records every push so tests can assert on what the bridge would have
//! written to the key-value store, keyed the same way.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use telemetry_hub::facade::ServiceHealthSummary;
use telemetry_hub::orchestrator::bridge::{health_key, metrics_key, MetricsSink};
use telemetry_hub::HubError;

/// One stored value and its expiry, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: String,
    pub ttl: Option<Duration>,
}

/// Mock bridge sink backed by a map.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<HashMap<String, StoredValue>>,
    pushes: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every push fail (or succeed again).
    pub fn fail_pushes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Value currently stored under `key`.
    pub fn get(&self, key: &str) -> Option<StoredValue> {
        self.entries.lock().get(key).cloned()
    }

    /// Last metrics snapshot pushed for `service`.
    pub fn metrics_for(&self, service: &str) -> Option<StoredValue> {
        self.get(&metrics_key(service))
    }

    /// Last health summary pushed for `service`.
    pub fn health_for(&self, service: &str) -> Option<ServiceHealthSummary> {
        self.get(&health_key(service))
            .and_then(|stored| serde_json::from_str(&stored.value).ok())
    }

    /// Keys written so far, in push order (repeats included).
    pub fn pushed_keys(&self) -> Vec<String> {
        self.pushes.lock().clone()
    }

    fn store(&self, key: String, value: String, ttl: Option<Duration>) -> Result<(), HubError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HubError::Bridge(format!("SET {key}: mock store unavailable")));
        }

        self.pushes.lock().push(key.clone());
        self.entries.lock().insert(key, StoredValue { value, ttl });
        Ok(())
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn push_metrics(
        &self,
        service: &str,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<(), HubError> {
        self.store(metrics_key(service), snapshot.to_string(), Some(ttl))
    }

    async fn push_health(
        &self,
        service: &str,
        summary: &ServiceHealthSummary,
    ) -> Result<(), HubError> {
        let json = serde_json::to_string(summary)
            .map_err(|e| HubError::Bridge(format!("Failed to encode health summary: {e}")))?;
        self.store(health_key(service), json, None)
    }
}
