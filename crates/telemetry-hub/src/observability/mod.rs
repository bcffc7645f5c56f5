//! Observability for the hub itself.
//!
//! Metrics recorded here describe the hub's own behavior (HTTP surface,
//! polling, bridge, lifecycle). Metrics of registered services live in their
//! per-service registries.

pub mod metrics;
