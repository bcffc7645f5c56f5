//! Telemetry Hub Library
//!
//! Collects metrics and health from independently deployed services and
//! exposes them through one Prometheus scrape endpoint and one aggregated
//! health endpoint.
//!
//! # Modules
//!
//! - `registry` - Per-service metric registry (Prometheus text exposition)
//! - `health` - Health states and threshold derivation
//! - `tracker` - Per-component operation statistics
//! - `facade` - Service metrics facade and the `TelemetrySource` seam
//! - `collector` - Unified scrape/health surface, request guard
//! - `orchestrator` - Lifecycle, registration, health polling, metrics bridge
//! - `config` - Environment configuration
//! - `errors` - Error types
//! - `handlers` / `routes` / `middleware` - HTTP surface
//! - `observability` - Hub self-instrumentation

pub mod collector;
pub mod config;
pub mod errors;
pub mod facade;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod routes;
pub mod tracker;

pub use collector::UnifiedCollector;
pub use config::Config;
pub use errors::HubError;
pub use facade::{ServiceHealthSummary, ServiceMetrics, TelemetrySource};
pub use health::HealthState;
pub use orchestrator::{LifecycleState, Orchestrator};
