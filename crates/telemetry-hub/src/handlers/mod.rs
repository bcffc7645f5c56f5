//! HTTP request handlers for the collector surface.

pub mod health;
pub mod metrics;

pub use health::{health_handler, readiness_handler, services_handler};
pub use metrics::metrics_handler;
