//! HTTP middleware for the collector surface.

pub mod http_metrics;

pub use http_metrics::http_metrics_middleware;
