//! HTTP routes for the collector surface.

use crate::collector::guard::request_guard_middleware;
use crate::collector::UnifiedCollector;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the collector router.
///
/// - `/metrics` - aggregated Prometheus scrape
/// - `/health` - aggregated health JSON
/// - `/services` - registered services and last activity
/// - `/ready` - readiness probe
///
/// Layer order (bottom-to-top execution):
/// 1. TimeoutLayer (innermost)
/// 2. request guard - in-flight cap and circuit breaker
/// 3. TraceLayer
/// 4. http_metrics_middleware (outermost, sees guard rejections too)
pub fn build_routes(collector: Arc<UnifiedCollector>) -> Router {
    let guard = collector.guard();

    Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health_handler))
        .route("/services", get(handlers::services_handler))
        .route("/ready", get(handlers::readiness_handler))
        .with_state(collector)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn_with_state(
            guard,
            request_guard_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::collector::CollectorConfig;
    use crate::facade::ServiceMetrics;
    use crate::health::HealthState;
    use crate::registry::RegistryLabels;
    use axum::{
        body::Body,
        http::{header::CONTENT_TYPE, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn labels(service: &str) -> RegistryLabels {
        RegistryLabels {
            service: service.to_string(),
            environment: "test".to_string(),
            version: "0.1.0".to_string(),
            instance: "hub-test".to_string(),
        }
    }

    fn collector(breaker_threshold: u32) -> Arc<UnifiedCollector> {
        Arc::new(UnifiedCollector::new(
            CollectorConfig {
                allowed_services: ["a", "b"].iter().map(|s| (*s).to_string()).collect(),
                max_concurrent_requests: 8,
                breaker_threshold,
                breaker_cooldown: Duration::from_secs(30),
                labels: labels("telemetry_hub"),
            },
            None,
        ))
    }

    fn facade(service: &str) -> Arc<ServiceMetrics> {
        Arc::new(ServiceMetrics::new(labels(service)).unwrap())
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_prometheus_text() {
        let collector = collector(5);
        let a = facade("a");
        a.track_operation("x", "op", Some(42.0), true, None);
        collector.register_service("a", a).unwrap();
        let app = build_routes(collector);

        let response = get(&app, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );

        let text = body_text(response).await;
        assert!(text.contains("a_operations_total"));
        assert!(text.contains("hub_registered_services"));
    }

    #[tokio::test]
    async fn test_metrics_with_one_failing_service_still_200() {
        let collector = collector(5);
        let a = facade("a");
        let b = facade("b");
        b.track_operation("z", "op", None, true, None);
        collector.register_service("a", a.clone()).unwrap();
        collector.register_service("b", b).unwrap();
        a.shutdown();
        let app = build_routes(collector);

        let response = get(&app, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        assert!(text.contains("b_operations_total"));
        assert!(text.contains("# scrape_error service=\"a\""));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_consecutive_failed_scrapes() {
        let collector = collector(2);
        let a = facade("a");
        collector.register_service("a", a.clone()).unwrap();
        a.shutdown();
        let app = build_routes(collector);

        assert_eq!(get(&app, "/metrics").await.status(), StatusCode::OK);
        assert_eq!(get(&app, "/metrics").await.status(), StatusCode::OK);

        let response = get(&app, "/metrics").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "CIRCUIT_OPEN");
    }

    #[tokio::test]
    async fn test_health_endpoint_unhealthy_returns_503() {
        let collector = collector(5);
        let a = facade("a");
        a.update_component_health("x", HealthState::Healthy);
        a.update_component_health("y", HealthState::Unhealthy);
        let b = facade("b");
        b.update_component_health("z", HealthState::Degraded);
        collector.register_service("a", a).unwrap();
        collector.register_service("b", b).unwrap();
        let app = build_routes(collector);

        let response = get(&app, "/health").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["services"]["a"]["status"], "unhealthy");
        assert_eq!(json["services"]["b"]["status"], "degraded");
    }

    #[tokio::test]
    async fn test_health_endpoint_degraded_returns_200() {
        let collector = collector(5);
        let b = facade("b");
        b.update_component_health("z", HealthState::Degraded);
        collector.register_service("b", b).unwrap();
        let app = build_routes(collector);

        let response = get(&app, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "degraded");
    }

    #[tokio::test]
    async fn test_services_endpoint_lists_names() {
        let collector = collector(5);
        collector.register_service("b", facade("b")).unwrap();
        collector.register_service("a", facade("a")).unwrap();
        let app = build_routes(collector);

        let response = get(&app, "/services").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_ready_before_start_is_503() {
        let app = build_routes(collector(5));
        let response = get(&app, "/ready").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "not_ready");
    }
}
