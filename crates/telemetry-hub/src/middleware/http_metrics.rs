//! HTTP self-metrics for the collector surface.
//!
//! Applied outermost, so every response is counted: handler output, guard
//! rejections (`BUSY`, `CIRCUIT_OPEN`), timeouts and unknown paths alike.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, endpoint, status code and latency of each request.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = next.run(request).await;

    record_http_request(
        method.as_str(),
        &path,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::collector::guard::{request_guard_middleware, RequestGuard};
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Sum of `name` counters whose labels include every pair in `labels`.
    fn counter_with(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> u64 {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| {
                let key = key.key();
                key.name() == name
                    && labels.iter().all(|(k, v)| {
                        key.labels().any(|label| label.key() == *k && label.value() == *v)
                    })
            })
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(v) => v,
                _ => 0,
            })
            .sum()
    }

    async fn get_status(app: &Router, uri: &str) -> StatusCode {
        app.clone()
            .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    fn scrape_app(guard: Arc<RequestGuard>) -> Router {
        Router::new()
            .route("/metrics", get(|| async { "# EOF" }))
            .layer(middleware::from_fn_with_state(guard, request_guard_middleware))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    #[tokio::test]
    async fn test_scrape_is_counted_by_endpoint_and_status() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _local = metrics::set_default_local_recorder(&recorder);

        let app = scrape_app(Arc::new(RequestGuard::new(4, 3, Duration::from_secs(30))));
        assert_eq!(get_status(&app, "/metrics").await, StatusCode::OK);
        assert_eq!(get_status(&app, "/metrics").await, StatusCode::OK);

        assert_eq!(
            counter_with(
                &snapshotter,
                "hub_http_requests_total",
                &[("method", "GET"), ("endpoint", "/metrics"), ("status_code", "200")]
            ),
            2
        );
    }

    #[tokio::test]
    async fn test_guard_rejection_is_counted() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _local = metrics::set_default_local_recorder(&recorder);

        let guard = Arc::new(RequestGuard::new(1, 3, Duration::from_secs(30)));
        let app = scrape_app(Arc::clone(&guard));

        // The only permit is taken
        let _held = guard.admit().unwrap();
        assert_eq!(
            get_status(&app, "/metrics").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        assert_eq!(
            counter_with(
                &snapshotter,
                "hub_http_requests_total",
                &[("endpoint", "/metrics"), ("status_code", "503")]
            ),
            1
        );
        assert_eq!(
            counter_with(&snapshotter, "hub_requests_rejected_total", &[("reason", "busy")]),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_bucketed_as_other() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _local = metrics::set_default_local_recorder(&recorder);

        let app = scrape_app(Arc::new(RequestGuard::new(4, 3, Duration::from_secs(30))));
        assert_eq!(
            get_status(&app, "/api/v1/anything").await,
            StatusCode::NOT_FOUND
        );

        assert_eq!(
            counter_with(
                &snapshotter,
                "hub_http_requests_total",
                &[("endpoint", "/other"), ("status_code", "404")]
            ),
            1
        );
        assert_eq!(
            counter_with(&snapshotter, "hub_http_requests_total", &[("endpoint", "/metrics")]),
            0
        );
    }
}
