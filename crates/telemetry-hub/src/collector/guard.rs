//! Request admission for the collector surface.
//!
//! Two checks run before any handler:
//! - an in-flight cap (`Semaphore::try_acquire_owned`), rejecting with `Busy`
//! - a consecutive-failure circuit breaker, rejecting with `CircuitOpen`
//!
//! Handlers that evaluate services attach an [`Evaluation`] to the response
//! extensions. The guard middleware feeds it to the breaker: any per-service
//! failure counts as one internal error, a clean evaluation resets the count.

use crate::errors::HubError;
use crate::observability::metrics;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until the cool-down elapses.
    Open,
    /// One probe request is admitted to test recovery.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of a request that evaluated registered services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Clean,
    Failed { failures: usize },
}

impl Evaluation {
    #[must_use]
    pub fn from_failures(failures: usize) -> Self {
        if failures == 0 {
            Evaluation::Clean
        } else {
            Evaluation::Failed { failures }
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker with a fixed cool-down.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, moving `Open` to `HalfOpen` once the cool-down elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Admit a request. Returns whether the request is the half-open probe.
    pub fn try_acquire(&self) -> Result<bool, HubError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(HubError::CircuitOpen),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(HubError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Record a clean evaluation.
    ///
    /// While half-open only the probe's outcome counts. While open the
    /// outcome is a stale request admitted before the trip and is ignored.
    pub fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!(target: "hub.collector", "Circuit breaker closed");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Record an evaluation with at least one per-service failure.
    ///
    /// Same staleness rules as [`record_success`](Self::record_success).
    pub fn record_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        let trip = match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.consecutive_failures >= self.failure_threshold
            }
            CircuitState::HalfOpen => probe,
            CircuitState::Open => false,
        };

        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            tracing::warn!(
                target: "hub.collector",
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    /// Give back a half-open probe slot that produced no evaluation.
    pub fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                    tracing::info!(target: "hub.collector", "Circuit breaker half-open");
                }
            }
        }
    }
}

/// Held for the lifetime of an admitted request.
///
/// Dropping an unsettled probe admission (client gone, future cancelled)
/// hands the half-open slot back to the breaker.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl Admission {
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            tracing::debug!(target: "hub.collector", "Half-open probe abandoned");
            self.breaker.release_probe();
        }
    }
}

/// In-flight cap plus circuit breaker.
#[derive(Debug)]
pub struct RequestGuard {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    breaker: Arc<CircuitBreaker>,
}

impl RequestGuard {
    pub fn new(max_in_flight: usize, failure_threshold: u32, cooldown: Duration) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            breaker: Arc::new(CircuitBreaker::new(failure_threshold, cooldown)),
        }
    }

    /// Admit a request or fail fast.
    pub fn admit(&self) -> Result<Admission, HubError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| HubError::Busy)?;
        let probe = self.breaker.try_acquire()?;

        Ok(Admission {
            _permit: permit,
            breaker: Arc::clone(&self.breaker),
            probe,
            settled: false,
        })
    }

    /// Feed an evaluation outcome to the breaker and release the admission.
    pub fn complete(&self, mut admission: Admission, evaluation: Option<Evaluation>) {
        let probe = admission.is_probe();
        match evaluation {
            Some(Evaluation::Clean) => self.breaker.record_success(probe),
            Some(Evaluation::Failed { .. }) => self.breaker.record_failure(probe),
            None if probe => self.breaker.release_probe(),
            None => {}
        }
        admission.settled = true;
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.permits.available_permits())
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

/// Middleware enforcing the request guard.
pub async fn request_guard_middleware(
    State(guard): State<Arc<RequestGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let admission = match guard.admit() {
        Ok(admission) => admission,
        Err(e) => {
            metrics::record_request_rejected(e.error_type());
            tracing::debug!(
                target: "hub.collector",
                path = %request.uri().path(),
                reason = e.error_type(),
                "Request rejected"
            );
            return e.into_response();
        }
    };

    let response = next.run(request).await;
    let evaluation = response.extensions().get::<Evaluation>().copied();
    guard.complete(admission, evaluation);

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure(false);
        breaker.record_failure(false);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure(false);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Err(HubError::CircuitOpen)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure(false);
        breaker.record_failure(false);
        breaker.record_success(false);
        breaker.record_failure(false);
        breaker.record_failure(false);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure(false);
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // One probe only
        assert!(breaker.try_acquire().unwrap());
        assert!(matches!(breaker.try_acquire(), Err(HubError::CircuitOpen)));

        breaker.record_success(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.try_acquire().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.record_failure(false);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(breaker.try_acquire().unwrap());
        breaker.record_failure(true);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_without_evaluation_is_released() {
        let guard = RequestGuard::new(4, 1, Duration::from_secs(10));
        guard.breaker().record_failure(false);
        tokio::time::advance(Duration::from_secs(11)).await;

        let admission = guard.admit().unwrap();
        assert!(admission.is_probe());
        guard.complete(admission, None);

        let admission = guard.admit().unwrap();
        assert!(admission.is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_admission_frees_half_open_slot() {
        let guard = RequestGuard::new(4, 1, Duration::from_secs(10));
        guard.breaker().record_failure(false);
        tokio::time::advance(Duration::from_secs(11)).await;

        let probe = guard.admit().unwrap();
        assert!(probe.is_probe());
        assert!(matches!(guard.admit(), Err(HubError::CircuitOpen)));

        // Request future cancelled before an evaluation was produced
        drop(probe);

        let next = guard.admit().unwrap();
        assert!(next.is_probe());
        guard.complete(next, Some(Evaluation::Clean));
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_does_not_wedge_half_open() {
        use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
        use tower::ServiceExt;

        async fn hang() -> Response {
            std::future::pending::<()>().await;
            StatusCode::OK.into_response()
        }

        async fn clean() -> Response {
            let mut response = StatusCode::OK.into_response();
            response.extensions_mut().insert(Evaluation::Clean);
            response
        }

        let guard = Arc::new(RequestGuard::new(4, 1, Duration::from_millis(50)));
        let app = Router::new()
            .route("/hang", get(hang))
            .route("/clean", get(clean))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&guard),
                request_guard_middleware,
            ));
        let request = |uri: &str| {
            axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };

        guard.breaker().record_failure(false);
        tokio::time::advance(Duration::from_millis(60)).await;

        // The probe hangs and the client gives up
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), app.clone().oneshot(request("/hang")))
                .await;
        assert!(abandoned.is_err());
        assert_eq!(guard.breaker().state(), CircuitState::HalfOpen);

        let response = app.clone().oneshot(request("/clean")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_success_does_not_skip_cooldown() {
        let guard = RequestGuard::new(8, 1, Duration::from_secs(30));
        let early = guard.admit().unwrap();
        let late = guard.admit().unwrap();

        guard.complete(late, Some(Evaluation::from_failures(1)));
        assert_eq!(guard.breaker().state(), CircuitState::Open);

        // Admitted before the trip, finishes clean afterwards
        guard.complete(early, Some(Evaluation::Clean));
        assert_eq!(guard.breaker().state(), CircuitState::Open);
        assert!(matches!(guard.admit(), Err(HubError::CircuitOpen)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(guard.admit().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_half_open_trial_settles_breaker() {
        let guard = RequestGuard::new(8, 1, Duration::from_secs(10));
        let straggler = guard.admit().unwrap();
        guard.breaker().record_failure(false);
        tokio::time::advance(Duration::from_secs(11)).await;

        let probe = guard.admit().unwrap();
        assert!(probe.is_probe());

        guard.complete(straggler, Some(Evaluation::Clean));
        assert_eq!(guard.breaker().state(), CircuitState::HalfOpen);
        assert!(matches!(guard.admit(), Err(HubError::CircuitOpen)));

        guard.complete(probe, Some(Evaluation::Clean));
        assert_eq!(guard.breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn test_guard_rejects_beyond_cap() {
        let guard = RequestGuard::new(2, 5, Duration::from_secs(30));
        let first = guard.admit().unwrap();
        let _second = guard.admit().unwrap();
        assert_eq!(guard.in_flight(), 2);

        assert!(matches!(guard.admit(), Err(HubError::Busy)));

        drop(first);
        assert!(guard.admit().is_ok());
    }

    #[test]
    fn test_guard_complete_feeds_breaker() {
        let guard = RequestGuard::new(8, 2, Duration::from_secs(30));
        for _ in 0..2 {
            let admission = guard.admit().unwrap();
            guard.complete(admission, Some(Evaluation::from_failures(1)));
        }
        assert_eq!(guard.breaker().state(), CircuitState::Open);
        assert!(matches!(guard.admit(), Err(HubError::CircuitOpen)));
    }

    #[test]
    fn test_evaluation_from_failures() {
        assert_eq!(Evaluation::from_failures(0), Evaluation::Clean);
        assert_eq!(
            Evaluation::from_failures(2),
            Evaluation::Failed { failures: 2 }
        );
    }
}
