//! Circuit breaking on downstream failures.
//!
//! A three-state machine guarded by a single mutex. A request fails iff
//! the downstream status is 500 or above. Closed passes everything and
//! counts consecutive failures; Open rejects with 503 until the open
//! timeout elapses; HalfOpen admits exactly one probe whose outcome
//! decides the next state.

use crate::core::error::GatewayError;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    probing: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    open_timeout: Duration,
    /// Budget for a single half-open probe; informational for callers that
    /// wrap probes in their own deadline.
    half_open_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_timeout: Duration, half_open_timeout: Duration) -> Self {
        let threshold = if threshold == 0 { 5 } else { threshold };
        Self {
            threshold,
            open_timeout,
            half_open_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                probing: false,
            }),
        }
    }

    pub fn half_open_timeout(&self) -> Duration {
        self.half_open_timeout
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Admission decision. Constant-time under the mutex.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed_open = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.open_timeout)
                    .unwrap_or(true);
                if !elapsed_open {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.probing = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.probing {
                    return false;
                }
                inner.probing = true;
                true
            }
        }
    }

    /// Record the downstream outcome of an admitted request.
    pub fn on_result(&self, success: bool) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::HalfOpen => {
                if success {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                } else {
                    inner.state = BreakerState::Open;
                    inner.last_failure = Some(Instant::now());
                }
                inner.probing = false;
            }
            BreakerState::Closed => {
                if success {
                    inner.failures = 0;
                } else {
                    inner.failures += 1;
                    inner.last_failure = Some(Instant::now());
                    if inner.failures >= self.threshold {
                        inner.state = BreakerState::Open;
                    }
                }
            }
            // Open never admits, so results cannot arrive here.
            BreakerState::Open => {}
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> Service<Request> for CircuitBreakerService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let breaker = Arc::clone(&self.breaker);
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if !breaker.allow() {
                return Ok(GatewayError::CircuitOpen.into_response());
            }
            let response = inner.call(request).await?;
            breaker.on_result(response.status().as_u16() < 500);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tower::ServiceExt;

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10), Duration::from_secs(5));
        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.on_result(false);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10), Duration::from_secs(5));
        breaker.on_result(false);
        breaker.on_result(false);
        breaker.on_result(true);
        breaker.on_result(false);
        breaker.on_result(false);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_single_probe_after_open_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20), Duration::from_secs(5));
        assert!(breaker.allow());
        breaker.on_result(false);
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(30));
        // Exactly one probe admitted.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow());

        breaker.on_result(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10), Duration::from_secs(5));
        assert!(breaker.allow());
        breaker.on_result(false);
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow());
        breaker.on_result(false);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[tokio::test]
    async fn test_middleware_short_circuits_without_calling_next() {
        let calls = Arc::new(AtomicU64::new(0));
        let breaker = Arc::new(CircuitBreaker::new(
            3,
            Duration::from_secs(10),
            Duration::from_secs(5),
        ));
        let call_count = calls.clone();
        let service = CircuitBreakerLayer::new(breaker.clone()).layer(
            tower::util::BoxCloneService::new(tower::service_fn(move |_request: Request| {
                let calls = call_count.clone();
                async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, Infallible>(
                        StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    )
                }
            })),
        );

        for _ in 0..3 {
            let response = service
                .clone()
                .oneshot(Request::builder().body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);

        // The 4th request inside the open window is rejected before `next`.
        let response = service
            .clone()
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}
