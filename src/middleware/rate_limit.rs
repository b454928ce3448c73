//! Global token-bucket rate limiting.
//!
//! Two admission modes: non-blocking (reject immediately with 429 and
//! `Retry-After: 1`) and bounded-wait (wait for a token under a deadline,
//! then 429). A refill rate or burst of zero disables the limiter.

use crate::core::error::GatewayError;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

/// Admission mode for the middleware.
#[derive(Debug, Clone, Copy)]
pub enum RateLimitMode {
    /// Reject immediately when no token is available.
    Allow,
    /// Wait up to the given deadline for a token.
    Wait(Duration),
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe global token bucket. `None` state means disabled.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    /// `rps <= 0` or `burst == 0` builds a passthrough limiter.
    pub fn new(rps: f64, burst: u32) -> Self {
        if rps <= 0.0 || burst == 0 {
            return Self {
                capacity: 0.0,
                refill_per_sec: 0.0,
                bucket: None,
            };
        }
        Self {
            capacity: f64::from(burst),
            refill_per_sec: rps,
            bucket: Some(Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Take one token without waiting.
    pub fn try_acquire(&self) -> bool {
        let Some(bucket) = &self.bucket else {
            return true;
        };
        let mut bucket = bucket.lock().expect("rate limiter lock");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, waiting up to `max_wait` for the bucket to refill.
    pub async fn acquire_within(&self, max_wait: Duration) -> bool {
        if self.bucket.is_none() {
            return true;
        }
        let deadline = Instant::now() + max_wait;
        loop {
            if self.try_acquire() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Sleep until roughly one token has accumulated, bounded by the
            // remaining deadline.
            let next_token = Duration::from_secs_f64(1.0 / self.refill_per_sec);
            tokio::time::sleep(next_token.min(deadline - now)).await;
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    mode: RateLimitMode,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, mode: RateLimitMode) -> Self {
        Self { limiter, mode }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            mode: self.mode,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    mode: RateLimitMode,
}

impl<S> Service<Request> for RateLimitService<S>
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
        let limiter = Arc::clone(&self.limiter);
        let mode = self.mode;
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if limiter.is_enabled() {
                let admitted = match mode {
                    RateLimitMode::Allow => limiter.try_acquire(),
                    RateLimitMode::Wait(max_wait) => limiter.acquire_within(max_wait).await,
                };
                if !admitted {
                    return Ok(GatewayError::RateLimited.into_response());
                }
            }
            inner.call(request).await
        })
    }
}
