//! # Middleware Pipeline
//!
//! Composable tower layers wrapping the dispatch path: body-size limiting,
//! forwarded-header normalization, correlation header weaving, token-bucket
//! rate limiting, circuit breaking, and access logging. Each middleware
//! either handles its failure locally (413/429/503) or passes the request
//! through untouched.

pub mod access_log;
pub mod body_limit;
pub mod circuit_breaker;
pub mod correlation;
pub mod proxy_headers;
pub mod rate_limit;

pub use access_log::AccessLogLayer;
pub use body_limit::{read_full_body, BodyLimitLayer};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerLayer};
pub use correlation::CorrelationLayer;
pub use proxy_headers::ProxyHeadersLayer;
pub use rate_limit::{RateLimitLayer, RateLimitMode, RateLimiter};
