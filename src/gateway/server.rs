//! # HTTP Server Assembly
//!
//! Wires the reserved paths, the middleware stack, and the pass-through
//! dispatch into one axum application.
//!
//! Reserved paths: `GET /sid/gateway/hello` (liveness), `GET|POST /gateway`
//! and `/gateway/*` (dynamic policy gateway). Everything else falls through
//! to the code-registered route table, then the YAML-declared table, and is
//! proxied upstream. Correlation weaving applies only to the pass-through
//! path; the dynamic gateway originates its own correlation.

use crate::core::config::GatewayConfig;
use crate::core::error::GatewayError;
use crate::correlation::FW_SESSION_HEADER;
use crate::gateway::dynamic::DynamicGateway;
use crate::middleware::{
    read_full_body, AccessLogLayer, BodyLimitLayer, CircuitBreaker, CircuitBreakerLayer,
    CorrelationLayer, ProxyHeadersLayer, RateLimitLayer, RateLimitMode, RateLimiter,
};
use crate::proxy::{ProxyRequest, ReverseProxy};
use crate::routing::{build_upstream_path, RegisteredOptions, Route, RouteTable};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared state for all handlers. The composition root owns the tables,
/// the proxy, and the dynamic gateway for process lifetime.
#[derive(Clone)]
pub struct AppState {
    /// Code-registered routes, consulted first.
    pub registered: Arc<RouteTable>,
    pub registered_options: Arc<HashMap<String, RegisteredOptions>>,
    /// YAML-declared routes.
    pub table: Arc<RouteTable>,
    pub rproxy: Arc<ReverseProxy>,
    pub dynamic: Arc<DynamicGateway>,
}

/// Knobs for the middleware stack, taken from the server config section.
pub struct MiddlewareSettings {
    pub max_body_bytes: usize,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,
    pub breaker_threshold: u32,
    pub breaker_open_timeout: Duration,
    pub breaker_half_open_timeout: Duration,
    pub biz_code: String,
}

impl MiddlewareSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_body_bytes: config.server.max_body_bytes,
            rate_limit_rps: config.server.rate_limit_rps,
            rate_limit_burst: config.server.rate_limit_burst,
            breaker_threshold: config.server.breaker_threshold,
            breaker_open_timeout: Duration::from_millis(config.server.breaker_open_timeout_ms),
            breaker_half_open_timeout: Duration::from_millis(
                config.server.breaker_half_open_timeout_ms,
            ),
            biz_code: config.application.biz_code.clone(),
        }
    }
}

/// Assemble the application router with the full middleware stack.
pub fn build_app(state: AppState, settings: MiddlewareSettings) -> Router {
    let breaker = Arc::new(CircuitBreaker::new(
        settings.breaker_threshold,
        settings.breaker_open_timeout,
        settings.breaker_half_open_timeout,
    ));
    let limiter = Arc::new(RateLimiter::new(
        settings.rate_limit_rps,
        settings.rate_limit_burst,
    ));

    // Correlation weaving wraps only the pass-through path.
    let passthrough = Router::new()
        .fallback(passthrough_handler)
        .layer(CorrelationLayer::new(settings.biz_code.clone()))
        .with_state(state.clone());

    Router::new()
        .route("/sid/gateway/hello", get(hello))
        .route("/gateway", any(dynamic_handler))
        .route("/gateway/*rest", any(dynamic_handler))
        .with_state(state)
        .fallback_service(passthrough)
        .layer(CircuitBreakerLayer::new(breaker))
        .layer(RateLimitLayer::new(limiter, RateLimitMode::Allow))
        .layer(BodyLimitLayer::new(settings.max_body_bytes))
        .layer(ProxyHeadersLayer::new())
        .layer(AccessLogLayer::new())
}

/// Liveness probe.
async fn hello() -> &'static str {
    "ok"
}

/// Reserved-path entry into the dynamic policy gateway.
async fn dynamic_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match read_full_body(body).await {
        Ok(bytes) => bytes,
        Err(e) => return e.into_response(),
    };
    state
        .dynamic
        .handle(parts.method, parts.uri, parts.headers, body)
        .await
}

/// Pass-through dispatch: match the code-registered table, then the YAML
/// table, and proxy upstream.
async fn passthrough_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let registered = state
        .registered
        .match_route(&parts.method, &path)
        .map(|(route, params)| (route, params, true));
    let matched = registered.or_else(|| {
        state
            .table
            .match_route(&parts.method, &path)
            .map(|(route, params)| (route, params, false))
    });

    let Some((route, params, from_registry)) = matched else {
        return GatewayError::not_found("not found url", "").into_response();
    };
    debug!(route = %route.name, %path, "pass-through route matched");

    let mut headers = parts.headers;

    // Session policy declared on the route descriptor.
    if route.options.require_session && !headers.contains_key(FW_SESSION_HEADER) {
        return GatewayError::upstream("missing X-Fw-Session-Id", "session header required")
            .into_response();
    }
    if route.options.generate_if_missing && !headers.contains_key(FW_SESSION_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert(FW_SESSION_HEADER, value);
        }
    }

    let body = match read_full_body(body).await {
        Ok(bytes) => bytes,
        Err(e) => return e.into_response(),
    };

    // Options attached to code-registered routes.
    let options = if from_registry {
        state.registered_options.get(&route.name)
    } else {
        None
    };
    if let Some(options) = options {
        if let Some(validator) = &options.validate_json {
            if !body.is_empty() {
                if let Err(reason) = validator(&body) {
                    return GatewayError::bad_request(
                        format!("validation failed: {reason}"),
                        "",
                    )
                    .into_response();
                }
            }
        }
    }

    let upstream_method = upstream_method(route, &parts.method);
    let upstream_path = build_upstream_path(route, &path, &params);
    let raw_query = parts.uri.query().map(str::to_owned);

    if options.map(|o| o.async_ack).unwrap_or(false) {
        // Acknowledge now, proxy in the background, discard the response.
        let state = state.clone();
        let route_name = route.name.clone();
        let scheme = route.backend.scheme.clone();
        let host = route.backend.host.clone();
        tokio::spawn(async move {
            let _ = state
                .rproxy
                .proxy(ProxyRequest {
                    route_name: &route_name,
                    scheme: &scheme,
                    host: &host,
                    upstream_path: &upstream_path,
                    raw_query: raw_query.as_deref(),
                    method: upstream_method,
                    headers: &headers,
                    body,
                    params: &params,
                })
                .await;
        });
        return StatusCode::ACCEPTED.into_response();
    }

    state
        .rproxy
        .proxy(ProxyRequest {
            route_name: &route.name,
            scheme: &route.backend.scheme,
            host: &route.backend.host,
            upstream_path: &upstream_path,
            raw_query: raw_query.as_deref(),
            method: upstream_method,
            headers: &headers,
            body,
            params: &params,
        })
        .await
}

/// Backend method override falls back to the client method.
fn upstream_method(route: &Route, client_method: &Method) -> Method {
    let configured = route.backend.method.trim();
    if configured.is_empty() {
        return client_method.clone();
    }
    configured
        .to_uppercase()
        .parse()
        .unwrap_or_else(|_| client_method.clone())
}
