//! # Reverse Proxy
//!
//! Issues one upstream HTTP call for a matched pass-through route and
//! streams the response back. The request body is materialized (bounded by
//! the body-limit middleware) so `Content-Length` is exact and the
//! route-specific transforms can rewrite it. Hop-by-hop headers are
//! stripped in both directions of the upstream exchange.

pub mod transforms;

use crate::correlation::{self, FW_HEADER, FW_SESSION_HEADER};
use crate::core::error::GatewayError;
use crate::routing::PathParams;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

pub use transforms::{BodyTransform, TransformInput, TransformOutcome, TransformTable};

/// Hop-by-hop headers never forwarded upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Build the shared outbound client: pooled connections, eager connect
/// timeout, keep-alive tuned for a steady internal fleet.
pub fn build_client(total_timeout: Duration) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(32)
        .timeout(total_timeout)
        .build()
        .map_err(GatewayError::from)
}

/// Everything the proxy needs for one dispatch.
pub struct ProxyRequest<'a> {
    pub route_name: &'a str,
    pub scheme: &'a str,
    pub host: &'a str,
    pub upstream_path: &'a str,
    pub raw_query: Option<&'a str>,
    pub method: Method,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub params: &'a PathParams,
}

pub struct ReverseProxy {
    client: reqwest::Client,
    transforms: TransformTable,
}

impl ReverseProxy {
    pub fn new(client: reqwest::Client, transforms: TransformTable) -> Self {
        Self { client, transforms }
    }

    /// Dispatch one upstream call and stream the response to the client.
    /// Transport failures become a 502 envelope.
    pub async fn proxy(&self, request: ProxyRequest<'_>) -> Response {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    async fn dispatch(&self, request: ProxyRequest<'_>) -> Result<Response, GatewayError> {
        // Route-specific body rewrite, if registered.
        let (body, session_id) = match self.transforms.get(request.route_name) {
            Some(transform) => {
                let outcome = transform(&TransformInput {
                    body: &request.body,
                    headers: request.headers,
                    params: request.params,
                })?;
                (outcome.body, outcome.session_id)
            }
            None => (request.body.clone(), None),
        };

        let mut url = format!(
            "{}://{}{}",
            request.scheme, request.host, request.upstream_path
        );
        if let Some(query) = request.raw_query {
            if !query.is_empty() {
                url.push('?');
                url.push_str(query);
            }
        }

        let mut upstream_headers = filter_hop_headers(request.headers);
        // A materialized body carries an exact length; stale framing must go.
        upstream_headers.remove(header::CONTENT_LENGTH);
        upstream_headers.remove(header::HOST);

        debug!(route = request.route_name, %url, method = %request.method, "proxying upstream");

        let mut builder = self
            .client
            .request(request.method, &url)
            .headers(upstream_headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let upstream = builder.send().await.map_err(|e| {
            warn!(route = request.route_name, error = %e, "upstream dispatch failed");
            GatewayError::upstream("upstream request failed", e)
        })?;

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            response_headers.append(name.clone(), value.clone());
        }

        // The response hop counter reflects this gateway.
        let fw_raw = upstream
            .headers()
            .get(FW_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if let Ok(value) = HeaderValue::from_str(&correlation::bump_srno(fw_raw)) {
            response_headers.insert(FW_HEADER, value);
        }
        if let Some(session) = session_id {
            if let Ok(value) = HeaderValue::from_str(&session) {
                response_headers.insert(FW_SESSION_HEADER, value);
            }
        }

        let mut response = Response::builder()
            .status(status)
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::internal(format!("failed to build response: {e}")))?;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Copy a header map without the hop-by-hop set.
pub fn filter_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}
