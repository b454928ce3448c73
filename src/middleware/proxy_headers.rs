//! Forwarded-header normalization.
//!
//! Appends the client address to `X-Forwarded-For`, and fills in
//! `X-Forwarded-Proto` / `X-Forwarded-Host` only when an upstream proxy
//! has not already set them.

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::net::SocketAddr;
use tower::{Layer, Service};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

#[derive(Debug, Clone, Default)]
pub struct ProxyHeadersLayer;

impl ProxyHeadersLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ProxyHeadersLayer {
    type Service = ProxyHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProxyHeadersService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyHeadersService<S> {
    inner: S,
}

impl<S> Service<Request> for ProxyHeadersService<S>
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

    fn call(&mut self, mut request: Request) -> Self::Future {
        apply_forwarded_headers(&mut request);
        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}

fn apply_forwarded_headers(request: &mut Request) {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    if let Some(ip) = client_ip {
        let value = match request.headers().get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            request.headers_mut().insert(X_FORWARDED_FOR, value);
        }
    }

    // TLS is terminated upstream of this listener; locally it is always http.
    if !request.headers().contains_key(X_FORWARDED_PROTO) {
        request
            .headers_mut()
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !request.headers().contains_key(X_FORWARDED_HOST) {
        if let Some(host) = request.headers().get(header::HOST).cloned() {
            request.headers_mut().insert(X_FORWARDED_HOST, host);
        }
    }
}
