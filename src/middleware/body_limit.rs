//! Request body size limiting.
//!
//! A declared `Content-Length` beyond the cap is refused with 413 before
//! any body byte is read. Bodies without a trustworthy length are wrapped
//! in a streaming cap, so an over-read downstream surfaces as 413 instead
//! of buffering without bound.

use crate::core::error::GatewayError;
use axum::body::Body;
use axum::extract::Request;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{LengthLimitError, Limited};
use std::convert::Infallible;
use tower::{Layer, Service};

/// Layer enforcing a maximum request body size. `max_bytes == 0` disables
/// the limit entirely.
#[derive(Debug, Clone)]
pub struct BodyLimitLayer {
    max_bytes: usize,
}

impl BodyLimitLayer {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl<S> Layer<S> for BodyLimitLayer {
    type Service = BodyLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BodyLimitService {
            inner,
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BodyLimitService<S> {
    inner: S,
    max_bytes: usize,
}

impl<S> Service<Request> for BodyLimitService<S>
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
        if self.max_bytes == 0 {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(request).await });
        }

        // Refuse early when the declared length already exceeds the cap.
        if let Some(length) = content_length(&request) {
            if length > self.max_bytes as u64 {
                return Box::pin(async move {
                    Ok(GatewayError::PayloadTooLarge.into_response())
                });
            }
        }

        let max_bytes = self.max_bytes;
        let request = request.map(|body| Body::new(Limited::new(body, max_bytes)));
        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}

fn content_length(request: &Request) -> Option<u64> {
    request
        .headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Buffer a request body completely. The streaming cap installed by
/// [`BodyLimitLayer`] turns an over-read into 413; other read failures are
/// 400.
pub async fn read_full_body(body: Body) -> Result<Bytes, GatewayError> {
    axum::body::to_bytes(body, usize::MAX).await.map_err(|e| {
        if is_length_limit(&e) {
            GatewayError::PayloadTooLarge
        } else {
            GatewayError::bad_request("failed to read body", e)
        }
    })
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    async fn drain_handler(request: Request) -> Result<Response, Infallible> {
        match read_full_body(request.into_body()).await {
            Ok(bytes) => Ok(format!("read {} bytes", bytes.len()).into_response()),
            Err(e) => Ok(e.into_response()),
        }
    }

    fn limited_service(max: usize) -> BodyLimitService<tower::util::BoxCloneService<Request, Response, Infallible>> {
        BodyLimitLayer::new(max).layer(tower::util::BoxCloneService::new(
            tower::service_fn(drain_handler),
        ))
    }

    #[tokio::test]
    async fn test_declared_oversize_is_rejected_without_reading() {
        let service = limited_service(16);
        let request = Request::builder()
            .header(header::CONTENT_LENGTH, "1024")
            .body(Body::from(vec![b'x'; 1024]))
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_streaming_overread_yields_413() {
        let service = limited_service(16);
        // No Content-Length header: the streaming cap has to catch it.
        let request = Request::builder().body(Body::from(vec![b'x'; 64])).unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_body_within_limit_passes() {
        let service = limited_service(64);
        let request = Request::builder()
            .header(header::CONTENT_LENGTH, "5")
            .body(Body::from("hello"))
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_zero_limit_is_passthrough() {
        let service = limited_service(0);
        let request = Request::builder()
            .body(Body::from(vec![b'x'; 1 << 20]))
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
