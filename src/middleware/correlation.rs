//! Correlation header weaving for pass-through routes.
//!
//! Inbound: fills in the missing `X-Fw-Header` fields, preserving an
//! existing `TCID` across hops. Outbound: replaces the response
//! `X-Fw-Header` with the bumped serial of the value woven at request
//! time. This is the single place pass-through traffic increments the hop
//! counter; the dynamic gateway performs its own bump.

use crate::correlation::{self, FW_HEADER};
use axum::extract::Request;
use axum::http::{header, HeaderValue};
use axum::response::Response;
use futures::future::BoxFuture;
use std::convert::Infallible;
use tower::{Layer, Service};

#[derive(Debug, Clone)]
pub struct CorrelationLayer {
    biz_code: String,
}

impl CorrelationLayer {
    pub fn new(biz_code: impl Into<String>) -> Self {
        Self {
            biz_code: biz_code.into(),
        }
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationService {
            inner,
            biz_code: self.biz_code.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationService<S> {
    inner: S,
    biz_code: String,
}

impl<S> Service<Request> for CorrelationService<S>
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
        let raw = request
            .headers()
            .get(FW_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let enhanced = correlation::ensure_for_request(&raw, &self.biz_code, &host);
        if let Ok(value) = HeaderValue::from_str(&enhanced) {
            request.headers_mut().insert(FW_HEADER, value);
        }

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut response = inner.call(request).await?;
            // Hop counter reflects this gateway on the way out.
            let bumped = correlation::bump_srno(&enhanced);
            if let Ok(value) = HeaderValue::from_str(&bumped) {
                response.headers_mut().insert(FW_HEADER, value);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::FwHeaderBag;
    use axum::body::Body;
    use axum::response::IntoResponse;
    use tower::ServiceExt;

    async fn echo_fw_header(request: Request) -> Result<Response, Infallible> {
        let raw = request
            .headers()
            .get(FW_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Ok(raw.into_response())
    }

    fn service() -> CorrelationService<tower::util::BoxCloneService<Request, Response, Infallible>>
    {
        CorrelationLayer::new("SMP").layer(tower::util::BoxCloneService::new(tower::service_fn(
            echo_fw_header,
        )))
    }

    #[tokio::test]
    async fn test_preserves_tcid_and_bumps_response_srno() {
        let request = Request::builder()
            .header(FW_HEADER, "TCID=T1;TCIDSRNO=0007")
            .header(header::HOST, "gw.example.com")
            .body(Body::empty())
            .unwrap();
        let response = service().oneshot(request).await.unwrap();

        let out = response
            .headers()
            .get(FW_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        let bag = FwHeaderBag::parse(out);
        assert_eq!(bag.tcid(), "T1");
        assert_eq!(bag.tcid_srno(), "0008");

        // The handler saw the woven (not yet bumped) header.
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let seen = FwHeaderBag::parse(std::str::from_utf8(&body).unwrap());
        assert_eq!(seen.tcid(), "T1");
        assert_eq!(seen.tcid_srno(), "0007");
        assert_eq!(seen.biz_srvc_cd(), "SMP");
        assert_eq!(seen.biz_srvc_ip(), "gw.example.com");
    }

    #[tokio::test]
    async fn test_generates_header_when_missing() {
        let request = Request::builder()
            .header(header::HOST, "gw.example.com:8080")
            .body(Body::empty())
            .unwrap();
        let response = service().oneshot(request).await.unwrap();

        let out = response
            .headers()
            .get(FW_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        let bag = FwHeaderBag::parse(out);
        assert_eq!(bag.tcid().len(), 34);
        // Fresh correlation starts at 0001, bumped to 0002 on the way out.
        assert_eq!(bag.tcid_srno(), "0002");
        assert_eq!(bag.biz_srvc_ip(), "gw.example.com");
    }
}
