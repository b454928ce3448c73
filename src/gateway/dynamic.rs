//! # Dynamic Policy Gateway
//!
//! Handles `/gateway` and `/gateway/*`: resolves the target API through the
//! policy catalog, authorizes the caller, enforces group- and API-level
//! control codes, forwards the request, and emits the four-phase audit
//! trail (11 inbound-request, 21 outbound-request, 22 outbound-response,
//! 12 inbound-response). The gateway always originates a fresh correlation
//! here; the inbound `TCID` is not preserved.

use crate::audit::{AuditEvent, Phase, Publisher};
use crate::core::config::GatewayConfig;
use crate::core::error::{error_response, GatewayError};
use crate::correlation::{FwHeaderBag, FW_HEADER, KEY_TCID_SRNO};
use crate::policy::{PolicyError, PolicyRepository, RequestData};
use crate::proxy::filter_hop_headers;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Request envelope for `POST /gateway`.
#[derive(Debug, Deserialize)]
struct GatewayEnvelope {
    #[serde(default)]
    url: String,
    /// Arbitrary JSON forwarded verbatim as the upstream body.
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// Feature-flag keys gating the four audit phases.
#[derive(Debug, Clone)]
pub struct AuditFlags {
    pub inbound_request: String,
    pub inbound_response: String,
    pub outbound_request: String,
    pub outbound_response: String,
}

pub struct DynamicGateway {
    repo: Arc<dyn PolicyRepository>,
    publisher: Arc<dyn Publisher>,
    client: reqwest::Client,
    timeout: Duration,
    group_code: String,
    default_biz_code: String,
    hosts: HashMap<String, String>,
    flags: AuditFlags,
}

impl DynamicGateway {
    pub fn new(
        repo: Arc<dyn PolicyRepository>,
        publisher: Arc<dyn Publisher>,
        client: reqwest::Client,
        config: &GatewayConfig,
    ) -> Self {
        let log = &config.application.log;
        Self {
            repo,
            publisher,
            client,
            timeout: config.server.read_timeout(),
            group_code: config.application.group_code.clone(),
            default_biz_code: config.application.biz_code.clone(),
            hosts: config.hosts.clone(),
            flags: AuditFlags {
                inbound_request: log.inbound.request.clone(),
                inbound_response: log.inbound.response.clone(),
                outbound_request: log.outbound.request.clone(),
                outbound_response: log.outbound.response.clone(),
            },
        }
    }

    /// Entry point for the reserved paths. Only `GET` and `POST` pass.
    pub async fn handle(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        if method != Method::GET && method != Method::POST {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed", "");
        }

        // Correlate: this gateway originates a fresh TCID for dynamic
        // traffic, preserving only caller-supplied bag entries.
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let raw_fw = headers
            .get(FW_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let mut merged = FwHeaderBag::parse(raw_fw);
        let biz_code = self.resolve_biz_code(&merged, &body);
        merged.apply_server_side(&biz_code, host);

        let api_path = uri.to_string();

        // Phase 11: inbound request.
        let inbound_body: &[u8] = if method == Method::GET { b"" } else { &body };
        self.emit(
            &self.flags.inbound_request,
            AuditEvent::from_bag(
                &merged,
                Phase::InboundRequest,
                true,
                &api_path,
                &self.group_code,
                inbound_body,
            ),
        )
        .await;

        // Envelope: POST parses the body, GET derives the target from the
        // path suffix.
        let envelope = match self.parse_envelope(&method, &uri, &body) {
            Ok(envelope) => envelope,
            Err(e) => return self.deny(&mut merged, &api_path, e).await,
        };

        // Policy resolution uses the path only; the query is preserved for
        // the upstream call.
        let path_only = match envelope.url.find('?') {
            Some(idx) => &envelope.url[..idx],
            None => envelope.url.as_str(),
        };
        let mut request_data = RequestData {
            request_url: path_only.to_string(),
            biz_service_code: biz_code.clone(),
            ..Default::default()
        };

        request_data = match self.repo.find_request_data(request_data).await {
            Ok(data) => data,
            Err(e) => {
                return self
                    .deny(
                        &mut merged,
                        &api_path,
                        GatewayError::policy("Request Api error", e),
                    )
                    .await;
            }
        };

        // Caller authorization.
        match self.repo.exist_use_api_list(&request_data).await {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .deny(
                        &mut merged,
                        &api_path,
                        GatewayError::policy("Access not allowed by use API policy", ""),
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .deny(&mut merged, &api_path, GatewayError::policy("Using Api error", e))
                    .await;
            }
        }

        // Group gate: a control refusal surfaces its own message.
        match self.repo.exist_api_group(&request_data).await {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .deny(
                        &mut merged,
                        &api_path,
                        GatewayError::policy("Api Group URL not allowed", ""),
                    )
                    .await;
            }
            Err(PolicyError::Control(message)) => {
                return self
                    .deny(&mut merged, &api_path, GatewayError::policy(message, ""))
                    .await;
            }
            Err(e) => {
                return self
                    .deny(
                        &mut merged,
                        &api_path,
                        GatewayError::policy("To use API Group error", e),
                    )
                    .await;
            }
        }

        // Per-API gate: refusal means the API does not exist for the caller.
        match self.repo.exist_api(&request_data).await {
            Ok(true) => {}
            Ok(false) => {
                return self
                    .deny(
                        &mut merged,
                        &api_path,
                        GatewayError::not_found("Api URL not allowed", ""),
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .deny(&mut merged, &api_path, GatewayError::policy("To use API error", e))
                    .await;
            }
        }

        // Upstream host: per-API target first, then the group host map.
        let upstream_base = if !request_data.request_host.is_empty() {
            request_data.request_host.clone()
        } else {
            self.hosts
                .get(&request_data.api_group_code)
                .cloned()
                .unwrap_or_default()
        };
        if upstream_base.is_empty() {
            return self
                .deny(
                    &mut merged,
                    &api_path,
                    GatewayError::policy("Host not found for API data", ""),
                )
                .await;
        }

        let upstream_url = format!("{upstream_base}{}", envelope.url);
        debug!(host = %upstream_base, url = %upstream_url, group = %request_data.api_group_code, "dynamic dispatch");

        // Construct the upstream request.
        let outbound_body: Bytes = if method == Method::GET {
            Bytes::new()
        } else {
            match &envelope.data {
                Some(raw) if raw.get() != "null" => Bytes::from(raw.get().as_bytes().to_vec()),
                _ => Bytes::new(),
            }
        };

        let mut upstream_headers = filter_hop_headers(&headers);
        upstream_headers.remove(header::CONTENT_LENGTH);
        upstream_headers.remove(header::HOST);
        if !outbound_body.is_empty() && !upstream_headers.contains_key(header::CONTENT_TYPE) {
            upstream_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        if let Ok(value) = HeaderValue::from_str(&merged.serialize()) {
            upstream_headers.insert(FW_HEADER, value);
        }

        // Phase 21: outbound request.
        self.emit(
            &self.flags.outbound_request,
            AuditEvent::from_bag(
                &merged,
                Phase::OutboundRequest,
                true,
                &upstream_url,
                &self.group_code,
                &outbound_body,
            ),
        )
        .await;

        // Dispatch under the configured per-request deadline.
        let mut builder = self
            .client
            .request(method.clone(), &upstream_url)
            .headers(upstream_headers)
            .timeout(self.timeout);
        if !outbound_body.is_empty() {
            builder = builder.body(outbound_body);
        }

        let upstream = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %upstream_url, error = %e, "dynamic upstream dispatch failed");
                return self
                    .deny(
                        &mut merged,
                        &api_path,
                        GatewayError::upstream("upstream request failed", e),
                    )
                    .await;
            }
        };

        let status = upstream.status();
        let upstream_headers_in = upstream.headers().clone();
        // Single read: this buffer feeds the 22 audit, the client write,
        // and the 12 audit.
        let response_body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url = %upstream_url, error = %e, "failed to read upstream response");
                return self
                    .deny(
                        &mut merged,
                        &api_path,
                        GatewayError::upstream("upstream response read failed", e),
                    )
                    .await;
            }
        };

        // Phase 22: outbound response.
        self.emit(
            &self.flags.outbound_response,
            AuditEvent::from_bag(
                &merged,
                Phase::OutboundResponse,
                true,
                &upstream_url,
                &self.group_code,
                &response_body,
            ),
        )
        .await;

        // Return to the client with the hop counter bumped.
        let fw_raw = upstream_headers_in
            .get(FW_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let bumped = crate::correlation::bump_srno(fw_raw);

        let mut response = Response::builder()
            .status(status)
            .body(Body::from(response_body.clone()))
            .unwrap_or_else(|_| {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed", "")
            });
        *response.headers_mut() = upstream_headers_in;
        if let Ok(value) = HeaderValue::from_str(&bumped) {
            response.headers_mut().insert(FW_HEADER, value);
        }

        // Phase 12: inbound response.
        self.emit(
            &self.flags.inbound_response,
            AuditEvent::from_bag(
                &merged,
                Phase::InboundResponse,
                true,
                &api_path,
                &self.group_code,
                &response_body,
            ),
        )
        .await;

        response
    }

    /// `BizSrvcCd` resolution: header bag, then body field, then default.
    fn resolve_biz_code(&self, bag: &FwHeaderBag, body: &[u8]) -> String {
        if !bag.biz_srvc_cd().is_empty() {
            return bag.biz_srvc_cd().to_string();
        }
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Some(code) = value.get("BizSrvcCd").and_then(|v| v.as_str()) {
                if !code.is_empty() {
                    return code.to_string();
                }
            }
        }
        self.default_biz_code.clone()
    }

    fn parse_envelope(
        &self,
        method: &Method,
        uri: &Uri,
        body: &[u8],
    ) -> Result<GatewayEnvelope, GatewayError> {
        if *method == Method::GET {
            let path = uri.path();
            let mut url = path.strip_prefix("/gateway").unwrap_or(path).to_string();
            if let Some(query) = uri.query() {
                url.push('?');
                url.push_str(query);
            }
            return Ok(GatewayEnvelope { url, data: None });
        }
        let envelope: GatewayEnvelope = serde_json::from_slice(body)
            .map_err(|e| GatewayError::bad_request("invalid JSON", e))?;
        if envelope.url.is_empty() {
            return Err(GatewayError::bad_request("missing url", ""));
        }
        Ok(envelope)
    }

    /// Early return: bump the hop counter, emit the failure audit, and
    /// render the error envelope.
    async fn deny(
        &self,
        merged: &mut FwHeaderBag,
        api_path: &str,
        error: GatewayError,
    ) -> Response {
        let srno = merged.tcid_srno().to_string();
        if let Ok(n) = srno.parse::<u64>() {
            merged.set(KEY_TCID_SRNO, format!("{:0width$}", n + 1, width = srno.len()));
        }

        let message = error.to_string();
        self.emit(
            &self.flags.inbound_response,
            AuditEvent::from_bag(
                merged,
                Phase::InboundResponse,
                false,
                api_path,
                &self.group_code,
                message.as_bytes(),
            ),
        )
        .await;
        axum::response::IntoResponse::into_response(error)
    }

    /// Publish an audit event when its feature flag is active. Flag lookup
    /// failures disable the phase for this event; they never fail the
    /// request.
    async fn emit(&self, flag_key: &str, event: AuditEvent) {
        let enabled = match self.repo.exist_config(flag_key).await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(flag = flag_key, error = %e, "audit flag lookup failed");
                false
            }
        };
        if !enabled {
            return;
        }
        match serde_json::to_vec(&event) {
            Ok(payload) => self.publisher.publish(event.tcid.as_bytes(), &payload),
            Err(e) => warn!(error = %e, "failed to encode audit event"),
        }
    }
}
