//! Route-specific body transforms.
//!
//! A small strategy table keyed by route name. Two routes carry a
//! downstream session contract: `save-user` resolves (or mints) the
//! session id carried in `body.key`, and `find-user-info` synthesizes a
//! lookup body from the `X-Fw-Session-Id` header and the matched `field`
//! path parameter.

use crate::correlation::FW_SESSION_HEADER;
use crate::core::error::GatewayError;
use crate::routing::PathParams;
use axum::http::HeaderMap;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Result of applying a transform to the buffered request body.
#[derive(Debug)]
pub struct TransformOutcome {
    pub body: Bytes,
    /// Session id to echo back to the client, when the route produced one.
    pub session_id: Option<String>,
}

/// Inputs available to a transform.
pub struct TransformInput<'a> {
    pub body: &'a [u8],
    pub headers: &'a HeaderMap,
    pub params: &'a PathParams,
}

pub type BodyTransform =
    Arc<dyn Fn(&TransformInput<'_>) -> Result<TransformOutcome, GatewayError> + Send + Sync>;

/// Transform table keyed by route name.
#[derive(Clone, Default)]
pub struct TransformTable {
    transforms: HashMap<String, BodyTransform>,
}

impl TransformTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in session routes.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register("save-user", Arc::new(save_user));
        table.register("find-user-info", Arc::new(find_user_info));
        table
    }

    pub fn register(&mut self, route_name: &str, transform: BodyTransform) {
        self.transforms.insert(route_name.to_string(), transform);
    }

    pub fn get(&self, route_name: &str) -> Option<&BodyTransform> {
        self.transforms.get(route_name)
    }
}

/// `save-user`: use `body.key` as the session id, minting a fresh one when
/// absent, and carry it in the forwarded body.
fn save_user(input: &TransformInput<'_>) -> Result<TransformOutcome, GatewayError> {
    let mut object = match serde_json::from_slice::<Value>(input.body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let session_id = match object.get("key").and_then(Value::as_str) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    object.insert("key".to_string(), Value::String(session_id.clone()));
    let body = serde_json::to_vec(&Value::Object(object))
        .map_err(|e| GatewayError::internal(format!("failed to encode session body: {e}")))?;
    Ok(TransformOutcome {
        body: Bytes::from(body),
        session_id: Some(session_id),
    })
}

/// `find-user-info`: require the session header and synthesize the lookup
/// body `{"key": <session>, "field": <param>}`.
fn find_user_info(input: &TransformInput<'_>) -> Result<TransformOutcome, GatewayError> {
    let session_id = input
        .headers
        .get(FW_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            GatewayError::upstream("missing X-Fw-Session-Id", "session header required")
        })?
        .to_string();

    let field = input.params.get("field").cloned().unwrap_or_default();
    let body = serde_json::to_vec(&json!({ "key": session_id, "field": field }))
        .map_err(|e| GatewayError::internal(format!("failed to encode lookup body: {e}")))?;
    Ok(TransformOutcome {
        body: Bytes::from(body),
        session_id: Some(session_id),
    })
}
