//! # Policy Catalog
//!
//! The `PolicyRepository` trait abstracts the relational catalog that
//! authorizes dynamic-gateway traffic: API resolution, caller bindings,
//! group/API control codes with blackout windows, and the feature flags
//! that gate audit phases. `MockRepository` answers every predicate with
//! `true` so the full forwarding path runs without a database.

pub mod mariadb;

use crate::core::config::{DbConfig, GatewayConfig};
use crate::core::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Catalog lookup state threaded through the dynamic gateway.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    /// Path (query stripped) used for the catalog lookup.
    pub request_url: String,
    /// Calling application's business-service code.
    pub biz_service_code: String,
    pub api_code: String,
    pub api_group_code: String,
    /// Per-API target host; empty falls back to the configured host map.
    pub request_host: String,
}

/// Errors surfaced by catalog lookups.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A control code other than `"00"` refused the request; carries the
    /// code-specific message shown to the client.
    #[error("{0}")]
    Control(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Catalog interface. No SQL leaks to callers.
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Resolve the request path to `(ApiCode, ApiGroupCode, TargetHost?)`.
    /// A miss is not an error: the input is returned with empty codes and
    /// the group/API gates fail downstream.
    async fn find_request_data(&self, input: RequestData) -> Result<RequestData, PolicyError>;

    /// Whether an active caller binding `(biz, group, api)` exists.
    async fn exist_use_api_list(&self, input: &RequestData) -> Result<bool, PolicyError>;

    /// Group-level gate: active and open per its control code. A control
    /// refusal propagates as [`PolicyError::Control`] so the code-specific
    /// message reaches the client.
    async fn exist_api_group(&self, input: &RequestData) -> Result<bool, PolicyError>;

    /// API-level gate: active and open per its control code. A control
    /// refusal yields `false` (the caller answers 404).
    async fn exist_api(&self, input: &RequestData) -> Result<bool, PolicyError>;

    /// Whether the feature flag `(group, key)` is active.
    async fn exist_config(&self, key: &str) -> Result<bool, PolicyError>;

    async fn close(&self);
}

/// Control-code message map. `"00"` is open and has no message.
pub fn control_code_message(code: &str) -> &'static str {
    match code {
        "01" => "system failure",
        "02" => "transaction volume surge",
        "03" => "system maintenance",
        "04" => "interface failure",
        "05" => "response time failure",
        "06" => "accumulated errors",
        "07" => "service inspection",
        "08" => "transactions disabled for the designated period",
        _ => "unknown control error",
    }
}

/// Enforce a 2-digit control code against the current `HHMMSS` time.
///
/// `"00"` is open. `"08"` refuses only while `now` falls inside
/// `[start, end]` (both non-empty). Any other code refuses outright with
/// its mapped message.
pub fn check_control_codes(
    code: &str,
    start: &str,
    end: &str,
    now_hhmmss: &str,
) -> Result<(), PolicyError> {
    if code == "00" || code.is_empty() {
        return Ok(());
    }
    if code == "08" {
        if !start.is_empty() && !end.is_empty() && now_hhmmss >= start && now_hhmmss <= end {
            return Err(PolicyError::Control(control_code_message(code).to_string()));
        }
        return Ok(());
    }
    Err(PolicyError::Control(control_code_message(code).to_string()))
}

/// Current wall-clock time as `HHMMSS`.
pub fn now_hhmmss() -> String {
    chrono::Local::now().format("%H%M%S").to_string()
}

/// Permissive stand-in used when the backing store is disabled.
pub struct MockRepository;

#[async_trait]
impl PolicyRepository for MockRepository {
    async fn find_request_data(&self, mut input: RequestData) -> Result<RequestData, PolicyError> {
        input.api_code = "006".to_string();
        Ok(input)
    }

    async fn exist_use_api_list(&self, _input: &RequestData) -> Result<bool, PolicyError> {
        Ok(true)
    }

    async fn exist_api_group(&self, _input: &RequestData) -> Result<bool, PolicyError> {
        Ok(true)
    }

    async fn exist_api(&self, _input: &RequestData) -> Result<bool, PolicyError> {
        Ok(true)
    }

    async fn exist_config(&self, _key: &str) -> Result<bool, PolicyError> {
        Ok(true)
    }

    async fn close(&self) {}
}

/// Build the repository selected by configuration.
pub async fn build_repository(config: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyRepository>> {
    let db: &DbConfig = &config.db;
    if !db.enabled {
        info!("policy store disabled, using mock repository");
        return Ok(Arc::new(MockRepository));
    }
    match db.driver.as_str() {
        "mysql" => {
            let repo =
                mariadb::MariaDbRepository::connect(db, &config.application.group_code).await?;
            Ok(Arc::new(repo))
        }
        other => Err(GatewayError::config(format!(
            "unsupported db.driver: {other}"
        ))),
    }
}
