//! # Configuration Module
//!
//! YAML configuration for the gateway, loaded once at startup. Environment
//! overrides: `GATEWAY_CONFIG` selects the file, `GATEWAY_MAX_BODY_BYTES`
//! overrides the request body cap, `FW_BIZ_CODE` overrides the default
//! business-service code.

use crate::core::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default request body cap: 10 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Default business-service code stamped into `X-Fw-Header`.
pub const DEFAULT_BIZ_CODE: &str = "SMP";

/// Complete gateway configuration as parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,

    pub application: ApplicationConfig,

    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Upstream base URL per API group code, consulted when the catalog
    /// entry carries no per-API target host.
    #[serde(default)]
    pub hosts: HashMap<String, String>,

    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    #[serde(default)]
    pub tracing: TracingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub idle_timeout_ms: u64,

    /// Request body cap in bytes; `0` disables the limit.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Token-bucket refill rate; `0` disables rate limiting.
    #[serde(default)]
    pub rate_limit_rps: f64,

    /// Token-bucket burst capacity; `0` disables rate limiting.
    #[serde(default)]
    pub rate_limit_burst: u32,

    /// Consecutive 5xx responses before the circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// How long an open circuit rejects before admitting a probe.
    #[serde(default = "default_breaker_open_timeout_ms")]
    pub breaker_open_timeout_ms: u64,

    /// Budget for a single half-open probe.
    #[serde(default = "default_breaker_half_open_timeout_ms")]
    pub breaker_half_open_timeout_ms: u64,
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_open_timeout_ms() -> u64 {
    10_000
}

fn default_breaker_half_open_timeout_ms() -> u64 {
    5_000
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,

    /// This gateway's own API group code, stamped on audit events and used
    /// for feature-flag lookups.
    pub group_code: String,

    /// Default business-service code; overridden by `FW_BIZ_CODE`.
    #[serde(default = "default_biz_code")]
    pub biz_code: String,

    pub log: LogConfig,
}

fn default_biz_code() -> String {
    DEFAULT_BIZ_CODE.to_string()
}

/// Audit topic plus the four feature-flag keys gating each audit phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub topic: String,
    pub inbound: LogPhaseConfig,
    pub outbound: LogPhaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPhaseConfig {
    pub request: String,
    pub response: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub client_id: String,
    /// One of `none`, `one`, `all`.
    #[serde(default = "default_acks")]
    pub acks: String,
    /// One of `gzip`, `snappy`, `lz4`, `zstd`.
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Per-message write deadline.
    #[serde(default = "default_kafka_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: u64,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub tls: KafkaTlsConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            brokers: Vec::new(),
            client_id: String::new(),
            acks: default_acks(),
            compression: default_compression(),
            timeout_ms: default_kafka_timeout_ms(),
            batch_bytes: default_batch_bytes(),
            batch_timeout_ms: default_batch_timeout_ms(),
            sasl: SaslConfig::default(),
            tls: KafkaTlsConfig::default(),
        }
    }
}

fn default_acks() -> String {
    "one".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_kafka_timeout_ms() -> u64 {
    5_000
}

fn default_batch_bytes() -> u64 {
    1_048_576
}

fn default_batch_timeout_ms() -> u64 {
    10
}

impl KafkaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mechanism: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KafkaTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub otlp: OtlpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtlpConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub insecure: bool,
}

/// One declarative route as written in the YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub name: String,
    #[serde(rename = "match")]
    pub match_: RouteMatchConfig,
    pub backend: RouteBackendConfig,
    #[serde(default)]
    pub options: RouteOptionsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMatchConfig {
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub path_pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteBackendConfig {
    pub scheme: String,
    pub host: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path_rewrite: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RouteOptionsConfig {
    #[serde(default)]
    pub require_session: bool,
    #[serde(default)]
    pub generate_if_missing: bool,
}

impl GatewayConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            GatewayError::config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("failed to parse config YAML: {e}")))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_MAX_BODY_BYTES` and `FW_BIZ_CODE` overrides.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        if let Ok(raw) = std::env::var("GATEWAY_MAX_BODY_BYTES") {
            self.server.max_body_bytes = raw
                .parse()
                .map_err(|e| GatewayError::config(format!("invalid GATEWAY_MAX_BODY_BYTES: {e}")))?;
        }
        if let Ok(code) = std::env::var("FW_BIZ_CODE") {
            if !code.is_empty() {
                self.application.biz_code = code;
            }
        }
        Ok(())
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> GatewayResult<()> {
        self.server
            .addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| GatewayError::config(format!("invalid server.addr: {e}")))?;

        if !matches!(self.kafka.acks.as_str(), "none" | "one" | "all") {
            return Err(GatewayError::config(format!(
                "invalid kafka.acks {:?}, expected none|one|all",
                self.kafka.acks
            )));
        }
        if !matches!(
            self.kafka.compression.as_str(),
            "gzip" | "snappy" | "lz4" | "zstd"
        ) {
            return Err(GatewayError::config(format!(
                "invalid kafka.compression {:?}",
                self.kafka.compression
            )));
        }
        if self.kafka.enabled {
            if self.kafka.brokers.is_empty() {
                return Err(GatewayError::config("kafka.brokers must not be empty"));
            }
            if self.application.log.topic.is_empty() {
                return Err(GatewayError::config("application.log.topic must not be empty"));
            }
        }

        for route in &self.routes {
            if route.name.is_empty() {
                return Err(GatewayError::config("route with empty name"));
            }
            if !matches!(route.backend.scheme.as_str(), "http" | "https") {
                return Err(GatewayError::config(format!(
                    "route {:?}: invalid backend.scheme {:?}",
                    route.name, route.backend.scheme
                )));
            }
            if route.backend.host.is_empty() {
                return Err(GatewayError::config(format!(
                    "route {:?}: backend.host must not be empty",
                    route.name
                )));
            }
        }
        Ok(())
    }
}
