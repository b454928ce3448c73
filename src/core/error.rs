//! # Error Handling Module
//!
//! Defines the gateway's error taxonomy with `thiserror` and maps each
//! variant to the HTTP status code the client observes. Handler errors are
//! rendered as the shared JSON envelope
//! `{"success": false, "message": ..., "data": {"error": ...}}`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy, organized by what the client sees.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Malformed request envelope or failed body validation.
    #[error("{message}")]
    BadRequest { message: String, detail: String },

    /// No route matched, or policy denies the specific API.
    #[error("{message}")]
    NotFound { message: String, detail: String },

    /// Wrong method on a reserved path.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// Request body exceeds the configured limit.
    #[error("request entity too large")]
    PayloadTooLarge,

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Policy lookup failed, host unresolved, or request construction failed.
    #[error("{message}")]
    Policy { message: String, detail: String },

    /// Upstream transport failure or missing required session header.
    #[error("{message}")]
    Upstream { message: String, detail: String },

    /// Circuit breaker is open.
    #[error("Service temporarily unavailable")]
    CircuitOpen,

    /// Internal server errors for unexpected failures.
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, listener binds, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors for configuration files.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors when making upstream requests.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Database errors from the policy catalog.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl GatewayError {
    /// Create a configuration error with a custom message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a bad-request error carrying the client-facing message and the cause.
    pub fn bad_request<S: Into<String>, D: ToString>(message: S, detail: D) -> Self {
        Self::BadRequest {
            message: message.into(),
            detail: detail.to_string(),
        }
    }

    /// Create a not-found error.
    pub fn not_found<S: Into<String>, D: ToString>(message: S, detail: D) -> Self {
        Self::NotFound {
            message: message.into(),
            detail: detail.to_string(),
        }
    }

    /// Create a policy error (surfaced as 500).
    pub fn policy<S: Into<String>, D: ToString>(message: S, detail: D) -> Self {
        Self::Policy {
            message: message.into(),
            detail: detail.to_string(),
        }
    }

    /// Create an upstream error (surfaced as 502).
    pub fn upstream<S: Into<String>, D: ToString>(message: S, detail: D) -> Self {
        Self::Upstream {
            message: message.into(),
            detail: detail.to_string(),
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map this error to the HTTP status code the client receives.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Policy { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::HttpClient(_) => StatusCode::BAD_GATEWAY,
            Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The detail string placed under `data.error` in the envelope.
    fn detail(&self) -> String {
        match self {
            Self::BadRequest { detail, .. }
            | Self::NotFound { detail, .. }
            | Self::Policy { detail, .. }
            | Self::Upstream { detail, .. } => detail.clone(),
            Self::Io(e) => e.to_string(),
            Self::Json(e) => e.to_string(),
            Self::Yaml(e) => e.to_string(),
            Self::HttpClient(e) => e.to_string(),
            Self::Database(e) => e.to_string(),
            _ => String::new(),
        }
    }
}

/// Build the shared JSON error envelope as a response.
pub fn error_response(status: StatusCode, message: &str, detail: &str) -> Response {
    let body = json!({
        "success": false,
        "message": message,
        "data": { "error": detail },
    });
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        header::HeaderValue::from_static("nosniff"),
    );
    response
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.detail();
        let mut response = error_response(status, &self.to_string(), &detail);
        if matches!(self, Self::RateLimited) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::bad_request("invalid JSON", "eof").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::not_found("Api URL not allowed", "").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::policy("Request Api error", "db down").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::upstream("upstream request failed", "refused").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::CircuitOpen.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = GatewayError::RateLimited.into_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_envelope_sets_nosniff() {
        let response = GatewayError::internal("boom").into_response();
        assert_eq!(
            response
                .headers()
                .get(header::X_CONTENT_TYPE_OPTIONS)
                .unwrap(),
            "nosniff"
        );
    }
}
