//! Error types for the Parley gateway

use std::io;
use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Main error type for Parley
#[derive(Error, Debug)]
pub enum ParleyError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Session handshake with the upstream failed
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Upstream chat call failed
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Malformed inbound request, rejected before any network call
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Shared rate-limit state could not be read or written
    #[error("Rate limit store error: {0}")]
    Store(String),

    /// HTTP protocol errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Hyper errors
    #[error("Hyper error: {0}")]
    Hyper(String),

    /// Server shutdown
    #[error("Server is shutting down")]
    Shutdown,

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures while negotiating a session credential
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Status endpoint answered with a non-2xx status
    #[error("Handshake rejected by upstream with status {0}")]
    UpstreamStatus(u16),

    /// A required handshake header was absent
    #[error("Handshake response is missing header '{0}'")]
    MissingHeader(&'static str),

    /// Challenge payload could not be decoded as the expected structure
    #[error("Malformed handshake challenge: {0}")]
    MalformedChallenge(String),

    /// Network failure reaching the status endpoint
    #[error("Handshake transport error: {0}")]
    Transport(String),
}

/// Failures of the upstream chat call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Upstream answered 429
    #[error("Upstream rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// Upstream answered with another non-2xx status
    #[error("Upstream returned status {0}")]
    HttpStatus(u16),

    /// Upstream body carried an application error marker
    #[error("Upstream reported an error: {0}")]
    Reported(String),

    /// Request or stream read exceeded the configured timeout
    #[error("Upstream request timed out")]
    Timeout,

    /// Connection-level failure
    #[error("Upstream transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// Suggested wait before retrying, only for the rate-limited variant
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            UpstreamError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

impl From<hyper::Error> for ParleyError {
    fn from(err: hyper::Error) -> Self {
        ParleyError::Hyper(err.to_string())
    }
}

impl From<http::Error> for ParleyError {
    fn from(err: http::Error) -> Self {
        ParleyError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        ParleyError::Internal(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ParleyError {
    fn from(err: serde_yaml::Error) -> Self {
        ParleyError::ConfigParse(err.to_string())
    }
}

impl From<toml::de::Error> for ParleyError {
    fn from(err: toml::de::Error) -> Self {
        ParleyError::ConfigParse(err.to_string())
    }
}

/// Error response that can be converted to an HTTP response
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: u16,
    /// OpenAI-style error type
    pub error_type: &'static str,
    /// Machine-readable code
    pub code: Option<&'static str>,
    pub message: String,
    /// Seconds for a `Retry-After` header
    pub retry_after_secs: Option<u64>,
}

impl ErrorResponse {
    /// Render the OpenAI error body
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.message,
                "type": self.error_type,
                "code": self.code,
            }
        })
    }
}

impl From<&ParleyError> for ErrorResponse {
    fn from(err: &ParleyError) -> Self {
        match err {
            ParleyError::Validation(msg) => ErrorResponse {
                status: 400,
                error_type: "invalid_request_error",
                code: None,
                message: msg.clone(),
                retry_after_secs: None,
            },
            ParleyError::Auth(e) => ErrorResponse {
                status: 502,
                error_type: "upstream_auth_error",
                code: Some(match e {
                    AuthError::UpstreamStatus(_) => "upstream_status",
                    AuthError::MissingHeader(_) => "missing_header",
                    AuthError::MalformedChallenge(_) => "malformed_challenge",
                    AuthError::Transport(_) => "transport",
                }),
                message: e.to_string(),
                retry_after_secs: None,
            },
            ParleyError::Upstream(UpstreamError::RateLimited { retry_after_ms }) => ErrorResponse {
                status: 429,
                error_type: "rate_limit_error",
                code: Some("rate_limited"),
                message: err.to_string(),
                retry_after_secs: Some(retry_after_ms.div_ceil(1000)),
            },
            ParleyError::Upstream(UpstreamError::Timeout) => ErrorResponse {
                status: 504,
                error_type: "upstream_error",
                code: Some("timeout"),
                message: "Gateway Timeout".to_string(),
                retry_after_secs: None,
            },
            ParleyError::Upstream(e) => ErrorResponse {
                status: 502,
                error_type: "upstream_error",
                code: Some(match e {
                    UpstreamError::HttpStatus(_) => "http_status",
                    UpstreamError::Reported(_) => "upstream_reported_error",
                    _ => "transport",
                }),
                message: e.to_string(),
                retry_after_secs: None,
            },
            ParleyError::Shutdown => ErrorResponse {
                status: 503,
                error_type: "server_error",
                code: None,
                message: "Service Unavailable".to_string(),
                retry_after_secs: None,
            },
            _ => ErrorResponse {
                status: 500,
                error_type: "server_error",
                code: None,
                message: "Internal Server Error".to_string(),
                retry_after_secs: None,
            },
        }
    }
}
