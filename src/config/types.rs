//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Client-facing HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream chat service
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Shared outbound rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Model catalog exposed to clients
    #[serde(default)]
    pub models: ModelsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Client-facing server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Maximum inbound request body size
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Graceful shutdown timeout
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_size: default_max_body_size(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_max_body_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Upstream service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Handshake endpoint issuing the session token and challenge
    #[serde(default = "default_status_url")]
    pub status_url: String,

    /// Chat endpoint
    #[serde(default = "default_chat_url")]
    pub chat_url: String,

    /// Total timeout for the handshake and non-streaming chat calls
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum silence between two reads of a streaming response
    #[serde(default = "default_stream_idle_timeout", with = "humantime_serde")]
    pub stream_idle_timeout: Duration,

    /// Browser user agents rotated across handshakes
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    /// Retry policy for upstream 429 responses
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            status_url: default_status_url(),
            chat_url: default_chat_url(),
            request_timeout: default_request_timeout(),
            stream_idle_timeout: default_stream_idle_timeout(),
            user_agents: default_user_agents(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_status_url() -> String {
    "https://duckduckgo.com/duckchat/v1/status".to_string()
}

fn default_chat_url() -> String {
    "https://duckduckgo.com/duckchat/v1/chat".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_stream_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Retry policy applied by the gateway when the upstream answers 429
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff, doubled per retry
    #[serde(default = "default_base_backoff", with = "humantime_serde")]
    pub base_backoff: Duration,

    /// Longest single wait the gateway accepts before giving up
    #[serde(default = "default_max_retry_wait", with = "humantime_serde")]
    pub max_retry_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff: default_base_backoff(),
            max_retry_wait: default_max_retry_wait(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_wait() -> Duration {
    Duration::from_secs(15)
}

/// Shared rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum upstream calls per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Sliding window length
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Minimum spacing between two calls
    #[serde(default = "default_min_interval", with = "humantime_serde")]
    pub min_interval: Duration,

    /// State older than this is treated as absent
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    /// Added to the computed wait when the window is full
    #[serde(default = "default_safety_margin", with = "humantime_serde")]
    pub safety_margin: Duration,

    /// Where the shared state lives
    #[serde(default)]
    pub backend: RateLimitBackend,

    /// State file for the file backend (defaults to the system temp dir)
    pub state_path: Option<PathBuf>,

    /// Redis URL for the redis backend
    pub redis_url: Option<String>,

    /// Key for the redis backend
    #[serde(default = "default_redis_key")]
    pub redis_key: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
            min_interval: default_min_interval(),
            stale_after: default_stale_after(),
            safety_margin: default_safety_margin(),
            backend: RateLimitBackend::default(),
            state_path: None,
            redis_url: None,
            redis_key: default_redis_key(),
        }
    }
}

impl RateLimitConfig {
    /// Resolved state file path
    pub fn state_file(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("parley-rate-limit.json"))
    }
}

fn default_max_requests() -> u32 {
    20
}

fn default_window() -> Duration {
    Duration::from_millis(60_000)
}

fn default_min_interval() -> Duration {
    Duration::from_millis(1_000)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_safety_margin() -> Duration {
    Duration::from_millis(100)
}

fn default_redis_key() -> String {
    "parley:ratelimit".to_string()
}

/// Rate limit state backends
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackend {
    /// JSON file shared by every process on the host
    #[default]
    File,
    /// Process-local state
    Memory,
    /// Redis key shared across hosts
    Redis,
}

/// Model catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelsConfig {
    /// Model used when a client asks for an unknown one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Models advertised on `/v1/models`
    #[serde(default = "crate::llm::default_catalog")]
    pub catalog: Vec<ModelEntry>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            catalog: crate::llm::default_catalog(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// One catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    /// Identifier clients send
    pub id: String,

    /// Identifier sent upstream (defaults to `id`)
    pub upstream_id: Option<String>,

    /// Reported `owned_by`
    #[serde(default = "default_owned_by")]
    pub owned_by: String,
}

impl ModelEntry {
    /// Identifier to send upstream
    pub fn upstream_id(&self) -> &str {
        self.upstream_id.as_deref().unwrap_or(&self.id)
    }
}

fn default_owned_by() -> String {
    "parley".to_string()
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Access logging
    #[serde(default)]
    pub access_log: AccessLogConfig,
}

/// Access log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessLogConfig {
    /// Enable access logging
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,

    /// Log file path (tracing only if not specified)
    pub path: Option<PathBuf>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: LogFormat::default(),
            path: None,
        }
    }
}

/// Access log formats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

fn default_true() -> bool {
    true
}

/// Helper module for humantime serde
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
