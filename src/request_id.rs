//! Identifier generation for requests and completions
//!
//! Request IDs are read from the inbound `x-request-id` header when present and
//! echoed on the response; completion IDs follow the `chatcmpl-` convention.

use http::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request ID header name
pub const X_REQUEST_ID: &str = "x-request-id";

/// Unique identifier generator
pub struct RequestIdGenerator {
    /// Counter for uniqueness within process
    counter: AtomicU64,
    /// Process start timestamp for uniqueness across restarts
    start_time: u64,
    prefix: String,
}

impl RequestIdGenerator {
    /// Create a generator whose IDs start with `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            counter: AtomicU64::new(0),
            start_time,
            prefix: prefix.into(),
        }
    }

    /// Generator for completion IDs
    pub fn completions() -> Self {
        Self::new("chatcmpl")
    }

    /// Generate a new unique ID
    pub fn generate(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let random: u32 = rand::random();

        // Format: <prefix>-<timestamp_hex><counter_hex><random_hex>
        format!(
            "{}-{:x}{:x}{:08x}",
            self.prefix, self.start_time, counter, random
        )
    }
}

/// Inbound request ID, if the client supplied a non-empty one
pub fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(String::from)
}
