//! Prometheus metrics implementation

use crate::error::{ParleyError, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

/// Metrics collector for Parley
pub struct Metrics {
    /// Prometheus registry
    registry: Registry,

    // Client request metrics
    /// Total requests
    pub requests_total: IntCounterVec,
    /// Request duration histogram
    pub request_duration_seconds: HistogramVec,

    // Upstream metrics
    /// Chat calls by mode and outcome
    pub upstream_requests_total: IntCounterVec,
    /// Chat call duration (time to full reply or to the open stream)
    pub upstream_request_duration_seconds: HistogramVec,
    /// Handshakes by outcome
    pub negotiations_total: IntCounterVec,

    // Rate limiting metrics
    /// Time spent waiting for admission
    pub rate_limit_wait_seconds: Histogram,
    /// Upstream 429 responses retried
    pub rate_limit_retries_total: IntCounter,

    // Tool metrics
    /// Tool calls returned to clients
    pub tool_calls_total: IntCounter,

    // Connection metrics
    /// Total connections accepted
    pub connections_total: IntCounter,
    /// Active connections
    pub active_connections: IntGauge,

    // Error metrics
    /// Error count by type
    pub errors_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("parley_requests_total", "Total number of client requests"),
            &["method", "route", "status"],
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "parley_request_duration_seconds",
                "Client request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["route"],
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let upstream_requests_total = IntCounterVec::new(
            Opts::new("parley_upstream_requests_total", "Total upstream chat calls"),
            &["mode", "outcome"],
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let upstream_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "parley_upstream_request_duration_seconds",
                "Upstream chat call duration in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["mode"],
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let negotiations_total = IntCounterVec::new(
            Opts::new(
                "parley_negotiations_total",
                "Upstream session handshakes by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let rate_limit_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "parley_rate_limit_wait_seconds",
                "Time spent waiting for rate limiter admission",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let rate_limit_retries_total = IntCounter::new(
            "parley_rate_limit_retries_total",
            "Upstream 429 responses that were retried",
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let tool_calls_total =
            IntCounter::new("parley_tool_calls_total", "Tool calls returned to clients")
                .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let connections_total =
            IntCounter::new("parley_connections_total", "Total connections accepted")
                .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let active_connections =
            IntGauge::new("parley_active_connections", "Number of active connections")
                .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        let errors_total = IntCounterVec::new(
            Opts::new("parley_errors_total", "Total errors by type"),
            &["type"],
        )
        .map_err(|e| ParleyError::Internal(format!("Failed to create metric: {}", e)))?;

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).ok();
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .ok();
        registry
            .register(Box::new(upstream_requests_total.clone()))
            .ok();
        registry
            .register(Box::new(upstream_request_duration_seconds.clone()))
            .ok();
        registry.register(Box::new(negotiations_total.clone())).ok();
        registry
            .register(Box::new(rate_limit_wait_seconds.clone()))
            .ok();
        registry
            .register(Box::new(rate_limit_retries_total.clone()))
            .ok();
        registry.register(Box::new(tool_calls_total.clone())).ok();
        registry.register(Box::new(connections_total.clone())).ok();
        registry.register(Box::new(active_connections.clone())).ok();
        registry.register(Box::new(errors_total.clone())).ok();

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            upstream_requests_total,
            upstream_request_duration_seconds,
            negotiations_total,
            rate_limit_wait_seconds,
            rate_limit_retries_total,
            tool_calls_total,
            connections_total,
            active_connections,
            errors_total,
        })
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ParleyError::Internal(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| {
            ParleyError::Internal(format!("Failed to convert metrics to string: {}", e))
        })
    }

    /// Record a client request
    pub fn record_request(&self, method: &str, route: &str, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[method, route, &status.to_string()])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    /// Record an upstream chat call
    pub fn record_upstream_call(&self, mode: &str, outcome: &str, duration: Duration) {
        self.upstream_requests_total
            .with_label_values(&[mode, outcome])
            .inc();

        self.upstream_request_duration_seconds
            .with_label_values(&[mode])
            .observe(duration.as_secs_f64());
    }

    /// Record a handshake outcome
    pub fn record_negotiation(&self, outcome: &str) {
        self.negotiations_total.with_label_values(&[outcome]).inc();
    }

    /// Record a rate limiter wait
    pub fn record_rate_limit_wait(&self, wait: Duration) {
        self.rate_limit_wait_seconds.observe(wait.as_secs_f64());
    }

    /// Record a retried upstream 429
    pub fn record_rate_limit_retry(&self) {
        self.rate_limit_retries_total.inc();
    }

    /// Record tool calls returned to a client
    pub fn record_tool_calls(&self, count: usize) {
        self.tool_calls_total.inc_by(count as u64);
    }

    /// Record connection accepted
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    /// Record connection closed
    pub fn record_connection_closed(&self) {
        self.active_connections.dec();
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();
    }
}

/// Helper for timing operations
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
