//! Access logging for client requests

use crate::config::{AccessLogConfig, LogFormat};
use crate::error::{ParleyError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

/// Access log entry
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Request ID
    pub request_id: String,
    /// Client IP address
    pub client_ip: String,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Response status code
    pub status: u16,
    /// Request duration in milliseconds
    pub duration_ms: u64,
    /// Resolved client-facing model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Whether the response was streamed
    pub stream: bool,
    /// Tool calls returned to the client
    pub tool_calls: usize,
    /// Error message (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccessLogEntry {
    /// Create a new access log entry
    pub fn new(request_id: String, client_ip: String) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            client_ip,
            method: String::new(),
            path: String::new(),
            status: 0,
            duration_ms: 0,
            model: None,
            stream: false,
            tool_calls: 0,
            error: None,
        }
    }

    /// Format as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Format as a single human-readable line
    pub fn to_compact(&self) -> String {
        let mut line = format!(
            "{} {} [{}] \"{} {}\" {} {}ms",
            self.client_ip,
            self.request_id,
            self.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.path,
            self.status,
            self.duration_ms,
        );
        if let Some(model) = &self.model {
            line.push_str(&format!(" model={}", model));
        }
        if self.stream {
            line.push_str(" stream");
        }
        if self.tool_calls > 0 {
            line.push_str(&format!(" tool_calls={}", self.tool_calls));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" error=\"{}\"", error));
        }
        line
    }
}

/// Access logger
pub struct AccessLogger {
    /// Log format
    format: LogFormat,
    /// Output writer
    writer: Option<Mutex<BufWriter<File>>>,
    /// Whether logging is enabled
    enabled: bool,
}

impl AccessLogger {
    /// Create a new access logger
    pub fn new(config: &AccessLogConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self {
                format: config.format.clone(),
                writer: None,
                enabled: false,
            });
        }

        let writer = if let Some(path) = &config.path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ParleyError::Config(format!(
                        "Failed to open access log file {:?}: {}",
                        path, e
                    ))
                })?;
            Some(Mutex::new(BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self {
            format: config.format.clone(),
            writer,
            enabled: true,
        })
    }

    /// Log an entry: to the file when one is configured, through tracing otherwise
    pub fn log(&self, entry: &AccessLogEntry) {
        if !self.enabled {
            return;
        }

        match &self.writer {
            Some(writer) => {
                let line = match self.format {
                    LogFormat::Json => entry.to_json(),
                    LogFormat::Compact => entry.to_compact(),
                };
                let mut writer = writer.lock();
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
            None => self.log_structured(entry),
        }
    }

    /// Log using tracing (structured logging)
    pub fn log_structured(&self, entry: &AccessLogEntry) {
        if !self.enabled {
            return;
        }

        tracing::info!(
            request_id = %entry.request_id,
            client_ip = %entry.client_ip,
            method = %entry.method,
            path = %entry.path,
            status = entry.status,
            duration_ms = entry.duration_ms,
            model = ?entry.model,
            stream = entry.stream,
            tool_calls = entry.tool_calls,
            error = ?entry.error,
            "request completed"
        );
    }
}

/// Builder for access log entries
#[derive(Clone)]
pub struct AccessLogBuilder {
    entry: AccessLogEntry,
    start_time: std::time::Instant,
}

impl AccessLogBuilder {
    /// Create a new builder
    pub fn new(request_id: String, client_ip: String) -> Self {
        Self {
            entry: AccessLogEntry::new(request_id, client_ip),
            start_time: std::time::Instant::now(),
        }
    }

    /// Set request details
    pub fn request(mut self, method: &str, path: &str) -> Self {
        self.entry.method = method.to_string();
        self.entry.path = path.to_string();
        self
    }

    /// Set completion details
    pub fn completion(mut self, model: &str, stream: bool) -> Self {
        self.entry.model = Some(model.to_string());
        self.entry.stream = stream;
        self
    }

    /// Set response status
    pub fn status(mut self, status: u16) -> Self {
        self.entry.status = status;
        self
    }

    /// Set number of tool calls returned
    pub fn tool_calls(mut self, count: usize) -> Self {
        self.entry.tool_calls = count;
        self
    }

    /// Set error
    pub fn error(mut self, error: Option<&str>) -> Self {
        self.entry.error = error.map(String::from);
        self
    }

    /// Build the log entry
    pub fn build(mut self) -> AccessLogEntry {
        self.entry.duration_ms = self.start_time.elapsed().as_millis() as u64;
        self.entry
    }
}
