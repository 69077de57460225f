//! Configuration validation

use super::types::*;
use crate::error::{ParleyError, Result};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Validate the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server(&config.server)?;
    validate_upstream(&config.upstream)?;
    validate_rate_limit(&config.rate_limit)?;
    validate_models(&config.models)?;
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<()> {
    server.listen.parse::<SocketAddr>().map_err(|e| {
        ParleyError::ConfigValidation(format!(
            "Invalid listen address '{}': {}",
            server.listen, e
        ))
    })?;

    if server.max_body_size == 0 {
        return Err(ParleyError::ConfigValidation(
            "server.max_body_size must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_upstream(upstream: &UpstreamConfig) -> Result<()> {
    for (field, url) in [
        ("status_url", &upstream.status_url),
        ("chat_url", &upstream.chat_url),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ParleyError::ConfigValidation(format!(
                "upstream.{} must be an http(s) URL, got '{}'",
                field, url
            )));
        }
    }

    if upstream.user_agents.is_empty() {
        return Err(ParleyError::ConfigValidation(
            "upstream.user_agents must list at least one user agent".to_string(),
        ));
    }

    if upstream.request_timeout.is_zero() || upstream.stream_idle_timeout.is_zero() {
        return Err(ParleyError::ConfigValidation(
            "upstream timeouts must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_rate_limit(rate_limit: &RateLimitConfig) -> Result<()> {
    if rate_limit.max_requests == 0 {
        return Err(ParleyError::ConfigValidation(
            "rate_limit.max_requests must be greater than 0".to_string(),
        ));
    }

    if rate_limit.window.is_zero() {
        return Err(ParleyError::ConfigValidation(
            "rate_limit.window must be greater than 0".to_string(),
        ));
    }

    if rate_limit.stale_after < rate_limit.window {
        return Err(ParleyError::ConfigValidation(format!(
            "rate_limit.stale_after ({:?}) must not be shorter than rate_limit.window ({:?})",
            rate_limit.stale_after, rate_limit.window
        )));
    }

    if rate_limit.backend == RateLimitBackend::Redis {
        if rate_limit.redis_url.is_none() {
            return Err(ParleyError::ConfigValidation(
                "rate_limit.redis_url is required for the redis backend".to_string(),
            ));
        }
        if !cfg!(feature = "distributed-rate-limit") {
            return Err(ParleyError::ConfigValidation(
                "the redis backend requires the 'distributed-rate-limit' feature".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_models(models: &ModelsConfig) -> Result<()> {
    if models.catalog.is_empty() {
        return Err(ParleyError::ConfigValidation(
            "models.catalog must not be empty".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for entry in &models.catalog {
        if entry.id.trim().is_empty() {
            return Err(ParleyError::ConfigValidation(
                "model ids must not be empty".to_string(),
            ));
        }
        if !ids.insert(entry.id.as_str()) {
            return Err(ParleyError::ConfigValidation(format!(
                "Duplicate model id: {}",
                entry.id
            )));
        }
    }

    if !ids.contains(models.default_model.as_str()) {
        return Err(ParleyError::ConfigValidation(format!(
            "models.default_model '{}' is not in the catalog",
            models.default_model
        )));
    }

    Ok(())
}
