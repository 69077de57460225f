//! Configuration module for the Parley gateway
//!
//! Supports YAML and TOML configuration formats with validation.
//! Environment variables can be interpolated using `${VAR}`, `${VAR:-default}`, or `${VAR:?error}` syntax.
//! Every section has defaults, so an empty file (or no file at all) is a valid configuration.

mod env;
mod types;
mod validation;

pub use env::{expand_env_vars, EnvExpander};
pub use types::*;
pub use validation::validate_config;

use crate::error::{ParleyError, Result};
use std::path::Path;
use tracing::info;

/// Load configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    load_config_with_options(path, true)
}

/// Load configuration with control over environment variable expansion
pub fn load_config_with_options<P: AsRef<Path>>(path: P, expand_env: bool) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ParleyError::Config(format!("Failed to read config file {:?}: {}", path, e)))?;

    let content = if expand_env {
        expand_env_vars(&content)?
    } else {
        content
    };

    let config = parse_config(&content, path)?;
    validate_config(&config)?;

    info!("Configuration loaded successfully from {:?}", path);
    Ok(config)
}

/// Load from `path` when given, otherwise validated defaults
pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let config = Config::default();
            validate_config(&config)?;
            Ok(config)
        }
    }
}

/// Parse configuration from string content
fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

    // serde_yaml rejects an empty document for a struct
    if content.trim().is_empty() {
        return Ok(Config::default());
    }

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.into()),
        "toml" => toml::from_str(content).map_err(|e| e.into()),
        _ => Err(ParleyError::Config(format!(
            "Unsupported config format: {}",
            extension
        ))),
    }
}
