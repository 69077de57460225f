//! Environment variable interpolation for configuration files
//!
//! Supported forms:
//! - `${VAR}` - required, fails if unset
//! - `${VAR:-default}` - falls back to `default`
//! - `${VAR:?message}` - required, fails with `message`

use crate::error::{ParleyError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:[-?])([^}]*))?\}").unwrap()
});

/// Expands `${...}` references against the process environment
/// or a fixed map (used by tests).
#[derive(Debug, Default)]
pub struct EnvExpander {
    source: Option<HashMap<String, String>>,
}

impl EnvExpander {
    /// Expander reading the process environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Expander reading from a fixed map
    pub fn with_source(source: HashMap<String, String>) -> Self {
        Self {
            source: Some(source),
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match &self.source {
            Some(map) => map.get(name).cloned(),
            None => std::env::var(name).ok(),
        }
    }

    /// Expand every reference in `input`, collecting all failures
    pub fn expand(&self, input: &str) -> Result<String> {
        let mut errors = Vec::new();

        let expanded = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            let modifier = caps.get(2).map(|m| m.as_str());
            let operand = caps.get(3).map(|m| m.as_str()).unwrap_or("");

            if let Some(value) = self.lookup(name) {
                return value;
            }
            match modifier {
                Some(":-") => operand.to_string(),
                Some(":?") if !operand.is_empty() => {
                    errors.push(operand.to_string());
                    String::new()
                }
                _ => {
                    errors.push(format!("Environment variable '{}' is not set", name));
                    String::new()
                }
            }
        });

        if errors.is_empty() {
            Ok(expanded.into_owned())
        } else {
            Err(ParleyError::Config(format!(
                "Environment variable errors:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Expand environment references using the process environment
pub fn expand_env_vars(input: &str) -> Result<String> {
    EnvExpander::new().expand(input)
}
