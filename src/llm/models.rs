//! Static model catalog and client-to-upstream model resolution

use crate::config::{ModelEntry, ModelsConfig};
use crate::llm::types::{ModelCard, ModelList};
use tracing::debug;

/// Synthetic `created` timestamp reported for every model (2024-01-01T00:00:00Z)
pub const CATALOG_CREATED: i64 = 1_704_067_200;

/// Models the upstream serves, with client-friendly aliases
pub fn default_catalog() -> Vec<ModelEntry> {
    let entry = |id: &str, upstream: Option<&str>, owner: &str| ModelEntry {
        id: id.to_string(),
        upstream_id: upstream.map(String::from),
        owned_by: owner.to_string(),
    };

    vec![
        entry("gpt-4o-mini", None, "openai"),
        entry("o3-mini", None, "openai"),
        entry("claude-3-haiku", Some("claude-3-haiku-20240307"), "anthropic"),
        entry(
            "llama-3.3-70b",
            Some("meta-llama/Llama-3.3-70B-Instruct-Turbo"),
            "meta",
        ),
        entry(
            "mistral-small-3",
            Some("mistralai/Mistral-Small-24B-Instruct-2501"),
            "mistralai",
        ),
    ]
}

/// Lookup over the configured catalog
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
    default_index: usize,
}

impl ModelCatalog {
    /// Build from configuration; an unlisted default falls back to the first entry
    pub fn new(config: &ModelsConfig) -> Self {
        let default_index = config
            .catalog
            .iter()
            .position(|m| m.id == config.default_model)
            .unwrap_or(0);
        Self {
            entries: config.catalog.clone(),
            default_index,
        }
    }

    /// Resolve a requested model by client id or upstream id,
    /// falling back to the default model
    pub fn resolve(&self, requested: Option<&str>) -> &ModelEntry {
        let requested = requested.map(str::trim).filter(|s| !s.is_empty());
        if let Some(name) = requested {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|m| m.id == name || m.upstream_id() == name)
            {
                return entry;
            }
            debug!(model = name, "Unknown model requested, using default");
        }
        &self.entries[self.default_index]
    }

    /// The `/v1/models` listing
    pub fn list(&self) -> ModelList {
        ModelList {
            object: "list".to_string(),
            data: self
                .entries
                .iter()
                .map(|m| ModelCard {
                    id: m.id.clone(),
                    object: "model".to_string(),
                    created: CATALOG_CREATED,
                    owned_by: m.owned_by.clone(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
