use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::app::RouterConfig;
use crate::error::{Error, Result};
use crate::models::provider::Capability;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDefinition {
    pub name: String,
    pub capability: Capability,
    /// Lower is preferred.
    pub priority: u32,
    pub model_id: String,
    pub fallback_model_id: Option<String>,
    pub implemented: bool,
}

impl ProviderDefinition {
    pub fn new(name: &str, capability: Capability, priority: u32, model_id: &str) -> Self {
        Self {
            name: name.to_string(),
            capability,
            priority,
            model_id: model_id.to_string(),
            fallback_model_id: None,
            implemented: true,
        }
    }

    pub fn with_fallback_model(mut self, model_id: &str) -> Self {
        self.fallback_model_id = Some(model_id.to_string());
        self
    }

    pub fn unimplemented(mut self) -> Self {
        self.implemented = false;
        self
    }
}

pub fn default_definitions() -> Vec<ProviderDefinition> {
    use Capability::*;

    vec![
        ProviderDefinition::new("openai", Text, 1, "gpt-4o").with_fallback_model("gpt-4o-mini"),
        ProviderDefinition::new("anthropic", Text, 2, "claude-3-5-sonnet-20241022")
            .with_fallback_model("claude-3-haiku-20240307"),
        ProviderDefinition::new("gemini", Text, 3, "gemini-1.5-pro").with_fallback_model("gemini-1.5-flash"),
        ProviderDefinition::new("openai", TextStream, 1, "gpt-4o").with_fallback_model("gpt-4o-mini"),
        ProviderDefinition::new("anthropic", TextStream, 2, "claude-3-5-sonnet-20241022"),
        ProviderDefinition::new("gemini", TextStream, 3, "gemini-1.5-flash"),
        ProviderDefinition::new("openai", Image, 1, "dall-e-3"),
        ProviderDefinition::new("replicate", Image, 2, "black-forest-labs/flux-schnell"),
        ProviderDefinition::new("gemini", Image, 3, "imagen-3.0-generate-002"),
        ProviderDefinition::new("openai", ImageEdit, 1, "gpt-image-1").with_fallback_model("dall-e-2"),
        ProviderDefinition::new("stability", ImageEdit, 2, "stable-diffusion-xl").unimplemented(),
        ProviderDefinition::new("replicate", Video, 1, "minimax/video-01"),
        ProviderDefinition::new("runway", Video, 2, "gen3a_turbo").unimplemented(),
        ProviderDefinition::new("elevenlabs", Speech, 1, "eleven_multilingual_v2"),
        ProviderDefinition::new("openai", Speech, 2, "tts-1").with_fallback_model("tts-1-hd"),
    ]
}

/// Static (provider, capability) table, validated once at startup.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    definitions: Vec<ProviderDefinition>,
}

impl CapabilityRegistry {
    pub fn new(definitions: Vec<ProviderDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        for definition in &definitions {
            if definition.name.is_empty() {
                return Err(Error::validation("Provider definition has an empty name"));
            }
            if definition.model_id.is_empty() {
                return Err(Error::validation(format!(
                    "Provider {} has an empty model id for {}",
                    definition.name, definition.capability
                )));
            }
            if !seen.insert((definition.name.clone(), definition.capability)) {
                return Err(Error::validation(format!(
                    "Provider {} is registered twice for {}",
                    definition.name, definition.capability
                )));
            }
        }
        Ok(Self { definitions })
    }

    pub fn with_defaults() -> Self {
        Self {
            definitions: default_definitions(),
        }
    }

    /// Applies per-provider overrides from the router configuration on top
    /// of the built-in table. Disabled providers are dropped entirely.
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let mut definitions = Vec::new();
        for mut definition in default_definitions() {
            if let Some(overrides) = config.providers.get(&definition.name) {
                if !overrides.enabled {
                    debug!("Provider {} disabled by configuration", definition.name);
                    continue;
                }
                if let Some(priority) = overrides.priority {
                    definition.priority = priority;
                }
                if let Some(model) = overrides.models.get(&definition.capability) {
                    definition.model_id = model.clone();
                }
                if let Some(model) = overrides.fallback_models.get(&definition.capability) {
                    definition.fallback_model_id = Some(model.clone());
                }
            }
            definitions.push(definition);
        }
        Self::new(definitions)
    }

    /// Definitions for `capability`, most preferred first. Equal priorities
    /// keep declaration order.
    pub fn get_candidates(&self, capability: Capability) -> Vec<ProviderDefinition> {
        let mut candidates: Vec<ProviderDefinition> = self
            .definitions
            .iter()
            .filter(|d| d.capability == capability)
            .cloned()
            .collect();
        candidates.sort_by_key(|d| d.priority);
        candidates
    }

    pub fn is_implemented(&self, provider: &str, capability: Capability) -> bool {
        self.definition(provider, capability)
            .map(|d| d.implemented)
            .unwrap_or(false)
    }

    pub fn definition(&self, provider: &str, capability: Capability) -> Option<&ProviderDefinition> {
        self.definitions
            .iter()
            .find(|d| d.name == provider && d.capability == capability)
    }

    /// Distinct provider names in declaration order.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for definition in &self.definitions {
            if !names.contains(&definition.name) {
                names.push(definition.name.clone());
            }
        }
        names
    }

    pub fn definitions(&self) -> &[ProviderDefinition] {
        &self.definitions
    }
}
