use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::circuit_breaker::BreakerConfig;
use crate::models::polling::PollingConfig;
use crate::models::provider::Capability;

pub const ENV_PREFIX: &str = "CAPROUTER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub breaker: BreakerConfig,
    pub polling: PollingConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub providers: HashMap<String, ProviderSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Timeout applied by the HTTP client to every outbound request.
    pub timeout_secs: u64,
    /// Ceiling for one adapter call on non-polling capabilities.
    pub attempt_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            attempt_timeout_secs: 120,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for generated assets. Defaults to the platform data dir.
    pub root: Option<String>,
    /// Prefix for public asset URLs. Defaults to `file://` URLs.
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub priority: Option<u32>,
    pub models: HashMap<Capability, String>,
    pub fallback_models: HashMap<Capability, String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key_env: None,
            priority: None,
            models: HashMap::new(),
            fallback_models: HashMap::new(),
        }
    }
}

/// Runtime knobs the manager reads per request and that can be swapped
/// without rebuilding it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterSettings {
    pub breaker: BreakerConfig,
    pub polling: PollingConfig,
    pub http: HttpConfig,
}

impl RouterConfig {
    /// Loads the TOML file at `path` (if present) and overlays
    /// `CAPROUTER__SECTION__KEY` environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from: {:?}", path);
        } else {
            info!("Config file {:?} not found, using defaults", path);
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RouterConfig = settings.try_deserialize()?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(Error::validation("Breaker failure threshold must be at least 1"));
        }
        if self.polling.max_attempts == 0 {
            return Err(Error::validation("Polling max_attempts must be at least 1"));
        }
        if self.http.timeout_secs == 0 || self.http.attempt_timeout_secs == 0 {
            return Err(Error::validation("HTTP timeouts must be positive"));
        }

        for (name, provider) in &self.providers {
            if let Some(base_url) = &provider.base_url {
                url::Url::parse(base_url)
                    .map_err(|e| Error::validation(format!("Provider {} has invalid base_url: {}", name, e)))?;
            }
            if let Some(env) = &provider.api_key_env {
                if env.is_empty() {
                    return Err(Error::validation(format!("Provider {} has empty api_key_env", name)));
                }
            }
        }

        if let Some(base) = &self.storage.public_base_url {
            url::Url::parse(base)
                .map_err(|e| Error::validation(format!("Invalid storage public_base_url: {}", e)))?;
        }

        Ok(())
    }

    pub fn settings(&self) -> RouterSettings {
        RouterSettings {
            breaker: self.breaker.clone(),
            polling: self.polling.clone(),
            http: self.http.clone(),
        }
    }

    pub fn base_url(&self, provider: &str) -> Option<&str> {
        self.providers
            .get(provider)
            .and_then(|p| p.base_url.as_deref())
    }

    /// Environment variable holding the fallback credential for `provider`.
    pub fn api_key_env(&self, provider: &str) -> String {
        self.providers
            .get(provider)
            .and_then(|p| p.api_key_env.clone())
            .unwrap_or_else(|| default_api_key_env(provider))
    }
}

pub fn default_api_key_env(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = RouterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_secs, 60);
        assert!(!config.breaker.timeout_trips_breaker);
    }

    #[test]
    fn test_config_validation() {
        let mut config = RouterConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.providers.insert(
            "openai".to_string(),
            ProviderSettings {
                base_url: Some("not a url".to_string()),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_env_defaults() {
        let mut config = RouterConfig::default();
        assert_eq!(config.api_key_env("openai"), "OPENAI_API_KEY");
        assert_eq!(default_api_key_env("my-vendor"), "MY_VENDOR_API_KEY");

        config.providers.insert(
            "gemini".to_string(),
            ProviderSettings {
                api_key_env: Some("GOOGLE_API_KEY".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(config.api_key_env("gemini"), "GOOGLE_API_KEY");
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RouterConfig::default();
        config.breaker.failure_threshold = 3;
        config.polling.interval_ms = 250;
        let mut replicate = ProviderSettings {
            base_url: Some("http://localhost:9000".to_string()),
            ..Default::default()
        };
        replicate.models.insert(Capability::Video, "luma/ray".to_string());
        config.providers.insert("replicate".to_string(), replicate);
        config.save(&path).await.unwrap();

        let loaded = RouterConfig::load(&path).unwrap();
        assert_eq!(loaded.breaker.failure_threshold, 3);
        assert_eq!(loaded.polling.interval_ms, 250);
        assert_eq!(loaded.base_url("replicate"), Some("http://localhost:9000"));
        assert_eq!(
            loaded.providers["replicate"].models.get(&Capability::Video).map(String::as_str),
            Some("luma/ray")
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = RouterConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.http, HttpConfig::default());
    }
}
