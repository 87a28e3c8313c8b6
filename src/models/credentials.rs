use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::app::config::{default_api_key_env, RouterConfig};
use crate::platform::CredentialStore;

/// Where the environment fallback is read from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    #[default]
    Process,
    Fixed(HashMap<String, String>),
}

impl EnvSource {
    fn get(&self, var: &str) -> Option<String> {
        match self {
            EnvSource::Process => std::env::var(var).ok(),
            EnvSource::Fixed(vars) => vars.get(var).cloned(),
        }
    }
}

/// Resolves provider credentials: override store first, then environment.
/// Nothing is cached; every call reads the sources again.
#[derive(Clone, Default)]
pub struct CredentialSource {
    store: Option<Arc<dyn CredentialStore>>,
    env_vars: HashMap<String, String>,
    env: EnvSource,
}

impl CredentialSource {
    pub fn new(store: Option<Arc<dyn CredentialStore>>) -> Self {
        Self {
            store,
            env_vars: HashMap::new(),
            env: EnvSource::Process,
        }
    }

    pub fn from_config(config: &RouterConfig, store: Option<Arc<dyn CredentialStore>>) -> Self {
        let env_vars = config
            .providers
            .iter()
            .filter_map(|(name, settings)| {
                settings
                    .api_key_env
                    .as_ref()
                    .map(|var| (name.clone(), var.clone()))
            })
            .collect();
        Self {
            store,
            env_vars,
            env: EnvSource::Process,
        }
    }

    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    pub fn with_env_var(mut self, provider: &str, var: &str) -> Self {
        self.env_vars.insert(provider.to_string(), var.to_string());
        self
    }

    fn env_var_for(&self, provider: &str) -> String {
        self.env_vars
            .get(provider)
            .cloned()
            .unwrap_or_else(|| default_api_key_env(provider))
    }

    pub async fn get_credential(&self, provider: &str) -> Option<SecretString> {
        if let Some(store) = &self.store {
            match store.get(provider).await {
                Ok(Some(key)) if !key.trim().is_empty() => {
                    debug!("Using override credential for provider: {}", provider);
                    return Some(SecretString::from(key.trim().to_string()));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Credential store lookup failed for {}, falling back to environment: {}",
                        provider, e
                    );
                }
            }
        }

        let var = self.env_var_for(provider);
        match self.env.get(&var) {
            Some(key) if !key.trim().is_empty() => {
                debug!("Using environment credential {} for provider: {}", var, provider);
                Some(SecretString::from(key.trim().to_string()))
            }
            _ => None,
        }
    }

    /// Reads the credentials for `providers` once. The snapshot stays fixed
    /// for the rest of a request so fallback attempts never see a mix of
    /// old and rotated keys.
    pub async fn snapshot(&self, providers: &[String]) -> CredentialSnapshot {
        let mut keys = HashMap::new();
        for provider in providers {
            if keys.contains_key(provider) {
                continue;
            }
            if let Some(key) = self.get_credential(provider).await {
                keys.insert(provider.clone(), key);
            }
        }
        CredentialSnapshot { keys }
    }
}

#[derive(Default)]
pub struct CredentialSnapshot {
    keys: HashMap<String, SecretString>,
}

impl CredentialSnapshot {
    pub fn get(&self, provider: &str) -> Option<&SecretString> {
        self.keys.get(provider)
    }

    pub fn has(&self, provider: &str) -> bool {
        self.keys.contains_key(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::InMemoryCredentialStore;
    use secrecy::ExposeSecret;

    fn env(pairs: &[(&str, &str)]) -> EnvSource {
        EnvSource::Fixed(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_override_beats_environment() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.set("openai", "sk-admin");
        let source = CredentialSource::new(Some(store.clone()))
            .with_env(env(&[("OPENAI_API_KEY", "sk-env"), ("GEMINI_API_KEY", "g-env")]));

        let openai = source.get_credential("openai").await.unwrap();
        assert_eq!(openai.expose_secret(), "sk-admin");

        let gemini = source.get_credential("gemini").await.unwrap();
        assert_eq!(gemini.expose_secret(), "g-env");

        assert!(source.get_credential("anthropic").await.is_none());
    }

    #[tokio::test]
    async fn test_rotation_visible_on_next_read() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.set("openai", "sk-1");
        let source = CredentialSource::new(Some(store.clone()));

        let before = source.snapshot(&["openai".to_string()]).await;
        store.set("openai", "sk-2");
        let after = source.snapshot(&["openai".to_string()]).await;

        assert_eq!(before.get("openai").unwrap().expose_secret(), "sk-1");
        assert_eq!(after.get("openai").unwrap().expose_secret(), "sk-2");
    }

    #[tokio::test]
    async fn test_surrounding_whitespace_is_stripped() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.set("openai", "sk-rotated\n");
        let source = CredentialSource::new(Some(store))
            .with_env(env(&[("GEMINI_API_KEY", "  g-key\r\n")]));

        assert_eq!(source.get_credential("openai").await.unwrap().expose_secret(), "sk-rotated");
        assert_eq!(source.get_credential("gemini").await.unwrap().expose_secret(), "g-key");
    }

    #[tokio::test]
    async fn test_blank_values_are_absent() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store.set("openai", "   ");
        let source = CredentialSource::new(Some(store))
            .with_env(env(&[("OPENAI_API_KEY", "")]));
        assert!(source.get_credential("openai").await.is_none());
    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl CredentialStore for BrokenStore {
        async fn get(&self, _provider: &str) -> crate::error::Result<Option<String>> {
            Err(crate::error::Error::platform("keyring locked"))
        }
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_to_environment() {
        let source = CredentialSource::new(Some(Arc::new(BrokenStore)))
            .with_env(env(&[("OPENAI_API_KEY", "sk-env")]));

        let key = source.get_credential("openai").await.unwrap();
        assert_eq!(key.expose_secret(), "sk-env");
        assert!(source.get_credential("anthropic").await.is_none());
    }

    #[tokio::test]
    async fn test_custom_env_var() {
        let source = CredentialSource::new(None)
            .with_env_var("gemini", "GOOGLE_API_KEY")
            .with_env(env(&[("GOOGLE_API_KEY", "g-key")]));
        let snapshot = source.snapshot(&["gemini".to_string(), "openai".to_string()]).await;
        assert!(snapshot.has("gemini"));
        assert!(!snapshot.has("openai"));
    }
}
