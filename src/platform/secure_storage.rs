use async_trait::async_trait;
use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const KEYRING_SERVICE: &str = "ai.valechat.provider_keys";

/// Administrator-managed credential overrides. The router only reads.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, provider: &str) -> Result<Option<String>>;
}

/// Credentials kept in the OS secure store via `keyring`.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub async fn set(&self, provider: &str, key: &str) -> Result<()> {
        debug!("Storing API key for provider: {}", provider);
        let service = self.service.clone();
        let provider = provider.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let entry = Entry::new(&service, &provider)?;
            entry.set_password(&key)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::platform(format!("Keyring task failed: {}", e)))?
    }

    pub async fn remove(&self, provider: &str) -> Result<()> {
        debug!("Deleting API key for provider: {}", provider);
        let service = self.service.clone();
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let entry = Entry::new(&service, &provider)?;
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(Error::SecureStorage(e)),
            }
        })
        .await
        .map_err(|e| Error::platform(format!("Keyring task failed: {}", e)))?
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn get(&self, provider: &str) -> Result<Option<String>> {
        let service = self.service.clone();
        let provider_name = provider.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let entry = Entry::new(&service, &provider_name)?;
            match entry.get_password() {
                Ok(password) => Ok(Some(password)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(Error::SecureStorage(e)),
            }
        })
        .await
        .map_err(|e| Error::platform(format!("Keyring task failed: {}", e)))?;

        if result.is_err() {
            warn!("Failed to read keyring entry for provider: {}", provider);
        }
        result
    }
}

/// Process-local override store, e.g. fed from an admin settings table.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    keys: RwLock<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, provider: &str, key: &str) {
        self.keys.write().insert(provider.to_string(), key.to_string());
    }

    pub fn remove(&self, provider: &str) {
        self.keys.write().remove(provider);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, provider: &str) -> Result<Option<String>> {
        Ok(self.keys.read().get(provider).cloned())
    }
}
