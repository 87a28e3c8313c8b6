use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::objects::{AssetCategory, ObjectStorage, StoredObject};

/// Writes assets under `root/<category>/` and serves them either as
/// `file://` URLs or under a configured public base URL.
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        let root = root.into();
        info!("Local object storage rooted at {:?}", root);
        Self {
            root,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn public_url(&self, path: &std::path::Path, relative: &str) -> Result<String> {
        match &self.public_base_url {
            Some(base) => Ok(format!("{}/{}", base, relative)),
            None => url::Url::from_file_path(path)
                .map(|u| u.to_string())
                .map_err(|_| Error::storage(format!("Cannot build file URL for {:?}", path))),
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, payload: Vec<u8>, category: AssetCategory, content_type: &str) -> Result<StoredObject> {
        if payload.is_empty() {
            return Err(Error::storage("Refusing to store an empty payload"));
        }

        let dir = self.root.join(category.as_str());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(format!("Failed to create {:?}: {}", dir, e)))?;

        let file_name = format!("{}.{}", Uuid::new_v4(), category.extension_for(content_type));
        let path = dir.join(&file_name);
        let size_bytes = payload.len() as u64;

        fs::write(&path, payload)
            .await
            .map_err(|e| Error::storage(format!("Failed to write {:?}: {}", path, e)))?;
        debug!("Stored {} bytes of {} at {:?}", size_bytes, category, path);

        let absolute = fs::canonicalize(&path).await.unwrap_or(path);
        let public_url = self.public_url(&absolute, &format!("{}/{}", category.as_str(), file_name))?;
        Ok(StoredObject { public_url, size_bytes })
    }
}
