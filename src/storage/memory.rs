use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::storage::objects::{AssetCategory, ObjectStorage, StoredObject};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryObject {
    pub category: AssetCategory,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub public_url: String,
}

/// Keeps uploads in memory. Useful for embedding and tests; can be told to
/// fail every upload.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<Vec<MemoryObject>>,
    fail_uploads: AtomicBool,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn objects(&self) -> Vec<MemoryObject> {
        self.objects.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn upload(&self, payload: Vec<u8>, category: AssetCategory, content_type: &str) -> Result<StoredObject> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(Error::storage("upload rejected"));
        }

        let mut objects = self.objects.lock();
        let public_url = format!(
            "memory://{}/{}.{}",
            category,
            objects.len(),
            category.extension_for(content_type)
        );
        let size_bytes = payload.len() as u64;
        objects.push(MemoryObject {
            category,
            content_type: content_type.to_string(),
            payload,
            public_url: public_url.clone(),
        });

        Ok(StoredObject { public_url, size_bytes })
    }
}
