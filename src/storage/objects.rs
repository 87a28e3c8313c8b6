use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Kind of generated asset, used to bucket uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetCategory {
    Image,
    Video,
    Audio,
}

impl AssetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetCategory::Image => "image",
            AssetCategory::Video => "video",
            AssetCategory::Audio => "audio",
        }
    }

    /// File extension for a content type, falling back to the category default.
    pub fn extension_for(&self, content_type: &str) -> &'static str {
        match content_type {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "video/mp4" => "mp4",
            "video/webm" => "webm",
            "audio/mpeg" | "audio/mp3" => "mp3",
            "audio/wav" | "audio/x-wav" => "wav",
            _ => match self {
                AssetCategory::Image => "png",
                AssetCategory::Video => "mp4",
                AssetCategory::Audio => "mp3",
            },
        }
    }
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub public_url: String,
    pub size_bytes: u64,
}

/// Durable storage for generated media. Adapters upload every binary they
/// produce and hand back the returned URL.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, payload: Vec<u8>, category: AssetCategory, content_type: &str) -> Result<StoredObject>;
}
