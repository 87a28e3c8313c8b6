// Durable storage for generated assets

pub mod local;
pub mod memory;
pub mod objects;

pub use local::LocalObjectStorage;
pub use memory::{MemoryObject, MemoryObjectStorage};
pub use objects::{AssetCategory, ObjectStorage, StoredObject};
