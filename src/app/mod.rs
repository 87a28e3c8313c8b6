pub mod config;

pub use config::{HttpConfig, ProviderSettings, RouterConfig, RouterSettings, StorageConfig};
