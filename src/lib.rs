pub mod app;
pub mod models;
pub mod platform;
pub mod storage;
pub mod error;

pub use error::{Error, Result};
