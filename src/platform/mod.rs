pub mod clock;
pub mod paths;
pub mod secure_storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use paths::AppPaths;
pub use secure_storage::{CredentialStore, InMemoryCredentialStore, KeyringCredentialStore};
