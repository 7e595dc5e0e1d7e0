//! Durable session cache for the GYMovoo client core.
//!
//! This crate provides:
//! - A key-value storage abstraction with a file-backed implementation
//! - A snapshot manager that owns session serialization, schema versioning,
//!   and the retention policy for anonymous sessions
//!
//! Load failures always degrade to "no session" — the app boots into an
//! unauthenticated state rather than crashing on a bad cache.

mod file;
mod keys;
mod snapshot;
mod traits;

pub use file::FileStorage;
pub use keys::StorageKeys;
pub use snapshot::{
    PersistedMode, SessionSnapshot, SnapshotManager, ANONYMOUS_RETENTION_DAYS, SCHEMA_VERSION,
};
pub use traits::KeyValueStorage;

use thiserror::Error;

/// Directory name under the platform data dir holding the session cache.
pub const STORE_DIR: &str = "gymovoo";

/// File name of the default session cache.
pub const STORE_FILE: &str = "session-store.json";

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backing store error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Create the default file-backed storage under the platform data directory.
pub fn create_storage() -> StorageResult<Box<dyn KeyValueStorage>> {
    let base = dirs::data_dir()
        .ok_or_else(|| StorageError::Backend("No data directory on this platform".to_string()))?;
    let storage = FileStorage::new(base.join(STORE_DIR).join(STORE_FILE))?;
    Ok(Box::new(storage))
}

/// Create a SnapshotManager with the default storage backend.
pub fn create_snapshot_manager() -> StorageResult<SnapshotManager> {
    let storage = create_storage()?;
    Ok(SnapshotManager::new(storage))
}
