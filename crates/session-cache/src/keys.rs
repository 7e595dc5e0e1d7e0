//! Storage key constants.

/// Storage keys used by the session cache
pub struct StorageKeys;

impl StorageKeys {
    /// Persisted session snapshot (JSON)
    pub const SESSION_SNAPSHOT: &'static str = "session_snapshot";
}
