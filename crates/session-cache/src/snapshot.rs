//! High-level API for persisting the session snapshot.

use crate::{KeyValueStorage, StorageError, StorageKeys, StorageResult};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Current snapshot schema version. Bump when the persisted shape changes;
/// `SnapshotManager::load` discards snapshots written by any other version.
pub const SCHEMA_VERSION: u32 = 1;

/// How long guest/demo snapshots are retained before a load discards them.
pub const ANONYMOUS_RETENTION_DAYS: i64 = 30;

/// Identity mode of a persisted session.
///
/// Unauthenticated sessions are never persisted; the absence of a snapshot is
/// what unauthenticated looks like on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedMode {
    Registered,
    Demo,
    Guest,
}

impl PersistedMode {
    /// Returns true for identities with no backend account.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, PersistedMode::Demo | PersistedMode::Guest)
    }
}

/// The durable subset of a session. Transient fields (loading flags, last
/// error) never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot<U> {
    /// Schema version this snapshot was written with.
    #[serde(default)]
    pub schema_version: u32,
    /// Identity mode at save time.
    pub mode: PersistedMode,
    /// The user record.
    pub user: U,
    /// When the snapshot was saved (RFC 3339).
    pub saved_at: String,
}

impl<U> SessionSnapshot<U> {
    /// Create a snapshot stamped with the current schema version and time.
    pub fn new(mode: PersistedMode, user: U) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            mode,
            user,
            saved_at: Utc::now().to_rfc3339(),
        }
    }

    /// Whether the retention window for this snapshot has elapsed.
    ///
    /// Only guest/demo snapshots expire; registered sessions are owned by the
    /// backend and are not aged out locally. A `saved_at` that fails to parse
    /// counts as expired.
    pub fn is_expired(&self) -> bool {
        if !self.mode.is_anonymous() {
            return false;
        }

        match DateTime::parse_from_rfc3339(&self.saved_at) {
            Ok(saved_at) => {
                let cutoff = Utc::now() - Duration::days(ANONYMOUS_RETENTION_DAYS);
                saved_at.with_timezone(&Utc) < cutoff
            }
            Err(_) => true,
        }
    }
}

/// High-level API for saving and restoring the session snapshot.
pub struct SnapshotManager {
    storage: Box<dyn KeyValueStorage>,
}

impl SnapshotManager {
    /// Create a new snapshot manager with the given storage backend
    pub fn new(storage: Box<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Persist a session snapshot.
    pub fn save<U: Serialize>(&self, snapshot: &SessionSnapshot<U>) -> StorageResult<()> {
        let serialized = serde_json::to_string(snapshot)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        self.storage.set(StorageKeys::SESSION_SNAPSHOT, &serialized)?;
        debug!(mode = ?snapshot.mode, "Session snapshot saved");
        Ok(())
    }

    /// Load the persisted session snapshot, if any.
    ///
    /// Every degraded case — missing key, corrupt JSON, unknown schema
    /// version, expired retention window — returns `Ok(None)` so the caller
    /// boots into an unauthenticated session instead of crashing. Unreadable
    /// snapshots are cleared so they are not re-parsed on every start.
    pub fn load<U: DeserializeOwned>(&self) -> StorageResult<Option<SessionSnapshot<U>>> {
        let raw = match self.storage.get(StorageKeys::SESSION_SNAPSHOT)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let snapshot: SessionSnapshot<U> = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Corrupt session snapshot, discarding");
                self.clear()?;
                return Ok(None);
            }
        };

        if snapshot.schema_version != SCHEMA_VERSION {
            // Migration hook: older shapes would be upgraded here once one
            // exists. Until then, unknown versions are discarded.
            info!(
                found = snapshot.schema_version,
                supported = SCHEMA_VERSION,
                "Session snapshot schema mismatch, discarding"
            );
            self.clear()?;
            return Ok(None);
        }

        if snapshot.is_expired() {
            info!(mode = ?snapshot.mode, "Session snapshot past retention window, discarding");
            self.clear()?;
            return Ok(None);
        }

        Ok(Some(snapshot))
    }

    /// Remove the persisted session snapshot.
    pub fn clear(&self) -> StorageResult<()> {
        self.storage.delete(StorageKeys::SESSION_SNAPSHOT)?;
        Ok(())
    }

    /// Check whether a snapshot is currently persisted.
    pub fn has_session(&self) -> StorageResult<bool> {
        self.storage.has(StorageKeys::SESSION_SNAPSHOT)
    }
}
