//! The identity service contract consumed by the session store.

use crate::{
    AccountRecord, AuthEvent, IdentityResult, PreferencesRecord, ProfileRecord, ProfileUpdate,
    StatsRecord,
};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Remote identity backend boundary.
///
/// The session store never assumes a specific transport; anything that can
/// answer these calls works. Fetches of the three per-user resources return
/// `Ok(None)` for a missing row — the sub-records are independently nullable
/// on the user model.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Authenticate with email and password.
    async fn sign_in(&self, email: &str, password: &str) -> IdentityResult<AccountRecord>;

    /// Create a new account.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> IdentityResult<AccountRecord>;

    /// Terminate the current backend session. Idempotent.
    async fn sign_out(&self) -> IdentityResult<()>;

    /// The account behind the current backend session, if one exists.
    async fn get_session(&self) -> IdentityResult<Option<AccountRecord>>;

    /// Fetch the profile row for a user.
    async fn get_profile(&self, user_id: &str) -> IdentityResult<Option<ProfileRecord>>;

    /// Apply a partial profile mutation and return the updated row.
    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> IdentityResult<ProfileRecord>;

    /// Fetch the preferences row for a user.
    async fn get_preferences(&self, user_id: &str) -> IdentityResult<Option<PreferencesRecord>>;

    /// Fetch the stats row for a user.
    async fn get_stats(&self, user_id: &str) -> IdentityResult<Option<StatsRecord>>;

    /// Subscribe to out-of-band auth state changes.
    ///
    /// Each call returns a fresh receiver on the same event stream.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
