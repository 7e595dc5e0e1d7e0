//! The user model assembled from backend records or synthesized locally.

use chrono::Utc;
use identity_client::{AccountRecord, PreferencesRecord, ProfileRecord, StatsRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain suffix for synthetic guest email addresses.
const GUEST_EMAIL_DOMAIN: &str = "guest.gymovoo.local";

/// Role attached to an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    User,
    Admin,
    Trainer,
}

/// Identity plus profile snapshot for the current session.
///
/// The `profile`/`preferences`/`stats` sub-records mirror the backend's three
/// per-user resources and are independently nullable; guest and demo users
/// carry locally synthesized values in the same shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub profile: Option<ProfileRecord>,
    #[serde(default)]
    pub preferences: Option<PreferencesRecord>,
    #[serde(default)]
    pub stats: Option<StatsRecord>,
    #[serde(default)]
    pub is_demo: bool,
    #[serde(default)]
    pub is_guest: bool,
}

impl User {
    /// Assemble a registered user from backend records.
    ///
    /// Display name resolution: profile display name, else the local part of
    /// the account email, else a generic fallback.
    pub fn registered(
        account: AccountRecord,
        profile: Option<ProfileRecord>,
        preferences: Option<PreferencesRecord>,
        stats: Option<StatsRecord>,
    ) -> Self {
        let email = account.email.unwrap_or_default();
        let display_name = profile
            .as_ref()
            .and_then(|p| p.display_name.clone())
            .or_else(|| email.split('@').next().map(str::to_string))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Athlete".to_string());

        Self {
            id: account.id,
            email,
            display_name,
            role: UserRole::User,
            profile,
            preferences,
            stats,
            is_demo: false,
            is_guest: false,
        }
    }

    /// Synthesize a fresh guest user.
    ///
    /// The id embeds the creation time plus a uuid fragment so that two
    /// guests minted in the same millisecond still get distinct ids. Guest
    /// ids are never reused.
    pub fn guest() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        let id = format!("guest-{}-{}", Utc::now().timestamp_millis(), &uuid[..8]);
        let email = format!("{}@{}", id, GUEST_EMAIL_DOMAIN);

        Self {
            id,
            email,
            display_name: "Guest".to_string(),
            role: UserRole::User,
            profile: None,
            preferences: None,
            stats: None,
            is_demo: false,
            is_guest: true,
        }
    }
}
