//! Typed records for the identity backend boundary.
//!
//! The backend exposes profile, preferences, and stats as three independent
//! resources keyed by user id. Each row carries its own timestamps. Payloads
//! are validated into these shapes at the boundary; nothing downstream deals
//! in untyped JSON.

use serde::{Deserialize, Serialize};

/// Self-reported training level. Also names the demo templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitnessLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl FitnessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitnessLevel::Beginner => "beginner",
            FitnessLevel::Intermediate => "intermediate",
            FitnessLevel::Advanced => "advanced",
        }
    }
}

impl std::str::FromStr for FitnessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginner" => Ok(FitnessLevel::Beginner),
            "intermediate" => Ok(FitnessLevel::Intermediate),
            "advanced" => Ok(FitnessLevel::Advanced),
            other => Err(format!("Unknown fitness level: {}", other)),
        }
    }
}

impl std::fmt::Display for FitnessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurement system preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    Metric,
    Imperial,
}

/// Minimal account record returned by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// User ID issued by the backend
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Profile row from the `profiles` resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub height_cm: Option<f32>,
    #[serde(default)]
    pub weight_kg: Option<f32>,
    #[serde(default)]
    pub fitness_level: Option<FitnessLevel>,
    /// Row creation time (RFC 3339)
    pub created_at: String,
    /// Last row update time (RFC 3339)
    pub updated_at: String,
}

/// Preferences row from the `preferences` resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesRecord {
    pub user_id: String,
    #[serde(default)]
    pub units: Option<Units>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub notifications_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Stats row from the `stats` resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub user_id: String,
    #[serde(default)]
    pub workouts_completed: u32,
    #[serde(default)]
    pub total_minutes: u32,
    #[serde(default)]
    pub streak_days: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial profile mutation. Only set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fitness_level: Option<FitnessLevel>,
}

impl ProfileUpdate {
    /// True when no field is set (nothing to send).
    pub fn is_empty(&self) -> bool {
        self == &ProfileUpdate::default()
    }
}

/// Out-of-band auth state change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    /// A session was established for this client.
    SignedIn { user_id: String },
    /// The session was terminated (locally or elsewhere).
    SignedOut,
}
