//! Canned demo identities.
//!
//! Demo users are seeded from a fixed per-level template so the app can be
//! showcased without an account. Everything about them is deterministic:
//! same level, same id, same stats, every time.

use crate::{User, UserRole};
use identity_client::{FitnessLevel, PreferencesRecord, ProfileRecord, StatsRecord, Units};

/// Domain suffix for synthetic demo email addresses.
const DEMO_EMAIL_DOMAIN: &str = "demo.gymovoo.local";

/// Fixed timestamp stamped on demo records. Demo data has no real history.
const DEMO_EPOCH: &str = "2024-01-01T00:00:00Z";

/// A canned demo identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemoTemplate {
    pub level: FitnessLevel,
    pub display_name: &'static str,
    pub age: u8,
    pub height_cm: f32,
    pub weight_kg: f32,
    pub workouts_completed: u32,
    pub total_minutes: u32,
    pub streak_days: u32,
}

const DEMO_TEMPLATES: &[DemoTemplate] = &[
    DemoTemplate {
        level: FitnessLevel::Beginner,
        display_name: "Noa (Demo)",
        age: 24,
        height_cm: 168.0,
        weight_kg: 64.0,
        workouts_completed: 6,
        total_minutes: 180,
        streak_days: 2,
    },
    DemoTemplate {
        level: FitnessLevel::Intermediate,
        display_name: "Omer (Demo)",
        age: 31,
        height_cm: 176.0,
        weight_kg: 78.0,
        workouts_completed: 84,
        total_minutes: 3150,
        streak_days: 11,
    },
    DemoTemplate {
        level: FitnessLevel::Advanced,
        display_name: "Maya (Demo)",
        age: 28,
        height_cm: 171.0,
        weight_kg: 62.0,
        workouts_completed: 312,
        total_minutes: 14760,
        streak_days: 46,
    },
];

/// Look up the template for a level. Every level has one.
pub fn demo_template(level: FitnessLevel) -> &'static DemoTemplate {
    DEMO_TEMPLATES
        .iter()
        .find(|t| t.level == level)
        .expect("every fitness level has a demo template")
}

/// Deterministic demo user id for a level.
pub fn demo_user_id(level: FitnessLevel) -> String {
    format!("demo-{}", level)
}

/// Build the full demo user for a level.
pub fn demo_user(level: FitnessLevel) -> User {
    let template = demo_template(level);
    let id = demo_user_id(level);
    let email = format!("{}@{}", id, DEMO_EMAIL_DOMAIN);

    let profile = ProfileRecord {
        user_id: id.clone(),
        display_name: Some(template.display_name.to_string()),
        avatar_url: None,
        age: Some(template.age),
        height_cm: Some(template.height_cm),
        weight_kg: Some(template.weight_kg),
        fitness_level: Some(level),
        created_at: DEMO_EPOCH.to_string(),
        updated_at: DEMO_EPOCH.to_string(),
    };

    let preferences = PreferencesRecord {
        user_id: id.clone(),
        units: Some(Units::Metric),
        language: None,
        notifications_enabled: false,
        created_at: DEMO_EPOCH.to_string(),
        updated_at: DEMO_EPOCH.to_string(),
    };

    let stats = StatsRecord {
        user_id: id.clone(),
        workouts_completed: template.workouts_completed,
        total_minutes: template.total_minutes,
        streak_days: template.streak_days,
        created_at: DEMO_EPOCH.to_string(),
        updated_at: DEMO_EPOCH.to_string(),
    };

    User {
        id,
        email,
        display_name: template.display_name.to_string(),
        role: UserRole::User,
        profile: Some(profile),
        preferences: Some(preferences),
        stats: Some(stats),
        is_demo: true,
        is_guest: false,
    }
}
