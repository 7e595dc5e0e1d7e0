//! Identity backend client for the GYMovoo client core.
//!
//! This crate provides:
//! - The `IdentityService` contract the session store consumes
//! - Typed records for the profile/preferences/stats resources
//! - An HTTP implementation speaking the backend's REST surface
//! - A broadcast stream of out-of-band auth state changes

mod error;
mod http;
mod service;
mod types;

pub use error::{IdentityError, IdentityResult};
pub use http::{HttpIdentityService, IdentityConfig, REQUEST_TIMEOUT};
pub use service::IdentityService;
pub use types::{
    AccountRecord, AuthEvent, FitnessLevel, PreferencesRecord, ProfileRecord, ProfileUpdate,
    StatsRecord, Units,
};
