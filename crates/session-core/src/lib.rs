//! Session management core for the GYMovoo client.
//!
//! This crate provides:
//! - An explicit FSM over the four identity modes (unauthenticated,
//!   registered, demo, guest)
//! - The `SessionStore`: sole owner and mutator of the session, with
//!   serialized transitions, double-tap coalescing, and a staleness guard
//! - Guest identity synthesis and canned demo templates
//! - Reconciliation of out-of-band backend auth events
//!
//! Collaborators are injected: the identity backend behind
//! `identity_client::IdentityService` and the durable cache behind
//! `session_cache::SnapshotManager`. See `SessionStore` for the lifecycle.

mod demo;
mod error;
mod fsm;
mod store;
mod user;

pub use demo::{demo_template, demo_user, demo_user_id, DemoTemplate};
pub use error::{SessionError, SessionResult};
pub use fsm::session_machine;
pub use fsm::{
    IdentityMode, SessionChangedPayload, SessionInput, SessionMachine, SessionMachineState,
};
pub use store::{SessionCallback, SessionState, SessionStore};
pub use user::{User, UserRole};

// Re-exported so store consumers don't need a direct identity-client
// dependency for the common types.
pub use identity_client::{FitnessLevel, ProfileUpdate};
