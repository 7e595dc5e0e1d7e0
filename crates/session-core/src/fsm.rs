//! Identity mode state machine using rust-fsm.
//!
//! This module defines an explicit finite state machine over the four
//! identity modes, replacing implicit mode derivation from whatever user
//! record happens to be loaded.
//!
//! The machine tracks *modes*, and its inputs are *completed* transitions.
//! In-flight work (signing in, refreshing, ...) is tracked by the session
//! store's loading flag instead of machine states: a failed transition must
//! leave the session exactly where it was, and sign-in is legal from guest
//! and demo modes too, so transient machine states would need one variant
//! per origin mode to get the failure edges right.
//!
//! ## State Diagram
//!
//! ```text
//!                 ┌──────────────────────────────────┐
//!                 │         Unauthenticated          │ (initial)
//!                 └───┬──────────┬──────────┬────────┘
//!    SignedIn/SignedUp│          │          │
//!    RemoteSignedIn   │          │BecameGuest   DemoStarted
//!    RestoredRegistered          │RestoredGuest │RestoredDemo
//!                     ▼          ▼          ▼
//!             ┌────────────┐ ┌───────┐ ┌───────┐
//!             │ Registered │ │ Guest │ │ Demo  │
//!             └─────┬──────┘ └───┬───┘ └───┬───┘
//!   ProfileSynced/  │ ▲          │         │
//!   Refreshed ──────┘ │          │         │   (SignedIn / BecameGuest /
//!                     │          │         │    DemoStarted move freely
//!      SignedOut /    │          │         │    between the three)
//!      RemoteSignedOut▼          ▼         ▼
//!                 ┌──────────────────────────────────┐
//!                 │         Unauthenticated          │
//!                 └──────────────────────────────────┘
//! ```
//!
//! Restrictions the machine enforces:
//! - `ProfileSynced`/`Refreshed` are legal only in `Registered` — profile
//!   mutations on guest/demo identities have nothing to commit.
//! - `RemoteSignedOut` is legal only in `Registered` and `RemoteSignedIn`
//!   only in `Unauthenticated` — guest/demo sessions ignore backend auth
//!   events.
//! - `Restored*` inputs are legal only from `Unauthenticated` — snapshots
//!   are applied once, at boot.

use rust_fsm::*;
use serde::{Deserialize, Serialize};

// Define the FSM using rust-fsm's declarative macro
// This generates a module `session_machine` with:
// - session_machine::State (enum)
// - session_machine::Input (enum)
// - session_machine::StateMachine (type alias)
// - session_machine::Impl (trait impl)
state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub session_machine(Unauthenticated)

    Unauthenticated => {
        SignedIn => Registered,
        SignedUp => Registered,
        BecameGuest => Guest,
        DemoStarted => Demo,
        // Signing out while already signed out is a legal no-op
        SignedOut => Unauthenticated,
        RemoteSignedIn => Registered,
        RestoredRegistered => Registered,
        RestoredDemo => Demo,
        RestoredGuest => Guest
    },
    Registered => {
        // Account switch without an explicit sign-out
        SignedIn => Registered,
        BecameGuest => Guest,
        DemoStarted => Demo,
        SignedOut => Unauthenticated,
        ProfileSynced => Registered,
        Refreshed => Registered,
        RemoteSignedOut => Unauthenticated
    },
    Guest => {
        SignedIn => Registered,
        SignedUp => Registered,
        // A fresh guest identity replaces the current one
        BecameGuest => Guest,
        DemoStarted => Demo,
        SignedOut => Unauthenticated
    },
    Demo => {
        SignedIn => Registered,
        SignedUp => Registered,
        BecameGuest => Guest,
        DemoStarted => Demo,
        SignedOut => Unauthenticated
    }
}

// Re-export the generated types with clearer names
pub use session_machine::Input as SessionInput;
pub use session_machine::State as SessionMachineState;
pub use session_machine::StateMachine as SessionMachine;

/// Identity mode of the current session, for external consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// No identity; the user record is always absent.
    Unauthenticated,
    /// Backend-backed account.
    Registered,
    /// Canned identity seeded from a demo template.
    Demo,
    /// Ephemeral locally-generated identity.
    Guest,
}

impl IdentityMode {
    /// Returns true if a user record is present (any mode but Unauthenticated).
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, IdentityMode::Unauthenticated)
    }

    /// Returns true for the backend-backed mode.
    pub fn is_registered(&self) -> bool {
        matches!(self, IdentityMode::Registered)
    }

    /// Returns true for identities with no backend account.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, IdentityMode::Demo | IdentityMode::Guest)
    }
}

impl From<&SessionMachineState> for IdentityMode {
    fn from(state: &SessionMachineState) -> Self {
        match state {
            SessionMachineState::Unauthenticated => IdentityMode::Unauthenticated,
            SessionMachineState::Registered => IdentityMode::Registered,
            SessionMachineState::Demo => IdentityMode::Demo,
            SessionMachineState::Guest => IdentityMode::Guest,
        }
    }
}

/// Payload for session state change notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionChangedPayload {
    /// Current identity mode.
    pub mode: IdentityMode,
    /// User ID if a user is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// User email if available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}
