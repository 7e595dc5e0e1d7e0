//! The session store: single owner of the current identity state.
//!
//! The store is the sole mutator of the session. UI code reads snapshots,
//! registers a change callback, and requests transitions; every transition
//! resolves to the post-transition snapshot and records failures in
//! `last_error` instead of returning them, so UI event handlers never have a
//! rejection to forget to handle.
//!
//! Lifecycle is explicit: build with injected collaborators, call
//! [`SessionStore::initialize`] once at app start (restores the persisted
//! snapshot and subscribes to backend auth events), and [`SessionStore::close`]
//! (or drop) at teardown to end the subscription.

use crate::demo::demo_user;
use crate::fsm::{IdentityMode, SessionChangedPayload, SessionInput, SessionMachine};
use crate::{SessionError, SessionResult, User};
use identity_client::{
    AccountRecord, AuthEvent, FitnessLevel, IdentityError, IdentityService, PreferencesRecord,
    ProfileRecord, ProfileUpdate, StatsRecord,
};
use session_cache::{PersistedMode, SessionSnapshot, SnapshotManager};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read-only snapshot of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub mode: IdentityMode,
    pub user: Option<User>,
    /// True while a transition is in flight.
    pub is_loading: bool,
    /// Last failed transition's error; cleared by the next successful
    /// transition or an explicit [`SessionStore::clear_error`].
    pub last_error: Option<SessionError>,
}

/// Callback type for session state change notifications.
pub type SessionCallback = Box<dyn Fn(SessionChangedPayload) + Send + Sync>;

/// The transition kinds used for in-flight coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TransitionKind {
    SignIn,
    SignUp,
    EnterGuest,
    EnterDemo,
    UpdateProfile,
    Refresh,
    SignOut,
}

/// What a finished transition wants done to the session.
enum Outcome {
    /// Commit a completed transition, persisting the session as `persist_as`.
    ///
    /// Persistence happens inside the commit, after the staleness check, so a
    /// transition that lost the race to a sign-out can never write a snapshot
    /// the sign-out already cleared. A persistence failure does not abort a
    /// transition that already succeeded remotely; it is surfaced as the
    /// committed state's `last_error`.
    Apply {
        input: SessionInput,
        user: Option<User>,
        persist_as: Option<PersistedMode>,
    },
    /// Nothing to do; leave the session untouched.
    NoOp,
    /// The backend no longer recognizes the session; clear everything.
    Invalidate(SessionError),
}

enum Entry {
    /// This caller runs the transition.
    Owner(watch::Sender<bool>),
    /// An identical transition is already in flight; observe its result.
    Joined(watch::Receiver<bool>),
}

struct Inner {
    machine: SessionMachine,
    user: Option<User>,
    last_error: Option<SessionError>,
    loading: bool,
    /// Monotonic commit counter. Transitions capture it at start and
    /// re-check before committing so a slow remote response cannot
    /// overwrite state a newer transition already replaced.
    epoch: u64,
}

impl Inner {
    fn mode(&self) -> IdentityMode {
        IdentityMode::from(self.machine.state())
    }

    fn snapshot(&self) -> SessionState {
        SessionState {
            mode: self.mode(),
            user: self.user.clone(),
            is_loading: self.loading,
            last_error: self.last_error.clone(),
        }
    }
}

/// Session store over the identity backend and the local session cache.
pub struct SessionStore {
    identity: Arc<dyn IdentityService>,
    snapshots: SnapshotManager,
    /// Self-reference handed to the reconciler task so the task never keeps
    /// the store alive on its own.
    weak: Weak<SessionStore>,
    inner: Mutex<Inner>,
    /// Serializes transitions so state mutations never interleave.
    op_lock: tokio::sync::Mutex<()>,
    /// In-flight transitions by kind; duplicate requests join instead of
    /// starting a second remote call.
    inflight: Mutex<HashMap<TransitionKind, watch::Receiver<bool>>>,
    callback: Mutex<Option<SessionCallback>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    /// Create a new session store. Call [`initialize`](Self::initialize)
    /// before use.
    pub fn new(identity: Arc<dyn IdentityService>, snapshots: SnapshotManager) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            identity,
            snapshots,
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                machine: SessionMachine::new(),
                user: None,
                last_error: None,
                loading: false,
                epoch: 0,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            reconciler: Mutex::new(None),
        })
    }

    /// Restore the persisted session (if any) and start reconciling backend
    /// auth events. Returns the resulting snapshot.
    ///
    /// Any problem reading the cache degrades to an unauthenticated session;
    /// boot never fails on a bad cache.
    pub async fn initialize(&self) -> SessionState {
        match self.snapshots.load::<User>() {
            Ok(Some(snapshot)) => {
                let input = match snapshot.mode {
                    PersistedMode::Registered => SessionInput::RestoredRegistered,
                    PersistedMode::Demo => SessionInput::RestoredDemo,
                    PersistedMode::Guest => SessionInput::RestoredGuest,
                };

                let mut inner = self.inner.lock().unwrap();
                match inner.machine.consume(&input) {
                    Ok(_) => {
                        info!(
                            mode = ?snapshot.mode,
                            user_id = %snapshot.user.id,
                            "Restored persisted session"
                        );
                        inner.user = Some(snapshot.user);
                        inner.epoch += 1;
                    }
                    Err(_) => {
                        warn!("Session already established, ignoring persisted snapshot");
                    }
                }
            }
            Ok(None) => {
                debug!("No persisted session found");
            }
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting unauthenticated");
            }
        }

        self.spawn_reconciler();
        self.state()
    }

    /// Stop reconciling backend auth events. Idempotent; also runs on drop.
    pub fn close(&self) {
        if let Some(handle) = self.reconciler.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Current session snapshot.
    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().snapshot()
    }

    /// Set a callback to be notified after committed session changes.
    pub fn set_state_callback(&self, callback: SessionCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Clear `last_error` without touching anything else.
    pub fn clear_error(&self) -> SessionState {
        let mut inner = self.inner.lock().unwrap();
        inner.last_error = None;
        inner.snapshot()
    }

    /// Sign in with email and password.
    ///
    /// On success, fetches the user's profile/preferences/stats, assembles
    /// the user record, and persists the session. On failure the session is
    /// left exactly as it was and the error lands in `last_error`.
    pub async fn sign_in(&self, email: &str, password: &str) -> SessionState {
        let owner = match self.enter(TransitionKind::SignIn) {
            Entry::Joined(done) => return self.join(done).await,
            Entry::Owner(tx) => tx,
        };

        let _guard = self.op_lock.lock().await;
        let epoch = self.set_loading(true);
        let outcome = self.perform_sign_in(email, password).await;
        let state = self.commit(epoch, outcome);
        self.exit(TransitionKind::SignIn, owner);
        state
    }

    /// Create an account and sign into it.
    ///
    /// Silent no-op while a registered session is active; sign out first to
    /// switch to a fresh account.
    pub async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> SessionState {
        let owner = match self.enter(TransitionKind::SignUp) {
            Entry::Joined(done) => return self.join(done).await,
            Entry::Owner(tx) => tx,
        };

        let _guard = self.op_lock.lock().await;
        let epoch = self.set_loading(true);
        let outcome = self.perform_sign_up(email, password, display_name).await;
        let state = self.commit(epoch, outcome);
        self.exit(TransitionKind::SignUp, owner);
        state
    }

    /// Start an ephemeral guest session with a freshly minted identity.
    pub async fn enter_guest(&self) -> SessionState {
        let owner = match self.enter(TransitionKind::EnterGuest) {
            Entry::Joined(done) => return self.join(done).await,
            Entry::Owner(tx) => tx,
        };

        let _guard = self.op_lock.lock().await;
        let epoch = self.set_loading(true);
        let user = User::guest();
        info!(user_id = %user.id, "Entered guest mode");
        let state = self.commit(
            epoch,
            Ok(Outcome::Apply {
                input: SessionInput::BecameGuest,
                user: Some(user),
                persist_as: Some(PersistedMode::Guest),
            }),
        );
        self.exit(TransitionKind::EnterGuest, owner);
        state
    }

    /// Start a demo session seeded from the template for `level`.
    pub async fn enter_demo(&self, level: FitnessLevel) -> SessionState {
        let owner = match self.enter(TransitionKind::EnterDemo) {
            Entry::Joined(done) => return self.join(done).await,
            Entry::Owner(tx) => tx,
        };

        let _guard = self.op_lock.lock().await;
        let epoch = self.set_loading(true);
        let user = demo_user(level);
        info!(user_id = %user.id, "Entered demo mode");
        let state = self.commit(
            epoch,
            Ok(Outcome::Apply {
                input: SessionInput::DemoStarted,
                user: Some(user),
                persist_as: Some(PersistedMode::Demo),
            }),
        );
        self.exit(TransitionKind::EnterDemo, owner);
        state
    }

    /// Apply a partial profile mutation for the registered user.
    ///
    /// Guest and demo identities have no backend counterpart, so outside
    /// registered mode this is a silent no-op — not an error.
    pub async fn update_profile(&self, update: ProfileUpdate) -> SessionState {
        let owner = match self.enter(TransitionKind::UpdateProfile) {
            Entry::Joined(done) => return self.join(done).await,
            Entry::Owner(tx) => tx,
        };

        let _guard = self.op_lock.lock().await;
        let epoch = self.set_loading(true);
        let outcome = self.perform_update_profile(&update).await;
        let state = self.commit(epoch, outcome);
        self.exit(TransitionKind::UpdateProfile, owner);
        state
    }

    /// Re-fetch the registered user's profile/preferences/stats.
    ///
    /// Silent no-op outside registered mode. A backend rejection of the
    /// session (revoked elsewhere) clears the local session.
    pub async fn refresh(&self) -> SessionState {
        let owner = match self.enter(TransitionKind::Refresh) {
            Entry::Joined(done) => return self.join(done).await,
            Entry::Owner(tx) => tx,
        };

        let _guard = self.op_lock.lock().await;
        let epoch = self.set_loading(true);
        let outcome = self.perform_refresh().await;
        let state = self.commit(epoch, outcome);
        self.exit(TransitionKind::Refresh, owner);
        state
    }

    /// Sign out.
    ///
    /// Local state and the persisted snapshot are cleared unconditionally
    /// and first; the remote sign-out (registered sessions only) is
    /// best-effort and its failure is logged, never surfaced. Idempotent.
    ///
    /// Deliberately does not take the transition lock: local logout must not
    /// wait behind a slow remote call, and the epoch bump retires any
    /// transition still in flight.
    pub async fn sign_out(&self) -> SessionState {
        let owner = match self.enter(TransitionKind::SignOut) {
            Entry::Joined(done) => return self.join(done).await,
            Entry::Owner(tx) => tx,
        };

        let (was_registered, state) = {
            let mut inner = self.inner.lock().unwrap();
            let was_registered = inner.mode().is_registered();
            // Legal from every state, including Unauthenticated.
            let _ = inner.machine.consume(&SessionInput::SignedOut);
            inner.user = None;
            inner.last_error = None;
            inner.loading = true;
            inner.epoch += 1;
            (was_registered, inner.snapshot())
        };
        self.notify(&state);

        if let Err(e) = self.snapshots.clear() {
            warn!(error = %e, "Failed to clear persisted session");
        }

        if was_registered {
            if let Err(e) = self.identity.sign_out().await {
                warn!(error = %e, "Remote sign-out failed; local session already cleared");
            }
        }

        self.set_loading(false);
        info!("Signed out");
        self.exit(TransitionKind::SignOut, owner);
        self.state()
    }

    // ==========================================
    // Transition bodies
    // ==========================================

    async fn perform_sign_in(&self, email: &str, password: &str) -> SessionResult<Outcome> {
        let account = self.identity.sign_in(email, password).await?;
        let user = self.assemble_registered(account).await?;
        info!(user_id = %user.id, "Signed in");
        Ok(Outcome::Apply {
            input: SessionInput::SignedIn,
            user: Some(user),
            persist_as: Some(PersistedMode::Registered),
        })
    }

    async fn perform_sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> SessionResult<Outcome> {
        if self.state().mode.is_registered() {
            debug!("Ignoring sign-up while a registered session is active");
            return Ok(Outcome::NoOp);
        }

        let account = self.identity.sign_up(email, password, display_name).await?;
        let mut user = self.assemble_registered(account).await?;
        if user.profile.is_none() {
            // The backend hasn't materialized a profile row yet; honor the
            // requested display name until one exists.
            user.display_name = display_name.to_string();
        }
        info!(user_id = %user.id, "Signed up");
        Ok(Outcome::Apply {
            input: SessionInput::SignedUp,
            user: Some(user),
            persist_as: Some(PersistedMode::Registered),
        })
    }

    async fn perform_update_profile(&self, update: &ProfileUpdate) -> SessionResult<Outcome> {
        let current = {
            let inner = self.inner.lock().unwrap();
            if !inner.mode().is_registered() {
                debug!(mode = ?inner.mode(), "Ignoring profile update outside registered mode");
                return Ok(Outcome::NoOp);
            }
            inner.user.clone()
        };

        let mut user = match current {
            Some(user) => user,
            None => return Ok(Outcome::NoOp),
        };

        let record = match self.identity.update_profile(&user.id, update).await {
            Ok(record) => record,
            Err(IdentityError::SessionInvalid(m)) => {
                warn!("Backend invalidated the session during profile update");
                return Ok(Outcome::Invalidate(SessionError::SessionInvalid(m)));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(name) = record.display_name.clone() {
            user.display_name = name;
        }
        user.profile = Some(record);
        Ok(Outcome::Apply {
            input: SessionInput::ProfileSynced,
            user: Some(user),
            persist_as: Some(PersistedMode::Registered),
        })
    }

    async fn perform_refresh(&self) -> SessionResult<Outcome> {
        let current = {
            let inner = self.inner.lock().unwrap();
            if !inner.mode().is_registered() {
                debug!(mode = ?inner.mode(), "Ignoring refresh outside registered mode");
                return Ok(Outcome::NoOp);
            }
            inner.user.clone()
        };

        let mut user = match current {
            Some(user) => user,
            None => return Ok(Outcome::NoOp),
        };

        let (profile, preferences, stats) = match self.fetch_records(&user.id).await {
            Ok(records) => records,
            Err(IdentityError::SessionInvalid(m)) => {
                warn!("Backend invalidated the session during refresh");
                return Ok(Outcome::Invalidate(SessionError::SessionInvalid(m)));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(name) = profile.as_ref().and_then(|p| p.display_name.clone()) {
            user.display_name = name;
        }
        user.profile = profile;
        user.preferences = preferences;
        user.stats = stats;
        debug!(user_id = %user.id, "Session refreshed");
        Ok(Outcome::Apply {
            input: SessionInput::Refreshed,
            user: Some(user),
            persist_as: Some(PersistedMode::Registered),
        })
    }

    async fn perform_adopt(&self) -> SessionResult<Outcome> {
        if self.state().mode != IdentityMode::Unauthenticated {
            return Ok(Outcome::NoOp);
        }

        let account = match self.identity.get_session().await {
            Ok(Some(account)) => account,
            Ok(None) => {
                debug!("Remote sign-in event without a backend session, ignoring");
                return Ok(Outcome::NoOp);
            }
            Err(e) => return Err(e.into()),
        };

        let user = self.assemble_registered(account).await?;
        info!(user_id = %user.id, "Adopted remote session");
        Ok(Outcome::Apply {
            input: SessionInput::RemoteSignedIn,
            user: Some(user),
            persist_as: Some(PersistedMode::Registered),
        })
    }

    /// Fetch the three per-user resources, treating a missing row as absent.
    async fn fetch_records(
        &self,
        user_id: &str,
    ) -> Result<
        (
            Option<ProfileRecord>,
            Option<PreferencesRecord>,
            Option<StatsRecord>,
        ),
        IdentityError,
    > {
        let profile = match self.identity.get_profile(user_id).await {
            Ok(profile) => profile,
            Err(IdentityError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let preferences = match self.identity.get_preferences(user_id).await {
            Ok(preferences) => preferences,
            Err(IdentityError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let stats = match self.identity.get_stats(user_id).await {
            Ok(stats) => stats,
            Err(IdentityError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok((profile, preferences, stats))
    }

    async fn assemble_registered(&self, account: AccountRecord) -> SessionResult<User> {
        let (profile, preferences, stats) = self
            .fetch_records(&account.id)
            .await
            .map_err(SessionError::from)?;
        Ok(User::registered(account, profile, preferences, stats))
    }

    // ==========================================
    // Commit machinery
    // ==========================================

    fn set_loading(&self, loading: bool) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.loading = loading;
        inner.epoch
    }

    /// Apply a finished transition, unless a newer one already committed.
    fn commit(&self, started_epoch: u64, outcome: SessionResult<Outcome>) -> SessionState {
        let mut should_notify = false;
        let mut clear_persisted = false;

        let state = {
            let mut inner = self.inner.lock().unwrap();
            inner.loading = false;

            if inner.epoch != started_epoch {
                debug!("Discarding transition result that lost the race to a newer transition");
            } else {
                match outcome {
                    Ok(Outcome::NoOp) => {}
                    Ok(Outcome::Apply {
                        input,
                        user,
                        persist_as,
                    }) => {
                        if inner.machine.consume(&input).is_ok() {
                            let warning = match (persist_as, user.as_ref()) {
                                (Some(mode), Some(user)) => self.persist(mode, user),
                                _ => None,
                            };
                            inner.user = user;
                            inner.last_error = warning;
                            inner.epoch += 1;
                            should_notify = true;
                        } else {
                            warn!(
                                input = ?input,
                                state = ?inner.machine.state(),
                                "Completed transition no longer legal, discarding"
                            );
                        }
                    }
                    Ok(Outcome::Invalidate(error)) => {
                        if inner.machine.consume(&SessionInput::RemoteSignedOut).is_err() {
                            let _ = inner.machine.consume(&SessionInput::SignedOut);
                        }
                        inner.user = None;
                        inner.last_error = Some(error);
                        inner.epoch += 1;
                        should_notify = true;
                        clear_persisted = true;
                    }
                    Err(error) => {
                        inner.last_error = Some(error);
                        should_notify = true;
                    }
                }
            }

            inner.snapshot()
        };

        if clear_persisted {
            if let Err(e) = self.snapshots.clear() {
                warn!(error = %e, "Failed to clear persisted session");
            }
        }
        if should_notify {
            self.notify(&state);
        }
        state
    }

    fn persist(&self, mode: PersistedMode, user: &User) -> Option<SessionError> {
        let snapshot = SessionSnapshot::new(mode, user.clone());
        match self.snapshots.save(&snapshot) {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Failed to persist session snapshot");
                Some(SessionError::from(e))
            }
        }
    }

    fn notify(&self, state: &SessionState) {
        let callback = self.callback.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            cb(SessionChangedPayload {
                mode: state.mode,
                user_id: state.user.as_ref().map(|u| u.id.clone()),
                email: state.user.as_ref().map(|u| u.email.clone()),
            });
        }
    }

    // ==========================================
    // In-flight coalescing
    // ==========================================

    fn enter(&self, kind: TransitionKind) -> Entry {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(done) = inflight.get(&kind) {
            return Entry::Joined(done.clone());
        }
        let (tx, rx) = watch::channel(false);
        inflight.insert(kind, rx);
        Entry::Owner(tx)
    }

    fn exit(&self, kind: TransitionKind, done: watch::Sender<bool>) {
        self.inflight.lock().unwrap().remove(&kind);
        let _ = done.send(true);
    }

    async fn join(&self, mut done: watch::Receiver<bool>) -> SessionState {
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.state()
    }

    // ==========================================
    // Backend auth event reconciliation
    // ==========================================

    fn spawn_reconciler(&self) {
        let mut events = self.identity.subscribe();
        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let store = match weak.upgrade() {
                            Some(store) => store,
                            None => break,
                        };
                        store.reconcile(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Auth event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.reconciler.lock().unwrap() = Some(handle);
    }

    async fn reconcile(&self, event: AuthEvent) {
        match event {
            AuthEvent::SignedOut => {
                let state = {
                    let mut inner = self.inner.lock().unwrap();
                    // Only legal in Registered; the machine rejects it for
                    // guest/demo sessions, which ignore backend auth events.
                    match inner.machine.consume(&SessionInput::RemoteSignedOut) {
                        Ok(_) => {
                            inner.user = None;
                            inner.last_error = None;
                            inner.epoch += 1;
                            Some(inner.snapshot())
                        }
                        Err(_) => None,
                    }
                };

                match state {
                    Some(state) => {
                        info!("Remote sign-out received, local session cleared");
                        if let Err(e) = self.snapshots.clear() {
                            warn!(error = %e, "Failed to clear persisted session");
                        }
                        self.notify(&state);
                    }
                    None => {
                        debug!("Ignoring remote sign-out for non-registered session");
                    }
                }
            }
            AuthEvent::SignedIn { user_id } => {
                if self.state().mode != IdentityMode::Unauthenticated {
                    debug!(user_id = %user_id, "Ignoring remote sign-in; session already present");
                    return;
                }
                self.adopt_remote_session().await;
            }
        }
    }

    async fn adopt_remote_session(&self) {
        let owner = match self.enter(TransitionKind::Refresh) {
            Entry::Joined(done) => {
                let _ = self.join(done).await;
                return;
            }
            Entry::Owner(tx) => tx,
        };

        let _guard = self.op_lock.lock().await;
        let epoch = self.set_loading(true);
        let outcome = self.perform_adopt().await;
        let _ = self.commit(epoch, outcome);
        self.exit(TransitionKind::Refresh, owner);
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use identity_client::IdentityResult;
    use session_cache::{KeyValueStorage, StorageResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory storage for testing; clones share the same map so a second
    /// store can observe what the first persisted.
    #[derive(Clone)]
    struct MemoryStorage {
        data: Arc<Mutex<HashMap<String, String>>>,
    }

    impl MemoryStorage {
        fn new() -> Self {
            Self {
                data: Arc::new(Mutex::new(HashMap::new())),
            }
        }
    }

    impl KeyValueStorage for MemoryStorage {
        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        fn delete(&self, key: &str) -> StorageResult<bool> {
            Ok(self.data.lock().unwrap().remove(key).is_some())
        }
    }

    fn base_profile(user_id: &str, display_name: &str) -> ProfileRecord {
        ProfileRecord {
            user_id: user_id.to_string(),
            display_name: Some(display_name.to_string()),
            avatar_url: None,
            age: None,
            height_cm: None,
            weight_kg: None,
            fitness_level: None,
            created_at: "2024-05-01T10:00:00Z".to_string(),
            updated_at: "2024-05-01T10:00:00Z".to_string(),
        }
    }

    async fn wait_gate(slot: &Mutex<Option<watch::Receiver<bool>>>) {
        let rx = slot.lock().unwrap().clone();
        if let Some(mut rx) = rx {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Scriptable identity backend.
    struct MockIdentity {
        /// Successful sign-in account; `None` makes sign-in fail with
        /// invalid credentials.
        account: Mutex<Option<AccountRecord>>,
        profile: Mutex<Option<ProfileRecord>>,
        preferences: Mutex<Option<PreferencesRecord>>,
        stats: Mutex<Option<StatsRecord>>,
        /// Account behind `get_session`, for remote sign-in adoption.
        session: Mutex<Option<AccountRecord>>,
        sign_in_calls: AtomicUsize,
        sign_up_calls: AtomicUsize,
        update_calls: AtomicUsize,
        /// When set, sign-in blocks until the gate reads true.
        sign_in_gate: Mutex<Option<watch::Receiver<bool>>>,
        /// When set, stats fetches block until the gate reads true.
        stats_gate: Mutex<Option<watch::Receiver<bool>>>,
        events: broadcast::Sender<AuthEvent>,
    }

    impl MockIdentity {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                account: Mutex::new(None),
                profile: Mutex::new(None),
                preferences: Mutex::new(None),
                stats: Mutex::new(None),
                session: Mutex::new(None),
                sign_in_calls: AtomicUsize::new(0),
                sign_up_calls: AtomicUsize::new(0),
                update_calls: AtomicUsize::new(0),
                sign_in_gate: Mutex::new(None),
                stats_gate: Mutex::new(None),
                events,
            })
        }

        fn with_account(id: &str, email: &str) -> Arc<Self> {
            let mock = Self::new();
            *mock.account.lock().unwrap() = Some(AccountRecord {
                id: id.to_string(),
                email: Some(email.to_string()),
            });
            mock
        }
    }

    #[async_trait]
    impl IdentityService for MockIdentity {
        async fn sign_in(&self, _email: &str, _password: &str) -> IdentityResult<AccountRecord> {
            self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
            wait_gate(&self.sign_in_gate).await;
            match self.account.lock().unwrap().clone() {
                Some(account) => Ok(account),
                None => Err(IdentityError::InvalidCredentials("HTTP 400".to_string())),
            }
        }

        async fn sign_up(
            &self,
            email: &str,
            _password: &str,
            _display_name: &str,
        ) -> IdentityResult<AccountRecord> {
            self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccountRecord {
                id: "new-user".to_string(),
                email: Some(email.to_string()),
            })
        }

        async fn sign_out(&self) -> IdentityResult<()> {
            Ok(())
        }

        async fn get_session(&self) -> IdentityResult<Option<AccountRecord>> {
            Ok(self.session.lock().unwrap().clone())
        }

        async fn get_profile(&self, _user_id: &str) -> IdentityResult<Option<ProfileRecord>> {
            Ok(self.profile.lock().unwrap().clone())
        }

        async fn update_profile(
            &self,
            user_id: &str,
            update: &ProfileUpdate,
        ) -> IdentityResult<ProfileRecord> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            let mut record = self
                .profile
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| base_profile(user_id, "User"));
            if let Some(name) = &update.display_name {
                record.display_name = Some(name.clone());
            }
            if let Some(age) = update.age {
                record.age = Some(age);
            }
            *self.profile.lock().unwrap() = Some(record.clone());
            Ok(record)
        }

        async fn get_preferences(
            &self,
            _user_id: &str,
        ) -> IdentityResult<Option<PreferencesRecord>> {
            Ok(self.preferences.lock().unwrap().clone())
        }

        async fn get_stats(&self, _user_id: &str) -> IdentityResult<Option<StatsRecord>> {
            wait_gate(&self.stats_gate).await;
            Ok(self.stats.lock().unwrap().clone())
        }

        fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
            self.events.subscribe()
        }
    }

    fn create_store(mock: Arc<MockIdentity>, storage: MemoryStorage) -> Arc<SessionStore> {
        SessionStore::new(mock, SnapshotManager::new(Box::new(storage)))
    }

    async fn wait_until(store: &SessionStore, predicate: impl Fn(&SessionState) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if predicate(&store.state()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn assert_invariants(state: &SessionState) {
        // Unauthenticated <=> no user
        assert_eq!(
            state.mode == IdentityMode::Unauthenticated,
            state.user.is_none()
        );
        if let Some(user) = &state.user {
            // At most one anonymous flag, none for registered users
            assert!(!(user.is_demo && user.is_guest));
            if state.mode == IdentityMode::Registered {
                assert!(!user.is_demo && !user.is_guest);
            }
        }
    }

    #[tokio::test]
    async fn test_initial_state_is_unauthenticated() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        let state = store.initialize().await;

        assert_eq!(state.mode, IdentityMode::Unauthenticated);
        assert!(state.user.is_none());
        assert!(!state.is_loading);
        assert!(state.last_error.is_none());
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_sign_in_success_assembles_user() {
        let mock = MockIdentity::with_account("u1", "a@b.com");
        *mock.profile.lock().unwrap() = Some(base_profile("u1", "A"));
        let store = create_store(mock, MemoryStorage::new());
        store.initialize().await;

        let state = store.sign_in("a@b.com", "pw").await;

        assert_eq!(state.mode, IdentityMode::Registered);
        assert!(state.last_error.is_none());
        assert!(!state.is_loading);
        let user = state.user.clone().unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.email, "a@b.com");
        assert_eq!(user.display_name, "A");
        assert!(!user.is_demo && !user.is_guest);
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_sign_in_invalid_credentials_leaves_state_unchanged() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        let state = store.sign_in("a@b.com", "wrong").await;

        assert_eq!(state.mode, IdentityMode::Unauthenticated);
        assert!(state.user.is_none());
        assert!(!state.is_loading);
        assert!(matches!(
            state.last_error,
            Some(SessionError::InvalidCredentials(_))
        ));
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_failed_sign_in_keeps_guest_session() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        let guest_state = store.enter_guest().await;
        let guest_id = guest_state.user.clone().unwrap().id;

        let state = store.sign_in("a@b.com", "wrong").await;

        assert_eq!(state.mode, IdentityMode::Guest);
        assert_eq!(state.user.unwrap().id, guest_id);
        assert!(matches!(
            state.last_error,
            Some(SessionError::InvalidCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_out_is_idempotent_when_unauthenticated() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        let before = store.state();
        let state = store.sign_out().await;

        assert_eq!(state.mode, IdentityMode::Unauthenticated);
        assert!(state.user.is_none());
        assert!(!state.is_loading);
        assert_eq!(state.mode, before.mode);
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_sequential_guests_get_distinct_ids() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        let first = store.enter_guest().await;
        let first_id = first.user.unwrap().id;

        let second = store.enter_guest().await;
        let second_id = second.user.clone().unwrap().id;

        assert_eq!(second.mode, IdentityMode::Guest);
        assert_ne!(first_id, second_id);
        assert_invariants(&second);
    }

    #[tokio::test]
    async fn test_demo_login_is_deterministic() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        let state = store.enter_demo(FitnessLevel::Beginner).await;

        assert_eq!(state.mode, IdentityMode::Demo);
        let user = state.user.clone().unwrap();
        assert_eq!(user.id, "demo-beginner");
        assert!(user.is_demo);

        let template = crate::demo::demo_template(FitnessLevel::Beginner);
        let stats = user.stats.unwrap();
        assert_eq!(stats.workouts_completed, template.workouts_completed);
        assert_eq!(stats.total_minutes, template.total_minutes);
        assert_eq!(stats.streak_days, template.streak_days);
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_update_profile_is_noop_for_guest() {
        let mock = MockIdentity::new();
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;

        store.enter_guest().await;
        let before = store.state();

        let update = ProfileUpdate {
            display_name: Some("X".to_string()),
            ..ProfileUpdate::default()
        };
        let state = store.update_profile(update).await;

        assert_eq!(mock.update_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.mode, IdentityMode::Guest);
        assert_eq!(state.user, before.user);
        assert!(state.last_error.is_none());
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_update_profile_merges_for_registered() {
        let mock = MockIdentity::with_account("u1", "a@b.com");
        *mock.profile.lock().unwrap() = Some(base_profile("u1", "A"));
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;
        store.sign_in("a@b.com", "pw").await;

        let update = ProfileUpdate {
            display_name: Some("Dana".to_string()),
            age: Some(30),
            ..ProfileUpdate::default()
        };
        let state = store.update_profile(update).await;

        assert_eq!(mock.update_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.mode, IdentityMode::Registered);
        let user = state.user.unwrap();
        assert_eq!(user.display_name, "Dana");
        assert_eq!(user.profile.unwrap().age, Some(30));
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_refresh_is_noop_for_demo() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        store.enter_demo(FitnessLevel::Intermediate).await;
        let before = store.state();

        let state = store.refresh().await;

        assert_eq!(state.mode, IdentityMode::Demo);
        assert_eq!(state.user, before.user);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_stale_refresh_cannot_resurrect_signed_out_session() {
        let mock = MockIdentity::with_account("u1", "a@b.com");
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;
        store.sign_in("a@b.com", "pw").await;

        // Gate stats fetches so the refresh parks mid-flight.
        let (gate_tx, gate_rx) = watch::channel(false);
        *mock.stats_gate.lock().unwrap() = Some(gate_rx);

        let refresh_store = store.clone();
        let refresh_task = tokio::spawn(async move { refresh_store.refresh().await });

        wait_until(&store, |state| state.is_loading).await;

        // Sign out while the refresh is still waiting on the network.
        let state = store.sign_out().await;
        assert_eq!(state.mode, IdentityMode::Unauthenticated);

        // Let the refresh finish; its result lost the race and is discarded.
        gate_tx.send(true).unwrap();
        let refresh_state = refresh_task.await.unwrap();

        assert_eq!(refresh_state.mode, IdentityMode::Unauthenticated);
        assert!(refresh_state.user.is_none());
        assert_eq!(store.state().mode, IdentityMode::Unauthenticated);
        assert_invariants(&store.state());
    }

    #[tokio::test]
    async fn test_double_tap_sign_in_coalesces_remote_calls() {
        let mock = MockIdentity::with_account("u1", "a@b.com");
        let (gate_tx, gate_rx) = watch::channel(false);
        *mock.sign_in_gate.lock().unwrap() = Some(gate_rx);
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;

        let first_store = store.clone();
        let first = tokio::spawn(async move { first_store.sign_in("a@b.com", "pw").await });

        // Wait for the first tap to reach the backend, then tap again.
        tokio::time::timeout(Duration::from_secs(2), async {
            while mock.sign_in_calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let second_store = store.clone();
        let second = tokio::spawn(async move { second_store.sign_in("a@b.com", "pw").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate_tx.send(true).unwrap();
        let first_state = first.await.unwrap();
        let second_state = second.await.unwrap();

        assert_eq!(mock.sign_in_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first_state.mode, IdentityMode::Registered);
        assert_eq!(second_state.mode, IdentityMode::Registered);
    }

    #[tokio::test]
    async fn test_session_round_trip_through_persistence() {
        let storage = MemoryStorage::new();
        let mock = MockIdentity::with_account("u1", "a@b.com");
        *mock.profile.lock().unwrap() = Some(base_profile("u1", "A"));

        let store = create_store(mock.clone(), storage.clone());
        store.initialize().await;
        let saved = store.sign_in("a@b.com", "pw").await;
        drop(store);

        let restored_store = create_store(mock, storage);
        let restored = restored_store.initialize().await;

        assert_eq!(restored.mode, saved.mode);
        assert_eq!(restored.user, saved.user);
    }

    #[tokio::test]
    async fn test_guest_session_survives_restart() {
        let storage = MemoryStorage::new();
        let store = create_store(MockIdentity::new(), storage.clone());
        store.initialize().await;
        let saved = store.enter_guest().await;
        drop(store);

        let restored_store = create_store(MockIdentity::new(), storage);
        let restored = restored_store.initialize().await;

        assert_eq!(restored.mode, IdentityMode::Guest);
        assert_eq!(restored.user, saved.user);
    }

    #[tokio::test]
    async fn test_sign_out_clears_persisted_session() {
        let storage = MemoryStorage::new();
        let store = create_store(MockIdentity::new(), storage.clone());
        store.initialize().await;

        store.enter_guest().await;
        let probe = SnapshotManager::new(Box::new(storage.clone()));
        assert!(probe.has_session().unwrap());

        store.sign_out().await;
        assert!(!probe.has_session().unwrap());
    }

    #[tokio::test]
    async fn test_remote_sign_out_clears_registered_session() {
        let mock = MockIdentity::with_account("u1", "a@b.com");
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;
        store.sign_in("a@b.com", "pw").await;

        mock.events.send(AuthEvent::SignedOut).unwrap();

        wait_until(&store, |state| state.mode == IdentityMode::Unauthenticated).await;
        assert!(store.state().user.is_none());
    }

    #[tokio::test]
    async fn test_remote_sign_out_ignored_for_demo_session() {
        let mock = MockIdentity::new();
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;
        store.enter_demo(FitnessLevel::Advanced).await;

        mock.events.send(AuthEvent::SignedOut).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = store.state();
        assert_eq!(state.mode, IdentityMode::Demo);
        assert!(state.user.is_some());
    }

    #[tokio::test]
    async fn test_remote_sign_in_adopts_backend_session() {
        let mock = MockIdentity::new();
        *mock.session.lock().unwrap() = Some(AccountRecord {
            id: "u9".to_string(),
            email: Some("elsewhere@b.com".to_string()),
        });
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;

        mock.events
            .send(AuthEvent::SignedIn {
                user_id: "u9".to_string(),
            })
            .unwrap();

        wait_until(&store, |state| state.mode == IdentityMode::Registered).await;
        assert_eq!(store.state().user.unwrap().id, "u9");
    }

    #[tokio::test]
    async fn test_sign_up_is_noop_while_registered() {
        let mock = MockIdentity::with_account("u1", "a@b.com");
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;
        store.sign_in("a@b.com", "pw").await;

        let state = store.sign_up("new@b.com", "pw", "New").await;

        assert_eq!(mock.sign_up_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.mode, IdentityMode::Registered);
        assert_eq!(state.user.unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_sign_up_from_guest() {
        let mock = MockIdentity::new();
        let store = create_store(mock.clone(), MemoryStorage::new());
        store.initialize().await;
        store.enter_guest().await;

        let state = store.sign_up("new@b.com", "pw", "New").await;

        assert_eq!(mock.sign_up_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.mode, IdentityMode::Registered);
        let user = state.user.unwrap();
        assert_eq!(user.id, "new-user");
        // No profile row yet, so the requested display name sticks.
        assert_eq!(user.display_name, "New");
    }

    #[tokio::test]
    async fn test_clear_error() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        store.sign_in("a@b.com", "wrong").await;
        assert!(store.state().last_error.is_some());

        let state = store.clear_error();
        assert!(state.last_error.is_none());
        assert_eq!(state.mode, IdentityMode::Unauthenticated);
    }

    #[tokio::test]
    async fn test_state_callback_fires_on_commits_and_failures() {
        let store = create_store(MockIdentity::new(), MemoryStorage::new());
        store.initialize().await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        store.set_state_callback(Box::new(move |_payload| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        store.enter_guest().await;
        store.sign_in("a@b.com", "wrong").await;

        // One notification for the committed guest entry, one for the
        // recorded failure.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
