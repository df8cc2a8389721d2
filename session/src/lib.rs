//! Client session lifecycle engine for the class-booking marketplace
//!
//! Owns everything between "the credentials were accepted" and "the user
//! is logged out": the session record mirrored across best-effort storage
//! backends, the background token renewal loop, the passive activity
//! stamp, and the login-form throttle.
//!
//! The engine is headless. Network collaborators (credential
//! verification, token refresh) are traits the embedding application
//! implements, and everything hangs off an explicit [`SessionContext`]
//! built once at startup rather than global state.

pub mod activity;
pub mod manager;
pub mod record;
pub mod renewal;
pub mod store;
pub mod throttle;

use std::sync::{Arc, Mutex};

use tracing::debug;

pub use activity::{ActivityTracker, Interaction};
pub use manager::{SessionManager, SessionStatus};
pub use record::{Role, SessionRecord, UserProfile};
pub use renewal::{RefreshClient, RefreshError, RefreshedTokens, RenewalConfig, RenewalScheduler};
pub use store::{CookieStore, FileStore, SessionStore, StoreStack};
pub use throttle::{
    BlockReason, CredentialClient, LoginError, LoginGate, LoginOutcome, LoginSuccess,
};

/// Top-level handle over the whole session mechanism.
///
/// Construct one per process, next to whatever owns the application
/// lifecycle. Dropping it cancels the renewal loop.
pub struct SessionContext {
    manager: Arc<SessionManager>,
    gate: LoginGate,
    tracker: ActivityTracker,
    refresher: Arc<dyn RefreshClient>,
    renewal: RenewalConfig,
    scheduler: Mutex<Option<RenewalScheduler>>,
}

impl SessionContext {
    pub fn new(
        stores: StoreStack,
        credentials: Arc<dyn CredentialClient>,
        refresher: Arc<dyn RefreshClient>,
        renewal: RenewalConfig,
    ) -> Self {
        let manager = Arc::new(SessionManager::new(stores));
        Self {
            gate: LoginGate::new(credentials, manager.clone()),
            tracker: ActivityTracker::new(manager.clone()),
            manager,
            refresher,
            renewal,
            scheduler: Mutex::new(None),
        }
    }

    /// Call once at application start.
    ///
    /// Picks up a previously persisted session if one is still live,
    /// starts the renewal loop for it, and returns the status the initial
    /// routing decision needs.
    pub fn initialize(&self) -> SessionStatus {
        let status = self.manager.status();
        if status.is_active {
            debug!("restored persisted session");
            self.start_renewal();
        }
        status
    }

    /// Submits the login form once. A success persists the session and
    /// starts the renewal loop.
    pub async fn attempt_login(&self, email: &str, password: &str) -> LoginOutcome {
        let outcome = self.gate.attempt_login(email, password).await;
        if matches!(outcome, LoginOutcome::Success(_)) {
            self.start_renewal();
        }
        outcome
    }

    /// Persists a session obtained outside the login form, e.g. right
    /// after registration, and starts renewing it.
    pub fn save_session(&self, record: &SessionRecord) {
        self.manager.save(record);
        self.start_renewal();
    }

    /// Explicit logout: clears every backend and cancels the renewal
    /// loop so no timer outlives the session.
    pub fn logout(&self) {
        if let Some(scheduler) = self.lock_scheduler().take() {
            scheduler.shutdown();
        }
        self.manager.clear();
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.manager.user()
    }

    pub fn current_token(&self) -> Option<String> {
        self.manager.token()
    }

    pub fn status(&self) -> SessionStatus {
        self.manager.status()
    }

    /// Feed of user interactions for the activity stamp.
    pub fn record_interaction(&self, kind: Interaction) {
        self.tracker.record(kind);
    }

    // Throttle state the login form renders from
    pub fn is_blocked(&self) -> bool {
        self.gate.is_blocked()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.gate.attempts_remaining()
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        self.gate.block_reason()
    }

    fn start_renewal(&self) {
        let mut scheduler = self.lock_scheduler();
        // A finished loop (session expired or torn down) is replaced; a
        // live one keeps running.
        if scheduler.as_ref().is_some_and(|s| !s.is_finished()) {
            return;
        }
        *scheduler = Some(RenewalScheduler::spawn(
            self.manager.clone(),
            self.refresher.clone(),
            self.renewal.clone(),
        ));
    }

    fn lock_scheduler(&self) -> std::sync::MutexGuard<'_, Option<RenewalScheduler>> {
        match self.scheduler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
