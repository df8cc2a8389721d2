//! Login attempt throttling
//!
//! Each login form owns a small state machine: it counts consecutive
//! failed credential checks and locks the form for a cooldown once the
//! count hits the limit. The state lives in memory only and does not
//! survive a restart.
//!
//! The [`LoginGate`] composes the throttle with the credential endpoint
//! and the session manager into the single call a form submits through.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::manager::SessionManager;
use crate::record::{SessionRecord, UserProfile};

/// Consecutive failures tolerated before the form locks.
pub const ATTEMPT_LIMIT: u32 = 3;
/// Form lock cooldown after too many attempts.
pub const ATTEMPT_COOLDOWN: Duration = Duration::from_secs(5 * 60);
/// Cooldown surfaced when the server reports the account itself locked.
pub const ACCOUNT_LOCK_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Why a locked form rejects submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Too many consecutive failures on this form.
    TooManyAttempts,
    /// The server reported the account locked.
    AccountLocked,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::TooManyAttempts => f.write_str("too many failed attempts"),
            BlockReason::AccountLocked => f.write_str("account temporarily locked"),
        }
    }
}

/// Structured failure of a credential check, as surfaced to the form.
///
/// Transport failures deliberately count against the throttle exactly
/// like wrong credentials; see the crate notes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("Wrong password")]
    WrongPassword,
    #[error("No account exists for this email")]
    UnknownEmail,
    #[error("Malformed email address")]
    MalformedEmail,
    #[error("Account locked, try again in {minutes} minutes")]
    AccountLocked { minutes: i64 },
    #[error("Server unavailable, try again later")]
    ServerUnavailable,
}

struct Lock {
    reason: BlockReason,
    until: Instant,
}

/// Per-form failed-attempt counter with a timed lock.
///
/// The unlock transition is evaluated lazily, at the next interaction
/// after the cooldown deadline; there is no background timer to cancel.
pub struct LoginThrottle {
    attempts: u32,
    limit: u32,
    cooldown: Duration,
    lock: Option<Lock>,
}

impl Default for LoginThrottle {
    fn default() -> Self {
        Self::new(ATTEMPT_LIMIT, ATTEMPT_COOLDOWN)
    }
}

impl LoginThrottle {
    pub fn new(limit: u32, cooldown: Duration) -> Self {
        Self {
            attempts: 0,
            limit,
            cooldown,
            lock: None,
        }
    }

    fn unlock_if_elapsed(&mut self) {
        if let Some(lock) = &self.lock {
            if lock.until <= Instant::now() {
                debug!("cooldown elapsed, throttle open again");
                self.attempts = 0;
                self.lock = None;
            }
        }
    }

    /// Gatekeeper for a submission. `Err` carries the lock reason and
    /// means the credential endpoint must not be contacted.
    pub fn check_submit(&mut self) -> Result<(), BlockReason> {
        self.unlock_if_elapsed();
        match &self.lock {
            Some(lock) => Err(lock.reason),
            None => Ok(()),
        }
    }

    /// Counts one failed check. Returns the lock reason when this failure
    /// tripped the threshold.
    pub fn record_failure(&mut self) -> Option<BlockReason> {
        self.attempts += 1;
        if self.attempts >= self.limit {
            info!(attempts = self.attempts, "throttle locked");
            self.lock = Some(Lock {
                reason: BlockReason::TooManyAttempts,
                until: Instant::now() + self.cooldown,
            });
            return Some(BlockReason::TooManyAttempts);
        }
        None
    }

    /// A successful check resets everything, winning over any pending
    /// lock-out.
    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.lock = None;
    }

    /// Locks immediately on a server-reported account lock, with the
    /// longer server-side cooldown.
    pub fn lock_account(&mut self) {
        info!("server reported account lock");
        self.lock = Some(Lock {
            reason: BlockReason::AccountLocked,
            until: Instant::now() + ACCOUNT_LOCK_COOLDOWN,
        });
    }

    pub fn is_blocked(&mut self) -> bool {
        self.unlock_if_elapsed();
        self.lock.is_some()
    }

    pub fn block_reason(&mut self) -> Option<BlockReason> {
        self.unlock_if_elapsed();
        self.lock.as_ref().map(|lock| lock.reason)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.limit.saturating_sub(self.attempts)
    }
}

/// Successful payload of the credential endpoint.
#[derive(Debug, Clone)]
pub struct LoginSuccess {
    pub user: UserProfile,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// The external credential-verification endpoint.
#[async_trait]
pub trait CredentialClient: Send + Sync {
    async fn verify(&self, email: &str, password: &str) -> Result<LoginSuccess, LoginError>;
}

/// What a submission came to.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Logged in; the session record is saved and returned.
    Success(SessionRecord),
    /// Credentials rejected; the form stays open.
    Rejected {
        error: LoginError,
        attempts_remaining: u32,
    },
    /// The form is locked, either from this failure or from before.
    Blocked { reason: BlockReason },
}

/// Login form backend: throttle in front of the credential endpoint,
/// session persistence behind it.
pub struct LoginGate {
    throttle: Mutex<LoginThrottle>,
    client: Arc<dyn CredentialClient>,
    manager: Arc<SessionManager>,
}

impl LoginGate {
    pub fn new(client: Arc<dyn CredentialClient>, manager: Arc<SessionManager>) -> Self {
        Self {
            throttle: Mutex::new(LoginThrottle::default()),
            client,
            manager,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.lock_throttle().is_blocked()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.lock_throttle().attempts_remaining()
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        self.lock_throttle().block_reason()
    }

    /// Submits the form once.
    pub async fn attempt_login(&self, email: &str, password: &str) -> LoginOutcome {
        if let Err(reason) = self.lock_throttle().check_submit() {
            return LoginOutcome::Blocked { reason };
        }

        // Obviously malformed addresses never reach the endpoint but
        // still consume an attempt, like any other failed check.
        if !well_formed_email(email) {
            return self.rejected(LoginError::MalformedEmail);
        }

        match self.client.verify(email, password).await {
            Ok(success) => {
                self.lock_throttle().record_success();
                let record = SessionRecord::new(
                    success.user,
                    success.access_token,
                    success.refresh_token,
                    success.expires_at,
                );
                self.manager.save(&record);
                LoginOutcome::Success(record)
            }
            Err(LoginError::AccountLocked { minutes }) => {
                let mut throttle = self.lock_throttle();
                throttle.lock_account();
                drop(throttle);
                LoginOutcome::Rejected {
                    error: LoginError::AccountLocked { minutes },
                    attempts_remaining: 0,
                }
            }
            Err(error) => self.rejected(error),
        }
    }

    fn rejected(&self, error: LoginError) -> LoginOutcome {
        let mut throttle = self.lock_throttle();
        if let Some(reason) = throttle.record_failure() {
            return LoginOutcome::Blocked { reason };
        }
        LoginOutcome::Rejected {
            error,
            attempts_remaining: throttle.attempts_remaining(),
        }
    }

    fn lock_throttle(&self) -> std::sync::MutexGuard<'_, LoginThrottle> {
        match self.throttle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn well_formed_email(email: &str) -> bool {
    matches!(email.split_once('@'), Some((local, domain))
        if !local.is_empty() && domain.contains('.') && !domain.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_profile;
    use crate::store::{CookieStore, StoreStack};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(StoreStack::new(vec![Box::new(
            CookieStore::new(),
        )])))
    }

    struct ScriptedClient {
        calls: AtomicUsize,
        script: fn(u32) -> Result<LoginSuccess, LoginError>,
    }

    impl ScriptedClient {
        fn new(script: fn(u32) -> Result<LoginSuccess, LoginError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn success() -> Result<LoginSuccess, LoginError> {
        Ok(LoginSuccess {
            user: test_profile(),
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        })
    }

    #[async_trait]
    impl CredentialClient for ScriptedClient {
        async fn verify(&self, _email: &str, _password: &str) -> Result<LoginSuccess, LoginError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            (self.script)(call)
        }
    }

    #[tokio::test]
    async fn successful_login_saves_a_session() {
        let manager = manager();
        let client = ScriptedClient::new(|_| success());
        let gate = LoginGate::new(client, manager.clone());

        let outcome = gate.attempt_login("maya@example.com", "pw").await;
        assert!(matches!(outcome, LoginOutcome::Success(_)));
        assert!(manager.read().is_some());
        assert!(!gate.is_blocked());
        assert_eq!(gate.attempts_remaining(), ATTEMPT_LIMIT);
    }

    #[tokio::test]
    async fn fourth_attempt_is_blocked_without_contacting_the_endpoint() {
        let client = ScriptedClient::new(|_| Err(LoginError::WrongPassword));
        let gate = LoginGate::new(client.clone(), manager());

        let first = gate.attempt_login("maya@example.com", "bad").await;
        assert!(matches!(
            first,
            LoginOutcome::Rejected {
                error: LoginError::WrongPassword,
                attempts_remaining: 2,
            }
        ));

        let second = gate.attempt_login("maya@example.com", "bad").await;
        assert!(matches!(
            second,
            LoginOutcome::Rejected {
                attempts_remaining: 1,
                ..
            }
        ));

        // Third failure trips the lock
        let third = gate.attempt_login("maya@example.com", "bad").await;
        assert!(matches!(
            third,
            LoginOutcome::Blocked {
                reason: BlockReason::TooManyAttempts
            }
        ));
        assert_eq!(client.call_count(), 3);
        assert!(gate.is_blocked());

        // Fourth submission never reaches the endpoint
        let fourth = gate.attempt_login("maya@example.com", "bad").await;
        assert!(matches!(fourth, LoginOutcome::Blocked { .. }));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let client = ScriptedClient::new(|call| match call {
            0 | 1 => Err(LoginError::WrongPassword),
            _ => success(),
        });
        let gate = LoginGate::new(client, manager());

        gate.attempt_login("maya@example.com", "bad").await;
        gate.attempt_login("maya@example.com", "bad").await;
        assert_eq!(gate.attempts_remaining(), 1);

        let outcome = gate.attempt_login("maya@example.com", "right").await;
        assert!(matches!(outcome, LoginOutcome::Success(_)));
        assert!(!gate.is_blocked());
        assert_eq!(gate.attempts_remaining(), ATTEMPT_LIMIT);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_auto_unlocks() {
        let client = ScriptedClient::new(|call| match call {
            0..=2 => Err(LoginError::WrongPassword),
            _ => success(),
        });
        let gate = LoginGate::new(client.clone(), manager());

        for _ in 0..3 {
            gate.attempt_login("maya@example.com", "bad").await;
        }
        assert!(gate.is_blocked());
        assert_eq!(gate.block_reason(), Some(BlockReason::TooManyAttempts));

        // Just before the deadline the form is still locked
        tokio::time::advance(ATTEMPT_COOLDOWN - Duration::from_secs(1)).await;
        assert!(gate.is_blocked());
        let blocked = gate.attempt_login("maya@example.com", "right").await;
        assert!(matches!(blocked, LoginOutcome::Blocked { .. }));
        assert_eq!(client.call_count(), 3);

        // Just past it the submission reaches the endpoint again
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!gate.is_blocked());
        let outcome = gate.attempt_login("maya@example.com", "right").await;
        assert!(matches!(outcome, LoginOutcome::Success(_)));
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn server_account_lock_uses_the_longer_cooldown() {
        let client = ScriptedClient::new(|_| Err(LoginError::AccountLocked { minutes: 15 }));
        let gate = LoginGate::new(client.clone(), manager());

        let outcome = gate.attempt_login("maya@example.com", "pw").await;
        assert!(matches!(
            outcome,
            LoginOutcome::Rejected {
                error: LoginError::AccountLocked { minutes: 15 },
                ..
            }
        ));
        assert_eq!(gate.block_reason(), Some(BlockReason::AccountLocked));

        // Still locked after the client-side cooldown would have elapsed
        tokio::time::advance(ATTEMPT_COOLDOWN + Duration::from_secs(1)).await;
        assert!(gate.is_blocked());

        tokio::time::advance(ACCOUNT_LOCK_COOLDOWN).await;
        assert!(!gate.is_blocked());
    }

    #[tokio::test]
    async fn transport_errors_consume_attempts_like_wrong_passwords() {
        let client = ScriptedClient::new(|_| Err(LoginError::ServerUnavailable));
        let gate = LoginGate::new(client, manager());

        for _ in 0..3 {
            gate.attempt_login("maya@example.com", "pw").await;
        }
        assert!(gate.is_blocked());
    }

    #[tokio::test]
    async fn malformed_email_rejected_before_the_endpoint_but_counted() {
        let client = ScriptedClient::new(|_| success());
        let gate = LoginGate::new(client.clone(), manager());

        let outcome = gate.attempt_login("not-an-email", "pw").await;
        assert!(matches!(
            outcome,
            LoginOutcome::Rejected {
                error: LoginError::MalformedEmail,
                attempts_remaining: 2,
            }
        ));
        assert_eq!(client.call_count(), 0);
    }

    #[test]
    fn email_shape_check() {
        assert!(well_formed_email("maya@example.com"));
        assert!(!well_formed_email("maya"));
        assert!(!well_formed_email("@example.com"));
        assert!(!well_formed_email("maya@nodot"));
        assert!(!well_formed_email("maya@.com"));
    }
}
