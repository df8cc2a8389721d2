//! Background access-token renewal
//!
//! A recurring task watches the remaining session lifetime and swaps the
//! tokens through the refresh endpoint shortly before expiry. A failed
//! refresh tears the session down rather than leaving it ambiguous, and
//! the task winds itself down once no session is left.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::manager::SessionManager;

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The endpoint rejected the refresh token.
    #[error("Refresh token rejected")]
    Rejected,
    /// The endpoint could not be reached.
    #[error("Refresh transport failure: {0}")]
    Transport(String),
}

/// Payload of a successful refresh call.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Present when the endpoint rotates refresh tokens.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// The external token-refresh endpoint.
#[async_trait]
pub trait RefreshClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError>;
}

/// Renewal tuning.
#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// How often the session lifetime is checked.
    pub tick_interval: Duration,
    /// Refresh once the remaining lifetime drops below this.
    pub renew_within: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5 * 60),
            renew_within: Duration::from_secs(10 * 60),
        }
    }
}

/// One renewal check, shared between the spawned loop and tests.
pub struct RenewalTask {
    manager: Arc<SessionManager>,
    client: Arc<dyn RefreshClient>,
    renew_within: chrono::Duration,
    /// Reentrancy guard: only one refresh call in flight.
    is_renewing: AtomicBool,
}

impl RenewalTask {
    pub fn new(
        manager: Arc<SessionManager>,
        client: Arc<dyn RefreshClient>,
        renew_within: Duration,
    ) -> Self {
        Self {
            manager,
            client,
            renew_within: chrono::Duration::from_std(renew_within)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            is_renewing: AtomicBool::new(false),
        }
    }

    /// Runs one tick. Returns false once the session is gone and the
    /// owning loop should stop.
    ///
    /// Ticks arriving while a refresh is already in flight are no-ops.
    pub async fn tick(&self) -> bool {
        if self
            .is_renewing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("refresh already in flight, skipping tick");
            return true;
        }

        let keep_running = self.check_and_renew().await;
        self.is_renewing.store(false, Ordering::SeqCst);
        keep_running
    }

    async fn check_and_renew(&self) -> bool {
        let Some(mut record) = self.manager.read() else {
            debug!("no session, renewal loop winding down");
            return false;
        };

        let remaining = record.time_until_expiry();
        if remaining > self.renew_within {
            return true;
        }

        match self.client.refresh(&record.refresh_token).await {
            Ok(tokens) => {
                record.access_token = tokens.access_token;
                if let Some(rotated) = tokens.refresh_token {
                    record.refresh_token = rotated;
                }
                record.expires_at = tokens.expires_at;
                self.manager.save(&record);
                info!(expires_at = %record.expires_at, "session renewed");
                true
            }
            Err(err) => {
                warn!(%err, "refresh failed, tearing session down");
                self.manager.clear();
                false
            }
        }
    }
}

/// Handle to the spawned renewal loop.
///
/// Owned by the session context; dropping or shutting it down cancels the
/// loop so no timer outlives the session it served.
pub struct RenewalScheduler {
    handle: JoinHandle<()>,
}

impl RenewalScheduler {
    pub fn spawn(
        manager: Arc<SessionManager>,
        client: Arc<dyn RefreshClient>,
        config: RenewalConfig,
    ) -> Self {
        let task = RenewalTask::new(manager, client, config.renew_within);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately;
            // the session was just created or validated, so skip it.
            interval.tick().await;

            loop {
                interval.tick().await;
                if !task.tick().await {
                    break;
                }
            }
        });

        Self { handle }
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{SessionRecord, test_profile};
    use crate::store::{CookieStore, StoreStack};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(StoreStack::new(vec![Box::new(
            CookieStore::new(),
        )])))
    }

    fn record_expiring_in(minutes: i64) -> SessionRecord {
        SessionRecord::new(
            test_profile(),
            "old-access",
            "old-refresh",
            Utc::now() + ChronoDuration::minutes(minutes),
        )
    }

    /// Counts calls; optionally parks each call until released.
    struct CountingClient {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        outcome: fn() -> Result<RefreshedTokens, RefreshError>,
    }

    impl CountingClient {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                outcome: || {
                    Ok(RefreshedTokens {
                        access_token: "new-access".into(),
                        refresh_token: Some("new-refresh".into()),
                        expires_at: Utc::now() + ChronoDuration::hours(1),
                    })
                },
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                outcome: || Err(RefreshError::Transport("connection refused".into())),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshClient for CountingClient {
        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            (self.outcome)()
        }
    }

    #[tokio::test]
    async fn fresh_session_is_left_alone() {
        let manager = manager();
        manager.save(&record_expiring_in(60));

        let client = Arc::new(CountingClient::succeeding());
        let task = RenewalTask::new(manager.clone(), client.clone(), Duration::from_secs(600));

        assert!(task.tick().await);
        assert_eq!(client.call_count(), 0);
        assert_eq!(manager.read().unwrap().access_token, "old-access");
    }

    #[tokio::test]
    async fn near_expiry_session_is_renewed_in_place() {
        let manager = manager();
        manager.save(&record_expiring_in(5));

        let client = Arc::new(CountingClient::succeeding());
        let task = RenewalTask::new(manager.clone(), client.clone(), Duration::from_secs(600));

        assert!(task.tick().await);
        assert_eq!(client.call_count(), 1);

        let record = manager.read().unwrap();
        assert_eq!(record.access_token, "new-access");
        assert_eq!(record.refresh_token, "new-refresh");
        assert!(record.time_until_expiry() > ChronoDuration::minutes(50));
    }

    #[tokio::test]
    async fn failed_refresh_tears_the_session_down() {
        let manager = manager();
        manager.save(&record_expiring_in(5));

        let client = Arc::new(CountingClient::failing());
        let task = RenewalTask::new(manager.clone(), client.clone(), Duration::from_secs(600));

        assert!(!task.tick().await);
        assert_eq!(client.call_count(), 1);
        assert_eq!(manager.read(), None);
    }

    #[tokio::test]
    async fn no_session_stops_the_loop_without_calling_out() {
        let manager = manager();
        let client = Arc::new(CountingClient::succeeding());
        let task = RenewalTask::new(manager, client.clone(), Duration::from_secs(600));

        assert!(!task.tick().await);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn overlapping_ticks_issue_a_single_refresh() {
        let manager = manager();
        manager.save(&record_expiring_in(5));

        let gate = Arc::new(Notify::new());
        let client = Arc::new(CountingClient {
            gate: Some(gate.clone()),
            ..CountingClient::succeeding()
        });
        let task = Arc::new(RenewalTask::new(
            manager.clone(),
            client.clone(),
            Duration::from_secs(600),
        ));

        let first = tokio::spawn({
            let task = task.clone();
            async move { task.tick().await }
        });
        // Let the first tick reach the parked refresh call
        tokio::task::yield_now().await;
        assert_eq!(client.call_count(), 1);

        // A tick firing mid-refresh is a no-op
        assert!(task.tick().await);
        assert_eq!(client.call_count(), 1);

        gate.notify_one();
        assert!(first.await.unwrap());
        assert_eq!(client.call_count(), 1);
        assert_eq!(manager.read().unwrap().access_token, "new-access");
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_ticks_on_its_interval_and_can_be_shut_down() {
        let manager = manager();
        manager.save(&record_expiring_in(5));

        let client = Arc::new(CountingClient::succeeding());
        let scheduler = RenewalScheduler::spawn(
            manager.clone(),
            client.clone(),
            RenewalConfig {
                tick_interval: Duration::from_secs(300),
                renew_within: Duration::from_secs(600),
            },
        );

        // Nothing before the first interval elapses
        tokio::task::yield_now().await;
        assert_eq!(client.call_count(), 0);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(client.call_count(), 1);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(client.call_count(), 1);
    }
}
