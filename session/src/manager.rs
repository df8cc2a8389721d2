//! Canonical session record management
//!
//! One manager owns the single meaningful session of the process. It
//! mirrors the record across every backend of its [`StoreStack`] and
//! reconstructs it on read, purging anything expired or unparseable.

use chrono::Utc;
use tracing::{debug, warn};

use crate::record::{SessionRecord, UserProfile};
use crate::store::StoreStack;

/// Storage key for the serialized [`SessionRecord`].
pub const SESSION_KEY: &str = "fitbook_session";
/// Storage key mirroring the bare access token, for lookups that do not
/// need the whole record deserialized.
pub const TOKEN_KEY: &str = "fitbook_token";
/// Storage key mirroring the bare refresh token.
pub const REFRESH_KEY: &str = "fitbook_refresh";

/// Point-in-time view of the session handed to routing decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub is_active: bool,
    pub user: Option<UserProfile>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub time_until_expiry: Option<chrono::Duration>,
}

impl SessionStatus {
    fn absent() -> Self {
        Self {
            is_active: false,
            user: None,
            expires_at: None,
            time_until_expiry: None,
        }
    }
}

pub struct SessionManager {
    stores: StoreStack,
}

impl SessionManager {
    pub fn new(stores: StoreStack) -> Self {
        Self { stores }
    }

    /// Persists `record` to every backend, fully overwriting the previous
    /// session. Backend failures are independent and silent.
    pub fn save(&self, record: &SessionRecord) {
        let ttl = (record.expires_at - Utc::now()).to_std().ok();

        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "cannot serialize session record, skipping save");
                return;
            }
        };

        self.stores.set(SESSION_KEY, &raw, ttl);
        self.stores.set(TOKEN_KEY, &record.access_token, ttl);
        self.stores.set(REFRESH_KEY, &record.refresh_token, ttl);
    }

    /// Reconstructs the current session, or nothing.
    ///
    /// A record that fails to parse or whose expiry has passed is purged
    /// from every backend before returning `None`. A successful read
    /// refreshes `last_activity` and re-persists as a side effect.
    pub fn read(&self) -> Option<SessionRecord> {
        let raw = self.stores.get(SESSION_KEY)?;

        let mut record: SessionRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                debug!(%err, "session record corrupted, clearing");
                self.clear();
                return None;
            }
        };

        if !record.is_active() {
            debug!("session expired, clearing");
            self.clear();
            return None;
        }

        record.last_activity = Utc::now();
        self.save(&record);
        Some(record)
    }

    /// Removes every session key from every backend. Safe to call with no
    /// session present, any number of times.
    pub fn clear(&self) {
        self.stores.remove(SESSION_KEY);
        self.stores.remove(TOKEN_KEY);
        self.stores.remove(REFRESH_KEY);
    }

    /// Profile snapshot of the logged-in user, if any.
    pub fn user(&self) -> Option<UserProfile> {
        self.read().map(|record| record.user)
    }

    /// Current access token, if a live session exists.
    pub fn token(&self) -> Option<String> {
        self.read().map(|record| record.access_token)
    }

    pub fn status(&self) -> SessionStatus {
        match self.read() {
            Some(record) => SessionStatus {
                is_active: true,
                user: Some(record.user),
                time_until_expiry: Some(record.expires_at - Utc::now()),
                expires_at: Some(record.expires_at),
            },
            None => SessionStatus::absent(),
        }
    }
}
