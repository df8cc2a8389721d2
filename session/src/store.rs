//! Best-effort session storage backends
//!
//! The session record is mirrored across two backends: a cookie jar with
//! per-key expiry, and a persistent key-value document on disk. Either one
//! may be unavailable (missing directory, read-only filesystem, disabled
//! cookies on the original client), so every operation degrades to a no-op
//! instead of surfacing an error. The backends are a cache for the session
//! record, not a source of truth.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Key used by [`SessionStore::is_supported`] for its write-read-delete probe.
const PROBE_KEY: &str = "__store_probe";

/// A single key-value backend for session data.
///
/// Implementations never panic and never return errors: a failing backend
/// silently drops writes and reads back nothing.
pub trait SessionStore: Send + Sync {
    /// Stores `value` under `key`, optionally expiring after `ttl`.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);

    /// Reads the value under `key`, if present and not expired.
    fn get(&self, key: &str) -> Option<String>;

    /// Removes the value under `key`. Missing keys are fine.
    fn remove(&self, key: &str);

    /// Probes the backend with a throwaway key.
    ///
    /// Returns false when the round trip does not read back what was
    /// written, which is how a degraded backend manifests.
    fn is_supported(&self) -> bool {
        self.set(PROBE_KEY, "probe", None);
        let ok = self.get(PROBE_KEY).as_deref() == Some("probe");
        self.remove(PROBE_KEY);
        ok
    }
}

struct CookieEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory jar with cookie semantics: a value disappears once its TTL
/// has passed. Eviction is lazy, on read.
#[derive(Default)]
pub struct CookieStore {
    jar: Mutex<HashMap<String, CookieEntry>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for CookieStore {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl)
        });

        let mut jar = match self.jar.lock() {
            Ok(jar) => jar,
            Err(poisoned) => poisoned.into_inner(),
        };
        jar.insert(
            key.to_owned(),
            CookieEntry {
                value: value.to_owned(),
                expires_at,
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut jar = match self.jar.lock() {
            Ok(jar) => jar,
            Err(poisoned) => poisoned.into_inner(),
        };

        let expired = matches!(
            jar.get(key),
            Some(CookieEntry {
                expires_at: Some(expires_at),
                ..
            }) if *expires_at <= Utc::now()
        );
        if expired {
            jar.remove(key);
            return None;
        }

        jar.get(key).map(|entry| entry.value.clone())
    }

    fn remove(&self, key: &str) {
        let mut jar = match self.jar.lock() {
            Ok(jar) => jar,
            Err(poisoned) => poisoned.into_inner(),
        };
        jar.remove(key);
    }
}

/// Persistent key-value document stored as a JSON file.
///
/// The whole document is read and rewritten on every operation; session
/// data is a handful of short strings, so this stays cheap. TTLs are
/// ignored, matching the persistent store the record is mirrored to —
/// staleness is handled at the record level by its own expiry timestamp.
pub struct FileStore {
    path: PathBuf,
    // Serializes the read-modify-write cycle between threads of this
    // process. Other processes are not coordinated with.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> HashMap<String, String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(err) => {
                debug!(path = %self.path.display(), %err, "cannot read store file");
                return HashMap::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "store file corrupted, starting empty");
                HashMap::new()
            }
        }
    }

    fn persist(&self, map: &HashMap<String, String>) {
        let raw = match serde_json::to_string(map) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "cannot serialize store document");
                return;
            }
        };

        if let Err(err) = fs::write(&self.path, raw) {
            debug!(path = %self.path.display(), %err, "cannot write store file");
        }
    }
}

impl SessionStore for FileStore {
    fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut map = self.load();
        map.insert(key.to_owned(), value.to_owned());
        self.persist(&map);
    }

    fn get(&self, key: &str) -> Option<String> {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.load().get(key).cloned()
    }

    fn remove(&self, key: &str) {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut map = self.load();
        if map.remove(key).is_some() {
            self.persist(&map);
        }
    }
}

/// Composition of backends: writes go to all of them, reads come from the
/// first one that answers, removals hit all of them.
///
/// This is the only place aware that there is more than one backend; the
/// session manager above it sees a single best-effort store.
pub struct StoreStack {
    backends: Vec<Box<dyn SessionStore>>,
}

impl StoreStack {
    pub fn new(backends: Vec<Box<dyn SessionStore>>) -> Self {
        Self { backends }
    }

    /// The default pairing: cookie jar first, file-backed store as the
    /// fallback, both keyed off the given file path.
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        Self::new(vec![
            Box::new(CookieStore::new()),
            Box::new(FileStore::new(path)),
        ])
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        for backend in &self.backends {
            backend.set(key, value, ttl);
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.backends.iter().find_map(|backend| backend.get(key))
    }

    pub fn remove(&self, key: &str) {
        for backend in &self.backends {
            backend.remove(key);
        }
    }

    /// True when at least one backend passes its probe.
    pub fn is_supported(&self) -> bool {
        self.backends.iter().any(|backend| backend.is_supported())
    }
}

/// Backend that drops every write and answers every read with nothing.
///
/// Stands in for a disabled cookie jar or an unwritable store path in
/// tests across the crate.
#[cfg(test)]
pub(crate) struct BrokenStore;

#[cfg(test)]
impl SessionStore for BrokenStore {
    fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) {}

    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn remove(&self, _key: &str) {}
}
