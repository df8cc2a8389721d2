//! Passive interaction tracking
//!
//! Keeps the stored record "warm" by stamping `last_activity` whenever
//! the user interacts. Advisory only: nothing reads the stamp to force a
//! logout.

use std::sync::Arc;

use tracing::trace;

use crate::manager::SessionManager;

/// The interaction kinds the tracker listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    PointerMove,
    KeyPress,
    Scroll,
    Touch,
}

pub struct ActivityTracker {
    manager: Arc<SessionManager>,
}

impl ActivityTracker {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Stamps the session on one interaction.
    ///
    /// Reading through the manager already bumps `last_activity` and
    /// re-persists the record; with no session this is a no-op.
    /// Overlapping calls simply overwrite each other, last write wins.
    pub fn record(&self, kind: Interaction) {
        if self.manager.read().is_some() {
            trace!(?kind, "activity stamped");
        }
    }
}
