use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::session::{SendError, Session, SessionId};

/// The authoritative, synchronized set of live sessions.
///
/// A single mutex serializes every operation, so enumeration never races a
/// mutation. Nothing blocking happens under the lock: delivery goes through
/// each session's non-blocking outbox, and slow clients are someone else's
/// problem (their own writer task).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session. Calling it again for an already-registered
    /// session is a no-op, so a `/join` after the accept-time registration
    /// cannot introduce a duplicate.
    pub fn add(&self, session: Arc<Session>) {
        let mut sessions = self.sessions();
        if sessions.iter().any(|s| s.id() == session.id()) {
            return;
        }
        sessions.push(session);
    }

    /// Removes a session if present. Idempotent.
    pub fn remove(&self, id: SessionId) {
        self.sessions().retain(|s| s.id() != id);
    }

    /// Delivers `message` to every registered session's outbox.
    ///
    /// A failed delivery never aborts the pass: a full outbox means the
    /// line is dropped for that session, and a closed outbox gets the
    /// session pruned from the registry after the pass.
    pub fn broadcast(&self, message: &str) {
        let mut sessions = self.sessions();
        let mut dead = Vec::new();
        for session in sessions.iter() {
            match session.send(message) {
                Ok(()) => {}
                Err(SendError::Full) => {
                    debug!(session = session.id(), "outbox full, dropping line");
                }
                Err(SendError::Closed) => {
                    warn!(session = session.id(), "send failed, pruning session");
                    dead.push(session.id());
                }
            }
        }
        if !dead.is_empty() {
            sessions.retain(|s| !dead.contains(&s.id()));
        }
    }

    /// Closes every session and empties the registry. Used at shutdown.
    pub fn close_all(&self) {
        for session in self.sessions().drain(..) {
            session.close();
        }
    }

    /// Snapshot of display names in registration order. Sessions that have
    /// not completed `/join` carry no name and are skipped.
    pub fn list_display_names(&self) -> Vec<String> {
        self.sessions()
            .iter()
            .filter_map(|s| s.display_name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
