use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use tokio::sync::{mpsc, watch};

pub type SessionId = u64;

/// Outbound lines buffered per session before the overflow policy kicks in.
pub const OUTBOX_CAPACITY: usize = 128;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Error kinds for handing a line to a session's outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbox is at capacity. The line was dropped (drop-newest policy);
    /// the session stays connected.
    Full,
    /// The session's connection is gone; nothing will drain the outbox.
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full => write!(f, "session outbox is full"),
            SendError::Closed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Server-side proxy for one connected client: identity, mutable display
/// name, and the outbound message path.
///
/// The outbox is drained by the connection's own writer task, so nothing
/// that holds the registry lock ever blocks on a slow client. The display
/// name stays `None` until the client completes a `/join`.
pub struct Session {
    id: SessionId,
    name: Mutex<Option<String>>,
    outbox: mpsc::Sender<String>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Creates a session and the receiving end of its outbox. The caller
    /// spawns a writer task that owns the receiver and the connection's
    /// write half.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: Mutex::new(None),
            outbox,
            closed,
        });
        (session, outbox_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn display_name(&self) -> Option<String> {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_display_name(&self, name: String) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = Some(name);
    }

    /// Hands a line to the outbox without blocking.
    pub fn send(&self, line: impl Into<String>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbox.try_send(line.into()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Marks the session closed and wakes its writer task. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close signal for the writer task; completes even if `close` ran
    /// before the task subscribed.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}
