//! Client connections and their per-connection state.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::document::DocumentId;
use crate::hub::{DocumentHub, HubError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the ID.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live connection about to be attached to a hub.
///
/// The hub keeps the sending half of the connection's bounded outbound
/// queue; the transport task drains the receiving half.
#[derive(Debug)]
pub struct ClientConnection {
    pub(crate) id: ConnectionId,
    pub(crate) user: String,
    pub(crate) outbound: mpsc::Sender<Bytes>,
}

impl ClientConnection {
    /// Create a connection for `user` with an outbound queue of `capacity`
    /// frames.
    #[must_use]
    pub fn new(user: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: ConnectionId::generate(),
            user: user.into(),
            outbound,
        };
        (connection, rx)
    }

    /// The connection's ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The authenticated user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }
}

/// Why a connection left its hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// Transport or heartbeat failure.
    Error,
    /// The client sent a close frame.
    CloseFrame,
    /// The server is stopping.
    ServerShutdown,
    /// The hub dropped the connection (slow consumer, revocation, deletion).
    Evicted,
    /// The owning task went away without detaching explicitly.
    Cancelled,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetachReason::Error => "error",
            DetachReason::CloseFrame => "close_frame",
            DetachReason::ServerShutdown => "server_shutdown",
            DetachReason::Evicted => "evicted",
            DetachReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a connection.
///
/// ```text
/// Connecting ─▶ Rejected ─────────────────────▶ Closed
/// Connecting ─▶ Attached ─▶ Detached(reason) ─▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Rejected,
    Attached,
    Detached(DetachReason),
    Closed,
}

impl ConnectionPhase {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: ConnectionPhase) -> bool {
        matches!(
            (self, next),
            (ConnectionPhase::Connecting, ConnectionPhase::Rejected)
                | (ConnectionPhase::Connecting, ConnectionPhase::Attached)
                | (ConnectionPhase::Rejected, ConnectionPhase::Closed)
                | (ConnectionPhase::Attached, ConnectionPhase::Detached(_))
                | (ConnectionPhase::Detached(_), ConnectionPhase::Closed)
        )
    }

    /// Check if the phase is terminal.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionPhase::Closed)
    }
}

/// Everything a connection needs to reach its hub.
///
/// Owned by the connection's task. Detaching consumes the state, and a drop
/// guard detaches if the task is cancelled first, so `DocumentHub::detach`
/// runs exactly once per attached connection.
pub struct ConnectionState {
    connection_id: ConnectionId,
    document_id: DocumentId,
    hub: Arc<DocumentHub>,
    detached: bool,
}

impl ConnectionState {
    pub(crate) fn new(
        connection_id: ConnectionId,
        document_id: DocumentId,
        hub: Arc<DocumentHub>,
    ) -> Self {
        Self {
            connection_id,
            document_id,
            hub,
            detached: false,
        }
    }

    /// The connection's ID.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The document this connection is bound to.
    #[must_use]
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// The hub this connection is attached to.
    #[must_use]
    pub fn hub(&self) -> &Arc<DocumentHub> {
        &self.hub
    }

    /// Process one inbound frame from this connection.
    ///
    /// Returns a frame to send back to this connection only, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed; hub state is unchanged.
    pub fn handle_frame(&self, frame: &[u8]) -> Result<Option<Bytes>, HubError> {
        self.hub.handle_frame(self.connection_id, frame)
    }

    /// Detach from the hub.
    pub fn detach(mut self, reason: DetachReason) {
        self.detach_once(reason);
    }

    fn detach_once(&mut self, reason: DetachReason) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.hub.detach(self.connection_id);
        debug!(
            connection = %self.connection_id,
            document = %self.document_id,
            reason = %reason,
            "Connection detached"
        );
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.detach_once(DetachReason::Cancelled);
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("connection_id", &self.connection_id)
            .field("document_id", &self.document_id)
            .field("detached", &self.detached)
            .finish()
    }
}
