//! Per-document hub.
//!
//! A hub owns the document's replica, its awareness map and the set of
//! attached connections. Every inbound frame of an attached connection goes
//! through [`DocumentHub::handle_frame`]; nothing else touches the replica or
//! the awareness map.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tandem_protocol::codec::{self, FrameCodec, ProtocolError};
use tandem_protocol::message::EXTENSION_DOCUMENT_DELETED;
use tandem_protocol::{AwarenessEntry, AwarenessUpdate, Message, SyncMessage};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::awareness::AwarenessMap;
use crate::connection::{ClientConnection, ConnectionId};
use crate::document::DocumentId;
use crate::registry::HubRegistry;
use crate::replica::{DocumentReplica, ReplicaError};

/// Hub errors. All of them are scoped to a single frame.
#[derive(Debug, Error)]
pub enum HubError {
    /// The frame could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The CRDT payload could not be merged.
    #[error(transparent)]
    Replica(#[from] ReplicaError),

    /// The sender is not attached to this hub.
    #[error("Connection {0} is not attached")]
    NotAttached(ConnectionId),
}

/// An attached connection as seen by the hub.
#[derive(Debug)]
struct Peer {
    user: String,
    /// Awareness client id this connection writes, claimed on first use.
    client_id: Option<u64>,
    /// `None` once the hub has evicted the connection.
    outbound: Option<mpsc::Sender<Bytes>>,
}

struct HubState {
    replica: DocumentReplica,
    awareness: AwarenessMap,
    peers: HashMap<ConnectionId, Peer>,
    disposed: bool,
}

impl HubState {
    /// Queue `frame` on every live peer except `excluding`.
    ///
    /// A peer whose queue is full is evicted: its sender is dropped so its
    /// transport task sees the queue close and detaches.
    fn broadcast(
        &mut self,
        document: &DocumentId,
        frame: &Bytes,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let mut delivered = 0;

        for (id, peer) in self.peers.iter_mut() {
            if Some(*id) == excluding {
                continue;
            }
            let Some(outbound) = &peer.outbound else {
                continue;
            };

            match outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        document = %document,
                        connection = %id,
                        "Outbound queue full, evicting slow connection"
                    );
                    peer.outbound = None;
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(document = %document, connection = %id, "Outbound queue closed");
                    peer.outbound = None;
                }
            }
        }

        delivered
    }

    fn broadcast_removals(
        &mut self,
        document: &DocumentId,
        removals: Vec<AwarenessEntry>,
        excluding: Option<ConnectionId>,
    ) {
        if removals.is_empty() {
            return;
        }
        let update = AwarenessUpdate::new(removals);
        match codec::encode(&Message::awareness_from(&update)) {
            Ok(frame) => {
                self.broadcast(document, &frame, excluding);
            }
            Err(e) => {
                warn!(document = %document, error = %e, "Failed to encode awareness removal");
            }
        }
    }
}

/// The per-document aggregate.
pub struct DocumentHub {
    id: DocumentId,
    registry: Weak<HubRegistry>,
    codec: FrameCodec,
    created_at: Instant,
    state: Mutex<HubState>,
}

impl DocumentHub {
    pub(crate) fn new(id: DocumentId, registry: Weak<HubRegistry>, codec: FrameCodec) -> Self {
        debug!(document = %id, "Creating document hub");
        Self {
            id,
            registry,
            codec,
            created_at: Instant::now(),
            state: Mutex::new(HubState {
                replica: DocumentReplica::new(),
                awareness: AwarenessMap::new(),
                peers: HashMap::new(),
                disposed: false,
            }),
        }
    }

    /// The document this hub serves.
    #[must_use]
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// How long the hub has existed.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Whether a connection is attached.
    #[must_use]
    pub fn is_attached(&self, connection: ConnectionId) -> bool {
        self.state.lock().peers.contains_key(&connection)
    }

    /// Whether the registry has disposed this hub.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Encoded state vector of the replica.
    #[must_use]
    pub fn state_vector(&self) -> Vec<u8> {
        self.state.lock().replica.state_vector()
    }

    /// The replica's full state as one update.
    #[must_use]
    pub fn encode_state(&self) -> Vec<u8> {
        self.state.lock().replica.encode_state()
    }

    /// Live awareness states.
    #[must_use]
    pub fn awareness_snapshot(&self) -> AwarenessUpdate {
        self.state.lock().awareness.snapshot()
    }

    /// Called by the registry while it holds this document's entry lock.
    pub(crate) fn attach(&self, connection: ClientConnection) {
        let mut state = self.state.lock();
        debug_assert!(!state.disposed, "attach to a disposed hub");

        state.peers.insert(
            connection.id,
            Peer {
                user: connection.user,
                client_id: None,
                outbound: Some(connection.outbound),
            },
        );

        debug!(
            document = %self.id,
            connection = %connection.id,
            connections = state.peers.len(),
            "Connection attached"
        );
    }

    /// Remove a connection, broadcast the removal of its awareness state and
    /// release the hub if it was the last one.
    ///
    /// Returns `false` if the connection was not attached.
    pub fn detach(&self, connection: ConnectionId) -> bool {
        let remaining = {
            let mut state = self.state.lock();
            let Some(peer) = state.peers.remove(&connection) else {
                return false;
            };

            if let Some(client_id) = peer.client_id {
                let removal: Vec<_> = state.awareness.remove(client_id).into_iter().collect();
                state.broadcast_removals(&self.id, removal, None);
            }

            debug!(
                document = %self.id,
                connection = %connection,
                user = %peer.user,
                connections = state.peers.len(),
                "Connection detached from hub"
            );
            state.peers.len()
        };

        if remaining == 0 {
            if let Some(registry) = self.registry.upgrade() {
                registry.release(self);
            }
        }

        true
    }

    /// Decode and dispatch one inbound frame from `from`.
    ///
    /// Returns a frame for the sender only (a sync step 2 reply or the full
    /// awareness state), if the message calls for one.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed. The hub is left unchanged
    /// and other connections are unaffected.
    pub fn handle_frame(
        &self,
        from: ConnectionId,
        frame: &[u8],
    ) -> Result<Option<Bytes>, HubError> {
        match self.codec.decode(frame)? {
            Message::Sync(sync) => self.apply_sync_message(from, sync),
            Message::Awareness(payload) => {
                self.apply_awareness_message(from, &payload)?;
                Ok(None)
            }
            Message::QueryAwareness => self.query_awareness().map(Some),
            Message::Extension { tag, payload } => {
                debug!(
                    document = %self.id,
                    connection = %from,
                    tag,
                    bytes = payload.len(),
                    "Ignoring inbound extension frame"
                );
                Ok(None)
            }
        }
    }

    /// Apply one sync step from `from`.
    ///
    /// A state vector query is answered with the diff the sender lacks. A
    /// reply or direct update is merged and forwarded to every other
    /// connection as a direct update.
    ///
    /// # Errors
    ///
    /// Returns an error if the carried blob cannot be decoded.
    pub fn apply_sync_message(
        &self,
        from: ConnectionId,
        message: SyncMessage,
    ) -> Result<Option<Bytes>, HubError> {
        let mut state = self.state.lock();
        if !state.peers.contains_key(&from) {
            return Err(HubError::NotAttached(from));
        }

        match message {
            SyncMessage::QueryStateVector(state_vector) => {
                let diff = state.replica.diff(&state_vector)?;
                trace!(
                    document = %self.id,
                    connection = %from,
                    bytes = diff.len(),
                    "Answering state vector query"
                );
                Ok(Some(codec::encode(&Message::state_vector_reply(diff))?))
            }
            SyncMessage::StateVectorReply(update) | SyncMessage::Update(update) => {
                state.replica.apply_update(&update)?;
                let frame = codec::encode(&Message::update(update))?;
                let recipients = state.broadcast(&self.id, &frame, Some(from));
                trace!(document = %self.id, connection = %from, recipients, "Merged update");
                Ok(None)
            }
        }
    }

    /// Merge an awareness payload from `from` and forward accepted tuples to
    /// every other connection.
    ///
    /// A connection owns the first client id it publishes; tuples for any
    /// other client id are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be decoded.
    pub fn apply_awareness_message(
        &self,
        from: ConnectionId,
        payload: &[u8],
    ) -> Result<(), HubError> {
        let update = AwarenessUpdate::decode(payload)?;
        let total = update.len();

        let mut state = self.state.lock();
        let HubState { awareness, peers, .. } = &mut *state;

        let owned = {
            let Some(peer) = peers.get(&from) else {
                return Err(HubError::NotAttached(from));
            };
            peer.client_id
        };

        let mut claimed = owned;
        let mut accepted = Vec::with_capacity(total);
        for entry in update.entries {
            let allowed = match claimed {
                Some(id) => id == entry.client_id,
                None => !peers
                    .iter()
                    .any(|(other, p)| *other != from && p.client_id == Some(entry.client_id)),
            };
            if !allowed {
                warn!(
                    document = %self.id,
                    connection = %from,
                    client_id = entry.client_id,
                    "Dropping awareness update for a client id owned elsewhere"
                );
                continue;
            }
            claimed = Some(entry.client_id);

            if awareness.apply(&entry) {
                accepted.push(entry);
            }
        }

        if claimed != owned {
            if let Some(peer) = peers.get_mut(&from) {
                peer.client_id = claimed;
            }
        }

        if accepted.is_empty() {
            return Ok(());
        }

        let frame = if accepted.len() == total {
            codec::encode(&Message::awareness(Bytes::copy_from_slice(payload)))?
        } else {
            codec::encode(&Message::awareness_from(&AwarenessUpdate::new(accepted)))?
        };
        state.broadcast(&self.id, &frame, Some(from));

        Ok(())
    }

    /// The full awareness state as an awareness frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame exceeds the maximum frame size.
    pub fn query_awareness(&self) -> Result<Bytes, HubError> {
        let snapshot = self.state.lock().awareness.snapshot();
        Ok(codec::encode(&Message::awareness_from(&snapshot))?)
    }

    /// Queue an encoded frame on every attached connection except
    /// `excluding`.
    ///
    /// Returns the number of connections the frame was queued on.
    pub fn broadcast(&self, frame: Bytes, excluding: Option<ConnectionId>) -> usize {
        self.state.lock().broadcast(&self.id, &frame, excluding)
    }

    /// Send an extension frame to every attached connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `tag` is below the extension range or the frame
    /// exceeds the maximum frame size.
    pub fn notify(&self, tag: u64, payload: impl Into<Bytes>) -> Result<usize, HubError> {
        let frame = codec::encode(&Message::extension(tag, payload)?)?;
        Ok(self.broadcast(frame, None))
    }

    /// Remove awareness states not refreshed within `timeout` and broadcast
    /// their removal.
    pub fn prune_stale_awareness(&self, timeout: Duration) -> usize {
        let mut state = self.state.lock();
        let removals = state.awareness.prune_stale(timeout);
        let count = removals.len();
        state.broadcast_removals(&self.id, removals, None);
        count
    }

    /// Announce deletion of the document and evict every connection.
    pub(crate) fn close_deleted(&self) -> usize {
        let payload = self.id.as_str().as_bytes().to_vec();
        if let Err(e) = self.notify(EXTENSION_DOCUMENT_DELETED, payload) {
            warn!(document = %self.id, error = %e, "Failed to announce document deletion");
        }
        self.evict_matching(|_| true)
    }

    /// Drop the outbound queues of matching connections. Their transport
    /// tasks observe the closed queue and detach.
    pub(crate) fn evict_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0;
        for (id, peer) in state.peers.iter_mut() {
            if peer.outbound.is_some() && predicate(&peer.user) {
                peer.outbound = None;
                evicted += 1;
                debug!(document = %self.id, connection = %id, "Evicting connection");
            }
        }
        evicted
    }

    /// Whether no connection is attached. Checked by the registry under the
    /// entry lock before disposal.
    pub(crate) fn is_idle(&self) -> bool {
        self.state.lock().peers.is_empty()
    }

    /// Discard the replica and awareness state.
    pub(crate) fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.awareness.clear();
        state.replica = DocumentReplica::new();
        debug!(document = %self.id, "Document hub disposed");
    }
}

impl std::fmt::Debug for DocumentHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHub")
            .field("id", &self.id)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Create a hub that belongs to no registry.
#[cfg(test)]
pub(crate) fn detached_hub(id: &str) -> std::sync::Arc<DocumentHub> {
    std::sync::Arc::new(DocumentHub::new(
        DocumentId::from(id),
        Weak::new(),
        FrameCodec::new(),
    ))
}
