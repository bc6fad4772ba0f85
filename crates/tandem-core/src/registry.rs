//! Process-wide registry of document hubs.
//!
//! The registry maps canonical document ids to hubs. A hub is created when
//! the first connection to its document attaches and disposed when the last
//! one detaches. Both happen under the `DashMap` entry lock for the id, and
//! the hub's own lock is only ever taken inside it (never the other way
//! round), so creation and disposal of one id are linearized: a connection
//! cannot attach to a hub that is being disposed.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tandem_protocol::codec::{FrameCodec, MAX_FRAME_SIZE};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, ConnectionState};
use crate::document::DocumentId;
use crate::hub::DocumentHub;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry no longer accepts connections.
    #[error("Registry is shutting down")]
    ShuttingDown,

    /// Maximum number of open documents reached.
    #[error("Maximum open documents reached")]
    MaxDocumentsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of documents with a live hub.
    pub max_documents: usize,
    /// Maximum inbound frame size accepted by hubs.
    pub max_frame_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_documents: 10_000,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live hubs.
    pub documents: usize,
    /// Number of attached connections across all hubs.
    pub connections: usize,
}

/// The hub registry.
///
/// Constructed once at process start and shared as `Arc<HubRegistry>`.
pub struct HubRegistry {
    hubs: DashMap<DocumentId, Arc<DocumentHub>>,
    config: RegistryConfig,
    shutting_down: AtomicBool,
    self_ref: Weak<HubRegistry>,
}

impl HubRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Arc<Self> {
        info!("Creating hub registry with config: {:?}", config);
        Arc::new_cyclic(|self_ref| Self {
            hubs: DashMap::new(),
            config,
            shutting_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Attach a connection to the hub of `document`, creating the hub if it
    /// does not exist.
    ///
    /// Get-or-create and attach happen under the same entry lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is shutting down or the document
    /// limit is reached.
    pub fn attach(
        &self,
        document: DocumentId,
        connection: ClientConnection,
    ) -> Result<ConnectionState, RegistryError> {
        if self.is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }

        let connection_id = connection.id();
        // Read before taking the entry lock; `len` visits every shard.
        let open_documents = self.hubs.len();

        let hub = match self.hubs.entry(document.clone()) {
            Entry::Occupied(entry) => {
                let hub = Arc::clone(entry.get());
                hub.attach(connection);
                hub
            }
            Entry::Vacant(entry) => {
                if open_documents >= self.config.max_documents {
                    warn!(document = %document, "Refusing new hub, document limit reached");
                    return Err(RegistryError::MaxDocumentsReached);
                }
                let hub = Arc::new(self.create_hub(document.clone()));
                hub.attach(connection);
                entry.insert(Arc::clone(&hub));
                hub
            }
        };

        Ok(ConnectionState::new(connection_id, document, hub))
    }

    /// Get the hub of `document`, creating an empty one if needed.
    ///
    /// A hub created here has no connections; it is disposed by the next
    /// [`release_idle`](Self::release_idle) unless a connection attaches
    /// first.
    ///
    /// # Errors
    ///
    /// Same conditions as [`attach`](Self::attach).
    pub fn get_or_create(&self, document: DocumentId) -> Result<Arc<DocumentHub>, RegistryError> {
        if self.is_shutting_down() {
            return Err(RegistryError::ShuttingDown);
        }

        let open_documents = self.hubs.len();
        match self.hubs.entry(document.clone()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                if open_documents >= self.config.max_documents {
                    return Err(RegistryError::MaxDocumentsReached);
                }
                let hub = Arc::new(self.create_hub(document));
                entry.insert(Arc::clone(&hub));
                Ok(hub)
            }
        }
    }

    fn create_hub(&self, document: DocumentId) -> DocumentHub {
        DocumentHub::new(
            document,
            self.self_ref.clone(),
            FrameCodec::with_max_frame_size(self.config.max_frame_size),
        )
    }

    /// Remove `hub` if it is still registered and still has no connections,
    /// then dispose it.
    ///
    /// Returns `true` if the hub was removed.
    pub(crate) fn release(&self, hub: &DocumentHub) -> bool {
        let removed = self.hubs.remove_if(hub.id(), |_, current| {
            std::ptr::eq(Arc::as_ptr(current), hub) && current.is_idle()
        });

        match removed {
            Some((id, hub)) => {
                hub.dispose();
                debug!(document = %id, "Released document hub");
                true
            }
            None => false,
        }
    }

    /// Get the hub of a document, if one is live.
    #[must_use]
    pub fn get(&self, document: &str) -> Option<Arc<DocumentHub>> {
        self.hubs.get(document).map(|entry| Arc::clone(entry.value()))
    }

    /// Check if a document has a live hub.
    #[must_use]
    pub fn contains(&self, document: &str) -> bool {
        self.hubs.contains_key(document)
    }

    /// Number of live hubs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    /// Check if no hub is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Ids of all documents with a live hub.
    #[must_use]
    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.hubs.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let hubs = self.snapshot();
        RegistryStats {
            documents: hubs.len(),
            connections: hubs.iter().map(|h| h.connection_count()).sum(),
        }
    }

    /// Send an extension frame to every connection of a document.
    ///
    /// Returns the number of connections the frame was queued on.
    pub fn notify(&self, document: &str, tag: u64, payload: impl Into<Bytes>) -> usize {
        let Some(hub) = self.get(document) else {
            return 0;
        };
        match hub.notify(tag, payload) {
            Ok(count) => count,
            Err(e) => {
                warn!(document = %document, error = %e, "Failed to send notification");
                0
            }
        }
    }

    /// Announce that a document was deleted and evict its connections.
    ///
    /// Returns the number of evicted connections.
    pub fn document_deleted(&self, document: &str) -> usize {
        let Some(hub) = self.get(document) else {
            return 0;
        };
        let evicted = hub.close_deleted();
        info!(document = %document, evicted, "Document deleted, connections evicted");
        evicted
    }

    /// Evict every connection `user` holds on `document`.
    ///
    /// Permission is only checked at admission; this is how a host revokes
    /// access from a live session.
    pub fn disconnect_user(&self, document: &str, user: &str) -> usize {
        let Some(hub) = self.get(document) else {
            return 0;
        };
        let evicted = hub.evict_matching(|u| u == user);
        if evicted > 0 {
            info!(document = %document, user = %user, evicted, "Disconnected user");
        }
        evicted
    }

    /// Prune awareness states not refreshed within `timeout` on every hub.
    pub fn sweep_awareness(&self, timeout: Duration) -> usize {
        self.snapshot()
            .iter()
            .map(|hub| hub.prune_stale_awareness(timeout))
            .sum()
    }

    /// Dispose every hub that has no connections.
    pub fn release_idle(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|hub| self.release(hub))
            .count()
    }

    /// Stop accepting connections and evict every attached one.
    ///
    /// Hubs are released as their connections detach.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let evicted: usize = self
            .snapshot()
            .iter()
            .map(|hub| hub.evict_matching(|_| true))
            .sum();
        info!(evicted, "Hub registry shutting down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Clone out every hub so no map lock is held while hubs are locked.
    fn snapshot(&self) -> Vec<Arc<DocumentHub>> {
        self.hubs.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

impl std::fmt::Debug for HubRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubRegistry")
            .field("documents", &self.hubs.len())
            .field("config", &self.config)
            .finish()
    }
}
