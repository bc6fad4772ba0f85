//! # tandem-core
//!
//! Document hubs and their registry for the Tandem collaborative sync server.
//!
//! This crate provides the building blocks behind the connection gateway:
//!
//! - **DocumentReplica** - the server's CRDT copy of one document
//! - **AwarenessMap** - last-writer-wins presence records per client
//! - **DocumentHub** - replica + awareness + attached connections
//! - **HubRegistry** - get-or-create/dispose map from document id to hub
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Registry   │────▶│     Hub     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                           │        │
//!                                           ▼        ▼
//!                                    ┌─────────┐ ┌───────────┐
//!                                    │ Replica │ │ Awareness │
//!                                    └─────────┘ └───────────┘
//! ```
//!
//! All mutation of one hub's replica and awareness map happens under that
//! hub's lock, so each document has a single writer at any time. Creation
//! and disposal of a hub are linearized by the registry's map entry lock.

pub mod awareness;
pub mod connection;
pub mod document;
pub mod hub;
pub mod registry;
pub mod replica;

pub use awareness::{AwarenessMap, AwarenessRecord};
pub use connection::{
    ClientConnection, ConnectionId, ConnectionPhase, ConnectionState, DetachReason,
};
pub use document::{validate_document_id, DocumentId};
pub use hub::{DocumentHub, HubError};
pub use registry::{HubRegistry, RegistryConfig, RegistryError, RegistryStats};
pub use replica::{DecodeError, DocumentReplica, ReplicaError};
