//! # tandem-server
//!
//! WebSocket gateway for the Tandem collaborative document hub.
//!
//! Clients connect to `ws://<host>/ws?noteId=<id-or-alias>`, authenticate
//! with a bearer token and exchange Yjs sync and awareness frames with every
//! other client editing the same document.

pub mod collaborators;
pub mod config;
pub mod gateway;
pub mod memory;
pub mod metrics;

pub use collaborators::{
    AuthError, Authenticator, Credentials, DocumentHandle, DocumentLookup, LookupError,
    PermissionPolicy, User,
};
pub use config::Config;
pub use gateway::{router, run_server, serve, AdmissionError, AppState};
pub use memory::{MemoryDirectory, TokenAuthenticator};
