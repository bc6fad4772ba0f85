//! # tandem-protocol
//!
//! Wire protocol definitions for the Tandem collaborative document hub.
//!
//! Every frame on the socket is a varint message tag followed by a
//! tag-specific payload. The encoding primitives follow lib0, so frames are
//! byte-compatible with Yjs `y-protocols` clients.
//!
//! ## Message Types
//!
//! - `Sync` (0) - state vector query, state vector reply, direct update
//! - `Awareness` (1) - batched presence tuples
//! - `QueryAwareness` (3) - request for the full presence state
//! - `Extension` (>= 100) - out-of-core notifications such as "document deleted"
//!
//! ## Example
//!
//! ```rust
//! use tandem_protocol::{codec, Message, SyncMessage};
//!
//! let message = Message::update(vec![0u8, 0]);
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert!(matches!(decoded, Message::Sync(SyncMessage::Update(_))));
//! ```

pub mod awareness;
pub mod codec;
pub mod encoding;
pub mod message;
pub mod sync;

pub use awareness::{AwarenessEntry, AwarenessUpdate};
pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use message::{Message, MessageType, SyncMessage, SyncStep};
