//! Message types for the Tandem protocol.
//!
//! A [`Message`] is the closed set of frames a hub understands. Adding a
//! variant forces every dispatch site to handle it.

use bytes::Bytes;

use crate::awareness::AwarenessUpdate;
use crate::codec::ProtocolError;

/// Tag of CRDT sync frames.
pub const MESSAGE_SYNC: u64 = 0;
/// Tag of awareness (presence) frames.
pub const MESSAGE_AWARENESS: u64 = 1;
/// Tag of full-awareness-state queries.
pub const MESSAGE_QUERY_AWARENESS: u64 = 3;
/// First tag reserved for out-of-core extensions.
pub const EXTENSION_BASE: u64 = 100;
/// Extension tag announcing that the document was deleted.
pub const EXTENSION_DOCUMENT_DELETED: u64 = EXTENSION_BASE;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Sync,
    Awareness,
    QueryAwareness,
    Extension(u64),
}

impl From<MessageType> for u64 {
    fn from(mt: MessageType) -> u64 {
        match mt {
            MessageType::Sync => MESSAGE_SYNC,
            MessageType::Awareness => MESSAGE_AWARENESS,
            MessageType::QueryAwareness => MESSAGE_QUERY_AWARENESS,
            MessageType::Extension(tag) => tag,
        }
    }
}

impl TryFrom<u64> for MessageType {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            MESSAGE_SYNC => Ok(MessageType::Sync),
            MESSAGE_AWARENESS => Ok(MessageType::Awareness),
            MESSAGE_QUERY_AWARENESS => Ok(MessageType::QueryAwareness),
            tag if tag >= EXTENSION_BASE => Ok(MessageType::Extension(tag)),
            other => Err(other),
        }
    }
}

/// Sub-step marker inside a sync payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncStep {
    /// Step 1: the sender publishes its state vector and asks for what it lacks.
    QueryStateVector = 0,
    /// Step 2: the update the requester lacks according to its state vector.
    StateVectorReply = 1,
    /// Step 3: an update pushed after a local edit.
    Update = 2,
}

impl From<SyncStep> for u64 {
    fn from(step: SyncStep) -> u64 {
        step as u64
    }
}

impl TryFrom<u64> for SyncStep {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncStep::QueryStateVector),
            1 => Ok(SyncStep::StateVectorReply),
            2 => Ok(SyncStep::Update),
            other => Err(other),
        }
    }
}

/// One step of the sync sub-protocol.
///
/// Payloads are opaque CRDT blobs: an encoded state vector for step 1 and an
/// encoded update for steps 2 and 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    QueryStateVector(Bytes),
    StateVectorReply(Bytes),
    Update(Bytes),
}

impl SyncMessage {
    /// The sub-step marker of this message.
    #[must_use]
    pub fn step(&self) -> SyncStep {
        match self {
            SyncMessage::QueryStateVector(_) => SyncStep::QueryStateVector,
            SyncMessage::StateVectorReply(_) => SyncStep::StateVectorReply,
            SyncMessage::Update(_) => SyncStep::Update,
        }
    }

    /// The carried blob.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        match self {
            SyncMessage::QueryStateVector(data)
            | SyncMessage::StateVectorReply(data)
            | SyncMessage::Update(data) => data,
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// CRDT synchronization.
    Sync(SyncMessage),
    /// Encoded awareness update (see [`AwarenessUpdate`]).
    Awareness(Bytes),
    /// Request for the full awareness state.
    QueryAwareness,
    /// Out-of-core notification, routed but never interpreted by the hub.
    Extension {
        /// Tag, always `>= EXTENSION_BASE`.
        tag: u64,
        /// Opaque payload.
        payload: Bytes,
    },
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Sync(_) => MessageType::Sync,
            Message::Awareness(_) => MessageType::Awareness,
            Message::QueryAwareness => MessageType::QueryAwareness,
            Message::Extension { tag, .. } => MessageType::Extension(*tag),
        }
    }

    /// Create a sync step 1 frame carrying the sender's state vector.
    #[must_use]
    pub fn query_state_vector(state_vector: impl Into<Bytes>) -> Self {
        Message::Sync(SyncMessage::QueryStateVector(state_vector.into()))
    }

    /// Create a sync step 2 frame.
    #[must_use]
    pub fn state_vector_reply(update: impl Into<Bytes>) -> Self {
        Message::Sync(SyncMessage::StateVectorReply(update.into()))
    }

    /// Create a sync step 3 frame.
    #[must_use]
    pub fn update(update: impl Into<Bytes>) -> Self {
        Message::Sync(SyncMessage::Update(update.into()))
    }

    /// Create an awareness frame from an already encoded update.
    #[must_use]
    pub fn awareness(encoded: impl Into<Bytes>) -> Self {
        Message::Awareness(encoded.into())
    }

    /// Create an awareness frame from decoded tuples.
    #[must_use]
    pub fn awareness_from(update: &AwarenessUpdate) -> Self {
        Message::Awareness(update.encode())
    }

    /// Create an extension frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidExtensionTag`] for tags below
    /// [`EXTENSION_BASE`].
    pub fn extension(tag: u64, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        if tag < EXTENSION_BASE {
            return Err(ProtocolError::InvalidExtensionTag(tag));
        }
        Ok(Message::Extension {
            tag,
            payload: payload.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0), Ok(MessageType::Sync));
        assert_eq!(MessageType::try_from(1), Ok(MessageType::Awareness));
        assert_eq!(MessageType::try_from(3), Ok(MessageType::QueryAwareness));
        assert_eq!(MessageType::try_from(100), Ok(MessageType::Extension(100)));
        assert_eq!(MessageType::try_from(4242), Ok(MessageType::Extension(4242)));
        assert_eq!(MessageType::try_from(2), Err(2));
        assert_eq!(MessageType::try_from(99), Err(99));
        assert_eq!(u64::from(MessageType::Extension(123)), 123);
    }

    #[test]
    fn test_sync_step_conversion() {
        assert_eq!(SyncStep::try_from(0), Ok(SyncStep::QueryStateVector));
        assert_eq!(SyncStep::try_from(1), Ok(SyncStep::StateVectorReply));
        assert_eq!(SyncStep::try_from(2), Ok(SyncStep::Update));
        assert!(SyncStep::try_from(3).is_err());
    }

    #[test]
    fn test_constructors() {
        let msg = Message::update(vec![1u8, 2, 3]);
        assert_eq!(msg.message_type(), MessageType::Sync);
        match msg {
            Message::Sync(sync) => {
                assert_eq!(sync.step(), SyncStep::Update);
                assert_eq!(&sync.payload()[..], &[1, 2, 3]);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let ext = Message::extension(150, Bytes::new()).unwrap();
        assert_eq!(ext.message_type(), MessageType::Extension(150));
        assert!(matches!(
            Message::extension(7, Bytes::new()),
            Err(ProtocolError::InvalidExtensionTag(7))
        ));
    }
}
