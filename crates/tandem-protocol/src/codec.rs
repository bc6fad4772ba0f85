//! Codec for encoding and decoding Tandem frames.
//!
//! One WebSocket binary message carries exactly one frame:
//! `<uvarint messageType><payload>`. There is no extra length prefix since
//! the transport already delimits messages.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::encoding::{write_var_bytes, write_var_uint, Decoder};
use crate::message::{Message, MessageType, EXTENSION_BASE};
use crate::sync;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// Input ended before the frame was complete.
    #[error("Unexpected end of frame")]
    UnexpectedEof,

    /// A varint does not fit in 64 bits.
    #[error("Varint overflows u64")]
    VarintOverflow,

    /// Tag outside the known and extension ranges.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    /// Unknown sync sub-step marker.
    #[error("Unknown sync step: {0}")]
    UnknownSyncStep(u64),

    /// Bytes left over after a complete payload.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// A string field is not UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// An awareness state is not valid JSON.
    #[error("Invalid awareness state: {0}")]
    InvalidAwarenessState(#[source] serde_json::Error),

    /// Extension frames must use a tag of at least 100.
    #[error("Extension tag {0} is outside the extension range")]
    InvalidExtensionTag(u64),
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if the encoded frame is larger than [`MAX_FRAME_SIZE`].
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(encoded_len_hint(message));
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message into an existing buffer.
///
/// # Errors
///
/// Returns an error if the encoded frame is larger than [`MAX_FRAME_SIZE`]
/// or an extension tag is below the extension range.
pub fn encode_into(message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if let Message::Extension { tag, .. } = message {
        if *tag < EXTENSION_BASE {
            return Err(ProtocolError::InvalidExtensionTag(*tag));
        }
    }

    let start = buf.len();
    write_var_uint(buf, message.message_type().into());

    match message {
        Message::Sync(sync) => sync::encode_payload(sync, buf),
        Message::Awareness(encoded) => write_var_bytes(buf, encoded),
        Message::QueryAwareness => {}
        Message::Extension { payload, .. } => buf.extend_from_slice(payload),
    }

    let len = buf.len() - start;
    if len > MAX_FRAME_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }

    Ok(())
}

/// Decode a single frame.
///
/// # Errors
///
/// Returns an error if the data is empty, too large or malformed.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Read the message type of a frame without decoding its payload.
///
/// # Errors
///
/// Returns an error if the tag is truncated or unknown.
pub fn peek_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    let tag = Decoder::new(data).read_var_uint()?;
    MessageType::try_from(tag).map_err(ProtocolError::UnknownMessageType)
}

fn decode_with_limit(data: &[u8], max_frame_size: usize) -> Result<Message, ProtocolError> {
    if data.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge(data.len(), max_frame_size));
    }

    let mut decoder = Decoder::new(data);
    let tag = decoder.read_var_uint()?;
    let message_type = MessageType::try_from(tag).map_err(ProtocolError::UnknownMessageType)?;

    match message_type {
        MessageType::Sync => Ok(Message::Sync(sync::decode_payload(&mut decoder)?)),
        MessageType::Awareness => {
            let encoded = Bytes::copy_from_slice(decoder.read_var_bytes()?);
            decoder.finish()?;
            Ok(Message::Awareness(encoded))
        }
        MessageType::QueryAwareness => {
            decoder.finish()?;
            Ok(Message::QueryAwareness)
        }
        MessageType::Extension(tag) => Ok(Message::Extension {
            tag,
            payload: Bytes::copy_from_slice(decoder.read_rest()),
        }),
    }
}

fn encoded_len_hint(message: &Message) -> usize {
    let payload = match message {
        Message::Sync(sync) => sync.payload().len() + 12,
        Message::Awareness(encoded) => encoded.len() + 10,
        Message::QueryAwareness => 0,
        Message::Extension { payload, .. } => payload.len(),
    };
    payload + 10
}

/// Codec with a configurable frame size limit.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that rejects inbound frames above `max_frame_size`.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// The inbound frame size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        encode(message)
    }

    /// Decode a frame, enforcing this codec's size limit.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, data: &[u8]) -> Result<Message, ProtocolError> {
        decode_with_limit(data, self.max_frame_size)
    }
}
