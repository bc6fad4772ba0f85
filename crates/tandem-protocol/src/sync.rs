//! Sync sub-protocol payloads.
//!
//! ```text
//! sync payload := uvarint(step) varbytes(blob)
//! ```
//!
//! A step 1 query may omit the blob entirely, which is read as an empty
//! state vector ("send me everything").

use bytes::{Bytes, BytesMut};

use crate::codec::ProtocolError;
use crate::encoding::{write_var_bytes, write_var_uint, Decoder};
use crate::message::{SyncMessage, SyncStep};

/// Append the payload of a sync message (without the outer message tag).
pub fn encode_payload(message: &SyncMessage, buf: &mut BytesMut) {
    write_var_uint(buf, message.step().into());
    write_var_bytes(buf, message.payload());
}

/// Decode a sync payload, consuming the rest of `decoder`.
///
/// # Errors
///
/// Returns an error for unknown steps, truncated blobs or trailing bytes.
pub fn decode_payload(decoder: &mut Decoder<'_>) -> Result<SyncMessage, ProtocolError> {
    let raw_step = decoder.read_var_uint()?;
    let step = SyncStep::try_from(raw_step).map_err(ProtocolError::UnknownSyncStep)?;

    if step == SyncStep::QueryStateVector && decoder.is_empty() {
        return Ok(SyncMessage::QueryStateVector(Bytes::new()));
    }

    let blob = Bytes::copy_from_slice(decoder.read_var_bytes()?);
    decoder.finish()?;

    Ok(match step {
        SyncStep::QueryStateVector => SyncMessage::QueryStateVector(blob),
        SyncStep::StateVectorReply => SyncMessage::StateVectorReply(blob),
        SyncStep::Update => SyncMessage::Update(blob),
    })
}
