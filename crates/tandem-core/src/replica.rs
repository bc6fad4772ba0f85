//! The hub's CRDT replica of a document.
//!
//! Update blobs are Yjs v1 updates merged through `yrs`, after a structural
//! walk that refuses anything `yrs` cannot decode safely. Merging is
//! commutative, associative and idempotent, so the replica converges no
//! matter how updates are ordered or duplicated. Updates whose causal
//! dependencies have not arrived yet are held by `yrs` until they can be
//! integrated.

use tandem_protocol::encoding::Decoder;
use tandem_protocol::ProtocolError;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Deepest nesting of lib0 `Any` values accepted in an update.
pub const MAX_VALUE_DEPTH: usize = 64;

/// A signed varint of nine bytes already carries 62 bits, more than any
/// integer lib0 writes.
const MAX_SIGNED_VARINT_LEN: usize = 9;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;
const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_MASK: u8 = 0b0000_1111;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;

const TYPE_XML_ELEMENT: u8 = 3;

/// Why an encoded update or state vector was refused.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Truncated input, an oversized varint or a string that is not UTF-8.
    #[error(transparent)]
    Malformed(#[from] ProtocolError),

    /// A count or clock outside what the format allows.
    #[error("{0} out of range")]
    OutOfRange(&'static str),

    /// A content, type or value tag the hub does not accept.
    #[error("Unsupported {0} tag {1}")]
    UnsupportedTag(&'static str, u8),

    /// Values nested deeper than [`MAX_VALUE_DEPTH`].
    #[error("Values nested deeper than {MAX_VALUE_DEPTH}")]
    TooDeep,

    /// Rejected by `yrs` after the structural check.
    #[error(transparent)]
    Yrs(#[from] yrs::encoding::read::Error),
}

/// Replica errors.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The update blob could not be decoded.
    #[error("Invalid update: {0}")]
    InvalidUpdate(#[source] DecodeError),

    /// The state vector could not be decoded.
    #[error("Invalid state vector: {0}")]
    InvalidStateVector(#[source] DecodeError),

    /// The update decoded but could not be integrated.
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// In-memory CRDT state of one document.
pub struct DocumentReplica {
    doc: Doc,
}

impl DocumentReplica {
    /// Create an empty replica.
    #[must_use]
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Merge an encoded update.
    ///
    /// The blob is walked with [`check_update`] before `yrs` sees it.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is malformed; the replica is unchanged.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), ReplicaError> {
        check_update(update).map_err(ReplicaError::InvalidUpdate)?;
        let update = Update::decode_v1(update)
            .map_err(|e| ReplicaError::InvalidUpdate(DecodeError::Yrs(e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    /// Encoded state vector summarizing everything merged so far.
    #[must_use]
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    ///
    /// An empty `state_vector` stands for a peer that has nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state vector is malformed.
    pub fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = if state_vector.is_empty() {
            StateVector::default()
        } else {
            check_state_vector(state_vector).map_err(ReplicaError::InvalidStateVector)?;
            StateVector::decode_v1(state_vector)
                .map_err(|e| ReplicaError::InvalidStateVector(DecodeError::Yrs(e)))?
        };
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// The full document state as a single update.
    #[must_use]
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// The underlying `yrs` document.
    #[must_use]
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

/// Walk a Yjs v1 update without building anything.
///
/// Accepts exactly the layout `yrs` reads and rejects, before `yrs` is
/// involved, anything it would decode unsafely: strings that are not UTF-8,
/// counts larger than the remaining input, clocks that overflow `u32` and
/// unbounded value nesting.
///
/// # Errors
///
/// Returns the first structural problem found.
pub fn check_update(update: &[u8]) -> Result<(), DecodeError> {
    let mut decoder = Decoder::new(update);

    let clients = read_count(&mut decoder, 3)?;
    for _ in 0..clients {
        let blocks = read_count(&mut decoder, 1)?;
        read_u32(&mut decoder)?;
        let mut clock = read_u32(&mut decoder)?;
        for _ in 0..blocks {
            let len = check_block(&mut decoder)?;
            clock = clock
                .checked_add(len)
                .ok_or(DecodeError::OutOfRange("clock"))?;
        }
    }

    check_delete_set(&mut decoder)
}

/// Walk an encoded state vector.
///
/// # Errors
///
/// Returns the first structural problem found.
pub fn check_state_vector(state_vector: &[u8]) -> Result<(), DecodeError> {
    let mut decoder = Decoder::new(state_vector);
    let clients = read_count(&mut decoder, 2)?;
    for _ in 0..clients {
        decoder.read_var_uint()?;
        read_u32(&mut decoder)?;
    }
    Ok(())
}

/// Returns the clock length of the block.
fn check_block(decoder: &mut Decoder<'_>) -> Result<u32, DecodeError> {
    let info = decoder.read_u8()?;
    if info == BLOCK_GC || info == BLOCK_SKIP {
        return read_u32(decoder);
    }

    if info & HAS_ORIGIN != 0 {
        read_id(decoder)?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        read_id(decoder)?;
    }
    if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
        if read_u32(decoder)? == 1 {
            decoder.read_var_string()?;
        } else {
            read_id(decoder)?;
        }
        if info & HAS_PARENT_SUB != 0 {
            decoder.read_var_string()?;
        }
    }

    check_content(decoder, info & CONTENT_MASK)
}

fn check_content(decoder: &mut Decoder<'_>, content: u8) -> Result<u32, DecodeError> {
    match content {
        CONTENT_DELETED => read_u32(decoder),
        CONTENT_JSON => {
            // yrs reads one entry past the declared count.
            let count = read_count(decoder, 1)?;
            for _ in 0..=count {
                decoder.read_var_string()?;
            }
            clock_len(count + 1)
        }
        CONTENT_BINARY => {
            decoder.read_var_bytes()?;
            Ok(1)
        }
        CONTENT_STRING => {
            let text = decoder.read_var_string()?;
            clock_len(text.encode_utf16().count())
        }
        CONTENT_EMBED => {
            decoder.read_var_string()?;
            Ok(1)
        }
        CONTENT_FORMAT => {
            decoder.read_var_string()?;
            decoder.read_var_string()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            check_type_ref(decoder)?;
            Ok(1)
        }
        CONTENT_ANY => {
            let count = read_count(decoder, 1)?;
            for _ in 0..count {
                check_value(decoder, 0)?;
            }
            clock_len(count)
        }
        CONTENT_DOC => {
            decoder.read_var_string()?;
            check_value(decoder, 0)?;
            Ok(1)
        }
        other => Err(DecodeError::UnsupportedTag("content", other)),
    }
}

fn check_type_ref(decoder: &mut Decoder<'_>) -> Result<(), DecodeError> {
    match decoder.read_u8()? {
        TYPE_XML_ELEMENT => {
            decoder.read_var_string()?;
            Ok(())
        }
        // array, map, text, xml fragment, xml hook, xml text, subdocument, undefined
        0 | 1 | 2 | 4 | 5 | 6 | 9 | 15 => Ok(()),
        other => Err(DecodeError::UnsupportedTag("type", other)),
    }
}

/// Walk one lib0 `Any` value.
fn check_value(decoder: &mut Decoder<'_>, depth: usize) -> Result<(), DecodeError> {
    if depth >= MAX_VALUE_DEPTH {
        return Err(DecodeError::TooDeep);
    }

    match decoder.read_u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => {}
        125 => skip_signed_varint(decoder)?,
        124 => {
            decoder.read_bytes(4)?;
        }
        123 | 122 => {
            decoder.read_bytes(8)?;
        }
        119 => {
            decoder.read_var_string()?;
        }
        118 => {
            let len = read_count(decoder, 2)?;
            for _ in 0..len {
                decoder.read_var_string()?;
                check_value(decoder, depth + 1)?;
            }
        }
        117 => {
            let len = read_count(decoder, 1)?;
            for _ in 0..len {
                check_value(decoder, depth + 1)?;
            }
        }
        116 => {
            decoder.read_var_bytes()?;
        }
        other => return Err(DecodeError::UnsupportedTag("value", other)),
    }
    Ok(())
}

fn check_delete_set(decoder: &mut Decoder<'_>) -> Result<(), DecodeError> {
    let clients = read_count(decoder, 2)?;
    for _ in 0..clients {
        read_u32(decoder)?;
        let ranges = read_count(decoder, 2)?;
        for _ in 0..ranges {
            let clock = read_u32(decoder)?;
            let len = read_u32(decoder)?;
            clock
                .checked_add(len)
                .ok_or(DecodeError::OutOfRange("deleted range"))?;
        }
    }
    Ok(())
}

fn read_u32(decoder: &mut Decoder<'_>) -> Result<u32, DecodeError> {
    let value = decoder.read_var_uint()?;
    u32::try_from(value).map_err(|_| DecodeError::OutOfRange("u32 field"))
}

fn read_id(decoder: &mut Decoder<'_>) -> Result<(), DecodeError> {
    read_u32(decoder)?;
    read_u32(decoder)?;
    Ok(())
}

/// Read an element count, refusing counts the remaining input cannot hold
/// at `min_size` bytes per element.
fn read_count(decoder: &mut Decoder<'_>, min_size: usize) -> Result<usize, DecodeError> {
    let count = decoder.read_var_uint()?;
    let capacity = decoder.remaining().len() / min_size;
    match usize::try_from(count) {
        Ok(count) if count <= capacity => Ok(count),
        _ => Err(DecodeError::OutOfRange("length")),
    }
}

fn skip_signed_varint(decoder: &mut Decoder<'_>) -> Result<(), DecodeError> {
    for _ in 0..MAX_SIGNED_VARINT_LEN {
        if decoder.read_u8()? & 0x80 == 0 {
            return Ok(());
        }
    }
    Err(DecodeError::OutOfRange("integer"))
}

fn clock_len(len: usize) -> Result<u32, DecodeError> {
    u32::try_from(len).map_err(|_| DecodeError::OutOfRange("block length"))
}

impl Default for DocumentReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DocumentReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentReplica")
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use yrs::{Doc, GetString, ReadTxn, Text, Transact};

    pub const TEXT: &str = "content";

    /// Insert `chunk` into a client doc and return the resulting update.
    pub fn edit(doc: &Doc, index: u32, chunk: &str) -> Vec<u8> {
        let text = doc.get_or_insert_text(TEXT);
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, index, chunk);
        }
        doc.transact().encode_diff_v1(&before)
    }

    pub fn content(doc: &Doc) -> String {
        let text = doc.get_or_insert_text(TEXT);
        let txn = doc.transact();
        text.get_string(&txn)
    }
}
