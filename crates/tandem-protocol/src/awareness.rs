//! Awareness (presence) payloads.
//!
//! ```text
//! awareness update := uvarint(n) { uvarint(clientId) uvarint(clock) varstring(json) }*n
//! ```
//!
//! A state of JSON `null` marks the client as gone.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::encoding::{write_var_string, write_var_uint, Decoder};

/// One presence tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    /// Ephemeral client id chosen by the client.
    pub client_id: u64,
    /// Per-client logical clock; higher wins.
    pub clock: u64,
    /// Presence record (cursor, identity hint, ...), `None` for removal.
    pub state: Option<Value>,
}

impl AwarenessEntry {
    /// Create a live presence tuple.
    #[must_use]
    pub fn new(client_id: u64, clock: u64, state: Value) -> Self {
        Self {
            client_id,
            clock,
            state: (!state.is_null()).then_some(state),
        }
    }

    /// Create a removal tuple.
    #[must_use]
    pub fn removed(client_id: u64, clock: u64) -> Self {
        Self {
            client_id,
            clock,
            state: None,
        }
    }

    /// Whether this tuple removes the client.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }
}

/// A batch of presence tuples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    /// Create an update from tuples.
    #[must_use]
    pub fn new(entries: Vec<AwarenessEntry>) -> Self {
        Self { entries }
    }

    /// Number of tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode the tuples (without the outer varbytes wrapper).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 * self.entries.len() + 1);
        write_var_uint(&mut buf, self.entries.len() as u64);
        for entry in &self.entries {
            write_var_uint(&mut buf, entry.client_id);
            write_var_uint(&mut buf, entry.clock);
            match &entry.state {
                Some(state) => write_var_string(&mut buf, &state.to_string()),
                None => write_var_string(&mut buf, "null"),
            }
        }
        buf.freeze()
    }

    /// Decode tuples.
    ///
    /// # Errors
    ///
    /// Returns an error on truncation, trailing bytes or a state that is not
    /// valid JSON.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut decoder = Decoder::new(data);
        let count = decoder.read_var_uint()?;

        // Every tuple needs at least three bytes; reject absurd counts early.
        let max_possible = (decoder.remaining().len() / 3) as u64;
        if count > max_possible {
            return Err(ProtocolError::UnexpectedEof);
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let client_id = decoder.read_var_uint()?;
            let clock = decoder.read_var_uint()?;
            let json = decoder.read_var_string()?;
            let state: Value =
                serde_json::from_str(json).map_err(ProtocolError::InvalidAwarenessState)?;
            entries.push(AwarenessEntry::new(client_id, clock, state));
        }
        decoder.finish()?;

        Ok(Self { entries })
    }
}
