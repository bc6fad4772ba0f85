//! lib0-compatible binary primitives.
//!
//! Unsigned integers are written as little-endian base-128 varints: seven
//! payload bits per byte, high bit set on every byte except the last.
//! Byte arrays and strings are prefixed with their varint length.

use bytes::{BufMut, BytesMut};

use crate::codec::ProtocolError;

/// Longest encoding of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Append a varint-encoded unsigned integer.
pub fn write_var_uint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Append a length-prefixed byte array.
pub fn write_var_bytes(buf: &mut BytesMut, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Append a length-prefixed UTF-8 string.
pub fn write_var_string(buf: &mut BytesMut, value: &str) {
    write_var_bytes(buf, value.as_bytes());
}

/// Number of bytes `value` occupies as a varint.
#[must_use]
pub fn var_uint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Create a decoder positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    /// Consume and return everything left in the buffer.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.remaining();
        self.pos = self.data.len();
        rest
    }

    /// Read a single raw byte.
    ///
    /// # Errors
    ///
    /// Returns an error at the end of the buffer.
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(ProtocolError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read exactly `len` raw bytes without copying.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let rest = self.remaining();
        if len > rest.len() {
            return Err(ProtocolError::UnexpectedEof);
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    /// Read a varint-encoded unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer ends mid-varint or the value does not
    /// fit in a `u64`.
    pub fn read_var_uint(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        let mut shift = 0u32;

        loop {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);

            // The tenth byte may only carry the top bit of a u64.
            if shift == 63 && bits > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            value |= bits << shift;

            if byte & 0x80 == 0 {
                return Ok(value);
            }

            shift += 7;
            if shift > 63 {
                return Err(ProtocolError::VarintOverflow);
            }
        }
    }

    /// Read a length-prefixed byte array without copying.
    ///
    /// # Errors
    ///
    /// Returns an error if the declared length runs past the end of the buffer.
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_uint()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::UnexpectedEof)?;
        self.read_bytes(len)
    }

    /// Read a length-prefixed UTF-8 string without copying.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are truncated or not valid UTF-8.
    pub fn read_var_string(&mut self) -> Result<&'a str, ProtocolError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Assert that the whole buffer was consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TrailingBytes`] if input remains.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.remaining().len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
