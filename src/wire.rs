//! Wayland wire format primitives.
//!
//! # Wire Format
//! ```text
//! ┌─────────────┬─────────────┬──────────────────────────┐
//! │  object_id  │ size|opcode │ arguments (size - 8)     │
//! │  (4 bytes)  │ (4 bytes)   │ 32-bit aligned words     │
//! └─────────────┴─────────────┴──────────────────────────┘
//! ```
//!
//! Payloads come from an untrusted peer, so arguments are read through a
//! [`WireCursor`] that refuses to read past the end of the message instead
//! of trusting declared lengths.

use thiserror::Error;

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 8;

/// Errors raised while walking a message payload.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated message: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

// =============================================================================
// Header
// =============================================================================

/// A parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub object_id: u32,
    pub opcode: u16,
    /// Total message size in bytes, header included
    pub size: usize,
}

impl MessageHeader {
    /// Parse the first [`HEADER_SIZE`] bytes of `data`.
    ///
    /// Returns `None` if fewer bytes are available. The size is not
    /// validated here; see [`MessageHeader::is_well_formed`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let object_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let size_opcode = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Some(Self {
            object_id,
            opcode: (size_opcode & 0xffff) as u16,
            size: (size_opcode >> 16) as usize,
        })
    }

    /// A size that covers the header and keeps word alignment.
    #[inline]
    pub fn is_well_formed(&self) -> bool {
        self.size >= HEADER_SIZE && self.size % 4 == 0
    }
}

// =============================================================================
// Argument Cursor
// =============================================================================

/// Bounds-checked reader over a message payload, one 32-bit word at a time.
#[derive(Debug)]
pub struct WireCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::Truncated {
                offset: self.offset,
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    /// A signed 24.8 fixed-point word as a float.
    pub fn read_fixed(&mut self) -> Result<f64, WireError> {
        Ok(fixed_to_f64(self.read_i32()?))
    }

    /// A length-prefixed blob padded to a word boundary.
    pub fn read_array(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        let padded = self.take(padded_len(len))?;
        Ok(&padded[..len])
    }

    /// A length-prefixed, NUL-terminated string. Length 0 is a null string.
    ///
    /// The terminator is stripped; invalid UTF-8 is replaced.
    pub fn read_string(&mut self) -> Result<Option<String>, WireError> {
        let bytes = self.read_array()?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let text = bytes.strip_suffix(&[0u8]).unwrap_or(bytes);
        Ok(Some(String::from_utf8_lossy(text).into_owned()))
    }
}

/// Round `len` up to the next multiple of four.
#[inline]
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

#[inline]
pub fn fixed_to_f64(raw: i32) -> f64 {
    f64::from(raw) / 256.0
}

// =============================================================================
// Test Support
// =============================================================================


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::testing::MessageBuilder;
    use super::*;

    #[test]
    fn test_parse_message_header() {
        let header = [
            0x01u8, 0x00, 0x00, 0x00, // object_id = 1
            0x01, 0x00, 0x0C, 0x00, // size=12, opcode=1
        ];

        let parsed = MessageHeader::parse(&header).unwrap();
        assert_eq!(parsed.object_id, 1);
        assert_eq!(parsed.opcode, 1);
        assert_eq!(parsed.size, 12);
        assert!(parsed.is_well_formed());
    }

    #[test]
    fn test_parse_message_header_too_small() {
        assert!(MessageHeader::parse(&[0x01, 0x00, 0x00]).is_none());
    }

    #[test]
    fn test_malformed_sizes() {
        let mut header = MessageHeader {
            object_id: 1,
            opcode: 0,
            size: 4,
        };
        assert!(!header.is_well_formed());
        header.size = 10;
        assert!(!header.is_well_formed());
        header.size = 8;
        assert!(header.is_well_formed());
    }

    #[test]
    fn test_cursor_reads_each_kind() {
        let msg = MessageBuilder::new(3, 0)
            .uint(7)
            .int(-2)
            .fixed(1.5)
            .string(Some("hi"))
            .string(None)
            .array(&[1, 2, 3, 4, 5])
            .build();

        let mut cursor = WireCursor::new(&msg[HEADER_SIZE..]);
        assert_eq!(cursor.read_u32().unwrap(), 7);
        assert_eq!(cursor.read_i32().unwrap(), -2);
        assert_eq!(cursor.read_fixed().unwrap(), 1.5);
        assert_eq!(cursor.read_string().unwrap().as_deref(), Some("hi"));
        assert_eq!(cursor.read_string().unwrap(), None);
        assert_eq!(cursor.read_array().unwrap(), &[1, 2, 3, 4, 5]);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_cursor_refuses_declared_length_past_end() {
        // String claims 64 bytes but only 4 follow
        let mut payload = 64u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"abc\0");

        let mut cursor = WireCursor::new(&payload);
        assert_eq!(
            cursor.read_string(),
            Err(WireError::Truncated {
                offset: 4,
                needed: 64,
                available: 4,
            })
        );
    }

    #[test]
    fn test_cursor_empty_payload() {
        let mut cursor = WireCursor::new(&[]);
        assert!(cursor.read_u32().is_err());
    }

    #[test]
    fn test_negative_fixed() {
        assert_eq!(fixed_to_f64(-256), -1.0);
        assert_eq!(fixed_to_f64(1), 1.0 / 256.0);
    }

    #[test]
    fn test_builder_header() {
        let msg = MessageBuilder::new(1, 1).uint(2).build();
        assert_eq!(msg.len(), 12);
        assert_eq!(
            MessageHeader::parse(&msg),
            Some(MessageHeader {
                object_id: 1,
                opcode: 1,
                size: 12,
            })
        );
    }
}
