//! Wire format encoding and decoding.
//!
//! Implements the 18-byte frame header:
//! ```text
//! ┌──────┬───────┬──────────┬──────────┬──────────┐
//! │ Kind │ Flags │ Function │ Call ID  │ Length   │
//! │ 1 B  │ 1 B   │ uint32 BE│ uint64 BE│ uint32 BE│
//! └──────┴───────┴──────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, RiiError};

/// Header size in bytes (fixed, exactly 18).
pub const HEADER_SIZE: usize = 18;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Absolute maximum payload size (~2 GB, max i32).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = 2_147_483_647;

/// Reserved call ID, never assigned to an invocation.
pub const RESERVED_CALL_ID: u64 = 0;

/// Frame kind byte values.
pub mod kind {
    /// Stub to skel: call a function.
    pub const INVOCATION: u8 = 0x01;
    /// Skel to stub: outcome of a call.
    pub const RESPONSE: u8 = 0x02;
}

/// Flag constants for the protocol.
pub mod flags {
    /// Error flag: the response payload is a fault (1) or results (0).
    pub const IS_ERROR: u8 = 0b0000_0001;

    /// Reserved bits mask (bits 1-7).
    pub const RESERVED_MASK: u8 = 0b1111_1110;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Typed view of the kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Invocation,
    Response,
}

impl MessageKind {
    /// Wire value of this kind.
    pub fn as_byte(self) -> u8 {
        match self {
            MessageKind::Invocation => kind::INVOCATION,
            MessageKind::Response => kind::RESPONSE,
        }
    }

    /// Parse a kind byte, `None` for unknown values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            kind::INVOCATION => Some(MessageKind::Invocation),
            kind::RESPONSE => Some(MessageKind::Response),
            _ => None,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Kind byte (see `kind` module).
    pub kind: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Function number being invoked (echoed on responses).
    pub function: u32,
    /// Correlation id (0 reserved).
    pub call_id: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: u8, flags: u8, function: u32, call_id: u64, payload_length: u32) -> Self {
        Self {
            kind,
            flags,
            function,
            call_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use riiwire::protocol::{kind, Header};
    ///
    /// let header = Header::new(kind::INVOCATION, 0, 3, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 18);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (18 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.kind;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.function.to_be_bytes());
        buf[6..14].copy_from_slice(&self.call_id.to_be_bytes());
        buf[14..18].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use riiwire::protocol::Header;
    ///
    /// let bytes = [1, 0, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 42, 0, 0, 0, 100];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.function, 3);
    /// assert_eq!(header.call_id, 42);
    /// assert_eq!(header.payload_length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: buf[0],
            flags: buf[1],
            function: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            call_id: u64::from_be_bytes([
                buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13],
            ]),
            payload_length: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// An oversized payload is fatal (`Protocol`): the stream cannot be
    /// resynchronised past it. Everything else is `Malformed`, which the
    /// reading loops report and skip.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(RiiError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if MessageKind::from_byte(self.kind).is_none() {
            return Err(self.malformed(format!("unknown frame kind 0x{:02x}", self.kind)));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(self.malformed("reserved flag bits must be 0"));
        }

        if self.is_error() && self.kind == kind::INVOCATION {
            return Err(self.malformed("error flag set on an invocation"));
        }

        Ok(())
    }

    /// Build a `Malformed` error attributed to this header's call id.
    pub fn malformed(&self, reason: impl Into<String>) -> RiiError {
        RiiError::Malformed {
            id: self.usable_id(),
            reason: reason.into(),
        }
    }

    /// Call id, unless it is the reserved value.
    #[inline]
    pub fn usable_id(&self) -> Option<u64> {
        (self.call_id != RESERVED_CALL_ID).then_some(self.call_id)
    }

    /// Typed kind, `None` for unknown kind bytes.
    #[inline]
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_byte(self.kind)
    }

    /// Check if this is an invocation.
    #[inline]
    pub fn is_invocation(&self) -> bool {
        self.kind == kind::INVOCATION
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.kind == kind::RESPONSE
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(kind::RESPONSE, flags::IS_ERROR, 7, 42, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(0x01, 0x00, 0x0203_0405, 0x0607_0809_0A0B_0C0D, 0x0E0F_1011);
        let bytes = header.encode();

        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(&bytes[2..6], &[0x02, 0x03, 0x04, 0x05]);
        assert_eq!(
            &bytes[6..14],
            &[0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(&bytes[14..18], &[0x0E, 0x0F, 0x10, 0x11]);
    }

    #[test]
    fn test_header_size_is_exactly_18() {
        assert_eq!(HEADER_SIZE, 18);
        let header = Header::new(kind::INVOCATION, 0, 0, 1, 0);
        assert_eq!(header.encode().len(), 18);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_payload_too_large_is_fatal() {
        let header = Header::new(kind::INVOCATION, 0, 0, 1, 1_000_000);
        let err = header.validate(100).unwrap_err();
        assert!(matches!(err, RiiError::Protocol(_)));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_unknown_kind_is_recoverable() {
        let header = Header::new(0x7F, 0, 0, 9, 0);
        let err = header.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(err.is_recoverable());
        match err {
            RiiError::Malformed { id, reason } => {
                assert_eq!(id, Some(9));
                assert!(reason.contains("unknown frame kind"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = Header::new(kind::RESPONSE, 0b1000_0000, 0, 1, 0);
        let result = header.validate(DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("reserved flag bits"));
    }

    #[test]
    fn test_validate_error_flag_on_invocation() {
        let header = Header::new(kind::INVOCATION, flags::IS_ERROR, 0, 1, 0);
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());

        let header = Header::new(kind::RESPONSE, flags::IS_ERROR, 0, 1, 0);
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }

    #[test]
    fn test_reserved_call_id_is_not_usable() {
        let header = Header::new(0x55, 0, 0, RESERVED_CALL_ID, 0);
        assert_eq!(header.usable_id(), None);
        match header.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err() {
            RiiError::Malformed { id, .. } => assert_eq!(id, None),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_header_accessors() {
        let header = Header::new(kind::RESPONSE, flags::IS_ERROR, 2, 5, 0);
        assert!(header.is_response());
        assert!(header.is_error());
        assert!(!header.is_invocation());
        assert_eq!(header.message_kind(), Some(MessageKind::Response));

        let header = Header::new(kind::INVOCATION, 0, 2, 5, 0);
        assert!(header.is_invocation());
        assert!(!header.is_error());
        assert_eq!(header.message_kind(), Some(MessageKind::Invocation));
    }

    #[test]
    fn test_message_kind_bytes() {
        assert_eq!(MessageKind::Invocation.as_byte(), kind::INVOCATION);
        assert_eq!(MessageKind::Response.as_byte(), kind::RESPONSE);
        assert_eq!(MessageKind::from_byte(0), None);
    }

    #[test]
    fn test_max_values() {
        let header = Header::new(kind::RESPONSE, 0, u32::MAX, u64::MAX, u32::MAX);
        assert!(header.validate(u32::MAX).is_ok());
        assert_eq!(Header::decode(&header.encode()), Some(header));
    }
}
