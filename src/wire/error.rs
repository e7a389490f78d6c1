//! Wire codec error types.

use thiserror::Error;

/// Errors from decoding a received datagram. Every variant means the packet
/// is dropped; no partial value is ever returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unexpected packet type: expected 0x{expected:02x}, got 0x{got:02x}")]
    UnexpectedPacketType { expected: u8, got: u8 },

    #[error("reserved flag bits set: 0x{0:02x}")]
    ReservedFlags(u8),

    #[error("packet truncated: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },

    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),

    #[error("packet too large: max {max}, got {got}")]
    Oversized { max: usize, got: usize },

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("invalid endpoint encoding")]
    InvalidEndpoint,

    #[error("relayed packet but no key for its token")]
    MissingKey,

    #[error("packet must be relayed over a neighbor link")]
    RelayRequired,

    #[error("HMAC verification failed")]
    InvalidHmac,
}

/// Errors from encoding a packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("packet too large: max {max}, got {got}")]
    Oversized { max: usize, got: usize },

    #[error("{field} too long: max {max}, got {got}")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        got: usize,
    },

    #[error("packet must be relayed over a neighbor link")]
    RelayRequired,

    #[error("missing {0} for this framing")]
    MissingField(&'static str),
}
