//! Wire Format Parsing and Serialization
//!
//! Fixed-layout binary encoders and decoders for every packet type. All
//! integers are little-endian and fixed width. Decoding is strict: reserved
//! flag bits, truncation, trailing bytes and out-of-range lengths fail with
//! a typed [`DecodeError`] and never yield a partial value.
//!
//! ## Packet Types
//!
//! | Type | Packet          | Framing             | Description                        |
//! |------|-----------------|---------------------|------------------------------------|
//! | 0x01 | PoW1 request    | direct              | Stateless puzzle solution          |
//! | 0x02 | PoW1 response   | direct              | Stateful challenge                 |
//! | 0x10 | REGISTER SYN    | direct or relayed   | Registration request, multi-hop    |
//! | 0x11 | REGISTER ACK1   | direct or relayed   | Responder keys and signature       |
//! | 0x12 | REGISTER ACK2   | direct or relayed   | Requester params and signature     |
//! | 0x13 | REGISTER CFM    | direct or relayed   | Confirmation, finalizes every hop  |
//! | 0x20 | NPACK           | direct or relayed   | Per-hop acknowledgement            |
//! | 0x21 | FAILURE         | direct or relayed   | Typed failure reported upstream    |
//! | 0x30 | PING            | relayed             | Liveness, teardown, confirmation   |
//! | 0x31 | PONG            | relayed             | Ping response                      |
//! | 0x40 | INVITE SYN      | relayed             | Invitation toward a destination id |
//! | 0x41 | INVITE ACK1     | relayed             | Destination's answer               |
//! | 0x42 | INVITE ACK2     | relayed             | Requester's acknowledgement        |
//! | 0x43 | INVITE CFM      | relayed             | Destination's confirmation         |
//!
//! Multi-hop packets place the request id and the per-hop sequence number
//! right after the hop header so response matchers compare a fixed prefix.

mod ack;
mod codec;
mod error;
mod hop;
mod invite;
mod ping;
mod pow;
mod register;

#[cfg(test)]
mod tests;

use std::fmt;

use crate::identity::RegistrationId;

pub use ack::{FailurePacket, Npack};
pub use codec::{decode_endpoint, decode_ip, encode_endpoint, encode_ip, ENDPOINT_SIZE};
pub use error::{DecodeError, EncodeError};
pub use hop::{peek_token, HopAuth, HopLink, FLAG_OPTION, FLAG_RELAYED};
pub use invite::{InviteAck1, InviteAck2, InviteCfm, InviteSyn, MAX_SESSION_DESCRIPTION};
pub use ping::{PingFlags, PingPacket, PongPacket};
pub use pow::{Pow1Request, Pow1Response, CHALLENGE_SIZE, POW_NONCE_SIZE};
pub use register::{request_prefix, RegisterAck1, RegisterAck2, RegisterCfm, RegisterSyn};

pub(crate) use register::UNSIGNED;

pub(crate) use codec::{PacketReader, PacketWriter};

/// Largest datagram the codec produces or accepts (avoids IP fragmentation).
pub const MAX_PACKET_SIZE: usize = 548;

/// Size of an encoded request id.
pub const REQUEST_ID_SIZE: usize = 36;

// ============================================================================
// Packet Type
// ============================================================================

/// First byte of every packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Pow1Request = 0x01,
    Pow1Response = 0x02,
    RegisterSyn = 0x10,
    RegisterAck1 = 0x11,
    RegisterAck2 = 0x12,
    RegisterCfm = 0x13,
    Npack = 0x20,
    Failure = 0x21,
    Ping = 0x30,
    Pong = 0x31,
    InviteSyn = 0x40,
    InviteAck1 = 0x41,
    InviteAck2 = 0x42,
    InviteCfm = 0x43,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(PacketType::Pow1Request),
            0x02 => Some(PacketType::Pow1Response),
            0x10 => Some(PacketType::RegisterSyn),
            0x11 => Some(PacketType::RegisterAck1),
            0x12 => Some(PacketType::RegisterAck2),
            0x13 => Some(PacketType::RegisterCfm),
            0x20 => Some(PacketType::Npack),
            0x21 => Some(PacketType::Failure),
            0x30 => Some(PacketType::Ping),
            0x31 => Some(PacketType::Pong),
            0x40 => Some(PacketType::InviteSyn),
            0x41 => Some(PacketType::InviteAck1),
            0x42 => Some(PacketType::InviteAck2),
            0x43 => Some(PacketType::InviteCfm),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Multi-hop packets that receive an NPACK from the next hop.
    pub fn is_hop_acknowledged(self) -> bool {
        matches!(
            self,
            PacketType::RegisterSyn
                | PacketType::RegisterAck1
                | PacketType::RegisterAck2
                | PacketType::RegisterCfm
                | PacketType::Failure
                | PacketType::InviteSyn
                | PacketType::InviteAck1
                | PacketType::InviteAck2
                | PacketType::InviteCfm
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Pow1Request => "Pow1Request",
            PacketType::Pow1Response => "Pow1Response",
            PacketType::RegisterSyn => "RegisterSyn",
            PacketType::RegisterAck1 => "RegisterAck1",
            PacketType::RegisterAck2 => "RegisterAck2",
            PacketType::RegisterCfm => "RegisterCfm",
            PacketType::Npack => "Npack",
            PacketType::Failure => "Failure",
            PacketType::Ping => "Ping",
            PacketType::Pong => "Pong",
            PacketType::InviteSyn => "InviteSyn",
            PacketType::InviteAck1 => "InviteAck1",
            PacketType::InviteAck2 => "InviteAck2",
            PacketType::InviteCfm => "InviteCfm",
        };
        write!(f, "{}", name)
    }
}

/// Classify a datagram by its first byte.
pub fn packet_type(data: &[u8]) -> Result<PacketType, DecodeError> {
    let first = *data.first().ok_or(DecodeError::Empty)?;
    PacketType::from_byte(first).ok_or(DecodeError::UnknownPacketType(first))
}

// ============================================================================
// Status Code
// ============================================================================

/// Status carried by NPACK, FAILURE, ACK1 and the PoW1 response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    RouteUnavailable = 1,
    HopBudgetExhausted = 2,
    Overloaded = 3,
    BadTimestamp = 4,
    NonUnique = 5,
    BadSignature = 6,
    BadProofOfWork = 7,
    /// Same request id already in flight here (loop).
    Duplicate = 8,
    AlreadyConnected = 9,
}

impl StatusCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::RouteUnavailable),
            2 => Some(StatusCode::HopBudgetExhausted),
            3 => Some(StatusCode::Overloaded),
            4 => Some(StatusCode::BadTimestamp),
            5 => Some(StatusCode::NonUnique),
            6 => Some(StatusCode::BadSignature),
            7 => Some(StatusCode::BadProofOfWork),
            8 => Some(StatusCode::Duplicate),
            9 => Some(StatusCode::AlreadyConnected),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    pub(crate) fn read(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let b = r.u8()?;
        Self::from_byte(b).ok_or(DecodeError::InvalidValue {
            field: "status",
            value: b as u32,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Ok => "ok",
            StatusCode::RouteUnavailable => "route unavailable",
            StatusCode::HopBudgetExhausted => "hop budget exhausted",
            StatusCode::Overloaded => "overloaded",
            StatusCode::BadTimestamp => "bad timestamp",
            StatusCode::NonUnique => "non-unique data",
            StatusCode::BadSignature => "bad signature",
            StatusCode::BadProofOfWork => "bad proof of work",
            StatusCode::Duplicate => "duplicate request",
            StatusCode::AlreadyConnected => "already connected",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Request Id
// ============================================================================

/// Identifies one multi-hop request: requester identity plus its timestamp.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub requester: RegistrationId,
    pub timestamp: u32,
}

impl RequestId {
    pub fn new(requester: RegistrationId, timestamp: u32) -> Self {
        Self {
            requester,
            timestamp,
        }
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_ID_SIZE] {
        let mut out = [0u8; REQUEST_ID_SIZE];
        out[..32].copy_from_slice(self.requester.as_bytes());
        out[32..].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    pub(crate) fn write(&self, w: &mut PacketWriter) {
        w.id(&self.requester).u32(self.timestamp);
    }

    pub(crate) fn read(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let requester = r.id()?;
        let timestamp = r.u32()?;
        Ok(Self {
            requester,
            timestamp,
        })
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.requester.short_hex(), self.timestamp)
    }
}

/// A decoded hop packet together with the framing it arrived with.
#[derive(Clone, Debug)]
pub struct Framed<T> {
    pub auth: HopAuth,
    pub packet: T,
}
