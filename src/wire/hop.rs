//! Hop Header
//!
//! Every packet that travels over a single hop starts with a type byte and
//! a flags byte. Bit 0 of the flags selects the framing:
//!
//! ```text
//! Direct:   [type:1][flags:1][...body...]
//! Relayed:  [type:1][flags:1][token:4 LE][...body...][hmac:32]
//! ```
//!
//! Direct framing is only used between a joining peer and its entry peer,
//! before any neighbor connection exists. Relayed framing carries the
//! receiver's connection token and an HMAC-SHA256 under that connection's
//! key, computed over every byte before the tag.

use super::codec::{PacketReader, PacketWriter};
use super::error::{DecodeError, EncodeError};
use super::{PacketType, MAX_PACKET_SIZE};
use crate::crypto::{HmacKey, HMAC_SIZE};
use crate::neighbor::NeighborToken;

/// Flag bit selecting relayed framing.
pub const FLAG_RELAYED: u8 = 0x01;

/// Packet-specific optional section present.
pub const FLAG_OPTION: u8 = 0x02;

/// Offset of the body in a direct packet.
pub const DIRECT_HEADER_SIZE: usize = 2;

/// Offset of the body in a relayed packet.
pub const RELAYED_HEADER_SIZE: usize = 6;

/// Framing of a received packet, after authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HopAuth {
    /// Unauthenticated single hop (joining peer to entry peer).
    Direct,
    /// HMAC-verified packet addressed to our connection `token`.
    Relayed { token: NeighborToken },
}

impl HopAuth {
    pub fn token(&self) -> Option<NeighborToken> {
        match self {
            HopAuth::Direct => None,
            HopAuth::Relayed { token } => Some(*token),
        }
    }

    /// Fixed prefix a response framed this way starts with.
    pub fn prefix(&self, packet_type: PacketType, extra_flags: u8) -> Vec<u8> {
        match self {
            HopAuth::Direct => vec![packet_type.to_byte(), extra_flags],
            HopAuth::Relayed { token } => {
                let mut p = vec![packet_type.to_byte(), FLAG_RELAYED | extra_flags];
                p.extend_from_slice(&token.to_le_bytes());
                p
            }
        }
    }
}

/// Framing for a packet being sent.
#[derive(Clone, Debug)]
pub enum HopLink {
    Direct,
    /// `token` is the receiver's token for this connection.
    Relayed { token: NeighborToken, hmac_key: HmacKey },
}

impl HopLink {
    pub fn is_direct(&self) -> bool {
        matches!(self, HopLink::Direct)
    }
}

/// Start a hop packet: type, flags and (relayed) token.
pub(crate) fn begin(packet_type: PacketType, link: &HopLink, extra_flags: u8) -> PacketWriter {
    let mut w = PacketWriter::new();
    w.u8(packet_type.to_byte());
    match link {
        HopLink::Direct => {
            w.u8(extra_flags);
        }
        HopLink::Relayed { token, .. } => {
            w.u8(FLAG_RELAYED | extra_flags).token(*token);
        }
    }
    w
}

/// Append the HMAC (relayed) and enforce the size limit.
pub(crate) fn seal(mut w: PacketWriter, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
    if let HopLink::Relayed { hmac_key, .. } = link {
        let tag = hmac_key.tag(w.as_slice());
        w.bytes(&tag);
    }
    w.finish()
}

/// An authenticated hop packet ready for body parsing.
pub(crate) struct Opened<'a> {
    pub(crate) auth: HopAuth,
    pub(crate) option: bool,
    pub(crate) body: PacketReader<'a>,
}

/// Check type and flags, verify the HMAC when relayed, and hand back the body.
///
/// `allowed_extra` lists the packet-specific flag bits this type accepts.
pub(crate) fn open<'a>(
    data: &'a [u8],
    expected: PacketType,
    allowed_extra: u8,
    hmac_key: Option<&HmacKey>,
) -> Result<Opened<'a>, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    if data.len() > MAX_PACKET_SIZE {
        return Err(DecodeError::Oversized {
            max: MAX_PACKET_SIZE,
            got: data.len(),
        });
    }
    if data[0] != expected.to_byte() {
        return Err(DecodeError::UnexpectedPacketType {
            expected: expected.to_byte(),
            got: data[0],
        });
    }
    if data.len() < DIRECT_HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: DIRECT_HEADER_SIZE,
            len: data.len(),
        });
    }
    let flags = data[1];
    let reserved = flags & !(FLAG_RELAYED | allowed_extra);
    if reserved != 0 {
        return Err(DecodeError::ReservedFlags(reserved));
    }
    let option = flags & FLAG_OPTION != 0;

    if flags & FLAG_RELAYED == 0 {
        return Ok(Opened {
            auth: HopAuth::Direct,
            option,
            body: PacketReader::with_base(&data[DIRECT_HEADER_SIZE..], DIRECT_HEADER_SIZE),
        });
    }

    let min = RELAYED_HEADER_SIZE + HMAC_SIZE;
    if data.len() < min {
        return Err(DecodeError::Truncated {
            needed: min,
            len: data.len(),
        });
    }
    let key = hmac_key.ok_or(DecodeError::MissingKey)?;
    let tag_at = data.len() - HMAC_SIZE;
    if !key.verify(&data[..tag_at], &data[tag_at..]) {
        return Err(DecodeError::InvalidHmac);
    }
    let token = NeighborToken::from_le_bytes([data[2], data[3], data[4], data[5]]);
    Ok(Opened {
        auth: HopAuth::Relayed { token },
        option,
        body: PacketReader::with_base(&data[RELAYED_HEADER_SIZE..tag_at], RELAYED_HEADER_SIZE),
    })
}

/// Read the receiver token of a relayed packet without authenticating it,
/// so the caller can look up the connection key. `None` for direct packets.
pub fn peek_token(data: &[u8]) -> Result<Option<NeighborToken>, DecodeError> {
    if data.len() < DIRECT_HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: DIRECT_HEADER_SIZE,
            len: data.len(),
        });
    }
    if data[1] & FLAG_RELAYED == 0 {
        return Ok(None);
    }
    if data.len() < RELAYED_HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: RELAYED_HEADER_SIZE,
            len: data.len(),
        });
    }
    Ok(Some(NeighborToken::from_le_bytes([
        data[2], data[3], data[4], data[5],
    ])))
}
