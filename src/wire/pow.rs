//! Proof-of-work admission packets (joining peer to entry peer, direct).
//!
//! ```text
//! PoW1 request:  [0x01][0x00][pow_req_id:4][timestamp:4][claimed_ip:16][nonce:64]
//! PoW1 response: [0x02][0x00][pow_req_id:4][status:1][challenge:16]
//! ```

use std::net::IpAddr;

use super::codec::decode_ip;
use super::error::{DecodeError, EncodeError};
use super::hop::{self, HopLink};
use super::{PacketType, StatusCode};

/// Size of a proof-of-work nonce.
pub const POW_NONCE_SIZE: usize = 64;

/// Size of the stateful challenge.
pub const CHALLENGE_SIZE: usize = 16;

/// Stateless puzzle solution asking for a stateful challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pow1Request {
    /// Echoed in the response so the requester can match it.
    pub pow_request_id: u32,
    pub timestamp: u32,
    pub claimed_ip: IpAddr,
    pub nonce: [u8; POW_NONCE_SIZE],
}

impl Pow1Request {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::Pow1Request, &HopLink::Direct, 0);
        w.u32(self.pow_request_id)
            .u32(self.timestamp)
            .bytes(&super::encode_ip(&self.claimed_ip))
            .bytes(&self.nonce);
        hop::seal(w, &HopLink::Direct)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut opened = hop::open(data, PacketType::Pow1Request, 0, None)?;
        let r = &mut opened.body;
        let pow_request_id = r.u32()?;
        let timestamp = r.u32()?;
        let claimed_ip = decode_ip(r.array()?);
        let nonce = r.array()?;
        r.finish()?;
        Ok(Self {
            pow_request_id,
            timestamp,
            claimed_ip,
            nonce,
        })
    }
}

/// Entry peer's answer: a challenge bound to the requester endpoint, or a
/// rejection status with an all-zero challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pow1Response {
    pub pow_request_id: u32,
    pub status: StatusCode,
    pub challenge: [u8; CHALLENGE_SIZE],
}

impl Pow1Response {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::Pow1Response, &HopLink::Direct, 0);
        w.u32(self.pow_request_id)
            .u8(self.status.to_byte())
            .bytes(&self.challenge);
        hop::seal(w, &HopLink::Direct)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut opened = hop::open(data, PacketType::Pow1Response, 0, None)?;
        let r = &mut opened.body;
        let pow_request_id = r.u32()?;
        let status = StatusCode::read(r)?;
        let challenge = r.array()?;
        r.finish()?;
        Ok(Self {
            pow_request_id,
            status,
            challenge,
        })
    }

    /// Prefix identifying the response to `pow_request_id`.
    pub fn prefix(pow_request_id: u32) -> Vec<u8> {
        let mut p = vec![PacketType::Pow1Response.to_byte(), 0];
        p.extend_from_slice(&pow_request_id.to_le_bytes());
        p
    }
}
