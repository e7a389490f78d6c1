//! Per-hop acknowledgement and failure packets.
//!
//! ```text
//! NPACK:   [hdr][seq:2][status:1][hmac?]
//! FAILURE: [hdr][request_id:36][seq:2][code:1][hmac?]
//! ```
//!
//! An NPACK only stops the sending hop's retransmission. FAILURE travels one
//! hop upstream and is itself acknowledged with an NPACK.

use super::error::{DecodeError, EncodeError};
use super::hop::{self, HopAuth, HopLink};
use super::{Framed, PacketType, RequestId, StatusCode};
use crate::crypto::HmacKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Npack {
    /// Sequence number of the acknowledged packet.
    pub seq: u16,
    pub status: StatusCode,
}

impl Npack {
    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::Npack, link, 0);
        w.u16(self.seq).u8(self.status.to_byte());
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::Npack, 0, hmac_key)?;
        let r = &mut opened.body;
        let seq = r.u16()?;
        let status = StatusCode::read(r)?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self { seq, status },
        })
    }

    /// Prefix of the NPACK answering `seq` when framed as `auth`.
    pub fn prefix(auth: &HopAuth, seq: u16) -> Vec<u8> {
        let mut p = auth.prefix(PacketType::Npack, 0);
        p.extend_from_slice(&seq.to_le_bytes());
        p
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailurePacket {
    pub request_id: RequestId,
    pub seq: u16,
    pub code: StatusCode,
}

impl FailurePacket {
    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::Failure, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq).u8(self.code.to_byte());
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::Failure, 0, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let code = StatusCode::read(r)?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                code,
            },
        })
    }
}
