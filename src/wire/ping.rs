//! Peer-to-peer liveness packets, always relayed framing.
//!
//! ```text
//! PING: [0x30][0x01][token:4][ping_id:4][ping_flags:1][neighbors:1][busy:32][hmac:32]
//! PONG: [0x31][0x01|opt][token:4][ping_id:4][neighbors:1][busy:32][cfm_sig:64 if opt][hmac:32]
//! ```
//!
//! Both directions advertise the sender's neighbor count and busy sector
//! bitmap, which feed the routing engine's coverage heuristic.

use super::error::{DecodeError, EncodeError};
use super::hop::{self, HopAuth, HopLink, FLAG_OPTION};
use super::{Framed, PacketType};
use crate::crypto::HmacKey;
use crate::identity::RegistrationSignature;
use crate::routing::{SectorSet, SECTOR_SET_SIZE};

/// PING option bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PingFlags {
    /// Sender asks for graceful closure.
    pub teardown: bool,
    /// Sender wants the registration confirmation signature in the PONG.
    pub request_confirmation: bool,
}

impl PingFlags {
    const TEARDOWN: u8 = 0x01;
    const REQUEST_CONFIRMATION: u8 = 0x02;

    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.teardown {
            b |= Self::TEARDOWN;
        }
        if self.request_confirmation {
            b |= Self::REQUEST_CONFIRMATION;
        }
        b
    }

    pub fn from_byte(b: u8) -> Result<Self, DecodeError> {
        if b & !(Self::TEARDOWN | Self::REQUEST_CONFIRMATION) != 0 {
            return Err(DecodeError::InvalidValue {
                field: "ping flags",
                value: b as u32,
            });
        }
        Ok(Self {
            teardown: b & Self::TEARDOWN != 0,
            request_confirmation: b & Self::REQUEST_CONFIRMATION != 0,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PingPacket {
    pub ping_id: u32,
    pub flags: PingFlags,
    pub neighbor_count: u8,
    pub busy_sectors: SectorSet,
}

impl PingPacket {
    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        if link.is_direct() {
            return Err(EncodeError::RelayRequired);
        }
        let mut w = hop::begin(PacketType::Ping, link, 0);
        w.u32(self.ping_id)
            .u8(self.flags.to_byte())
            .u8(self.neighbor_count)
            .bytes(self.busy_sectors.as_bytes());
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::Ping, 0, hmac_key)?;
        if opened.auth == HopAuth::Direct {
            return Err(DecodeError::RelayRequired);
        }
        let r = &mut opened.body;
        let ping_id = r.u32()?;
        let flags = PingFlags::from_byte(r.u8()?)?;
        let neighbor_count = r.u8()?;
        let busy_sectors = SectorSet::from_bytes(r.array::<SECTOR_SET_SIZE>()?);
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                ping_id,
                flags,
                neighbor_count,
                busy_sectors,
            },
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PongPacket {
    pub ping_id: u32,
    pub neighbor_count: u8,
    pub busy_sectors: SectorSet,
    /// Responder's registration confirmation, when the PING asked for it.
    pub confirmation: Option<RegistrationSignature>,
}

impl PongPacket {
    pub fn flags(&self) -> u8 {
        if self.confirmation.is_some() {
            FLAG_OPTION
        } else {
            0
        }
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        if link.is_direct() {
            return Err(EncodeError::RelayRequired);
        }
        let mut w = hop::begin(PacketType::Pong, link, self.flags());
        w.u32(self.ping_id)
            .u8(self.neighbor_count)
            .bytes(self.busy_sectors.as_bytes());
        if let Some(sig) = &self.confirmation {
            w.signature(sig);
        }
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::Pong, FLAG_OPTION, hmac_key)?;
        if opened.auth == HopAuth::Direct {
            return Err(DecodeError::RelayRequired);
        }
        let r = &mut opened.body;
        let ping_id = r.u32()?;
        let neighbor_count = r.u8()?;
        let busy_sectors = SectorSet::from_bytes(r.array::<SECTOR_SET_SIZE>()?);
        let confirmation = if opened.option {
            Some(r.signature()?)
        } else {
            None
        };
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                ping_id,
                neighbor_count,
                busy_sectors,
                confirmation,
            },
        })
    }

    /// Prefix of a PONG for `ping_id` addressed to our `auth` token.
    ///
    /// Only matches the given option framing; callers waiting for a
    /// confirmation pass `FLAG_OPTION`.
    pub fn prefix(auth: &HopAuth, extra_flags: u8, ping_id: u32) -> Vec<u8> {
        let mut p = auth.prefix(PacketType::Pong, extra_flags);
        p.extend_from_slice(&ping_id.to_le_bytes());
        p
    }
}
