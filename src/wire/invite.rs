//! INVITE packets. Same four-step shape as REGISTER, routed greedily toward
//! a destination identity over neighbor links only.
//!
//! ```text
//! SYN:  [hdr][request_id:36][seq:2][responder_id:32][hop_budget:1][hops:1]
//!       [desc_len:2][desc][signature:64][hmac]
//! ACK1: [hdr][request_id:36][seq:2][status:1][hops:1][desc_len:2][desc][signature:64][hmac]
//! ACK2: [hdr][request_id:36][seq:2][signature:64][hmac]
//! CFM:  [hdr][request_id:36][seq:2][signature:64][hmac]
//! ```
//!
//! `hop_budget` and `hops` change at every proxy and are not signed.

use super::error::{DecodeError, EncodeError};
use super::hop::{self, HopAuth, HopLink};
use super::{Framed, PacketType, RequestId, StatusCode};
use crate::crypto::HmacKey;
use crate::identity::{RegistrationId, RegistrationSignature};

/// Largest opaque session description carried by INVITE SYN/ACK1.
pub const MAX_SESSION_DESCRIPTION: usize = 256;

const LABEL_SYN: &[u8] = b"drp/v1 invite syn";
const LABEL_ACK1: &[u8] = b"drp/v1 invite ack1";
const LABEL_ACK2: &[u8] = b"drp/v1 invite ack2";
const LABEL_CFM: &[u8] = b"drp/v1 invite cfm";

fn open_relayed<'a>(
    data: &'a [u8],
    packet_type: PacketType,
    hmac_key: Option<&HmacKey>,
) -> Result<hop::Opened<'a>, DecodeError> {
    let opened = hop::open(data, packet_type, 0, hmac_key)?;
    if opened.auth == HopAuth::Direct {
        return Err(DecodeError::RelayRequired);
    }
    Ok(opened)
}

fn require_relayed(link: &HopLink) -> Result<(), EncodeError> {
    if link.is_direct() {
        return Err(EncodeError::RelayRequired);
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteSyn {
    pub request_id: RequestId,
    pub seq: u16,
    /// Destination identity.
    pub responder_id: RegistrationId,
    pub hop_budget: u8,
    /// Hops traversed so far, incremented by each receiving peer.
    pub hops: u8,
    pub session_description: Vec<u8>,
    pub signature: RegistrationSignature,
}

impl InviteSyn {
    pub fn signed_fields(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.session_description.len());
        out.extend_from_slice(LABEL_SYN);
        out.extend_from_slice(&self.request_id.to_bytes());
        out.extend_from_slice(self.responder_id.as_bytes());
        out.extend_from_slice(&(self.session_description.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.session_description);
        out
    }

    pub fn verify_signature(&self) -> bool {
        self.request_id
            .requester
            .verify(&self.signed_fields(), &self.signature)
            .is_ok()
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        require_relayed(link)?;
        let mut w = hop::begin(PacketType::InviteSyn, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq)
            .id(&self.responder_id)
            .u8(self.hop_budget)
            .u8(self.hops)
            .var_bytes(
                "session description",
                &self.session_description,
                MAX_SESSION_DESCRIPTION,
            )?
            .signature(&self.signature);
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = open_relayed(data, PacketType::InviteSyn, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let responder_id = r.id()?;
        let hop_budget = r.u8()?;
        let hops = r.u8()?;
        let session_description = r.var_bytes("session description", MAX_SESSION_DESCRIPTION)?;
        let signature = r.signature()?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                responder_id,
                hop_budget,
                hops,
                session_description,
                signature,
            },
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteAck1 {
    pub request_id: RequestId,
    pub seq: u16,
    pub status: StatusCode,
    /// Hop count the SYN arrived with at the destination.
    pub hops: u8,
    pub session_description: Vec<u8>,
    pub signature: RegistrationSignature,
}

impl InviteAck1 {
    pub fn signed_fields(&self, syn: &InviteSyn) -> Vec<u8> {
        let mut out = syn.signed_fields();
        out.extend_from_slice(LABEL_ACK1);
        out.push(self.status.to_byte());
        out.extend_from_slice(&(self.session_description.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.session_description);
        out
    }

    pub fn verify_signature(&self, syn: &InviteSyn) -> bool {
        syn.responder_id
            .verify(&self.signed_fields(syn), &self.signature)
            .is_ok()
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        require_relayed(link)?;
        let mut w = hop::begin(PacketType::InviteAck1, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq)
            .u8(self.status.to_byte())
            .u8(self.hops)
            .var_bytes(
                "session description",
                &self.session_description,
                MAX_SESSION_DESCRIPTION,
            )?
            .signature(&self.signature);
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = open_relayed(data, PacketType::InviteAck1, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let status = StatusCode::read(r)?;
        let hops = r.u8()?;
        let session_description = r.var_bytes("session description", MAX_SESSION_DESCRIPTION)?;
        let signature = r.signature()?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                status,
                hops,
                session_description,
                signature,
            },
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteAck2 {
    pub request_id: RequestId,
    pub seq: u16,
    pub signature: RegistrationSignature,
}

impl InviteAck2 {
    pub fn signed_fields(syn: &InviteSyn, ack1: &InviteAck1) -> Vec<u8> {
        let mut out = ack1.signed_fields(syn);
        out.extend_from_slice(LABEL_ACK2);
        out
    }

    pub fn verify_signature(&self, syn: &InviteSyn, ack1: &InviteAck1) -> bool {
        syn.request_id
            .requester
            .verify(&Self::signed_fields(syn, ack1), &self.signature)
            .is_ok()
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        require_relayed(link)?;
        let mut w = hop::begin(PacketType::InviteAck2, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq).signature(&self.signature);
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = open_relayed(data, PacketType::InviteAck2, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let signature = r.signature()?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                signature,
            },
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteCfm {
    pub request_id: RequestId,
    pub seq: u16,
    pub signature: RegistrationSignature,
}

impl InviteCfm {
    pub fn signed_fields(syn: &InviteSyn, ack1: &InviteAck1) -> Vec<u8> {
        let mut out = InviteAck2::signed_fields(syn, ack1);
        out.extend_from_slice(LABEL_CFM);
        out
    }

    pub fn verify_signature(&self, syn: &InviteSyn, ack1: &InviteAck1) -> bool {
        syn.responder_id
            .verify(&Self::signed_fields(syn, ack1), &self.signature)
            .is_ok()
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        require_relayed(link)?;
        let mut w = hop::begin(PacketType::InviteCfm, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq).signature(&self.signature);
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = open_relayed(data, PacketType::InviteCfm, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let signature = r.signature()?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                signature,
            },
        })
    }
}
