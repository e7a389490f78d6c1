//! REGISTER handshake packets.
//!
//! ```text
//! SYN:  [hdr][request_id:36][seq:2][ecdh:32][min_distance:4][hop_budget:1]
//!       [entry_endpoint:18][signature:64][pow2_nonce:64 direct only][hmac?]
//! ACK1: [hdr][request_id:36][seq:2][status:1][ecdh:32][params:32]
//!       [responder_id:32][signature:64][requester_endpoint:18 if option][hmac?]
//! ACK2: [hdr][request_id:36][seq:2][params:32][signature:64][hmac?]
//! CFM:  [hdr][request_id:36][seq:2][responder_cfm:64][requester_cfm:64][hmac?]
//! ```
//!
//! Signatures chain: each packet's signed bytes start with the previous
//! packet's signed bytes, so later signatures cover the whole transcript.
//! The hop budget is not signed because every proxy decrements it.

use std::net::SocketAddr;

use sha2::{Digest, Sha256};

use super::codec::encode_endpoint;
use super::error::{DecodeError, EncodeError};
use super::hop::{self, HopAuth, HopLink, FLAG_OPTION};
use super::pow::POW_NONCE_SIZE;
use super::{Framed, PacketType, RequestId, StatusCode};
use crate::crypto::{EcdhPublicKey, HmacKey, ENCRYPTED_PARAMS_SIZE};
use crate::identity::{RegistrationId, RegistrationSignature, SIGNATURE_SIZE};

const LABEL_SYN: &[u8] = b"drp/v1 register syn";
const LABEL_ACK1: &[u8] = b"drp/v1 register ack1";
const LABEL_ACK2: &[u8] = b"drp/v1 register ack2";
const LABEL_KEYS: &[u8] = b"drp/v1 register keys";
const LABEL_CFM_RESPONDER: &[u8] = b"drp/v1 register confirm responder";
const LABEL_CFM_REQUESTER: &[u8] = b"drp/v1 register confirm requester";

/// Placeholder used while building a packet before it is signed.
pub(crate) const UNSIGNED: RegistrationSignature =
    RegistrationSignature::from_bytes([0u8; SIGNATURE_SIZE]);

/// Prefix of a multi-hop packet for `request_id` framed as `auth`.
pub fn request_prefix(
    packet_type: PacketType,
    auth: &HopAuth,
    extra_flags: u8,
    request_id: &RequestId,
) -> Vec<u8> {
    let mut p = auth.prefix(packet_type, extra_flags);
    p.extend_from_slice(&request_id.to_bytes());
    p
}

// ============================================================================
// SYN
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterSyn {
    pub request_id: RequestId,
    pub seq: u16,
    pub requester_ecdh: EcdhPublicKey,
    /// Minimum distance norm the requester wants to its new neighbor.
    pub min_distance: u32,
    pub hop_budget: u8,
    /// First hop as the requester addressed it.
    pub entry_endpoint: SocketAddr,
    pub signature: RegistrationSignature,
    /// Stateful proof of work, present only on the direct first hop.
    pub pow2_nonce: Option<[u8; POW_NONCE_SIZE]>,
}

impl RegisterSyn {
    /// Bytes covered by the requester's signature.
    pub fn signed_fields(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(LABEL_SYN);
        out.extend_from_slice(&self.request_id.to_bytes());
        out.extend_from_slice(self.requester_ecdh.as_bytes());
        out.extend_from_slice(&self.min_distance.to_le_bytes());
        out.extend_from_slice(&encode_endpoint(&self.entry_endpoint));
        out
    }

    /// Transcript hash used as key-derivation salt once the responder's
    /// ephemeral key and identity are known.
    pub fn key_transcript_hash(
        &self,
        responder_ecdh: &EcdhPublicKey,
        responder_id: &RegistrationId,
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(LABEL_KEYS);
        hasher.update(self.signed_fields());
        hasher.update(responder_ecdh.as_bytes());
        hasher.update(responder_id.as_bytes());
        hasher.finalize().into()
    }

    pub fn verify_signature(&self) -> bool {
        self.request_id
            .requester
            .verify(&self.signed_fields(), &self.signature)
            .is_ok()
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::RegisterSyn, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq)
            .ecdh(&self.requester_ecdh)
            .u32(self.min_distance)
            .u8(self.hop_budget)
            .endpoint(&self.entry_endpoint)
            .signature(&self.signature);
        if link.is_direct() {
            let nonce = self.pow2_nonce.ok_or(EncodeError::MissingField("pow2 nonce"))?;
            w.bytes(&nonce);
        }
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::RegisterSyn, 0, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let requester_ecdh = r.ecdh()?;
        let min_distance = r.u32()?;
        let hop_budget = r.u8()?;
        let entry_endpoint = r.endpoint()?;
        let signature = r.signature()?;
        let pow2_nonce = match opened.auth {
            HopAuth::Direct => Some(r.array()?),
            HopAuth::Relayed { .. } => None,
        };
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                requester_ecdh,
                min_distance,
                hop_budget,
                entry_endpoint,
                signature,
                pow2_nonce,
            },
        })
    }
}

// ============================================================================
// ACK1
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterAck1 {
    pub request_id: RequestId,
    pub seq: u16,
    pub status: StatusCode,
    pub responder_ecdh: EcdhPublicKey,
    /// Responder's transport params, encrypted toward the requester.
    pub encrypted_params: [u8; ENCRYPTED_PARAMS_SIZE],
    pub responder_id: RegistrationId,
    pub signature: RegistrationSignature,
    /// Requester's endpoint as seen by the last hop, added on that hop only.
    pub requester_endpoint: Option<SocketAddr>,
}

impl RegisterAck1 {
    pub fn signed_fields(&self, syn: &RegisterSyn) -> Vec<u8> {
        let mut out = syn.signed_fields();
        out.extend_from_slice(LABEL_ACK1);
        out.push(self.status.to_byte());
        out.extend_from_slice(self.responder_ecdh.as_bytes());
        out.extend_from_slice(&self.encrypted_params);
        out.extend_from_slice(self.responder_id.as_bytes());
        out
    }

    pub fn verify_signature(&self, syn: &RegisterSyn) -> bool {
        self.responder_id
            .verify(&self.signed_fields(syn), &self.signature)
            .is_ok()
    }

    /// Flag bits this packet is framed with.
    pub fn flags(&self) -> u8 {
        if self.requester_endpoint.is_some() {
            FLAG_OPTION
        } else {
            0
        }
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::RegisterAck1, link, self.flags());
        self.request_id.write(&mut w);
        w.u16(self.seq)
            .u8(self.status.to_byte())
            .ecdh(&self.responder_ecdh)
            .bytes(&self.encrypted_params)
            .id(&self.responder_id)
            .signature(&self.signature);
        if let Some(endpoint) = &self.requester_endpoint {
            w.endpoint(endpoint);
        }
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::RegisterAck1, FLAG_OPTION, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let status = StatusCode::read(r)?;
        let responder_ecdh = r.ecdh()?;
        let encrypted_params = r.array()?;
        let responder_id = r.id()?;
        let signature = r.signature()?;
        let requester_endpoint = if opened.option {
            Some(r.endpoint()?)
        } else {
            None
        };
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                status,
                responder_ecdh,
                encrypted_params,
                responder_id,
                signature,
                requester_endpoint,
            },
        })
    }
}

// ============================================================================
// ACK2
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterAck2 {
    pub request_id: RequestId,
    pub seq: u16,
    /// Requester's transport params, encrypted toward the responder.
    pub encrypted_params: [u8; ENCRYPTED_PARAMS_SIZE],
    pub signature: RegistrationSignature,
}

impl RegisterAck2 {
    pub fn signed_fields(&self, syn: &RegisterSyn, ack1: &RegisterAck1) -> Vec<u8> {
        let mut out = ack1.signed_fields(syn);
        out.extend_from_slice(LABEL_ACK2);
        out.extend_from_slice(&self.encrypted_params);
        out
    }

    pub fn verify_signature(&self, syn: &RegisterSyn, ack1: &RegisterAck1) -> bool {
        syn.request_id
            .requester
            .verify(&self.signed_fields(syn, ack1), &self.signature)
            .is_ok()
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::RegisterAck2, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq)
            .bytes(&self.encrypted_params)
            .signature(&self.signature);
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::RegisterAck2, 0, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let encrypted_params = r.array()?;
        let signature = r.signature()?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                encrypted_params,
                signature,
            },
        })
    }
}

// ============================================================================
// CFM
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterCfm {
    pub request_id: RequestId,
    pub seq: u16,
    /// Responder's confirmation, delivered to the requester in a PONG.
    pub responder_confirmation: RegistrationSignature,
    pub requester_confirmation: RegistrationSignature,
}

impl RegisterCfm {
    /// Message the responder signs to confirm the direct channel.
    pub fn responder_message(
        syn: &RegisterSyn,
        ack1: &RegisterAck1,
        ack2: &RegisterAck2,
    ) -> Vec<u8> {
        let mut out = ack2.signed_fields(syn, ack1);
        out.extend_from_slice(LABEL_CFM_RESPONDER);
        out
    }

    /// Message the requester signs to confirm the direct channel.
    pub fn requester_message(
        syn: &RegisterSyn,
        ack1: &RegisterAck1,
        ack2: &RegisterAck2,
    ) -> Vec<u8> {
        let mut out = ack2.signed_fields(syn, ack1);
        out.extend_from_slice(LABEL_CFM_REQUESTER);
        out
    }

    pub fn verify_signatures(
        &self,
        syn: &RegisterSyn,
        ack1: &RegisterAck1,
        ack2: &RegisterAck2,
    ) -> bool {
        let responder_ok = ack1
            .responder_id
            .verify(
                &Self::responder_message(syn, ack1, ack2),
                &self.responder_confirmation,
            )
            .is_ok();
        let requester_ok = syn
            .request_id
            .requester
            .verify(
                &Self::requester_message(syn, ack1, ack2),
                &self.requester_confirmation,
            )
            .is_ok();
        responder_ok && requester_ok
    }

    pub fn encode(&self, link: &HopLink) -> Result<Vec<u8>, EncodeError> {
        let mut w = hop::begin(PacketType::RegisterCfm, link, 0);
        self.request_id.write(&mut w);
        w.u16(self.seq)
            .signature(&self.responder_confirmation)
            .signature(&self.requester_confirmation);
        hop::seal(w, link)
    }

    pub fn decode(data: &[u8], hmac_key: Option<&HmacKey>) -> Result<Framed<Self>, DecodeError> {
        let mut opened = hop::open(data, PacketType::RegisterCfm, 0, hmac_key)?;
        let r = &mut opened.body;
        let request_id = RequestId::read(r)?;
        let seq = r.u16()?;
        let responder_confirmation = r.signature()?;
        let requester_confirmation = r.signature()?;
        r.finish()?;
        Ok(Framed {
            auth: opened.auth,
            packet: Self {
                request_id,
                seq,
                responder_confirmation,
                requester_confirmation,
            },
        })
    }
}
