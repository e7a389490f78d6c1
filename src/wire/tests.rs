use super::*;
use crate::crypto::{EcdhPublicKey, EphemeralKeypair, HmacKey, ENCRYPTED_PARAMS_SIZE};
use crate::identity::Identity;
use crate::neighbor::NeighborToken;
use crate::routing::{Sector, SectorSet};
use proptest::prelude::*;
use std::net::SocketAddr;

fn key() -> HmacKey {
    HmacKey::from_bytes([7u8; 32])
}

fn relayed(token: u32) -> HopLink {
    HopLink::Relayed {
        token: NeighborToken::new(token),
        hmac_key: key(),
    }
}

fn endpoint(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn signed_syn(requester: &Identity, ecdh: EcdhPublicKey) -> RegisterSyn {
    let mut syn = RegisterSyn {
        request_id: RequestId::new(*requester.id(), 1_700_000_000),
        seq: 3,
        requester_ecdh: ecdh,
        min_distance: 1_000,
        hop_budget: 6,
        entry_endpoint: endpoint("198.51.100.7:4000"),
        signature: UNSIGNED,
        pow2_nonce: Some([0x55; POW_NONCE_SIZE]),
    };
    syn.signature = requester.sign(&syn.signed_fields());
    syn
}

fn signed_ack1(responder: &Identity, syn: &RegisterSyn) -> RegisterAck1 {
    let mut ack1 = RegisterAck1 {
        request_id: syn.request_id,
        seq: 9,
        status: StatusCode::Ok,
        responder_ecdh: *EphemeralKeypair::generate().public(),
        encrypted_params: [0xab; ENCRYPTED_PARAMS_SIZE],
        responder_id: *responder.id(),
        signature: UNSIGNED,
        requester_endpoint: None,
    };
    ack1.signature = responder.sign(&ack1.signed_fields(syn));
    ack1
}

// ===== Packet type =====

#[test]
fn test_packet_type_roundtrip_all() {
    for b in 0..=255u8 {
        if let Some(t) = PacketType::from_byte(b) {
            assert_eq!(t.to_byte(), b);
        }
    }
    assert_eq!(packet_type(&[]), Err(DecodeError::Empty));
    assert_eq!(packet_type(&[0x99]), Err(DecodeError::UnknownPacketType(0x99)));
    assert_eq!(packet_type(&[0x10, 0]), Ok(PacketType::RegisterSyn));
}

#[test]
fn test_status_codes_known() {
    for b in 0..=9u8 {
        assert_eq!(StatusCode::from_byte(b).unwrap().to_byte(), b);
    }
    assert!(StatusCode::from_byte(10).is_none());
    assert!(StatusCode::Ok.is_ok());
    assert!(!StatusCode::RouteUnavailable.is_ok());
}

// ===== REGISTER =====

#[test]
fn test_syn_direct_carries_pow() {
    let requester = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let bytes = syn.encode(&HopLink::Direct).unwrap();
    assert_eq!(bytes[0], 0x10);
    assert_eq!(bytes[1], 0x00);

    let framed = RegisterSyn::decode(&bytes, None).unwrap();
    assert_eq!(framed.auth, HopAuth::Direct);
    assert_eq!(framed.packet, syn);
    assert!(framed.packet.verify_signature());
}

#[test]
fn test_syn_direct_without_pow_rejected() {
    let requester = Identity::generate();
    let mut syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    syn.pow2_nonce = None;
    assert_eq!(
        syn.encode(&HopLink::Direct),
        Err(EncodeError::MissingField("pow2 nonce"))
    );
}

#[test]
fn test_syn_relayed_drops_pow() {
    let requester = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let bytes = syn.encode(&relayed(0xdead_beef)).unwrap();
    let framed = RegisterSyn::decode(&bytes, Some(&key())).unwrap();
    assert_eq!(
        framed.auth,
        HopAuth::Relayed {
            token: NeighborToken::new(0xdead_beef)
        }
    );
    assert_eq!(framed.packet.pow2_nonce, None);
    assert!(framed.packet.verify_signature());
}

#[test]
fn test_syn_hop_budget_not_signed() {
    let requester = Identity::generate();
    let mut syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    syn.hop_budget -= 1;
    assert!(syn.verify_signature());
    syn.min_distance += 1;
    assert!(!syn.verify_signature());
}

#[test]
fn test_syn_prefix_matches() {
    let requester = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let bytes = syn.encode(&relayed(5)).unwrap();
    let auth = HopAuth::Relayed {
        token: NeighborToken::new(5),
    };
    assert!(bytes.starts_with(&request_prefix(
        PacketType::RegisterSyn,
        &auth,
        0,
        &syn.request_id
    )));
}

#[test]
fn test_ack1_option_endpoint() {
    let requester = Identity::generate();
    let responder = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let mut ack1 = signed_ack1(&responder, &syn);

    let plain = ack1.encode(&relayed(1)).unwrap();

    ack1.requester_endpoint = Some(endpoint("203.0.113.9:5151"));
    let bytes = ack1.encode(&HopLink::Direct).unwrap();
    assert_eq!(bytes[1], FLAG_OPTION);
    let framed = RegisterAck1::decode(&bytes, None).unwrap();
    assert_eq!(framed.packet, ack1);
    // The endpoint is added by the last hop and is outside the signature
    assert!(framed.packet.verify_signature(&syn));
    assert_eq!(plain[..2], [0x11, FLAG_RELAYED]);
}

#[test]
fn test_ack1_signature_binds_syn() {
    let requester = Identity::generate();
    let responder = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let ack1 = signed_ack1(&responder, &syn);
    assert!(ack1.verify_signature(&syn));

    let other = signed_syn(&requester, *EphemeralKeypair::generate().public());
    assert!(!ack1.verify_signature(&other));
}

#[test]
fn test_ack2_and_cfm_chain() {
    let requester = Identity::generate();
    let responder = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let ack1 = signed_ack1(&responder, &syn);

    let mut ack2 = RegisterAck2 {
        request_id: syn.request_id,
        seq: 10,
        encrypted_params: [0xcd; ENCRYPTED_PARAMS_SIZE],
        signature: UNSIGNED,
    };
    ack2.signature = requester.sign(&ack2.signed_fields(&syn, &ack1));
    let bytes = ack2.encode(&relayed(2)).unwrap();
    let decoded = RegisterAck2::decode(&bytes, Some(&key())).unwrap().packet;
    assert_eq!(decoded, ack2);
    assert!(decoded.verify_signature(&syn, &ack1));

    let cfm = RegisterCfm {
        request_id: syn.request_id,
        seq: 11,
        responder_confirmation: responder
            .sign(&RegisterCfm::responder_message(&syn, &ack1, &ack2)),
        requester_confirmation: requester
            .sign(&RegisterCfm::requester_message(&syn, &ack1, &ack2)),
    };
    let bytes = cfm.encode(&HopLink::Direct).unwrap();
    let decoded = RegisterCfm::decode(&bytes, None).unwrap().packet;
    assert!(decoded.verify_signatures(&syn, &ack1, &ack2));

    // Swapped confirmations must not verify
    let swapped = RegisterCfm {
        responder_confirmation: cfm.requester_confirmation,
        requester_confirmation: cfm.responder_confirmation,
        ..cfm
    };
    assert!(!swapped.verify_signatures(&syn, &ack1, &ack2));
}

// ===== NPACK / FAILURE =====

#[test]
fn test_npack_layout() {
    let npack = Npack {
        seq: 0x0102,
        status: StatusCode::Duplicate,
    };
    let bytes = npack.encode(&HopLink::Direct).unwrap();
    assert_eq!(bytes, vec![0x20, 0x00, 0x02, 0x01, 8]);
    assert!(bytes.starts_with(&Npack::prefix(&HopAuth::Direct, 0x0102)));
    assert_eq!(Npack::decode(&bytes, None).unwrap().packet, npack);
}

#[test]
fn test_failure_relayed() {
    let id = *Identity::generate().id();
    let failure = FailurePacket {
        request_id: RequestId::new(id, 42),
        seq: 17,
        code: StatusCode::RouteUnavailable,
    };
    let bytes = failure.encode(&relayed(77)).unwrap();
    let framed = FailurePacket::decode(&bytes, Some(&key())).unwrap();
    assert_eq!(framed.packet, failure);
    assert_eq!(framed.auth.token(), Some(NeighborToken::new(77)));
}

// ===== PING / PONG =====

#[test]
fn test_ping_flags_and_sectors() {
    let mut busy = SectorSet::new();
    busy.insert(Sector::new(3));
    busy.insert(Sector::new(200));
    let ping = PingPacket {
        ping_id: 99,
        flags: PingFlags {
            teardown: true,
            request_confirmation: false,
        },
        neighbor_count: 4,
        busy_sectors: busy,
    };
    let bytes = ping.encode(&relayed(3)).unwrap();
    let decoded = PingPacket::decode(&bytes, Some(&key())).unwrap().packet;
    assert_eq!(decoded, ping);
    assert!(decoded.busy_sectors.contains(Sector::new(200)));
}

#[test]
fn test_ping_requires_relay() {
    let ping = PingPacket {
        ping_id: 1,
        flags: PingFlags::default(),
        neighbor_count: 0,
        busy_sectors: SectorSet::new(),
    };
    assert_eq!(
        ping.encode(&HopLink::Direct),
        Err(EncodeError::RelayRequired)
    );
    // A hand-built direct PING is refused on decode
    let mut bytes = vec![0x30, 0x00];
    bytes.extend_from_slice(&[0u8; 4 + 1 + 1 + 32]);
    assert_eq!(
        PingPacket::decode(&bytes, None).err(),
        Some(DecodeError::RelayRequired)
    );
}

#[test]
fn test_ping_unknown_flag_bits_rejected() {
    assert!(PingFlags::from_byte(0x04).is_err());
    assert_eq!(
        PingFlags::from_byte(0x03).unwrap(),
        PingFlags {
            teardown: true,
            request_confirmation: true
        }
    );
}

#[test]
fn test_pong_confirmation_option() {
    let identity = Identity::generate();
    let pong = PongPacket {
        ping_id: 5,
        neighbor_count: 2,
        busy_sectors: SectorSet::new(),
        confirmation: Some(identity.sign(b"confirm")),
    };
    let link = relayed(8);
    let bytes = pong.encode(&link).unwrap();
    let auth = HopAuth::Relayed {
        token: NeighborToken::new(8),
    };
    assert!(bytes.starts_with(&PongPacket::prefix(&auth, FLAG_OPTION, 5)));
    assert!(!bytes.starts_with(&PongPacket::prefix(&auth, 0, 5)));
    assert_eq!(PongPacket::decode(&bytes, Some(&key())).unwrap().packet, pong);
}

// ===== INVITE =====

fn signed_invite(requester: &Identity, responder: &Identity, desc: Vec<u8>) -> InviteSyn {
    let mut syn = InviteSyn {
        request_id: RequestId::new(*requester.id(), 7),
        seq: 1,
        responder_id: *responder.id(),
        hop_budget: 8,
        hops: 0,
        session_description: desc,
        signature: UNSIGNED,
    };
    syn.signature = requester.sign(&syn.signed_fields());
    syn
}

#[test]
fn test_invite_full_exchange_signatures() {
    let a = Identity::generate();
    let b = Identity::generate();
    let syn = signed_invite(&a, &b, b"v=0 session".to_vec());
    let bytes = syn.encode(&relayed(1)).unwrap();
    let mut decoded = InviteSyn::decode(&bytes, Some(&key())).unwrap().packet;
    assert!(decoded.verify_signature());
    decoded.hops = 3;
    decoded.hop_budget = 2;
    assert!(decoded.verify_signature());

    let mut ack1 = InviteAck1 {
        request_id: syn.request_id,
        seq: 2,
        status: StatusCode::Ok,
        hops: 3,
        session_description: b"answer".to_vec(),
        signature: UNSIGNED,
    };
    ack1.signature = b.sign(&ack1.signed_fields(&syn));
    let bytes = ack1.encode(&relayed(2)).unwrap();
    let ack1 = InviteAck1::decode(&bytes, Some(&key())).unwrap().packet;
    assert!(ack1.verify_signature(&syn));

    let ack2 = InviteAck2 {
        request_id: syn.request_id,
        seq: 3,
        signature: a.sign(&InviteAck2::signed_fields(&syn, &ack1)),
    };
    assert!(ack2.verify_signature(&syn, &ack1));
    let cfm = InviteCfm {
        request_id: syn.request_id,
        seq: 4,
        signature: b.sign(&InviteCfm::signed_fields(&syn, &ack1)),
    };
    let bytes = cfm.encode(&relayed(3)).unwrap();
    let cfm = InviteCfm::decode(&bytes, Some(&key())).unwrap().packet;
    assert!(cfm.verify_signature(&syn, &ack1));
    // ACK2 and CFM signatures are domain separated
    assert!(!InviteCfm {
        signature: ack2.signature,
        ..cfm
    }
    .verify_signature(&syn, &ack1));
}

#[test]
fn test_invite_description_bounded() {
    let a = Identity::generate();
    let b = Identity::generate();
    let syn = signed_invite(&a, &b, vec![0u8; MAX_SESSION_DESCRIPTION]);
    assert!(syn.encode(&relayed(1)).is_ok());

    let syn = signed_invite(&a, &b, vec![0u8; MAX_SESSION_DESCRIPTION + 1]);
    assert!(matches!(
        syn.encode(&relayed(1)),
        Err(EncodeError::FieldTooLong { .. })
    ));
}

#[test]
fn test_invite_length_field_checked() {
    let a = Identity::generate();
    let b = Identity::generate();
    let syn = signed_invite(&a, &b, b"xy".to_vec());
    let link = relayed(1);
    let mut bytes = syn.encode(&link).unwrap();
    // Overwrite the length with an out-of-range value and re-seal
    let len_at = RELAYED_HEADER + 36 + 2 + 32 + 1 + 1;
    bytes[len_at..len_at + 2].copy_from_slice(&0x0400u16.to_le_bytes());
    let body_end = bytes.len() - 32;
    let tag = key().tag(&bytes[..body_end]);
    bytes[body_end..].copy_from_slice(&tag);
    assert!(matches!(
        InviteSyn::decode(&bytes, Some(&key())),
        Err(DecodeError::InvalidValue {
            field: "session description",
            ..
        })
    ));
}

const RELAYED_HEADER: usize = 6;

// ===== PoW1 =====

#[test]
fn test_pow1_request_response() {
    let request = Pow1Request {
        pow_request_id: 0xfeed,
        timestamp: 1_700_000_000,
        claimed_ip: "2001:db8::1".parse().unwrap(),
        nonce: [9u8; POW_NONCE_SIZE],
    };
    let bytes = request.encode().unwrap();
    assert_eq!(bytes.len(), 2 + 4 + 4 + 16 + 64);
    assert_eq!(Pow1Request::decode(&bytes).unwrap(), request);

    let response = Pow1Response {
        pow_request_id: 0xfeed,
        status: StatusCode::Ok,
        challenge: [1u8; CHALLENGE_SIZE],
    };
    let bytes = response.encode().unwrap();
    assert!(bytes.starts_with(&Pow1Response::prefix(0xfeed)));
    assert_eq!(Pow1Response::decode(&bytes).unwrap(), response);
}

// ===== Strictness =====

#[test]
fn test_truncation_rejected_everywhere() {
    let requester = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let bytes = syn.encode(&HopLink::Direct).unwrap();
    for len in 0..bytes.len() {
        assert!(RegisterSyn::decode(&bytes[..len], None).is_err());
    }
}

#[test]
fn test_trailing_bytes_rejected() {
    let npack = Npack {
        seq: 1,
        status: StatusCode::Ok,
    };
    let mut bytes = npack.encode(&HopLink::Direct).unwrap();
    bytes.push(0);
    assert_eq!(
        Npack::decode(&bytes, None).err(),
        Some(DecodeError::TrailingBytes(1))
    );
}

#[test]
fn test_oversized_rejected() {
    let mut bytes = vec![0x20, 0x00];
    bytes.resize(MAX_PACKET_SIZE + 1, 0);
    assert!(matches!(
        Npack::decode(&bytes, None),
        Err(DecodeError::Oversized { .. })
    ));
}

#[test]
fn test_invalid_status_rejected() {
    let bytes = [0x20, 0x00, 0x01, 0x00, 0xee];
    assert_eq!(
        Npack::decode(&bytes, None).err(),
        Some(DecodeError::InvalidValue {
            field: "status",
            value: 0xee
        })
    );
}

#[test]
fn test_wrong_hmac_key_rejected() {
    let npack = Npack {
        seq: 1,
        status: StatusCode::Ok,
    };
    let bytes = npack.encode(&relayed(1)).unwrap();
    let other = HmacKey::from_bytes([8u8; 32]);
    assert_eq!(
        Npack::decode(&bytes, Some(&other)).err(),
        Some(DecodeError::InvalidHmac)
    );
}

#[test]
fn test_zero_endpoint_rejected() {
    let requester = Identity::generate();
    let syn = signed_syn(&requester, *EphemeralKeypair::generate().public());
    let mut bytes = syn.encode(&HopLink::Direct).unwrap();
    // entry endpoint port lives after id, seq, ecdh, min_distance, hop_budget, ip
    let port_at = 2 + 36 + 2 + 32 + 4 + 1 + 16;
    bytes[port_at] = 0;
    bytes[port_at + 1] = 0;
    assert_eq!(
        RegisterSyn::decode(&bytes, None).err(),
        Some(DecodeError::InvalidEndpoint)
    );
}

proptest! {
    #[test]
    fn decoders_never_panic(data in proptest::collection::vec(any::<u8>(), 0..600)) {
        let k = key();
        let _ = RegisterSyn::decode(&data, Some(&k));
        let _ = RegisterAck1::decode(&data, Some(&k));
        let _ = RegisterAck2::decode(&data, Some(&k));
        let _ = RegisterCfm::decode(&data, Some(&k));
        let _ = Npack::decode(&data, Some(&k));
        let _ = FailurePacket::decode(&data, Some(&k));
        let _ = PingPacket::decode(&data, Some(&k));
        let _ = PongPacket::decode(&data, Some(&k));
        let _ = InviteSyn::decode(&data, Some(&k));
        let _ = InviteAck1::decode(&data, Some(&k));
        let _ = InviteAck2::decode(&data, Some(&k));
        let _ = InviteCfm::decode(&data, Some(&k));
        let _ = Pow1Request::decode(&data);
        let _ = Pow1Response::decode(&data);
        let _ = peek_token(&data);
        let _ = packet_type(&data);
    }

    #[test]
    fn direct_syn_with_random_body_never_verifies(body in proptest::collection::vec(any::<u8>(), 221)) {
        let mut data = vec![0x10, 0x00];
        data.extend_from_slice(&body);
        if let Ok(framed) = RegisterSyn::decode(&data, None) {
            prop_assert!(!framed.packet.verify_signature());
        }
    }
}
