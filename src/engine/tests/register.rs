use super::*;
use crate::admission::{solve_pow1, POW_MAX_ATTEMPTS};
use crate::wire::{Pow1Request, Pow1Response, RegisterSyn};

#[test]
fn test_direct_registration_establishes_both_sides() {
    let mut net = TestNet::new(2);
    let token = net.connect(0, 1);

    let requester_events = net.events(0);
    assert!(requester_events.contains(&EngineEvent::NeighborEstablished {
        token,
        remote: net.id(1),
        role: ConnectionRole::Requester,
    }));

    let entry_token = net.token_for(1, 0).unwrap();
    assert!(net.events(1).contains(&EngineEvent::NeighborEstablished {
        token: entry_token,
        remote: net.id(0),
        role: ConnectionRole::Responder,
    }));

    let ours = net.engines[0].neighbors();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].state, ConnectionState::Established);
    assert_eq!(ours[0].endpoint, Some(endpoint(1)));

    let theirs = net.engines[1].neighbors();
    assert_eq!(theirs.len(), 1);
    assert_eq!(theirs[0].endpoint, Some(endpoint(0)));

    assert_eq!(net.engines[1].routed_requests(), 0);
    assert_eq!(net.engines[0].pending_requests(), 0);
}

#[test]
fn test_link_keys_agree() {
    let mut net = TestNet::new(2);
    let ours = net.connect(0, 1);
    let theirs = net.token_for(1, 0).unwrap();

    let a = net.engines[0].neighbor_table().hmac_key(ours).unwrap();
    let b = net.engines[1].neighbor_table().hmac_key(theirs).unwrap();
    assert_eq!(a.tag(b"link-check"), b.tag(b"link-check"));

    // Each side addresses the other with the token the other allocated
    let a_conn = net.engines[0].neighbor_table().get(ours).unwrap();
    let b_conn = net.engines[1].neighbor_table().get(theirs).unwrap();
    assert_eq!(a_conn.remote_token(), Some(theirs));
    assert_eq!(b_conn.remote_token(), Some(ours));
}

#[test]
fn test_syn_retransmitted_until_acknowledged() {
    let mut net = TestNet::new(2);
    let (requester, entry) = (endpoint(0), endpoint(1));
    let window_end = START_MS + 2_000;
    // Only the PoW exchange gets through at first
    net.set_drop(move |from, datagram, now| {
        from == entry
            && datagram.to == requester
            && now < window_end
            && packet_type(&datagram.data) != Ok(PacketType::Pow1Response)
    });

    let request_id = net.engines[0].register(entry, 0, net.now_ms).unwrap();
    net.run();
    net.advance(2_000);
    assert!(net.completed(0, request_id).is_none());

    let syns = net
        .sent_of(0, PacketType::RegisterSyn)
        .filter(|s| s.at_ms < window_end)
        .count();
    assert!(syns >= 4, "expected retransmissions, saw {} SYNs", syns);

    assert!(net.advance_until(5_000, |net| net.completed(0, request_id).is_some()));

    // One acceptance despite the retransmitted SYNs
    let established = net
        .events(1)
        .iter()
        .filter(|e| matches!(e, EngineEvent::NeighborEstablished { .. }))
        .count();
    assert_eq!(established, 1);
    assert_eq!(net.engines[1].neighbor_table().live_count(), 1);

    let ack1s: Vec<&Sent> = net.sent_of(1, PacketType::RegisterAck1).collect();
    assert!(ack1s.len() > 1);
    assert!(ack1s.iter().all(|s| s.data == ack1s[0].data));
}

#[test]
fn test_register_via_neighbor_reaches_new_peer() {
    // 0 joins through 1, 1 links to 2, then 0 asks 1 for another neighbor
    let mut net = TestNet::new(3);
    let via = net.connect(0, 1);
    net.connect(1, 2);
    net.clear_events();

    let request_id = net.engines[0]
        .register_via_neighbor(via, 0, net.now_ms)
        .unwrap();
    net.run();
    assert!(net.advance_until(5_000, |net| net.completed(0, request_id).is_some()));

    let (_, remote) = net.completed(0, request_id).unwrap();
    assert_eq!(remote, net.id(2));
    assert!(net.is_established(0, 2));
    assert!(net.is_established(2, 0));
    assert_eq!(net.engines[0].neighbor_table().established_count(), 2);

    // The new neighbor talks to us directly, not through the relay
    let token = net.token_for(2, 0).unwrap();
    let conn = net.engines[2].neighbor_table().get(token).unwrap();
    assert_eq!(conn.remote_endpoint(), Some(endpoint(0)));

    assert_eq!(net.engines[1].routed_requests(), 0);
    assert!(net.sent_of(1, PacketType::RegisterSyn).count() >= 1);
    assert_eq!(net.sent_of(0, PacketType::Pow1Request).count(), 1);
}

#[test]
fn test_register_via_neighbor_requires_established() {
    let mut net = TestNet::new(1);
    let err = net.engines[0]
        .register_via_neighbor(NeighborToken::new(7), 0, net.now_ms)
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownNeighbor(_)));
}

#[test]
fn test_unreachable_entry_times_out() {
    let mut net = TestNet::new(1);
    let request_id = net.engines[0].register(endpoint(7), 0, net.now_ms).unwrap();
    net.run();
    net.advance(6_000);

    assert_eq!(net.failed(0, request_id), Some(HandshakeError::Timeout));
    assert_eq!(net.engines[0].pending_requests(), 0);
    assert!(net.sent_of(0, PacketType::Pow1Request).count() > 1);
}

#[test]
fn test_second_registration_with_same_entry_rejected() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    net.advance(1_000);

    let request_id = net.engines[0].register(endpoint(1), 0, net.now_ms).unwrap();
    net.run();
    assert!(net.advance_until(5_000, |net| net.failed(0, request_id).is_some()));
    assert_eq!(
        net.failed(0, request_id),
        Some(HandshakeError::Rejected(StatusCode::RouteUnavailable))
    );
    assert_eq!(net.engines[0].neighbor_table().live_count(), 1);
    assert_eq!(net.engines[1].neighbor_table().live_count(), 1);
}

#[test]
fn test_pow1_replay_rejected() {
    let mut net = TestNet::new(2);
    let timestamp = (START_MS / 1000) as u32;
    let claimed_ip = endpoint(0).ip();
    let nonce = solve_pow1(timestamp, &claimed_ip, POW_MAX_ATTEMPTS).unwrap();
    let request = |pow_request_id| {
        Pow1Request {
            pow_request_id,
            timestamp,
            claimed_ip,
            nonce,
        }
        .encode()
        .unwrap()
    };
    let ask = |net: &mut TestNet, data: &[u8]| {
        net.engines[1].on_datagram(endpoint(0), data, START_MS);
        let out = net.engines[1].poll_transmit().unwrap();
        assert_eq!(out.to, endpoint(0));
        out.data
    };

    let first = ask(&mut net, &request(1));
    let response = Pow1Response::decode(&first).unwrap();
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.pow_request_id, 1);

    // A retransmission gets the cached answer and the same challenge
    let again = ask(&mut net, &request(1));
    assert_eq!(again, first);

    // The same solution under a new request id is a replay
    let replay = Pow1Response::decode(&ask(&mut net, &request(2))).unwrap();
    assert_eq!(replay.status, StatusCode::NonUnique);
    assert_eq!(replay.pow_request_id, 2);
}

#[test]
fn test_stale_pow1_timestamp_rejected() {
    let mut net = TestNet::new(2);
    let timestamp = (START_MS / 1000) as u32 - 600;
    let claimed_ip = endpoint(0).ip();
    let nonce = solve_pow1(timestamp, &claimed_ip, POW_MAX_ATTEMPTS).unwrap();
    let data = Pow1Request {
        pow_request_id: 9,
        timestamp,
        claimed_ip,
        nonce,
    }
    .encode()
    .unwrap();

    net.engines[1].on_datagram(endpoint(0), &data, START_MS);
    let out = net.engines[1].poll_transmit().unwrap();
    let response = Pow1Response::decode(&out.data).unwrap();
    assert_eq!(response.status, StatusCode::BadTimestamp);
}

#[test]
fn test_exhausted_pow_fails_registration() {
    let mut net = TestNet::new(2);
    let request_id = net.engines[0].register(endpoint(1), 0, net.now_ms).unwrap();
    let job = net.engines[0].poll_pow_job().unwrap();
    let now = net.now_ms;
    net.engines[0].on_pow_solved(PowSolution { job, nonce: None }, now);
    net.run();

    assert!(matches!(
        net.failed(0, request_id),
        Some(HandshakeError::ProofOfWorkExhausted(_))
    ));
    assert!(net.sent.is_empty());
}

#[test]
fn test_back_to_back_registrations_get_distinct_ids() {
    let mut net = TestNet::new(3);
    let first = net.engines[0].register(endpoint(1), 0, net.now_ms).unwrap();
    net.run();
    assert!(net.advance_until(5_000, |net| net.completed(0, first).is_some()));

    // Same second as the first one, which has finished already
    let second = net.engines[0].register(endpoint(2), 0, net.now_ms).unwrap();
    assert_ne!(first, second);
    assert!(second.timestamp > first.timestamp);
    net.run();
    assert!(net.advance_until(5_000, |net| net.completed(0, second).is_some()));

    assert_eq!(net.completed(0, first).map(|(_, r)| r), Some(net.id(1)));
    assert_eq!(net.completed(0, second).map(|(_, r)| r), Some(net.id(2)));
    let completions: Vec<RequestId> = net
        .events(0)
        .iter()
        .filter_map(|e| match e {
            EngineEvent::RegistrationCompleted { request_id, .. } => Some(*request_id),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![first, second]);
}

/// The SYN 0 last sent to 1 over their link, decoded with 1's key.
fn last_relayed_syn(net: &TestNet) -> RegisterSyn {
    let token = net.token_for(1, 0).unwrap();
    let key = net.engines[1].neighbor_table().hmac_key(token).unwrap();
    let sent = net.sent_of(0, PacketType::RegisterSyn).last().unwrap();
    RegisterSyn::decode(&sent.data, Some(key)).unwrap().packet
}

/// Deliver `syn` from 0 to 1 over their link and return 1's NPACK.
fn deliver_syn(net: &mut TestNet, syn: &RegisterSyn) -> Npack {
    let token = net.token_for(1, 0).unwrap();
    let key = net.engines[1].neighbor_table().hmac_key(token).unwrap().clone();
    let data = syn
        .encode(&HopLink::Relayed {
            token,
            hmac_key: key.clone(),
        })
        .unwrap();
    let now = net.now_ms;
    net.engines[1].on_datagram(endpoint(0), &data, now);

    let mut npack = None;
    while let Some(out) = net.engines[1].poll_transmit() {
        if out.to == endpoint(0) && packet_type(&out.data) == Ok(PacketType::Npack) {
            npack = Some(Npack::decode(&out.data, Some(&key)).unwrap().packet);
        }
    }
    npack.expect("no NPACK for the SYN")
}

#[test]
fn test_syn_for_request_in_flight_rejected_as_duplicate() {
    // 1 proxies to 2, which never answers, so the request stays open at 1
    let mut net = TestNet::new(3);
    let via = net.connect(0, 1);
    net.connect(1, 2);
    let silent = endpoint(2);
    net.set_drop(move |from, _, _| from == silent);

    let request_id = net.engines[0]
        .register_via_neighbor(via, 0, net.now_ms)
        .unwrap();
    net.run();
    assert_eq!(net.engines[1].routed_requests(), 1);

    // Same request under a new sequence number, so not a retransmission
    let mut syn = last_relayed_syn(&net);
    assert_eq!(syn.request_id, request_id);
    syn.seq = syn.seq.wrapping_add(1);
    let npack = deliver_syn(&mut net, &syn);
    assert_eq!(npack.seq, syn.seq);
    assert_eq!(npack.status, StatusCode::Duplicate);
    assert_eq!(net.engines[1].routed_requests(), 1);
}

#[test]
fn test_reused_ephemeral_key_rejected() {
    let seed = [0x5a; 32];
    let mut net = TestNet::with_identities(vec![
        Identity::from_secret_bytes(&seed),
        Identity::generate(),
        Identity::generate(),
    ]);
    let via = net.connect(0, 1);
    net.connect(1, 2);

    let request_id = net.engines[0]
        .register_via_neighbor(via, 0, net.now_ms)
        .unwrap();
    net.run();
    assert!(net.advance_until(5_000, |net| net.completed(0, request_id).is_some()));

    // A properly signed SYN for a new request that reuses the old key
    let requester = Identity::from_secret_bytes(&seed);
    let mut syn = last_relayed_syn(&net);
    syn.request_id.timestamp += 1;
    syn.seq = syn.seq.wrapping_add(1);
    syn.signature = requester.sign(&syn.signed_fields());
    assert!(syn.verify_signature());

    let npack = deliver_syn(&mut net, &syn);
    assert_eq!(npack.status, StatusCode::NonUnique);
    assert_eq!(net.engines[1].routed_requests(), 0);
}

#[test]
fn test_recent_ephemeral_keys_bounded_and_expire() {
    let mut net = TestNet::configured(
        (0..3).map(|_| Identity::generate()).collect(),
        |i, config| {
            if i == 1 {
                config.limits.max_recent_ephemeral_keys = 1;
                config.handshake.ephemeral_key_retention_ms = 5_000;
            }
        },
    );
    net.connect(0, 1);
    assert_eq!(net.engines[1].recent_ephemeral_keys(), 1);

    // Admitted at 1 whether it accepts or proxies
    let request_id = net.engines[2].register(endpoint(1), 0, net.now_ms).unwrap();
    net.run();
    assert!(net.advance_until(5_000, |net| net.completed(2, request_id).is_some()));
    assert_eq!(net.engines[1].recent_ephemeral_keys(), 1);

    net.advance(6_000);
    assert_eq!(net.engines[1].recent_ephemeral_keys(), 0);
}
