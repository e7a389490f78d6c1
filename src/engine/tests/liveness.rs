use super::*;

fn disposed(net: &TestNet, index: usize, remote: usize) -> bool {
    let remote = net.id(remote);
    net.events(index)
        .iter()
        .any(|e| matches!(e, EngineEvent::NeighborDisposed { remote: r, .. } if *r == remote))
}

#[test]
fn test_pings_keep_neighbors_alive() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    net.clear_events();

    net.advance(60_000);

    assert!(net.is_established(0, 1));
    assert!(net.is_established(1, 0));
    assert!(net.events(0).is_empty());
    assert!(net.events(1).is_empty());
    assert!(net.sent_of(0, PacketType::Ping).count() >= 4);
    assert!(net.sent_of(1, PacketType::Pong).count() >= 4);
    assert!(net.engines[0].neighbors()[0].rtt_ms.is_some());
}

#[test]
fn test_silent_neighbor_disposed() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    net.clear_events();
    net.set_drop(|_, _, _| true);

    net.advance(40_000);
    assert!(net.is_established(0, 1));

    net.advance(10_000);
    assert!(disposed(&net, 0, 1));
    assert!(disposed(&net, 1, 0));
    assert!(net.engines[0].neighbors().is_empty());
    assert!(net.engines[1].neighbors().is_empty());
}

#[test]
fn test_teardown_disposes_both_sides() {
    let mut net = TestNet::new(2);
    let token = net.connect(0, 1);
    net.clear_events();

    net.engines[0].teardown(token, net.now_ms).unwrap();
    net.run();

    let state = |net: &TestNet, index: usize| net.engines[index].neighbors()[0].state;
    assert!(matches!(state(&net, 0), ConnectionState::TearingDown { .. }));
    assert!(matches!(state(&net, 1), ConnectionState::TearingDown { .. }));
    assert!(!disposed(&net, 0, 1));

    net.advance(2_500);
    assert!(disposed(&net, 0, 1));
    assert!(disposed(&net, 1, 0));

    // Slots stay reserved for the grace period, then return
    assert_eq!(net.engines[0].neighbor_table().len(), 1);
    net.advance(10_000);
    assert!(net.engines[0].neighbor_table().is_empty());
    assert!(net.engines[1].neighbor_table().is_empty());
}

#[test]
fn test_teardown_errors() {
    let mut net = TestNet::new(2);
    let now = net.now_ms;
    assert!(matches!(
        net.engines[0].teardown(NeighborToken::new(3), now),
        Err(EngineError::UnknownNeighbor(_))
    ));

    let token = net.connect(0, 1);
    let now = net.now_ms;
    net.engines[0].teardown(token, now).unwrap();
    assert!(matches!(
        net.engines[0].teardown(token, now),
        Err(EngineError::NotEstablished(_))
    ));
}

#[test]
fn test_tampered_ping_dropped() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    let pinger = endpoint(0);
    net.set_drop(move |from, datagram, _| {
        from == pinger && packet_type(&datagram.data) == Ok(PacketType::Ping)
    });
    net.advance(3_000);

    let ping = net
        .sent_of(0, PacketType::Ping)
        .last()
        .map(|s| s.data.clone())
        .unwrap();
    let mut tampered = ping.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;

    let now = net.now_ms;
    net.engines[1].on_datagram(endpoint(0), &tampered, now);
    assert!(net.engines[1].poll_transmit().is_none());

    net.engines[1].on_datagram(endpoint(0), &ping, now);
    let pong = net.engines[1].poll_transmit().unwrap();
    assert_eq!(pong.to, endpoint(0));
    assert_eq!(packet_type(&pong.data), Ok(PacketType::Pong));
}

#[test]
fn test_neighbor_info_reports_role() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    assert_eq!(net.engines[0].neighbors()[0].role, ConnectionRole::Requester);
    assert_eq!(net.engines[1].neighbors()[0].role, ConnectionRole::Responder);
    assert_eq!(net.engines[1].neighbors()[0].remote, net.id(0));
}
