use super::*;
use crate::crypto::{EphemeralKeypair, LinkKeys};
use crate::identity::Identity;
use crate::wire::{HopLink, RequestId};
use std::collections::HashSet;
use std::net::SocketAddr;

fn liveness() -> LivenessConfig {
    LivenessConfig {
        initial_rtt_ms: 100,
        rtt_multiplier: 10,
        min_ping_interval_ms: 500,
        max_ping_interval_ms: 5_000,
        neighbor_timeout_ms: 20_000,
        teardown_grace_ms: 1_000,
        disposal_grace_ms: 3_000,
    }
}

fn key_pair() -> (LinkKeys, LinkKeys) {
    let a = EphemeralKeypair::generate();
    let b = EphemeralKeypair::generate();
    let transcript = [3u8; 32];
    (
        a.derive(b.public(), &transcript).unwrap(),
        b.derive(a.public(), &transcript).unwrap(),
    )
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], port))
}

fn connection(token: NeighborToken, role: ConnectionRole, keys: LinkKeys) -> NeighborConnection {
    let remote = *Identity::generate().id();
    NeighborConnection::new(token, role, remote, RequestId::new(remote, 1), keys, 0)
}

fn established(token: NeighborToken) -> NeighborConnection {
    let (keys, _) = key_pair();
    let mut conn = connection(token, ConnectionRole::Requester, keys);
    conn.init_p2p_stream(addr(1), NeighborToken::new(77)).unwrap();
    conn.mark_established(0).unwrap();
    conn
}

// ===== Handshake =====

#[test]
fn test_both_sides_share_hmac_key() {
    let (ka, kb) = key_pair();
    let mut a = connection(NeighborToken::new(1), ConnectionRole::Requester, ka);
    let mut b = connection(NeighborToken::new(2), ConnectionRole::Responder, kb);
    a.init_p2p_stream(addr(2), NeighborToken::new(2)).unwrap();
    b.init_p2p_stream(addr(1), NeighborToken::new(1)).unwrap();

    let tag = a.hmac_key().unwrap().tag(b"ping");
    assert!(b.hmac_key().unwrap().verify(b"ping", &tag));

    match a.link().unwrap() {
        HopLink::Relayed { token, .. } => assert_eq!(token, NeighborToken::new(2)),
        HopLink::Direct => panic!("expected relayed link"),
    }
}

#[test]
fn test_stream_initialized_once() {
    let (keys, _) = key_pair();
    let mut conn = connection(NeighborToken::new(5), ConnectionRole::Responder, keys);
    assert!(conn.link().is_none());
    assert!(conn.mark_established(0).is_err());

    conn.init_p2p_stream(addr(1), NeighborToken::new(9)).unwrap();
    assert_eq!(
        conn.init_p2p_stream(addr(2), NeighborToken::new(10)),
        Err(NeighborError::StreamAlreadyInitialized(NeighborToken::new(5)))
    );
    assert_eq!(conn.remote_endpoint(), Some(addr(1)));

    conn.mark_established(10).unwrap();
    assert!(conn.is_established());
    // Idempotent
    conn.mark_established(20).unwrap();
}

// ===== Liveness =====

#[test]
fn test_ping_interval_tracks_rtt() {
    let config = liveness();
    let mut conn = established(NeighborToken::new(1));
    // Initial RTT 100ms x 10
    assert_eq!(conn.ping_interval_ms(&config), 1_000);
    assert!(!conn.ping_due(999, &config));
    assert!(conn.ping_due(1_000, &config));

    let id = conn.begin_ping(1_000);
    assert_eq!(conn.on_pong(id.wrapping_add(1), 1_030), None);
    assert_eq!(conn.on_pong(id, 1_040), Some(40));
    assert_eq!(conn.rtt_ms(), Some(40));
    // 40 x 10 = 400, clamped to the minimum
    assert_eq!(conn.ping_interval_ms(&config), 500);
    assert!(!conn.ping_due(1_400, &config));
    assert!(conn.ping_due(1_540, &config));

    // Second sample is smoothed
    let id = conn.begin_ping(2_000);
    conn.on_pong(id, 2_800);
    assert_eq!(conn.rtt_ms(), Some((40 * 7 + 800) / 8));
}

#[test]
fn test_ping_interval_capped() {
    let config = liveness();
    let mut conn = established(NeighborToken::new(1));
    let id = conn.begin_ping(0);
    conn.on_pong(id, 3_000);
    assert_eq!(conn.ping_interval_ms(&config), 5_000);
}

#[test]
fn test_timeout_after_silence() {
    let config = liveness();
    let mut conn = established(NeighborToken::new(1));
    assert!(!conn.timed_out(19_999, &config));
    conn.touch(10_000);
    assert!(!conn.timed_out(29_999, &config));
    assert!(conn.timed_out(30_000, &config));
}

#[test]
fn test_handshaking_never_pings() {
    let (keys, _) = key_pair();
    let conn = connection(NeighborToken::new(1), ConnectionRole::Requester, keys);
    assert!(!conn.ping_due(1_000_000, &liveness()));
}

// ===== Teardown and disposal =====

#[test]
fn test_teardown_then_dispose() {
    let config = liveness();
    let mut conn = established(NeighborToken::new(1));
    assert!(conn.begin_teardown(100));
    assert!(!conn.begin_teardown(200));
    assert!(!conn.is_established());
    assert!(conn.link().is_some());

    assert!(!conn.teardown_expired(1_099, &config));
    assert!(conn.teardown_expired(1_100, &config));

    assert!(conn.dispose(1_100));
    assert!(!conn.dispose(1_200));
    assert!(conn.link().is_none());
    assert_eq!(conn.state(), ConnectionState::Disposed { at_ms: 1_100 });
    assert!(conn.init_p2p_stream(addr(3), NeighborToken::new(3)).is_err());
}

#[test]
fn test_disposed_slot_reclaimed_after_grace() {
    let config = liveness();
    let mut table = NeighborTable::new(100);
    let token = table.allocate(established).unwrap();
    assert!(table.hmac_key(token).is_some());

    table.get_mut(token).unwrap().dispose(1_000);
    assert!(table.hmac_key(token).is_none());
    assert_eq!(table.established_count(), 0);
    assert_eq!(table.len(), 1);

    assert!(table.reclaim(3_999, &config).is_empty());
    assert_eq!(table.reclaim(4_000, &config), vec![token]);
    assert!(table.is_empty());
}

// ===== Table =====

#[test]
fn test_tokens_unique_per_slot() {
    let mut table = NeighborTable::new(100);
    let mut slots = HashSet::new();
    for _ in 0..500 {
        let token = table.allocate(established).unwrap();
        assert!(slots.insert(token.slot()));
        assert_eq!(table.get(token).unwrap().local_token(), token);
    }
    assert_eq!(table.established_count(), 500);
}

#[test]
fn test_find_by_remote_skips_disposed() {
    let mut table = NeighborTable::new(100);
    let token = table.allocate(established).unwrap();
    let remote = *table.get(token).unwrap().remote_id();
    assert_eq!(table.find_by_remote(&remote), Some(token));

    table.get_mut(token).unwrap().dispose(0);
    assert_eq!(table.find_by_remote(&remote), None);
}

#[test]
fn test_busy_sectors_from_established() {
    let mut table = NeighborTable::new(100);
    let local = crate::routing::Coordinates::of(Identity::generate().id());
    assert!(table.busy_sectors(&local).is_empty());

    let token = table.allocate(established).unwrap();
    let remote = *table.get(token).unwrap().remote_coordinates();
    let busy = table.busy_sectors(&local);
    assert_eq!(busy.len(), 1);
    assert!(busy.contains(local.sector_of(&remote)));
}
