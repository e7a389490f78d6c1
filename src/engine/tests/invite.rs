use super::*;
use crate::wire::MAX_SESSION_DESCRIPTION;

fn received(net: &TestNet, index: usize, request_id: RequestId) -> Option<(Vec<u8>, u8)> {
    net.events(index).iter().find_map(|e| match e {
        EngineEvent::InviteReceived {
            request_id: id,
            session_description,
            hops,
            ..
        } if *id == request_id => Some((session_description.clone(), *hops)),
        _ => None,
    })
}

fn completed(net: &TestNet, index: usize, request_id: RequestId) -> Option<(Vec<u8>, u8)> {
    net.events(index).iter().find_map(|e| match e {
        EngineEvent::InviteCompleted {
            request_id: id,
            session_description,
            hops,
            ..
        } if *id == request_id => Some((session_description.clone(), *hops)),
        _ => None,
    })
}

fn invite_failure(net: &TestNet, index: usize, request_id: RequestId) -> Option<HandshakeError> {
    net.events(index).iter().find_map(|e| match e {
        EngineEvent::InviteFailed { request_id: id, error } if *id == request_id => {
            Some(error.clone())
        }
        _ => None,
    })
}

fn answer_with(net: &mut TestNet, index: usize, answer: &'static [u8]) {
    net.engines[index].set_invite_acceptor(move |_, _| Ok(answer.to_vec()));
}

#[test]
fn test_invite_neighbor() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    answer_with(&mut net, 1, b"answer");

    let target = net.id(1);
    let request_id = net.engines[0]
        .invite(target, b"offer".to_vec(), net.now_ms)
        .unwrap();
    net.run();

    assert_eq!(received(&net, 1, request_id), Some((b"offer".to_vec(), 1)));
    assert_eq!(completed(&net, 0, request_id), Some((b"answer".to_vec(), 1)));
    assert!(net.events(1).iter().any(|e| matches!(
        e,
        EngineEvent::InviteReceived { from, .. } if *from == net.id(0)
    )));
    assert_eq!(net.engines[0].pending_requests(), 0);
    assert_eq!(net.engines[1].pending_requests(), 0);
    assert_eq!(net.engines[1].routed_requests(), 0);
}

#[test]
fn test_invite_reroutes_around_dead_end() {
    // 0:A 1:B 2:X 3:Y 4:D. X is B's closest neighbor to D but has no
    // onward route, so B falls back to Y.
    let identities = sample_identities(5, |c| {
        let d = |i: usize| c[i].distance(&c[4]);
        d(2) < d(3) && d(3) < d(1) && d(1) < d(0)
    });
    let mut net = TestNet::with_identities(identities);
    net.connect(1, 2);
    net.connect(1, 3);
    net.connect(3, 4);
    net.connect(1, 0);
    answer_with(&mut net, 4, b"sdp-answer");

    let target = net.id(4);
    let request_id = net.engines[0]
        .invite(target, b"sdp-offer".to_vec(), net.now_ms)
        .unwrap();
    net.run();

    assert_eq!(completed(&net, 0, request_id), Some((b"sdp-answer".to_vec(), 3)));
    assert_eq!(received(&net, 4, request_id), Some((b"sdp-offer".to_vec(), 3)));
    assert!(net.sent_of(2, PacketType::Failure).count() >= 1);
    assert_eq!(net.sent_of(1, PacketType::InviteSyn).count(), 2);
    for engine in &net.engines {
        assert_eq!(engine.routed_requests(), 0);
    }
}

#[test]
fn test_invite_rejected_by_destination() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    net.engines[1].set_invite_acceptor(|_, _| Err(StatusCode::Overloaded));

    let target = net.id(1);
    let request_id = net.engines[0]
        .invite(target, b"offer".to_vec(), net.now_ms)
        .unwrap();
    net.run();

    assert_eq!(
        invite_failure(&net, 0, request_id),
        Some(HandshakeError::Rejected(StatusCode::Overloaded))
    );
    assert!(received(&net, 1, request_id).is_none());
    assert_eq!(net.engines[1].routed_requests(), 0);
}

#[test]
fn test_invite_argument_errors() {
    let mut net = TestNet::new(2);
    let own = net.id(0);
    let other = net.id(1);
    let now = net.now_ms;

    assert!(matches!(
        net.engines[0].invite(own, Vec::new(), now),
        Err(EngineError::SelfRequest)
    ));
    assert!(matches!(
        net.engines[0].invite(other, Vec::new(), now),
        Err(EngineError::NoNeighbors)
    ));
    assert!(matches!(
        net.engines[0].invite(other, vec![0u8; MAX_SESSION_DESCRIPTION + 1], now),
        Err(EngineError::DescriptionTooLong { .. })
    ));
}

#[test]
fn test_invite_without_closer_neighbor() {
    let mut identities = sample_identities(3, |c| c[1].distance(&c[2]) >= c[0].distance(&c[2]));
    let destination = *identities[2].id();
    identities.truncate(2);
    let mut net = TestNet::with_identities(identities);
    net.connect(0, 1);

    let result = net.engines[0].invite(destination, b"offer".to_vec(), net.now_ms);
    assert!(matches!(result, Err(EngineError::NoRoute(id)) if id == destination));
    assert_eq!(net.sent_of(0, PacketType::InviteSyn).count(), 0);
}

#[test]
fn test_invite_unanswered_fails() {
    let mut net = TestNet::new(2);
    net.connect(0, 1);
    let silent = endpoint(1);
    net.set_drop(move |from, _, _| from == silent);

    let target = net.id(1);
    let request_id = net.engines[0]
        .invite(target, b"offer".to_vec(), net.now_ms)
        .unwrap();
    net.run();
    assert!(net.advance_until(25_000, |net| invite_failure(net, 0, request_id).is_some()));
    assert!(net.sent_of(0, PacketType::InviteSyn).count() > 1);
    assert!(completed(&net, 0, request_id).is_none());
}
