//! Scenario tests: several engines wired together over a simulated
//! network with an explicit clock.

use super::*;
use crate::reliable::OutboundDatagram;
use crate::routing::Coordinates;
use crate::wire::{packet_type, PacketType};
use std::net::{IpAddr, Ipv4Addr};

mod invite;
mod liveness;
mod register;

pub(super) const START_MS: u64 = 1_700_000_000_000;
pub(super) const TICK_MS: u64 = 100;

/// Fixed endpoint of engine `index`.
pub(super) fn endpoint(index: usize) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, index as u8 + 1)), 4100)
}

type DropRule = Box<dyn Fn(SocketAddr, &OutboundDatagram, u64) -> bool>;

/// A datagram that left an engine, whether or not it was delivered.
pub(super) struct Sent {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
    pub at_ms: u64,
}

impl Sent {
    pub fn packet_type(&self) -> Option<PacketType> {
        packet_type(&self.data).ok()
    }
}

pub(super) struct TestNet {
    pub engines: Vec<Engine>,
    pub now_ms: u64,
    pub sent: Vec<Sent>,
    events: Vec<Vec<EngineEvent>>,
    drop_rule: Option<DropRule>,
}

impl TestNet {
    pub fn new(count: usize) -> Self {
        Self::with_identities((0..count).map(|_| Identity::generate()).collect())
    }

    pub fn with_identities(identities: Vec<Identity>) -> Self {
        Self::configured(identities, |_, _| {})
    }

    /// Engines with per-index configuration tweaks.
    pub fn configured(identities: Vec<Identity>, configure: impl Fn(usize, &mut NodeConfig)) -> Self {
        let engines: Vec<Engine> = identities
            .into_iter()
            .enumerate()
            .map(|(i, identity)| {
                let mut config = NodeConfig::default();
                configure(i, &mut config);
                Engine::new(identity, config, endpoint(i), START_MS)
            })
            .collect();
        let events = engines.iter().map(|_| Vec::new()).collect();
        Self {
            engines,
            now_ms: START_MS,
            sent: Vec::new(),
            events,
            drop_rule: None,
        }
    }

    pub fn id(&self, index: usize) -> RegistrationId {
        *self.engines[index].id()
    }

    pub fn coordinates(&self, index: usize) -> Coordinates {
        *self.engines[index].coordinates()
    }

    fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        (0..self.engines.len()).find(|i| endpoint(*i) == addr)
    }

    /// Drop every datagram the rule matches until cleared.
    pub fn set_drop(&mut self, rule: impl Fn(SocketAddr, &OutboundDatagram, u64) -> bool + 'static) {
        self.drop_rule = Some(Box::new(rule));
    }

    pub fn clear_drop(&mut self) {
        self.drop_rule = None;
    }

    /// Solve queued puzzles and deliver datagrams until the network is
    /// quiet at the current instant.
    pub fn run(&mut self) {
        for _ in 0..10_000 {
            let mut outbound = Vec::new();
            let mut progressed = false;
            for (i, engine) in self.engines.iter_mut().enumerate() {
                while let Some(job) = engine.poll_pow_job() {
                    engine.on_pow_solved(job.solve(), self.now_ms);
                    progressed = true;
                }
                while let Some(datagram) = engine.poll_transmit() {
                    outbound.push((endpoint(i), datagram));
                }
                while let Some(event) = engine.poll_event() {
                    self.events[i].push(event);
                }
            }

            for (from, datagram) in outbound {
                progressed = true;
                let dropped = self
                    .drop_rule
                    .as_ref()
                    .is_some_and(|rule| rule(from, &datagram, self.now_ms));
                self.sent.push(Sent {
                    from,
                    to: datagram.to,
                    data: datagram.data.clone(),
                    at_ms: self.now_ms,
                });
                if dropped {
                    continue;
                }
                if let Some(j) = self.index_of(datagram.to) {
                    self.engines[j].on_datagram(from, &datagram.data, self.now_ms);
                }
            }

            if !progressed {
                return;
            }
        }
        panic!("network did not settle");
    }

    /// Move the clock forward in fixed ticks.
    pub fn advance(&mut self, duration_ms: u64) {
        let end = self.now_ms + duration_ms;
        while self.now_ms < end {
            self.now_ms += TICK_MS;
            for engine in &mut self.engines {
                engine.on_tick(self.now_ms);
            }
            self.run();
        }
    }

    /// Advance until `done` holds or `limit_ms` passes.
    pub fn advance_until(&mut self, limit_ms: u64, mut done: impl FnMut(&TestNet) -> bool) -> bool {
        let end = self.now_ms + limit_ms;
        while !done(self) {
            if self.now_ms >= end {
                return false;
            }
            self.advance(TICK_MS);
        }
        true
    }

    pub fn events(&self, index: usize) -> &[EngineEvent] {
        &self.events[index]
    }

    pub fn clear_events(&mut self) {
        for events in &mut self.events {
            events.clear();
        }
    }

    pub fn completed(&self, index: usize, request_id: RequestId) -> Option<(NeighborToken, RegistrationId)> {
        self.events[index].iter().find_map(|e| match e {
            EngineEvent::RegistrationCompleted {
                request_id: id,
                token,
                remote,
            } if *id == request_id => Some((*token, *remote)),
            _ => None,
        })
    }

    pub fn failed(&self, index: usize, request_id: RequestId) -> Option<HandshakeError> {
        self.events[index].iter().find_map(|e| match e {
            EngineEvent::RegistrationFailed { request_id: id, error } if *id == request_id => {
                Some(error.clone())
            }
            _ => None,
        })
    }

    /// Token `index` holds for its connection to `remote`.
    pub fn token_for(&self, index: usize, remote: usize) -> Option<NeighborToken> {
        self.engines[index]
            .neighbor_table()
            .find_by_remote(&self.id(remote))
    }

    pub fn is_established(&self, index: usize, remote: usize) -> bool {
        self.token_for(index, remote)
            .and_then(|t| self.engines[index].neighbor_table().get(t))
            .is_some_and(|c| c.is_established())
    }

    /// Register `requester` directly with `entry`. The entry must have no
    /// neighbors other than ones routing would skip, so it accepts itself.
    pub fn connect(&mut self, requester: usize, entry: usize) -> NeighborToken {
        let request_id = self.engines[requester]
            .register(endpoint(entry), 0, self.now_ms)
            .unwrap();
        self.run();
        assert!(
            self.advance_until(5_000, |net| net.completed(requester, request_id).is_some()),
            "registration {} -> {} did not complete",
            requester,
            entry
        );
        let (token, remote) = self.completed(requester, request_id).unwrap();
        assert_eq!(remote, self.id(entry));
        assert!(self.is_established(entry, requester));
        token
    }

    pub fn sent_of(&self, from: usize, packet: PacketType) -> impl Iterator<Item = &Sent> {
        let from = endpoint(from);
        self.sent
            .iter()
            .filter(move |s| s.from == from && s.packet_type() == Some(packet))
    }
}

/// Identities whose coordinates satisfy `accept`, found by sampling.
pub(super) fn sample_identities(
    count: usize,
    accept: impl Fn(&[Coordinates]) -> bool,
) -> Vec<Identity> {
    for _ in 0..100_000 {
        let identities: Vec<Identity> = (0..count).map(|_| Identity::generate()).collect();
        let coordinates: Vec<Coordinates> =
            identities.iter().map(|i| Coordinates::of(i.id())).collect();
        if accept(&coordinates) {
            return identities;
        }
    }
    panic!("no identity arrangement found");
}

// ============================================================================
// Harness self-checks
// ============================================================================

#[test]
fn test_fresh_engine_is_quiet() {
    let mut net = TestNet::new(2);
    net.run();
    net.advance(1_000);
    assert!(net.sent.is_empty());
    assert!(net.events(0).is_empty());
    assert_eq!(net.engines[0].pending_requests(), 0);
    assert!(net.engines[0].neighbors().is_empty());
}

#[test]
fn test_garbage_datagram_ignored() {
    let mut net = TestNet::new(1);
    net.engines[0].on_datagram(endpoint(5), &[0xff, 0x00, 0x01], START_MS);
    net.engines[0].on_datagram(endpoint(5), &[], START_MS);
    assert!(net.engines[0].poll_transmit().is_none());
    assert!(net.engines[0].poll_event().is_none());
}
