//! One authenticated channel to a neighbor.

use std::fmt;
use std::net::SocketAddr;

use super::{NeighborError, NeighborToken};
use crate::config::LivenessConfig;
use crate::crypto::{HmacKey, LinkKeys};
use crate::identity::RegistrationId;
use crate::routing::{Coordinates, SectorSet};
use crate::wire::{HopLink, RequestId};

/// Which side of the REGISTER handshake created this connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    Requester,
    Responder,
}

/// Lifecycle of a neighbor connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Keys derived, waiting for the handshake to finish.
    Handshaking,
    /// Confirmed end to end; carries liveness and routing traffic.
    Established,
    /// Peer asked to close; disposed once the grace period ends.
    TearingDown { since_ms: u64 },
    /// Never responds again. The token slot is freed after a grace delay.
    Disposed { at_ms: u64 },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Established => "established",
            ConnectionState::TearingDown { .. } => "tearing-down",
            ConnectionState::Disposed { .. } => "disposed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub struct NeighborConnection {
    local_token: NeighborToken,
    role: ConnectionRole,
    state: ConnectionState,
    remote_id: RegistrationId,
    remote_coordinates: Coordinates,
    /// Handshake that created the connection.
    request_id: RequestId,
    keys: LinkKeys,

    // Set exactly once by `init_p2p_stream`
    remote_token: Option<NeighborToken>,
    remote_endpoint: Option<SocketAddr>,
    hmac_key: Option<HmacKey>,

    // Liveness
    created_ms: u64,
    last_seen_ms: u64,
    last_ping_sent_ms: u64,
    rtt_ms: Option<u64>,
    outstanding_ping: Option<(u32, u64)>,
    next_ping_id: u32,

    // Remote load, advertised in PING/PONG
    remote_neighbor_count: u8,
    remote_busy_sectors: SectorSet,
}

impl NeighborConnection {
    pub fn new(
        local_token: NeighborToken,
        role: ConnectionRole,
        remote_id: RegistrationId,
        request_id: RequestId,
        keys: LinkKeys,
        now_ms: u64,
    ) -> Self {
        Self {
            local_token,
            role,
            state: ConnectionState::Handshaking,
            remote_id,
            remote_coordinates: Coordinates::of(&remote_id),
            request_id,
            keys,
            remote_token: None,
            remote_endpoint: None,
            hmac_key: None,
            created_ms: now_ms,
            last_seen_ms: now_ms,
            last_ping_sent_ms: now_ms,
            rtt_ms: None,
            outstanding_ping: None,
            next_ping_id: rand::random(),
            remote_neighbor_count: 0,
            remote_busy_sectors: SectorSet::new(),
        }
    }

    // === Accessors ===

    pub fn local_token(&self) -> NeighborToken {
        self.local_token
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_id(&self) -> &RegistrationId {
        &self.remote_id
    }

    pub fn remote_coordinates(&self) -> &Coordinates {
        &self.remote_coordinates
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn keys(&self) -> &LinkKeys {
        &self.keys
    }

    pub fn remote_token(&self) -> Option<NeighborToken> {
        self.remote_token
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint
    }

    /// Key verifying packets addressed to our token, once the stream is up.
    pub fn hmac_key(&self) -> Option<&HmacKey> {
        self.hmac_key.as_ref()
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        self.rtt_ms
    }

    pub fn remote_neighbor_count(&self) -> u8 {
        self.remote_neighbor_count
    }

    pub fn remote_busy_sectors(&self) -> &SectorSet {
        &self.remote_busy_sectors
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state, ConnectionState::Disposed { .. })
    }

    /// Still answering packets (anything but disposed).
    pub fn is_live(&self) -> bool {
        !self.is_disposed()
    }

    /// Framing for packets sent to the remote over this connection.
    pub fn link(&self) -> Option<HopLink> {
        match (self.remote_token, &self.hmac_key) {
            (Some(token), Some(hmac_key)) if self.is_live() => Some(HopLink::Relayed {
                token,
                hmac_key: hmac_key.clone(),
            }),
            _ => None,
        }
    }

    // === Handshake ===

    /// Fix the remote's transport params and the shared authentication
    /// key. Called once per side after ACK2.
    pub fn init_p2p_stream(
        &mut self,
        remote_endpoint: SocketAddr,
        remote_token: NeighborToken,
    ) -> Result<(), NeighborError> {
        if self.hmac_key.is_some() {
            return Err(NeighborError::StreamAlreadyInitialized(self.local_token));
        }
        if self.is_disposed() {
            return Err(NeighborError::Disposed(self.local_token));
        }
        self.remote_endpoint = Some(remote_endpoint);
        self.remote_token = Some(remote_token);
        self.hmac_key = Some(self.keys.hmac_key().clone());
        Ok(())
    }

    /// Handshake confirmed end to end.
    pub fn mark_established(&mut self, now_ms: u64) -> Result<(), NeighborError> {
        match self.state {
            ConnectionState::Handshaking if self.hmac_key.is_some() => {
                self.state = ConnectionState::Established;
                self.last_seen_ms = now_ms;
                self.last_ping_sent_ms = now_ms;
                Ok(())
            }
            ConnectionState::Established => Ok(()),
            _ => Err(NeighborError::NotHandshaking(self.local_token)),
        }
    }

    // === Liveness ===

    /// Any authenticated packet from the remote.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
    }

    pub fn update_remote_load(&mut self, neighbor_count: u8, busy_sectors: SectorSet) {
        self.remote_neighbor_count = neighbor_count;
        self.remote_busy_sectors = busy_sectors;
    }

    /// Idle time after which a ping is sent: RTT times the multiplier,
    /// clamped to the configured bounds.
    pub fn ping_interval_ms(&self, config: &LivenessConfig) -> u64 {
        let rtt = self.rtt_ms.unwrap_or(config.initial_rtt_ms);
        let max = config.max_ping_interval_ms.max(config.min_ping_interval_ms);
        rtt.saturating_mul(config.rtt_multiplier)
            .clamp(config.min_ping_interval_ms, max)
    }

    pub fn ping_due(&self, now_ms: u64, config: &LivenessConfig) -> bool {
        if !self.is_established() {
            return false;
        }
        let idle_since = self.last_seen_ms.max(self.last_ping_sent_ms);
        now_ms.saturating_sub(idle_since) >= self.ping_interval_ms(config)
    }

    /// Record an outgoing ping and return its id.
    pub fn begin_ping(&mut self, now_ms: u64) -> u32 {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.outstanding_ping = Some((id, now_ms));
        self.last_ping_sent_ms = now_ms;
        id
    }

    /// Match a PONG to the outstanding ping. Returns the measured RTT.
    pub fn on_pong(&mut self, ping_id: u32, now_ms: u64) -> Option<u64> {
        self.touch(now_ms);
        match self.outstanding_ping {
            Some((id, sent_ms)) if id == ping_id => {
                self.outstanding_ping = None;
                let rtt = now_ms.saturating_sub(sent_ms);
                // Smooth like TCP's SRTT with alpha 1/8
                self.rtt_ms = Some(match self.rtt_ms {
                    Some(prev) => (prev * 7 + rtt) / 8,
                    None => rtt,
                });
                Some(rtt)
            }
            _ => None,
        }
    }

    /// No liveness signal for longer than the neighbor timeout.
    pub fn timed_out(&self, now_ms: u64, config: &LivenessConfig) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) >= config.neighbor_timeout_ms
    }

    // === Teardown ===

    /// Enter the teardown grace state. Returns false if already closing.
    pub fn begin_teardown(&mut self, now_ms: u64) -> bool {
        match self.state {
            ConnectionState::Handshaking | ConnectionState::Established => {
                self.state = ConnectionState::TearingDown { since_ms: now_ms };
                true
            }
            _ => false,
        }
    }

    pub fn teardown_expired(&self, now_ms: u64, config: &LivenessConfig) -> bool {
        match self.state {
            ConnectionState::TearingDown { since_ms } => {
                now_ms.saturating_sub(since_ms) >= config.teardown_grace_ms
            }
            _ => false,
        }
    }

    /// Dispose the connection. Idempotent: returns true only the first time.
    pub fn dispose(&mut self, now_ms: u64) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.state = ConnectionState::Disposed { at_ms: now_ms };
        self.outstanding_ping = None;
        true
    }

    /// The token slot may be reused.
    pub fn slot_reclaimable(&self, now_ms: u64, config: &LivenessConfig) -> bool {
        match self.state {
            ConnectionState::Disposed { at_ms } => {
                now_ms.saturating_sub(at_ms) >= config.disposal_grace_ms
            }
            _ => false,
        }
    }
}
