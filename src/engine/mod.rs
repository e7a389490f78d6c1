//! Registration Engine
//!
//! One peer's protocol state machine. The engine owns the neighbor table,
//! the pending-wait set and every in-flight handshake. It is driven by three
//! inputs (inbound datagrams, a fixed tick and finished proof-of-work
//! searches) and produces three outputs: datagrams in the outbox, events in
//! the event queue, and puzzle searches in the job queue. The runtime
//! drains all of them after every call.
//!
//! The engine never reads a clock. Every entry point takes the current
//! engine time in Unix milliseconds, so scenario tests run on an explicit
//! simulated clock.
//!
//! ## Roles
//!
//! For a given request id a peer is exactly one of: the requester, a relay
//! (proxy) between two hops, or the responder that accepted the request.
//! The relay and responder tables double as the in-flight guard that turns
//! routing loops into `Duplicate` rejections.

mod dispatch;
mod invite;
mod liveness;
mod pow;
mod register;
mod relay;
mod responder;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::{debug, warn};

use crate::admission::AdmissionFilter;
use crate::config::NodeConfig;
use crate::crypto::{CryptoError, EcdhPublicKey, HmacKey};
use crate::identity::{Identity, RegistrationId};
use crate::neighbor::{
    ConnectionRole, ConnectionState, NeighborError, NeighborTable, NeighborToken, TokenError,
};
use crate::reliable::{
    OutboundDatagram, Outbox, PendingRequests, RequestError, ResponderCache, ResponseMatcher,
};
use crate::routing::{Coordinates, SectorSet};
use crate::wire::{
    peek_token, request_prefix, DecodeError, EncodeError, FailurePacket, HopAuth, HopLink,
    InviteAck1, Npack, PacketType, RegisterAck1, RequestId, StatusCode,
};

pub use pow::{PowJob, PowSolution};

use invite::{InviteAcceptance, InviteRoute};
use register::Registration;
use relay::RegisterRelay;
use responder::Acceptance;

/// Errors returned by engine API calls.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown neighbor {0}")]
    UnknownNeighbor(NeighborToken),

    #[error("neighbor {0} is not established")]
    NotEstablished(NeighborToken),

    #[error("no established neighbors")]
    NoNeighbors,

    #[error("no neighbor is closer to {0:?}")]
    NoRoute(RegistrationId),

    #[error("cannot address a request to ourselves")]
    SelfRequest,

    #[error("hop {0} can no longer be reached")]
    HopUnavailable(Hop),

    #[error("session description too long: {len} bytes (max {max})")]
    DescriptionTooLong { len: usize, max: usize },

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("request error: {0}")]
    Request(#[from] RequestError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("neighbor error: {0}")]
    Neighbor(#[from] NeighborError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Why a handshake driven by this peer did not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("rejected: {0}")]
    Rejected(StatusCode),

    #[error("handshake timed out")]
    Timeout,

    #[error("signature or confirmation did not verify")]
    AuthenticationFailed,

    #[error("key agreement failed: {0}")]
    KeyExchange(String),

    #[error("proof of work not found within {0} attempts")]
    ProofOfWorkExhausted(u64),

    #[error("neighbor connection lost")]
    ConnectionLost,

    #[error("local resources exhausted: {0}")]
    Resource(String),
}

/// Notifications for the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// Our registration finished; `token` is the new neighbor connection.
    RegistrationCompleted {
        request_id: RequestId,
        token: NeighborToken,
        remote: RegistrationId,
    },
    RegistrationFailed {
        request_id: RequestId,
        error: HandshakeError,
    },
    /// A connection reached the established state, on either side.
    NeighborEstablished {
        token: NeighborToken,
        remote: RegistrationId,
        role: ConnectionRole,
    },
    /// An established connection was torn down or timed out.
    NeighborDisposed {
        token: NeighborToken,
        remote: RegistrationId,
    },
    /// We are the destination of an INVITE and acknowledged it.
    InviteReceived {
        request_id: RequestId,
        from: RegistrationId,
        session_description: Vec<u8>,
        hops: u8,
    },
    /// Our INVITE reached its destination and was confirmed.
    InviteCompleted {
        request_id: RequestId,
        destination: RegistrationId,
        session_description: Vec<u8>,
        hops: u8,
    },
    InviteFailed {
        request_id: RequestId,
        error: HandshakeError,
    },
}

/// Snapshot of one live neighbor connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborInfo {
    pub token: NeighborToken,
    pub remote: RegistrationId,
    pub role: ConnectionRole,
    pub state: ConnectionState,
    pub endpoint: Option<SocketAddr>,
    pub rtt_ms: Option<u64>,
}

/// Decides whether to accept an INVITE addressed to us. Returns our session
/// description, or the status to reject with.
pub type InviteAcceptor =
    Box<dyn FnMut(&RegistrationId, &[u8]) -> Result<Vec<u8>, StatusCode> + Send>;

// ============================================================================
// Hops and waits
// ============================================================================

/// The previous or next hop of a multi-hop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hop {
    /// A joining peer, or its entry peer, addressed by raw endpoint.
    Direct(SocketAddr),
    /// A neighbor connection, by our local token.
    Neighbor(NeighborToken),
}

impl Hop {
    fn from_auth(auth: &HopAuth, from: SocketAddr) -> Self {
        match auth {
            HopAuth::Direct => Hop::Direct(from),
            HopAuth::Relayed { token } => Hop::Neighbor(*token),
        }
    }

    fn is_direct(&self) -> bool {
        matches!(self, Hop::Direct(_))
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Direct(addr) => write!(f, "direct:{}", addr),
            Hop::Neighbor(token) => write!(f, "neighbor:{}", token),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Register,
    Invite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Requester,
    Relay,
    Responder,
}

/// What the engine does when a pending wait resolves or expires.
#[derive(Clone, Debug)]
pub(crate) enum Waiter {
    /// PoW1 response from the entry peer.
    Pow1 { request_id: RequestId },
    /// NPACK for a hop packet we sent to `hop`.
    Npack {
        flow: Flow,
        role: Role,
        request_id: RequestId,
        packet: PacketType,
        hop: Hop,
    },
    /// ACK1 travelling back from `hop`.
    Ack1 {
        flow: Flow,
        role: Role,
        request_id: RequestId,
        hop: Hop,
    },
    /// FAILURE reported by `hop`.
    Failure {
        flow: Flow,
        role: Role,
        request_id: RequestId,
        hop: Hop,
    },
    /// PONG carrying the responder's registration confirmation.
    Confirmation {
        request_id: RequestId,
        token: NeighborToken,
    },
    /// Liveness or teardown PONG.
    Pong { token: NeighborToken, ping_id: u32 },
}

impl Waiter {
    fn belongs_to(&self, flow: Flow, role: Role, id: &RequestId) -> bool {
        match self {
            Waiter::Pow1 { request_id } | Waiter::Confirmation { request_id, .. } => {
                flow == Flow::Register && role == Role::Requester && request_id == id
            }
            Waiter::Npack {
                flow: f,
                role: r,
                request_id,
                ..
            }
            | Waiter::Ack1 {
                flow: f,
                role: r,
                request_id,
                ..
            }
            | Waiter::Failure {
                flow: f,
                role: r,
                request_id,
                ..
            } => *f == flow && *r == role && request_id == id,
            Waiter::Pong { .. } => false,
        }
    }

    /// Waits tied to one SYN attempt: its NPACK and the ACK1/FAILURE race.
    fn is_syn_attempt(&self, flow: Flow, role: Role, id: &RequestId) -> bool {
        let syn_npack = matches!(
            self,
            Waiter::Npack { packet, .. }
                if *packet == PacketType::RegisterSyn || *packet == PacketType::InviteSyn
        );
        let reply = matches!(self, Waiter::Ack1 { .. } | Waiter::Failure { .. });
        (syn_npack || reply) && self.belongs_to(flow, role, id)
    }
}

fn npack_valid(data: &[u8], key: Option<&HmacKey>) -> bool {
    Npack::decode(data, key).is_ok()
}

fn register_ack1_valid(data: &[u8], key: Option<&HmacKey>) -> bool {
    RegisterAck1::decode(data, key).is_ok()
}

fn invite_ack1_valid(data: &[u8], key: Option<&HmacKey>) -> bool {
    InviteAck1::decode(data, key).is_ok()
}

fn failure_valid(data: &[u8], key: Option<&HmacKey>) -> bool {
    FailurePacket::decode(data, key).is_ok()
}

/// Matcher for a datagram from `from` starting with `prefix` that fully
/// decodes (and authenticates, when `key` is set).
fn hop_matcher(
    from: SocketAddr,
    prefix: Vec<u8>,
    key: Option<HmacKey>,
    valid: fn(&[u8], Option<&HmacKey>) -> bool,
) -> ResponseMatcher {
    ResponseMatcher::new(from, prefix).with_filter(move |data| valid(data, key.as_ref()))
}

/// Downstream failures worth another route.
fn is_retryable(code: StatusCode) -> bool {
    matches!(
        code,
        StatusCode::RouteUnavailable
            | StatusCode::HopBudgetExhausted
            | StatusCode::Overloaded
            | StatusCode::Duplicate
            | StatusCode::AlreadyConnected
    )
}

// ============================================================================
// Engine
// ============================================================================

/// Protocol state of one peer.
pub struct Engine {
    // === Identity ===
    identity: Identity,
    coordinates: Coordinates,
    /// Endpoint advertised in transport parameters.
    local_endpoint: SocketAddr,

    // === Configuration ===
    config: NodeConfig,

    // === Connections and request plumbing ===
    neighbors: NeighborTable,
    pending: PendingRequests<Waiter>,
    responder: ResponderCache,
    admission: AdmissionFilter,
    next_seq: u16,
    /// Timestamp of the last request id we issued.
    last_request_ts: u32,

    // === In-flight handshakes ===
    registrations: HashMap<RequestId, Registration>,
    register_relays: HashMap<RequestId, RegisterRelay>,
    acceptances: HashMap<RequestId, Acceptance>,
    invites: HashMap<RequestId, InviteRoute>,
    invite_acceptances: HashMap<RequestId, InviteAcceptance>,
    /// Requester ECDH keys seen recently, with the request that carried
    /// them and when the entry expires.
    recent_ecdh: HashMap<EcdhPublicKey, (RequestId, u64)>,
    /// Insertion order of `recent_ecdh`, for eviction.
    recent_ecdh_order: VecDeque<(EcdhPublicKey, u64)>,
    invite_acceptor: InviteAcceptor,

    // === Outputs ===
    outbox: Outbox,
    events: VecDeque<EngineEvent>,
    pow_jobs: VecDeque<PowJob>,
}

impl Engine {
    pub fn new(
        identity: Identity,
        config: NodeConfig,
        local_endpoint: SocketAddr,
        now_ms: u64,
    ) -> Self {
        let coordinates = Coordinates::of(identity.id());
        Self {
            neighbors: NeighborTable::new(config.limits.token_attempts),
            pending: PendingRequests::new(config.limits.max_pending_requests),
            responder: ResponderCache::new(
                config.handshake.responder_retention_ms,
                config.limits.responder_cache_size,
            ),
            admission: AdmissionFilter::new(config.admission.clone(), now_ms),
            next_seq: rand::random(),
            last_request_ts: 0,
            identity,
            coordinates,
            local_endpoint,
            config,
            registrations: HashMap::new(),
            register_relays: HashMap::new(),
            acceptances: HashMap::new(),
            invites: HashMap::new(),
            invite_acceptances: HashMap::new(),
            recent_ecdh: HashMap::new(),
            recent_ecdh_order: VecDeque::new(),
            invite_acceptor: Box::new(|_, _| Ok(Vec::new())),
            outbox: Outbox::new(),
            events: VecDeque::new(),
            pow_jobs: VecDeque::new(),
        }
    }

    // === Accessors ===

    pub fn id(&self) -> &RegistrationId {
        self.identity.id()
    }

    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    /// Update the advertised endpoint, e.g. after binding an ephemeral port.
    pub fn set_local_endpoint(&mut self, endpoint: SocketAddr) {
        self.local_endpoint = endpoint;
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn neighbor_table(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Live neighbor connections, handshaking ones included.
    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        self.neighbors
            .tokens()
            .into_iter()
            .filter_map(|token| self.neighbors.get(token))
            .filter(|c| c.is_live())
            .map(|c| NeighborInfo {
                token: c.local_token(),
                remote: *c.remote_id(),
                role: c.role(),
                state: c.state(),
                endpoint: c.remote_endpoint(),
                rtt_ms: c.rtt_ms(),
            })
            .collect()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Requests this peer is relaying or answering.
    pub fn routed_requests(&self) -> usize {
        self.register_relays.len()
            + self.acceptances.len()
            + self.invites.values().filter(|r| r.upstream.is_some()).count()
            + self.invite_acceptances.len()
    }

    /// Requester ephemeral keys currently held for reuse detection.
    pub fn recent_ephemeral_keys(&self) -> usize {
        self.recent_ecdh.len()
    }

    pub fn set_invite_acceptor(
        &mut self,
        acceptor: impl FnMut(&RegistrationId, &[u8]) -> Result<Vec<u8>, StatusCode> + Send + 'static,
    ) {
        self.invite_acceptor = Box::new(acceptor);
    }

    // === Outputs ===

    pub fn poll_transmit(&mut self) -> Option<OutboundDatagram> {
        self.outbox.pop()
    }

    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    pub fn poll_pow_job(&mut self) -> Option<PowJob> {
        self.pow_jobs.pop_front()
    }

    // === Shared helpers ===

    pub(in crate::engine) fn next_seq(&mut self) -> u16 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }

    /// Request id for a new request of ours. Timestamps are strictly
    /// increasing per engine, so two requests in the same second stay
    /// distinct even after the first one finished.
    pub(in crate::engine) fn fresh_request_id(&mut self, now_ms: u64) -> RequestId {
        let now_s = (now_ms / 1000) as u32;
        let timestamp = now_s.max(self.last_request_ts.saturating_add(1));
        self.last_request_ts = timestamp;
        RequestId::new(*self.identity.id(), timestamp)
    }

    /// Destination and framing for packets sent to `hop`.
    pub(in crate::engine) fn hop_link(&self, hop: Hop) -> Option<(SocketAddr, HopLink)> {
        match hop {
            Hop::Direct(addr) => Some((addr, HopLink::Direct)),
            Hop::Neighbor(token) => {
                let conn = self.neighbors.get(token)?;
                Some((conn.remote_endpoint()?, conn.link()?))
            }
        }
    }

    /// Framing of packets we receive from `hop`.
    pub(in crate::engine) fn hop_auth(hop: Hop) -> HopAuth {
        match hop {
            Hop::Direct(_) => HopAuth::Direct,
            Hop::Neighbor(token) => HopAuth::Relayed { token },
        }
    }

    pub(in crate::engine) fn hop_key(&self, hop: Hop) -> Option<HmacKey> {
        match hop {
            Hop::Direct(_) => None,
            Hop::Neighbor(token) => self.neighbors.hmac_key(token).cloned(),
        }
    }

    /// Key for the connection a received datagram is addressed to.
    pub(in crate::engine) fn key_for(&self, data: &[u8]) -> Option<HmacKey> {
        peek_token(data)
            .ok()
            .flatten()
            .and_then(|token| self.neighbors.hmac_key(token).cloned())
    }

    pub(in crate::engine) fn touch(&mut self, hop: Hop, now_ms: u64) {
        if let Hop::Neighbor(token) = hop {
            if let Some(conn) = self.neighbors.get_mut(token) {
                conn.touch(now_ms);
            }
        }
    }

    /// Neighbor count and busy sectors we advertise in PING and PONG.
    pub(in crate::engine) fn advertised_load(&self) -> (u8, SectorSet) {
        let count = self.neighbors.established_count().min(u8::MAX as usize) as u8;
        (count, self.neighbors.busy_sectors(&self.coordinates))
    }

    pub(in crate::engine) fn log_decode_failure(
        &self,
        packet_type: PacketType,
        from: SocketAddr,
        data: &[u8],
        error: &DecodeError,
    ) {
        let established = peek_token(data)
            .ok()
            .flatten()
            .and_then(|token| self.neighbors.get(token))
            .is_some_and(|c| c.is_established());
        if *error == DecodeError::InvalidHmac && established {
            warn!(
                from = %from,
                packet = %packet_type,
                "Authentication failed on established connection, dropping"
            );
        } else {
            debug!(from = %from, packet = %packet_type, error = %error, "Dropping packet");
        }
    }

    /// Send a hop packet built by `encode` and wait for its NPACK.
    pub(in crate::engine) fn send_hop(
        &mut self,
        hop: Hop,
        seq: u16,
        encode: impl FnOnce(&HopLink) -> Result<Vec<u8>, EncodeError>,
        waiter: Waiter,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let (addr, link) = self.hop_link(hop).ok_or(EngineError::HopUnavailable(hop))?;
        let data = encode(&link)?;
        let matcher = hop_matcher(
            addr,
            Npack::prefix(&Self::hop_auth(hop), seq),
            self.hop_key(hop),
            npack_valid,
        );
        self.pending.send_and_wait(
            addr,
            Some(data),
            matcher,
            now_ms + self.config.handshake.hop_timeout_ms,
            &self.config.retransmit,
            waiter,
            now_ms,
            &mut self.outbox,
        )?;
        Ok(())
    }

    /// Wait for an ACK1 or FAILURE for `request_id` coming back from `hop`.
    #[allow(clippy::too_many_arguments)]
    pub(in crate::engine) fn await_reply(
        &mut self,
        hop: Hop,
        packet_type: PacketType,
        extra_flags: u8,
        request_id: RequestId,
        waiter: Waiter,
        timeout_ms: u64,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let (addr, _) = self.hop_link(hop).ok_or(EngineError::HopUnavailable(hop))?;
        let valid: fn(&[u8], Option<&HmacKey>) -> bool = match packet_type {
            PacketType::RegisterAck1 => register_ack1_valid,
            PacketType::InviteAck1 => invite_ack1_valid,
            _ => failure_valid,
        };
        let prefix = request_prefix(packet_type, &Self::hop_auth(hop), extra_flags, &request_id);
        let matcher = hop_matcher(addr, prefix, self.hop_key(hop), valid);
        self.pending.send_and_wait(
            addr,
            None,
            matcher,
            now_ms + timeout_ms,
            &self.config.retransmit,
            waiter,
            now_ms,
            &mut self.outbox,
        )?;
        Ok(())
    }

    /// Answer a hop packet with an NPACK, cached for retransmissions.
    pub(in crate::engine) fn acknowledge(
        &mut self,
        request: &[u8],
        from: SocketAddr,
        source: Hop,
        seq: u16,
        status: StatusCode,
        now_ms: u64,
    ) {
        let Some((_, link)) = self.hop_link(source) else {
            debug!(source = %source, "No link to acknowledge on");
            return;
        };
        match (Npack { seq, status }).encode(&link) {
            Ok(bytes) => self
                .responder
                .respond(request, from, bytes, now_ms, &mut self.outbox),
            Err(e) => debug!(error = %e, "Failed to encode NPACK"),
        }
    }

    /// Report a failure one hop upstream.
    pub(in crate::engine) fn send_failure(
        &mut self,
        hop: Hop,
        request_id: RequestId,
        code: StatusCode,
        flow: Flow,
        role: Role,
        now_ms: u64,
    ) {
        let failure = FailurePacket {
            request_id,
            seq: self.next_seq(),
            code,
        };
        let waiter = Waiter::Npack {
            flow,
            role,
            request_id,
            packet: PacketType::Failure,
            hop,
        };
        if let Err(e) = self.send_hop(hop, failure.seq, |l| failure.encode(l), waiter, now_ms) {
            debug!(request = %request_id, error = %e, "Failed to send FAILURE upstream");
        }
    }

    /// Decode a FAILURE that matched a wait on `hop` and acknowledge it.
    pub(in crate::engine) fn accept_failure(
        &mut self,
        hop: Hop,
        response: &[u8],
        now_ms: u64,
    ) -> Option<StatusCode> {
        let (from, _) = self.hop_link(hop)?;
        let key = self.hop_key(hop);
        let failure = FailurePacket::decode(response, key.as_ref()).ok()?.packet;
        self.touch(hop, now_ms);
        self.acknowledge(response, from, hop, failure.seq, StatusCode::Ok, now_ms);
        debug!(request = %failure.request_id, hop = %hop, code = %failure.code, "Received FAILURE");
        Some(failure.code)
    }

    pub(in crate::engine) fn cancel_syn_attempt(&mut self, flow: Flow, role: Role, id: RequestId) {
        self.pending
            .cancel_where(|w| w.is_syn_attempt(flow, role, &id));
    }

    pub(in crate::engine) fn cancel_flow(&mut self, flow: Flow, role: Role, id: RequestId) {
        self.pending.cancel_where(|w| w.belongs_to(flow, role, &id));
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", self.identity.id())
            .field("local_endpoint", &self.local_endpoint)
            .field("neighbors", &self.neighbors.established_count())
            .field("pending", &self.pending.len())
            .field("registrations", &self.registrations.len())
            .field("routed", &self.routed_requests())
            .finish()
    }
}
