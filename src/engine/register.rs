//! Requester side of REGISTER.
//!
//! ```text
//! direct:   PoW1 ─► challenge ─► PoW2 ─► SYN ─► ACK1 ─► ACK2 ─► PING/PONG ─► CFM
//! relayed:                               SYN ─► ACK1 ─► ACK2 ─► PING/PONG ─► CFM
//! ```
//!
//! Every hop packet waits for its NPACK. The ACK1 wait races a FAILURE wait
//! from the same hop; whichever matches first cancels the other.

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info, warn};

use super::{
    Engine, EngineError, EngineEvent, Flow, HandshakeError, Hop, PowJob, PowSolution, Role,
    Waiter,
};
use crate::admission::PowNonce;
use crate::crypto::{Direction, EphemeralKeypair, TransportParams};
use crate::neighbor::{ConnectionRole, NeighborConnection, NeighborToken};
use crate::reliable::ResponseMatcher;
use crate::wire::{
    Framed, HopAuth, PacketType, PingFlags, PingPacket, Pow1Request, Pow1Response, PongPacket,
    RegisterAck1, RegisterAck2, RegisterCfm, RegisterSyn, RequestId, StatusCode, FLAG_OPTION,
    UNSIGNED,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Stage {
    SolvingPow1,
    AwaitingChallenge,
    SolvingPow2,
    AwaitingAck1,
    AwaitingAck2Ack,
    AwaitingConfirmation,
    AwaitingCfmAck,
}

/// A registration we started.
pub(in crate::engine) struct Registration {
    hop: Hop,
    min_distance: u32,
    pub(super) started_ms: u64,
    stage: Stage,
    keypair: Option<EphemeralKeypair>,
    syn: Option<RegisterSyn>,
    ack1: Option<RegisterAck1>,
    ack2: Option<RegisterAck2>,
    token: Option<NeighborToken>,
}

impl Registration {
    fn new(hop: Hop, min_distance: u32, stage: Stage, now_ms: u64) -> Self {
        Self {
            hop,
            min_distance,
            started_ms: now_ms,
            stage,
            keypair: None,
            syn: None,
            ack1: None,
            ack2: None,
            token: None,
        }
    }
}

/// ACK1 carries the requester's observed endpoint only on a direct hop.
fn ack1_flags(hop: Hop) -> u8 {
    if hop.is_direct() { FLAG_OPTION } else { 0 }
}

impl Engine {
    /// Join through `entry`, a peer we have no connection with yet. Starts
    /// with the two proof-of-work stages.
    pub fn register(
        &mut self,
        entry: SocketAddr,
        min_distance: u32,
        now_ms: u64,
    ) -> Result<RequestId, EngineError> {
        let request_id = self.fresh_request_id(now_ms);
        self.registrations.insert(
            request_id,
            Registration::new(Hop::Direct(entry), min_distance, Stage::SolvingPow1, now_ms),
        );
        self.pow_jobs.push_back(PowJob::Pow1 {
            request_id,
            timestamp: request_id.timestamp,
            claimed_ip: self.local_endpoint.ip(),
            max_attempts: self.config.handshake.pow_max_attempts,
        });
        info!(
            request = %request_id,
            entry = %entry,
            min_distance,
            "Registration started"
        );
        Ok(request_id)
    }

    /// Ask an established neighbor to find us another neighbor. No proof
    /// of work: the neighbor already knows us.
    pub fn register_via_neighbor(
        &mut self,
        token: NeighborToken,
        min_distance: u32,
        now_ms: u64,
    ) -> Result<RequestId, EngineError> {
        let conn = self
            .neighbors
            .get(token)
            .ok_or(EngineError::UnknownNeighbor(token))?;
        if !conn.is_established() {
            return Err(EngineError::NotEstablished(token));
        }

        let request_id = self.fresh_request_id(now_ms);
        self.registrations.insert(
            request_id,
            Registration::new(Hop::Neighbor(token), min_distance, Stage::SolvingPow2, now_ms),
        );
        if let Err(e) = self.send_register_syn(request_id, None, now_ms) {
            self.registrations.remove(&request_id);
            self.cancel_flow(Flow::Register, Role::Requester, request_id);
            return Err(e);
        }
        info!(
            request = %request_id,
            neighbor = %token,
            min_distance,
            "Registration via neighbor started"
        );
        Ok(request_id)
    }

    /// Feed back a finished proof-of-work search.
    pub fn on_pow_solved(&mut self, solution: PowSolution, now_ms: u64) {
        let request_id = solution.job.request_id();
        let Some(stage) = self.registrations.get(&request_id).map(|r| r.stage) else {
            debug!(request = %request_id, "PoW result for finished registration");
            return;
        };
        let Some(nonce) = solution.nonce else {
            let attempts = solution.job.max_attempts();
            self.fail_registration(
                request_id,
                HandshakeError::ProofOfWorkExhausted(attempts),
                now_ms,
            );
            return;
        };

        match (&solution.job, stage) {
            (
                PowJob::Pow1 {
                    timestamp,
                    claimed_ip,
                    ..
                },
                Stage::SolvingPow1,
            ) => self.send_pow1_request(request_id, *timestamp, *claimed_ip, nonce, now_ms),
            (PowJob::Pow2 { .. }, Stage::SolvingPow2) => {
                if let Err(e) = self.send_register_syn(request_id, Some(nonce), now_ms) {
                    self.fail_registration(
                        request_id,
                        HandshakeError::Resource(e.to_string()),
                        now_ms,
                    );
                }
            }
            _ => debug!(request = %request_id, "Stale PoW result"),
        }
    }

    fn send_pow1_request(
        &mut self,
        request_id: RequestId,
        timestamp: u32,
        claimed_ip: IpAddr,
        nonce: PowNonce,
        now_ms: u64,
    ) {
        let Some(Hop::Direct(entry)) = self.registrations.get(&request_id).map(|r| r.hop) else {
            return;
        };
        let request = Pow1Request {
            pow_request_id: rand::random(),
            timestamp,
            claimed_ip,
            nonce,
        };
        let data = match request.encode() {
            Ok(data) => data,
            Err(e) => {
                self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
                return;
            }
        };
        let matcher = ResponseMatcher::new(entry, Pow1Response::prefix(request.pow_request_id))
            .with_filter(|d| Pow1Response::decode(d).is_ok());
        let sent = self.pending.send_and_wait(
            entry,
            Some(data),
            matcher,
            now_ms + self.config.handshake.hop_timeout_ms,
            &self.config.retransmit,
            Waiter::Pow1 { request_id },
            now_ms,
            &mut self.outbox,
        );
        match sent {
            Ok(_) => {
                if let Some(reg) = self.registrations.get_mut(&request_id) {
                    reg.stage = Stage::AwaitingChallenge;
                }
                debug!(request = %request_id, entry = %entry, "Sent PoW1 request");
            }
            Err(e) => {
                self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms)
            }
        }
    }

    pub(in crate::engine) fn on_pow1_response(
        &mut self,
        request_id: RequestId,
        response: &[u8],
        now_ms: u64,
    ) {
        let Ok(response) = Pow1Response::decode(response) else {
            return;
        };
        if !response.status.is_ok() {
            self.fail_registration(request_id, HandshakeError::Rejected(response.status), now_ms);
            return;
        }
        let Some(reg) = self.registrations.get_mut(&request_id) else {
            return;
        };
        if reg.stage != Stage::AwaitingChallenge {
            return;
        }
        reg.stage = Stage::SolvingPow2;
        self.pow_jobs.push_back(PowJob::Pow2 {
            request_id,
            challenge: response.challenge,
            max_attempts: self.config.handshake.pow_max_attempts,
        });
        debug!(request = %request_id, "Received PoW challenge");
    }

    /// Sign and send the SYN, then wait for ACK1 or FAILURE from the hop.
    fn send_register_syn(
        &mut self,
        request_id: RequestId,
        pow2_nonce: Option<PowNonce>,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let Some((hop, min_distance)) = self
            .registrations
            .get(&request_id)
            .map(|r| (r.hop, r.min_distance))
        else {
            return Ok(());
        };
        let (entry_endpoint, _) = self.hop_link(hop).ok_or(EngineError::HopUnavailable(hop))?;

        let keypair = EphemeralKeypair::generate();
        let mut syn = RegisterSyn {
            request_id,
            seq: self.next_seq(),
            requester_ecdh: *keypair.public(),
            min_distance,
            hop_budget: self.config.handshake.hop_budget,
            entry_endpoint,
            signature: UNSIGNED,
            pow2_nonce,
        };
        syn.signature = self.identity.sign(&syn.signed_fields());

        let waiter = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Requester,
            request_id,
            packet: PacketType::RegisterSyn,
            hop,
        };
        self.send_hop(hop, syn.seq, |l| syn.encode(l), waiter, now_ms)?;

        let timeout = self.config.handshake.registration_timeout_ms;
        self.await_reply(
            hop,
            PacketType::RegisterAck1,
            ack1_flags(hop),
            request_id,
            Waiter::Ack1 {
                flow: Flow::Register,
                role: Role::Requester,
                request_id,
                hop,
            },
            timeout,
            now_ms,
        )?;
        self.await_reply(
            hop,
            PacketType::Failure,
            0,
            request_id,
            Waiter::Failure {
                flow: Flow::Register,
                role: Role::Requester,
                request_id,
                hop,
            },
            timeout,
            now_ms,
        )?;

        if let Some(reg) = self.registrations.get_mut(&request_id) {
            reg.stage = Stage::AwaitingAck1;
            reg.keypair = Some(keypair);
            reg.syn = Some(syn);
        }
        debug!(request = %request_id, hop = %hop, "Sent REGISTER SYN");
        Ok(())
    }

    /// ACK1 reached us: derive keys, open our side of the connection and
    /// answer with ACK2.
    pub(in crate::engine) fn on_register_ack1(
        &mut self,
        request_id: RequestId,
        hop: Hop,
        response: &[u8],
        now_ms: u64,
    ) {
        let Some((from, _)) = self.hop_link(hop) else {
            self.fail_registration(request_id, HandshakeError::ConnectionLost, now_ms);
            return;
        };
        let key = self.hop_key(hop);
        let Ok(Framed { packet: ack1, .. }) = RegisterAck1::decode(response, key.as_ref()) else {
            return;
        };
        // ACK1 implies the SYN arrived; its NPACK no longer matters
        self.cancel_syn_attempt(Flow::Register, Role::Requester, request_id);

        let Some(reg) = self.registrations.get_mut(&request_id) else {
            return;
        };
        if reg.stage != Stage::AwaitingAck1 {
            return;
        }
        let (Some(syn), Some(keypair)) = (reg.syn.clone(), reg.keypair.take()) else {
            return;
        };

        if !ack1.status.is_ok() {
            self.acknowledge(response, from, hop, ack1.seq, StatusCode::Ok, now_ms);
            self.fail_registration(request_id, HandshakeError::Rejected(ack1.status), now_ms);
            return;
        }
        if !ack1.verify_signature(&syn) {
            self.acknowledge(response, from, hop, ack1.seq, StatusCode::BadSignature, now_ms);
            self.fail_registration(request_id, HandshakeError::AuthenticationFailed, now_ms);
            return;
        }
        if ack1.responder_id == *self.identity.id()
            || self.neighbors.find_by_remote(&ack1.responder_id).is_some()
        {
            self.acknowledge(response, from, hop, ack1.seq, StatusCode::AlreadyConnected, now_ms);
            self.fail_registration(
                request_id,
                HandshakeError::Rejected(StatusCode::AlreadyConnected),
                now_ms,
            );
            return;
        }

        let transcript = syn.key_transcript_hash(&ack1.responder_ecdh, &ack1.responder_id);
        let keys = match keypair.derive(&ack1.responder_ecdh, &transcript) {
            Ok(keys) => keys,
            Err(e) => {
                self.acknowledge(response, from, hop, ack1.seq, StatusCode::BadSignature, now_ms);
                self.fail_registration(request_id, HandshakeError::KeyExchange(e.to_string()), now_ms);
                return;
            }
        };
        let params = match TransportParams::decrypt(
            &ack1.encrypted_params,
            &keys,
            Direction::ToRequester,
        ) {
            Ok(params) => params,
            Err(e) => {
                self.acknowledge(response, from, hop, ack1.seq, StatusCode::BadSignature, now_ms);
                self.fail_registration(request_id, HandshakeError::KeyExchange(e.to_string()), now_ms);
                return;
            }
        };

        let responder_id = ack1.responder_id;
        let allocated = self.neighbors.allocate(|token| {
            NeighborConnection::new(
                token,
                ConnectionRole::Requester,
                responder_id,
                request_id,
                keys.clone(),
                now_ms,
            )
        });
        let token = match allocated {
            Ok(token) => token,
            Err(e) => {
                warn!(request = %request_id, error = %e, "Token allocation failed");
                self.acknowledge(response, from, hop, ack1.seq, StatusCode::Overloaded, now_ms);
                self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
                return;
            }
        };
        if let Some(reg) = self.registrations.get_mut(&request_id) {
            reg.token = Some(token);
        }
        let initialized = self
            .neighbors
            .get_mut(token)
            .map(|conn| conn.init_p2p_stream(params.endpoint, params.token));
        if let Some(Err(e)) = initialized {
            self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
            return;
        }

        self.acknowledge(response, from, hop, ack1.seq, StatusCode::Ok, now_ms);

        let own_endpoint = ack1.requester_endpoint.unwrap_or(self.local_endpoint);
        let mut ack2 = RegisterAck2 {
            request_id,
            seq: self.next_seq(),
            encrypted_params: TransportParams::new(own_endpoint, token)
                .encrypt(&keys, Direction::ToResponder),
            signature: UNSIGNED,
        };
        ack2.signature = self.identity.sign(&ack2.signed_fields(&syn, &ack1));

        let waiter = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Requester,
            request_id,
            packet: PacketType::RegisterAck2,
            hop,
        };
        if let Err(e) = self.send_hop(hop, ack2.seq, |l| ack2.encode(l), waiter, now_ms) {
            self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
            return;
        }

        if let Some(reg) = self.registrations.get_mut(&request_id) {
            reg.stage = Stage::AwaitingAck2Ack;
            reg.ack1 = Some(ack1);
            reg.ack2 = Some(ack2);
        }
        debug!(
            request = %request_id,
            token = %token,
            responder = %responder_id.short_hex(),
            endpoint = %params.endpoint,
            "Received ACK1, sent ACK2"
        );
    }

    /// NPACK (or its absence) for a packet we sent as requester.
    pub(in crate::engine) fn on_register_requester_npack(
        &mut self,
        request_id: RequestId,
        packet: PacketType,
        status: Option<StatusCode>,
        now_ms: u64,
    ) {
        match status {
            None => self.fail_registration(request_id, HandshakeError::Timeout, now_ms),
            Some(code) if !code.is_ok() => {
                self.fail_registration(request_id, HandshakeError::Rejected(code), now_ms)
            }
            Some(_) => match packet {
                PacketType::RegisterAck2 => self.send_confirmation_ping(request_id, now_ms),
                PacketType::RegisterCfm => self.complete_registration(request_id),
                _ => {}
            },
        }
    }

    /// FAILURE raced ACK1 and won.
    pub(in crate::engine) fn on_register_requester_failure(
        &mut self,
        request_id: RequestId,
        hop: Hop,
        response: &[u8],
        now_ms: u64,
    ) {
        let Some(code) = self.accept_failure(hop, response, now_ms) else {
            return;
        };
        self.fail_registration(request_id, HandshakeError::Rejected(code), now_ms);
    }

    /// Ask the responder for its confirmation over the new direct channel.
    fn send_confirmation_ping(&mut self, request_id: RequestId, now_ms: u64) {
        let Some(token) = self.registrations.get(&request_id).and_then(|r| r.token) else {
            return;
        };
        let (neighbor_count, busy_sectors) = self.advertised_load();
        let key = self.neighbors.hmac_key(token).cloned();
        let Some(conn) = self.neighbors.get_mut(token) else {
            self.fail_registration(request_id, HandshakeError::ConnectionLost, now_ms);
            return;
        };
        let (Some(link), Some(addr)) = (conn.link(), conn.remote_endpoint()) else {
            self.fail_registration(request_id, HandshakeError::ConnectionLost, now_ms);
            return;
        };
        let ping_id = conn.begin_ping(now_ms);
        let ping = PingPacket {
            ping_id,
            flags: PingFlags {
                teardown: false,
                request_confirmation: true,
            },
            neighbor_count,
            busy_sectors,
        };
        let data = match ping.encode(&link) {
            Ok(data) => data,
            Err(e) => {
                self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
                return;
            }
        };
        let matcher = super::hop_matcher(
            addr,
            PongPacket::prefix(&HopAuth::Relayed { token }, FLAG_OPTION, ping_id),
            key,
            |d, k| PongPacket::decode(d, k).is_ok(),
        );
        let sent = self.pending.send_and_wait(
            addr,
            Some(data),
            matcher,
            now_ms + self.config.handshake.hop_timeout_ms,
            &self.config.retransmit,
            Waiter::Confirmation { request_id, token },
            now_ms,
            &mut self.outbox,
        );
        if let Err(e) = sent {
            self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
            return;
        }
        if let Some(reg) = self.registrations.get_mut(&request_id) {
            reg.stage = Stage::AwaitingConfirmation;
        }
        debug!(request = %request_id, to = %addr, "Requested registration confirmation");
    }

    /// PONG with the responder's confirmation: the channel works both ways.
    pub(in crate::engine) fn on_confirmation(
        &mut self,
        request_id: RequestId,
        token: NeighborToken,
        response: &[u8],
        now_ms: u64,
    ) {
        let key = self.neighbors.hmac_key(token).cloned();
        let Ok(Framed { packet: pong, .. }) = PongPacket::decode(response, key.as_ref()) else {
            return;
        };
        let Some(reg) = self.registrations.get(&request_id) else {
            return;
        };
        let hop = reg.hop;
        let (Some(syn), Some(ack1), Some(ack2)) = (&reg.syn, &reg.ack1, &reg.ack2) else {
            return;
        };

        let verified = pong.confirmation.as_ref().is_some_and(|sig| {
            ack1.responder_id
                .verify(&RegisterCfm::responder_message(syn, ack1, ack2), sig)
                .is_ok()
        });
        let requester_confirmation = self
            .identity
            .sign(&RegisterCfm::requester_message(syn, ack1, ack2));
        let remote = ack1.responder_id;
        let Some(responder_confirmation) = pong.confirmation.filter(|_| verified) else {
            self.fail_registration(request_id, HandshakeError::AuthenticationFailed, now_ms);
            return;
        };
        let cfm = RegisterCfm {
            request_id,
            seq: self.next_seq(),
            responder_confirmation,
            requester_confirmation,
        };

        let Some(conn) = self.neighbors.get_mut(token) else {
            self.fail_registration(request_id, HandshakeError::ConnectionLost, now_ms);
            return;
        };
        conn.on_pong(pong.ping_id, now_ms);
        conn.update_remote_load(pong.neighbor_count, pong.busy_sectors);
        if let Err(e) = conn.mark_established(now_ms) {
            self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
            return;
        }
        info!(
            token = %token,
            remote = %remote.short_hex(),
            role = "requester",
            "Neighbor established"
        );
        self.events.push_back(EngineEvent::NeighborEstablished {
            token,
            remote,
            role: ConnectionRole::Requester,
        });

        let waiter = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Requester,
            request_id,
            packet: PacketType::RegisterCfm,
            hop,
        };
        if let Err(e) = self.send_hop(hop, cfm.seq, |l| cfm.encode(l), waiter, now_ms) {
            self.fail_registration(request_id, HandshakeError::Resource(e.to_string()), now_ms);
            return;
        }
        if let Some(reg) = self.registrations.get_mut(&request_id) {
            reg.stage = Stage::AwaitingCfmAck;
        }
    }

    fn complete_registration(&mut self, request_id: RequestId) {
        let Some(reg) = self.registrations.remove(&request_id) else {
            return;
        };
        let (Some(token), Some(ack1)) = (reg.token, reg.ack1) else {
            return;
        };
        info!(
            request = %request_id,
            token = %token,
            remote = %ack1.responder_id.short_hex(),
            "Registration completed"
        );
        self.events.push_back(EngineEvent::RegistrationCompleted {
            request_id,
            token,
            remote: ack1.responder_id,
        });
    }

    pub(in crate::engine) fn fail_registration(
        &mut self,
        request_id: RequestId,
        error: HandshakeError,
        now_ms: u64,
    ) {
        let Some(reg) = self.registrations.remove(&request_id) else {
            return;
        };
        self.cancel_flow(Flow::Register, Role::Requester, request_id);
        if let Some(token) = reg.token {
            self.dispose_connection(token, now_ms, "registration failed");
        }
        warn!(request = %request_id, error = %error, "Registration failed");
        self.events.push_back(EngineEvent::RegistrationFailed { request_id, error });
    }

    /// Registrations past their overall deadline, PoW stages included.
    pub(in crate::engine) fn expire_registrations(&mut self, now_ms: u64) {
        let timeout = self.config.handshake.registration_timeout_ms;
        let expired: Vec<RequestId> = self
            .registrations
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.started_ms) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            self.fail_registration(request_id, HandshakeError::Timeout, now_ms);
        }
    }
}
