//! Engine entry points: inbound datagrams, resolved and expired waits, and
//! the periodic tick.

use std::net::SocketAddr;

use tracing::{debug, trace};

use super::{Engine, Flow, HandshakeError, Hop, Role, Waiter};
use crate::wire::{packet_type, Npack, PacketType, RequestId, StatusCode};

impl Engine {
    /// Process one inbound datagram.
    ///
    /// Retransmitted requests are answered from the responder cache first,
    /// then pending waits get a chance to match, and only then is the
    /// packet handled as a new request.
    pub fn on_datagram(&mut self, from: SocketAddr, data: &[u8], now_ms: u64) {
        let packet_type = match packet_type(data) {
            Ok(t) => t,
            Err(e) => {
                debug!(from = %from, error = %e, "Dropping unclassifiable datagram");
                return;
            }
        };

        let replayable = packet_type == PacketType::Pow1Request
            || packet_type == PacketType::Ping
            || packet_type.is_hop_acknowledged();
        if replayable && self.responder.replay(data, from, &mut self.outbox) {
            trace!(from = %from, packet = %packet_type, "Replayed cached response");
            return;
        }

        if let Some(matched) = self.pending.on_datagram(from, data) {
            self.on_matched(matched.waiter, &matched.response, now_ms);
            return;
        }

        match packet_type {
            PacketType::Pow1Request => self.handle_pow1_request(data, from, now_ms),
            PacketType::RegisterSyn => self.handle_register_syn(data, from, now_ms),
            PacketType::RegisterAck2 => self.handle_register_ack2(data, from, now_ms),
            PacketType::RegisterCfm => self.handle_register_cfm(data, from, now_ms),
            PacketType::Ping => self.handle_ping(data, from, now_ms),
            PacketType::InviteSyn => self.handle_invite_syn(data, from, now_ms),
            PacketType::InviteAck2 => self.handle_invite_ack2(data, from, now_ms),
            PacketType::InviteCfm => self.handle_invite_cfm(data, from, now_ms),
            PacketType::Pow1Response
            | PacketType::RegisterAck1
            | PacketType::Npack
            | PacketType::Failure
            | PacketType::Pong
            | PacketType::InviteAck1 => {
                debug!(from = %from, packet = %packet_type, "Unsolicited response dropped");
            }
        }
    }

    fn on_matched(&mut self, waiter: Waiter, response: &[u8], now_ms: u64) {
        match waiter {
            Waiter::Pow1 { request_id } => self.on_pow1_response(request_id, response, now_ms),
            Waiter::Npack {
                flow,
                role,
                request_id,
                packet,
                hop,
            } => {
                let status = self.npack_status(hop, response, now_ms);
                self.on_npack(flow, role, request_id, packet, status, now_ms);
            }
            Waiter::Ack1 {
                flow: Flow::Register,
                role: Role::Requester,
                request_id,
                hop,
            } => self.on_register_ack1(request_id, hop, response, now_ms),
            Waiter::Ack1 {
                flow: Flow::Register,
                request_id,
                hop,
                ..
            } => self.relay_register_ack1(request_id, hop, response, now_ms),
            Waiter::Ack1 {
                flow: Flow::Invite,
                request_id,
                hop,
                ..
            } => self.on_invite_ack1(request_id, hop, response, now_ms),
            Waiter::Failure {
                flow: Flow::Register,
                role: Role::Requester,
                request_id,
                hop,
            } => self.on_register_requester_failure(request_id, hop, response, now_ms),
            Waiter::Failure {
                flow: Flow::Register,
                request_id,
                hop,
                ..
            } => self.on_relay_failure(request_id, hop, response, now_ms),
            Waiter::Failure {
                flow: Flow::Invite,
                request_id,
                hop,
                ..
            } => self.on_invite_failure(request_id, hop, response, now_ms),
            Waiter::Confirmation { request_id, token } => {
                self.on_confirmation(request_id, token, response, now_ms)
            }
            Waiter::Pong { token, ping_id } => self.on_pong(token, ping_id, response, now_ms),
        }
    }

    fn npack_status(&mut self, hop: Hop, response: &[u8], now_ms: u64) -> Option<StatusCode> {
        let key = self.hop_key(hop);
        let npack = Npack::decode(response, key.as_ref()).ok()?.packet;
        self.touch(hop, now_ms);
        Some(npack.status)
    }

    /// Route an NPACK outcome; `None` means the hop never acknowledged.
    fn on_npack(
        &mut self,
        flow: Flow,
        role: Role,
        request_id: RequestId,
        packet: PacketType,
        status: Option<StatusCode>,
        now_ms: u64,
    ) {
        if let Some(code) = status.filter(|s| !s.is_ok()) {
            debug!(request = %request_id, packet = %packet, status = %code, "Hop rejected packet");
        }
        match (flow, role) {
            (Flow::Register, Role::Requester) => {
                self.on_register_requester_npack(request_id, packet, status, now_ms)
            }
            (Flow::Register, Role::Relay) => {
                self.on_relay_npack(request_id, packet, status, now_ms)
            }
            (Flow::Register, Role::Responder) => {
                self.on_responder_npack(request_id, packet, status, now_ms)
            }
            (Flow::Invite, role) => self.on_invite_npack(role, request_id, packet, status, now_ms),
        }
    }

    fn on_expired(&mut self, waiter: Waiter, now_ms: u64) {
        match waiter {
            Waiter::Pow1 { request_id } | Waiter::Confirmation { request_id, .. } => {
                self.fail_registration(request_id, HandshakeError::Timeout, now_ms)
            }
            Waiter::Npack {
                flow,
                role,
                request_id,
                packet,
                ..
            } => self.on_npack(flow, role, request_id, packet, None, now_ms),
            Waiter::Ack1 {
                flow: Flow::Register,
                role: Role::Requester,
                request_id,
                ..
            } => self.fail_registration(request_id, HandshakeError::Timeout, now_ms),
            Waiter::Ack1 {
                flow: Flow::Register,
                request_id,
                ..
            } => {
                // Upstream started its timer first and has given up already
                if self.register_relays.remove(&request_id).is_some() {
                    self.cancel_flow(Flow::Register, Role::Relay, request_id);
                    debug!(request = %request_id, "Relay gave up waiting for ACK1");
                }
            }
            Waiter::Ack1 {
                flow: Flow::Invite,
                request_id,
                ..
            } => self.fail_invite(request_id, HandshakeError::Timeout),
            Waiter::Failure { .. } => {}
            Waiter::Pong { token, ping_id } => {
                debug!(token = %token, ping_id, "PING unanswered");
            }
        }
    }

    /// Periodic step: retransmissions, timeouts, liveness and housekeeping.
    pub fn on_tick(&mut self, now_ms: u64) {
        let expired = self
            .pending
            .on_tick(now_ms, &self.config.retransmit, &mut self.outbox);
        for entry in expired {
            self.on_expired(entry.waiter, now_ms);
        }

        self.responder.on_tick(now_ms);
        self.admission.on_tick(now_ms);

        self.expire_registrations(now_ms);
        self.expire_relays(now_ms);
        self.expire_acceptances(now_ms);
        self.expire_invites(now_ms);

        self.check_neighbors(now_ms);
        self.expire_ecdh(now_ms);
    }
}
