//! Entry-peer admission and multi-hop REGISTER relaying.
//!
//! A SYN that passes admission is either accepted here or proxied to the
//! neighbor the routing engine picks. A proxy keeps a [`RegisterRelay`]
//! until the CFM passes through; the entry doubles as the loop guard.

use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, info};

use super::{is_retryable, Engine, Flow, Hop, Role, Waiter};
use crate::admission::timestamp_within;
use crate::identity::RegistrationId;
use crate::neighbor::NeighborToken;
use crate::routing::{route_register, Coordinates, RouteCandidate, RouteDecision, RouteTarget};
use crate::wire::{
    Framed, PacketType, Pow1Request, Pow1Response, RegisterAck1, RegisterAck2, RegisterCfm,
    RegisterSyn, RequestId, StatusCode, CHALLENGE_SIZE,
};

/// A REGISTER request this peer is proxying.
pub(in crate::engine) struct RegisterRelay {
    upstream: Hop,
    syn: RegisterSyn,
    downstream: Option<NeighborToken>,
    tried: HashSet<NeighborToken>,
    attempts: usize,
    ack1: Option<RegisterAck1>,
    ack2: Option<RegisterAck2>,
    pub(super) started_ms: u64,
}

impl Engine {
    // === Admission ===

    pub(in crate::engine) fn handle_pow1_request(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        let request = match Pow1Request::decode(data) {
            Ok(request) => request,
            Err(e) => {
                self.log_decode_failure(PacketType::Pow1Request, from, data, &e);
                return;
            }
        };
        let (status, challenge) = match self.admission.check_pow1(&request, from, now_ms) {
            Ok(challenge) => (StatusCode::Ok, challenge),
            Err(e) => {
                debug!(from = %from, error = %e, "PoW1 rejected");
                (e.status(), [0u8; CHALLENGE_SIZE])
            }
        };
        let response = Pow1Response {
            pow_request_id: request.pow_request_id,
            status,
            challenge,
        };
        match response.encode() {
            Ok(bytes) => self
                .responder
                .respond(data, from, bytes, now_ms, &mut self.outbox),
            Err(e) => debug!(error = %e, "Failed to encode PoW1 response"),
        }
    }

    fn admit_register_syn(
        &self,
        syn: &RegisterSyn,
        source: Hop,
        now_ms: u64,
    ) -> Result<(), StatusCode> {
        if let Hop::Direct(addr) = source {
            let nonce = syn.pow2_nonce.ok_or(StatusCode::BadProofOfWork)?;
            self.admission
                .check_pow2(
                    addr,
                    &syn.request_id.requester,
                    syn.request_id.timestamp,
                    &nonce,
                )
                .map_err(|e| e.status())?;
        }
        if !syn.verify_signature() {
            return Err(StatusCode::BadSignature);
        }
        if !timestamp_within(
            syn.request_id.timestamp,
            now_ms,
            self.config.admission.timestamp_tolerance_secs,
        ) {
            return Err(StatusCode::BadTimestamp);
        }
        let id = &syn.request_id;
        if id.requester == *self.identity.id()
            || self.register_relays.contains_key(id)
            || self.acceptances.contains_key(id)
        {
            return Err(StatusCode::Duplicate);
        }
        if self.routed_requests() >= self.config.limits.max_routed_requests {
            return Err(StatusCode::Overloaded);
        }
        match self.recent_ecdh.get(&syn.requester_ecdh) {
            Some((seen, _)) if seen != id => Err(StatusCode::NonUnique),
            _ => Ok(()),
        }
    }

    /// Record the requester's ephemeral key, evicting the oldest once the
    /// set is full.
    fn remember_ecdh(&mut self, syn: &RegisterSyn, now_ms: u64) {
        let expires_ms = now_ms + self.config.handshake.ephemeral_key_retention_ms;
        if !self.recent_ecdh.contains_key(&syn.requester_ecdh) {
            while self.recent_ecdh.len() >= self.config.limits.max_recent_ephemeral_keys {
                let Some((oldest, stamped_ms)) = self.recent_ecdh_order.pop_front() else {
                    break;
                };
                if self
                    .recent_ecdh
                    .get(&oldest)
                    .is_some_and(|(_, e)| *e == stamped_ms)
                {
                    self.recent_ecdh.remove(&oldest);
                }
            }
        }
        self.recent_ecdh
            .insert(syn.requester_ecdh, (syn.request_id, expires_ms));
        self.recent_ecdh_order
            .push_back((syn.requester_ecdh, expires_ms));
    }

    /// Forget ephemeral keys past their retention.
    pub(in crate::engine) fn expire_ecdh(&mut self, now_ms: u64) {
        while let Some((key, expires_ms)) = self.recent_ecdh_order.front().copied() {
            if expires_ms > now_ms {
                break;
            }
            self.recent_ecdh_order.pop_front();
            if self
                .recent_ecdh
                .get(&key)
                .is_some_and(|(_, e)| *e <= now_ms)
            {
                self.recent_ecdh.remove(&key);
            }
        }
    }

    // === SYN ===

    pub(in crate::engine) fn handle_register_syn(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        let key = self.key_for(data);
        let Framed { auth, packet: syn } = match RegisterSyn::decode(data, key.as_ref()) {
            Ok(framed) => framed,
            Err(e) => {
                self.log_decode_failure(PacketType::RegisterSyn, from, data, &e);
                return;
            }
        };
        let source = Hop::from_auth(&auth, from);
        if let Hop::Neighbor(token) = source {
            if !self.neighbors.get(token).is_some_and(|c| c.is_established()) {
                debug!(token = %token, "SYN over a connection that is not established");
                return;
            }
        }
        self.touch(source, now_ms);

        if let Err(status) = self.admit_register_syn(&syn, source, now_ms) {
            debug!(
                request = %syn.request_id,
                source = %source,
                status = %status,
                "REGISTER SYN rejected"
            );
            self.acknowledge(data, from, source, syn.seq, status, now_ms);
            return;
        }

        if let Hop::Direct(addr) = source {
            self.admission.consume_challenge(&addr);
        }
        self.remember_ecdh(&syn, now_ms);
        self.acknowledge(data, from, source, syn.seq, StatusCode::Ok, now_ms);

        debug!(
            request = %syn.request_id,
            source = %source,
            budget = syn.hop_budget,
            min_distance = syn.min_distance,
            "REGISTER SYN admitted"
        );
        let relay = RegisterRelay {
            upstream: source,
            syn,
            downstream: None,
            tried: HashSet::new(),
            attempts: 0,
            ack1: None,
            ack2: None,
            started_ms: now_ms,
        };
        self.route_register_syn(relay, now_ms);
    }

    /// Whether this peer may become the requester's neighbor.
    fn can_accept(&self, requester: &RegistrationId) -> bool {
        requester != self.identity.id()
            && self.neighbors.find_by_remote(requester).is_none()
            && self.neighbors.live_count() < self.config.limits.max_neighbors
    }

    fn register_candidates(&self, relay: &RegisterRelay) -> Vec<RouteCandidate> {
        let requester = &relay.syn.request_id.requester;
        let mut candidates = Vec::new();
        if self.can_accept(requester) {
            let (neighbor_count, busy_sectors) = self.advertised_load();
            candidates.push(RouteCandidate {
                target: RouteTarget::Local,
                coordinates: self.coordinates,
                neighbor_count: neighbor_count as usize,
                busy_sectors,
            });
        }
        if relay.syn.hop_budget == 0 {
            return candidates;
        }
        for conn in self.neighbors.established() {
            let token = conn.local_token();
            if relay.upstream == Hop::Neighbor(token)
                || relay.tried.contains(&token)
                || conn.remote_id() == requester
            {
                continue;
            }
            candidates.push(RouteCandidate {
                target: RouteTarget::Neighbor(token),
                coordinates: *conn.remote_coordinates(),
                neighbor_count: conn.remote_neighbor_count() as usize,
                busy_sectors: *conn.remote_busy_sectors(),
            });
        }
        candidates
    }

    fn route_register_syn(&mut self, relay: RegisterRelay, now_ms: u64) {
        let candidates = self.register_candidates(&relay);
        let requester = Coordinates::of(&relay.syn.request_id.requester);
        let decision = route_register(
            &self.config.routing,
            &requester,
            relay.syn.min_distance,
            &candidates,
            self.config.limits.max_neighbors,
        );
        match decision {
            RouteDecision::AcceptLocally => {
                self.accept_registration(relay.upstream, relay.syn, now_ms)
            }
            RouteDecision::Proxy(token) => self.proxy_register_syn(relay, token, now_ms),
            RouteDecision::Unavailable => {
                let code = if relay.syn.hop_budget == 0 {
                    StatusCode::HopBudgetExhausted
                } else {
                    StatusCode::RouteUnavailable
                };
                debug!(request = %relay.syn.request_id, code = %code, "No route for REGISTER");
                self.send_failure(
                    relay.upstream,
                    relay.syn.request_id,
                    code,
                    Flow::Register,
                    Role::Relay,
                    now_ms,
                );
            }
        }
    }

    fn proxy_register_syn(&mut self, mut relay: RegisterRelay, token: NeighborToken, now_ms: u64) {
        let request_id = relay.syn.request_id;
        let hop = Hop::Neighbor(token);
        relay.tried.insert(token);
        relay.attempts += 1;
        relay.downstream = Some(token);

        let mut syn = relay.syn.clone();
        syn.seq = self.next_seq();
        syn.hop_budget = syn.hop_budget.saturating_sub(1);
        syn.pow2_nonce = None;

        let timeout = self.config.handshake.registration_timeout_ms;
        let npack = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Relay,
            request_id,
            packet: PacketType::RegisterSyn,
            hop,
        };
        let ack1 = Waiter::Ack1 {
            flow: Flow::Register,
            role: Role::Relay,
            request_id,
            hop,
        };
        let failure = Waiter::Failure {
            flow: Flow::Register,
            role: Role::Relay,
            request_id,
            hop,
        };
        let sent = self
            .send_hop(hop, syn.seq, |l| syn.encode(l), npack, now_ms)
            .and_then(|_| {
                self.await_reply(hop, PacketType::RegisterAck1, 0, request_id, ack1, timeout, now_ms)
            })
            .and_then(|_| {
                self.await_reply(hop, PacketType::Failure, 0, request_id, failure, timeout, now_ms)
            });

        info!(
            request = %request_id,
            upstream = %relay.upstream,
            downstream = %token,
            attempt = relay.attempts,
            "Proxying REGISTER"
        );
        self.register_relays.insert(request_id, relay);
        if let Err(e) = sent {
            debug!(request = %request_id, error = %e, "Failed to proxy SYN");
            self.retry_register_relay(request_id, StatusCode::RouteUnavailable, now_ms);
        }
    }

    /// The current downstream failed before ACK1: try another route or
    /// report upstream.
    pub(in crate::engine) fn retry_register_relay(
        &mut self,
        request_id: RequestId,
        code: StatusCode,
        now_ms: u64,
    ) {
        let Some(mut relay) = self.register_relays.remove(&request_id) else {
            return;
        };
        if relay.ack1.is_some() {
            self.register_relays.insert(request_id, relay);
            return;
        }
        self.cancel_syn_attempt(Flow::Register, Role::Relay, request_id);
        if let Some(token) = relay.downstream.take() {
            relay.tried.insert(token);
        }

        if is_retryable(code) && relay.attempts < self.config.handshake.max_proxy_attempts {
            debug!(
                request = %request_id,
                code = %code,
                attempts = relay.attempts,
                "Downstream failed, rerouting"
            );
            self.route_register_syn(relay, now_ms);
        } else {
            let code = if is_retryable(code) {
                StatusCode::RouteUnavailable
            } else {
                code
            };
            debug!(request = %request_id, code = %code, "Giving up on REGISTER");
            self.send_failure(
                relay.upstream,
                request_id,
                code,
                Flow::Register,
                Role::Relay,
                now_ms,
            );
        }
    }

    pub(in crate::engine) fn on_relay_failure(
        &mut self,
        request_id: RequestId,
        hop: Hop,
        response: &[u8],
        now_ms: u64,
    ) {
        if let Some(code) = self.accept_failure(hop, response, now_ms) {
            self.retry_register_relay(request_id, code, now_ms);
        }
    }

    /// NPACK (or its absence) for a packet we forwarded.
    pub(in crate::engine) fn on_relay_npack(
        &mut self,
        request_id: RequestId,
        packet: PacketType,
        status: Option<StatusCode>,
        now_ms: u64,
    ) {
        match (packet, status) {
            (_, Some(StatusCode::Ok)) | (PacketType::Failure, _) => {}
            (PacketType::RegisterSyn, status) => self.retry_register_relay(
                request_id,
                status.unwrap_or(StatusCode::RouteUnavailable),
                now_ms,
            ),
            (packet, status) => {
                debug!(
                    request = %request_id,
                    packet = %packet,
                    status = ?status,
                    "Forwarded packet not acknowledged, dropping relay"
                );
                self.register_relays.remove(&request_id);
                self.cancel_flow(Flow::Register, Role::Relay, request_id);
            }
        }
    }

    // === ACK1, ACK2, CFM ===

    /// ACK1 from our downstream: check it against the SYN and pass it on.
    pub(in crate::engine) fn relay_register_ack1(
        &mut self,
        request_id: RequestId,
        hop: Hop,
        response: &[u8],
        now_ms: u64,
    ) {
        let Some((from, _)) = self.hop_link(hop) else {
            return;
        };
        let key = self.hop_key(hop);
        let Ok(Framed { packet: ack1, .. }) = RegisterAck1::decode(response, key.as_ref()) else {
            return;
        };
        self.touch(hop, now_ms);

        let Some(relay) = self.register_relays.get(&request_id) else {
            self.acknowledge(response, from, hop, ack1.seq, StatusCode::Ok, now_ms);
            return;
        };
        if !ack1.verify_signature(&relay.syn) {
            self.acknowledge(response, from, hop, ack1.seq, StatusCode::BadSignature, now_ms);
            self.retry_register_relay(request_id, StatusCode::BadSignature, now_ms);
            return;
        }
        let upstream = relay.upstream;
        self.cancel_syn_attempt(Flow::Register, Role::Relay, request_id);
        self.acknowledge(response, from, hop, ack1.seq, StatusCode::Ok, now_ms);

        let mut forward = ack1.clone();
        forward.seq = self.next_seq();
        forward.requester_endpoint = match upstream {
            Hop::Direct(addr) => Some(addr),
            Hop::Neighbor(_) => None,
        };
        let waiter = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Relay,
            request_id,
            packet: PacketType::RegisterAck1,
            hop: upstream,
        };
        if let Err(e) = self.send_hop(upstream, forward.seq, |l| forward.encode(l), waiter, now_ms) {
            debug!(request = %request_id, error = %e, "Failed to forward ACK1");
            self.register_relays.remove(&request_id);
            return;
        }

        if ack1.status.is_ok() {
            if let Some(relay) = self.register_relays.get_mut(&request_id) {
                relay.ack1 = Some(ack1);
            }
        } else {
            self.register_relays.remove(&request_id);
        }
    }

    pub(in crate::engine) fn handle_register_ack2(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        let key = self.key_for(data);
        let Framed { auth, packet: ack2 } = match RegisterAck2::decode(data, key.as_ref()) {
            Ok(framed) => framed,
            Err(e) => {
                self.log_decode_failure(PacketType::RegisterAck2, from, data, &e);
                return;
            }
        };
        let source = Hop::from_auth(&auth, from);
        let request_id = ack2.request_id;

        if self.acceptances.contains_key(&request_id) {
            self.accept_register_ack2(data, from, source, ack2, now_ms);
            return;
        }
        let Some(relay) = self.register_relays.get(&request_id) else {
            debug!(request = %request_id, "ACK2 for unknown request");
            return;
        };
        if source != relay.upstream {
            debug!(request = %request_id, source = %source, "ACK2 from wrong hop");
            return;
        }
        let (Some(ack1), Some(downstream)) = (&relay.ack1, relay.downstream) else {
            debug!(request = %request_id, "ACK2 before ACK1");
            return;
        };
        if !ack2.verify_signature(&relay.syn, ack1) {
            self.acknowledge(data, from, source, ack2.seq, StatusCode::BadSignature, now_ms);
            return;
        }
        self.touch(source, now_ms);
        self.acknowledge(data, from, source, ack2.seq, StatusCode::Ok, now_ms);

        let hop = Hop::Neighbor(downstream);
        let mut forward = ack2.clone();
        forward.seq = self.next_seq();
        let waiter = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Relay,
            request_id,
            packet: PacketType::RegisterAck2,
            hop,
        };
        if let Err(e) = self.send_hop(hop, forward.seq, |l| forward.encode(l), waiter, now_ms) {
            debug!(request = %request_id, error = %e, "Failed to forward ACK2");
            self.register_relays.remove(&request_id);
            return;
        }
        if let Some(relay) = self.register_relays.get_mut(&request_id) {
            relay.ack2 = Some(ack2);
        }
    }

    pub(in crate::engine) fn handle_register_cfm(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        let key = self.key_for(data);
        let Framed { auth, packet: cfm } = match RegisterCfm::decode(data, key.as_ref()) {
            Ok(framed) => framed,
            Err(e) => {
                self.log_decode_failure(PacketType::RegisterCfm, from, data, &e);
                return;
            }
        };
        let source = Hop::from_auth(&auth, from);
        let request_id = cfm.request_id;

        if self.acceptances.contains_key(&request_id) {
            self.accept_register_cfm(data, from, source, cfm, now_ms);
            return;
        }
        let Some(relay) = self.register_relays.get(&request_id) else {
            debug!(request = %request_id, "CFM for unknown request");
            return;
        };
        if source != relay.upstream {
            debug!(request = %request_id, source = %source, "CFM from wrong hop");
            return;
        }
        let (Some(ack1), Some(ack2), Some(downstream)) =
            (&relay.ack1, &relay.ack2, relay.downstream)
        else {
            debug!(request = %request_id, "CFM before ACK2");
            return;
        };
        if !cfm.verify_signatures(&relay.syn, ack1, ack2) {
            self.acknowledge(data, from, source, cfm.seq, StatusCode::BadSignature, now_ms);
            return;
        }
        self.touch(source, now_ms);
        self.acknowledge(data, from, source, cfm.seq, StatusCode::Ok, now_ms);

        let hop = Hop::Neighbor(downstream);
        let mut forward = cfm;
        forward.seq = self.next_seq();
        let waiter = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Relay,
            request_id,
            packet: PacketType::RegisterCfm,
            hop,
        };
        if let Err(e) = self.send_hop(hop, forward.seq, |l| forward.encode(l), waiter, now_ms) {
            debug!(request = %request_id, error = %e, "Failed to forward CFM");
        }
        // CFM finalizes the request at this hop
        self.register_relays.remove(&request_id);
        debug!(request = %request_id, "REGISTER relayed to completion");
    }

    /// Relays whose request never completed.
    pub(in crate::engine) fn expire_relays(&mut self, now_ms: u64) {
        let timeout = self.config.handshake.registration_timeout_ms;
        let expired: Vec<RequestId> = self
            .register_relays
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.started_ms) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            debug!(request = %request_id, "Relay state expired");
            self.register_relays.remove(&request_id);
            self.cancel_flow(Flow::Register, Role::Relay, request_id);
        }
    }
}
