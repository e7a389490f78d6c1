//! INVITE: greedy multi-hop routing toward a destination identity over
//! established neighbor links.
//!
//! ```text
//! requester ─SYN─► relay ─SYN─► destination
//!           ◄ACK1─       ◄ACK1─
//!           ─ACK2─►      ─ACK2─►
//!           ◄─CFM─       ◄─CFM─
//! ```
//!
//! Every receiving peer increments `hops`. A relay with no strictly closer
//! neighbor left reports route-unavailable upstream, and the previous hop
//! tries its next best neighbor.

use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use super::{is_retryable, Engine, EngineError, EngineEvent, Flow, HandshakeError, Hop, Role, Waiter};
use crate::admission::timestamp_within;
use crate::identity::RegistrationId;
use crate::neighbor::NeighborToken;
use crate::routing::{route_invite, Coordinates, RouteCandidate, RouteTarget};
use crate::wire::{
    Framed, HopAuth, InviteAck1, InviteAck2, InviteCfm, InviteSyn, PacketType, RequestId,
    StatusCode, MAX_SESSION_DESCRIPTION, UNSIGNED,
};

/// An INVITE we sent or are relaying.
pub(in crate::engine) struct InviteRoute {
    /// `None` when we are the requester.
    pub(super) upstream: Option<NeighborToken>,
    syn: InviteSyn,
    downstream: Option<NeighborToken>,
    tried: HashSet<NeighborToken>,
    attempts: usize,
    ack1: Option<InviteAck1>,
    pub(super) started_ms: u64,
}

impl InviteRoute {
    fn role(&self) -> Role {
        if self.upstream.is_some() {
            Role::Relay
        } else {
            Role::Requester
        }
    }
}

/// An INVITE addressed to us, waiting for ACK2.
pub(in crate::engine) struct InviteAcceptance {
    upstream: NeighborToken,
    syn: InviteSyn,
    ack1: InviteAck1,
    pub(super) started_ms: u64,
}

fn relayed_source(auth: &HopAuth) -> Option<NeighborToken> {
    match auth {
        HopAuth::Relayed { token } => Some(*token),
        HopAuth::Direct => None,
    }
}

impl Engine {
    /// Invite the peer `destination` to a session. It must be reachable
    /// through neighbors that are progressively closer to it.
    pub fn invite(
        &mut self,
        destination: RegistrationId,
        session_description: Vec<u8>,
        now_ms: u64,
    ) -> Result<RequestId, EngineError> {
        if destination == *self.identity.id() {
            return Err(EngineError::SelfRequest);
        }
        if session_description.len() > MAX_SESSION_DESCRIPTION {
            return Err(EngineError::DescriptionTooLong {
                len: session_description.len(),
                max: MAX_SESSION_DESCRIPTION,
            });
        }
        if self.neighbors.established_count() == 0 {
            return Err(EngineError::NoNeighbors);
        }

        let request_id = self.fresh_request_id(now_ms);
        let mut syn = InviteSyn {
            request_id,
            seq: 0,
            responder_id: destination,
            hop_budget: self.config.handshake.invite_hop_budget,
            hops: 0,
            session_description,
            signature: UNSIGNED,
        };
        syn.signature = self.identity.sign(&syn.signed_fields());

        let mut route = InviteRoute {
            upstream: None,
            syn,
            downstream: None,
            tried: HashSet::new(),
            attempts: 0,
            ack1: None,
            started_ms: now_ms,
        };
        if !self.forward_invite(&mut route, now_ms) {
            return Err(EngineError::NoRoute(destination));
        }
        info!(
            request = %request_id,
            destination = %destination.short_hex(),
            "Invite started"
        );
        self.invites.insert(request_id, route);
        Ok(request_id)
    }

    /// Closest untried neighbor strictly nearer to the destination than us.
    fn next_invite_hop(&self, route: &InviteRoute) -> Option<NeighborToken> {
        let candidates: Vec<RouteCandidate> = self
            .neighbors
            .established()
            .filter(|c| {
                let token = c.local_token();
                route.upstream != Some(token) && !route.tried.contains(&token)
            })
            .map(|c| RouteCandidate {
                target: RouteTarget::Neighbor(c.local_token()),
                coordinates: *c.remote_coordinates(),
                neighbor_count: c.remote_neighbor_count() as usize,
                busy_sectors: *c.remote_busy_sectors(),
            })
            .collect();
        route_invite(
            &self.coordinates,
            &Coordinates::of(&route.syn.responder_id),
            &candidates,
        )
    }

    /// Send the SYN to the next usable hop. Returns false once no hop is
    /// left or the attempt bound is reached.
    fn forward_invite(&mut self, route: &mut InviteRoute, now_ms: u64) -> bool {
        let request_id = route.syn.request_id;
        let role = route.role();
        let timeout = self.config.handshake.invite_timeout_ms;

        while route.attempts < self.config.handshake.max_proxy_attempts {
            let Some(token) = self.next_invite_hop(route) else {
                return false;
            };
            route.tried.insert(token);
            route.attempts += 1;
            route.downstream = Some(token);

            let hop = Hop::Neighbor(token);
            let mut syn = route.syn.clone();
            syn.seq = self.next_seq();
            if route.upstream.is_some() {
                syn.hop_budget = syn.hop_budget.saturating_sub(1);
            }
            let npack = Waiter::Npack {
                flow: Flow::Invite,
                role,
                request_id,
                packet: PacketType::InviteSyn,
                hop,
            };
            let ack1 = Waiter::Ack1 {
                flow: Flow::Invite,
                role,
                request_id,
                hop,
            };
            let failure = Waiter::Failure {
                flow: Flow::Invite,
                role,
                request_id,
                hop,
            };
            let sent = self
                .send_hop(hop, syn.seq, |l| syn.encode(l), npack, now_ms)
                .and_then(|_| {
                    self.await_reply(hop, PacketType::InviteAck1, 0, request_id, ack1, timeout, now_ms)
                })
                .and_then(|_| {
                    self.await_reply(hop, PacketType::Failure, 0, request_id, failure, timeout, now_ms)
                });
            match sent {
                Ok(()) => {
                    debug!(
                        request = %request_id,
                        next = %token,
                        attempt = route.attempts,
                        "Forwarded INVITE SYN"
                    );
                    return true;
                }
                Err(e) => {
                    debug!(request = %request_id, next = %token, error = %e, "INVITE hop unusable");
                    self.cancel_syn_attempt(Flow::Invite, role, request_id);
                    route.downstream = None;
                }
            }
        }
        false
    }

    pub(in crate::engine) fn handle_invite_syn(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        let key = self.key_for(data);
        let Framed { auth, packet: syn } = match InviteSyn::decode(data, key.as_ref()) {
            Ok(framed) => framed,
            Err(e) => {
                self.log_decode_failure(PacketType::InviteSyn, from, data, &e);
                return;
            }
        };
        let Some(token) = relayed_source(&auth) else {
            return;
        };
        if !self.neighbors.get(token).is_some_and(|c| c.is_established()) {
            debug!(token = %token, "INVITE over a connection that is not established");
            return;
        }
        let source = Hop::Neighbor(token);
        self.touch(source, now_ms);

        let request_id = syn.request_id;
        let status = if !syn.verify_signature() {
            StatusCode::BadSignature
        } else if !timestamp_within(
            request_id.timestamp,
            now_ms,
            self.config.admission.timestamp_tolerance_secs,
        ) {
            StatusCode::BadTimestamp
        } else if request_id.requester == *self.identity.id()
            || self.invites.contains_key(&request_id)
            || self.invite_acceptances.contains_key(&request_id)
        {
            StatusCode::Duplicate
        } else if self.routed_requests() >= self.config.limits.max_routed_requests {
            StatusCode::Overloaded
        } else {
            StatusCode::Ok
        };
        self.acknowledge(data, from, source, syn.seq, status, now_ms);
        if !status.is_ok() {
            debug!(request = %request_id, status = %status, "INVITE SYN rejected");
            return;
        }

        let mut syn = syn;
        syn.hops = syn.hops.saturating_add(1);

        if syn.responder_id == *self.identity.id() {
            self.accept_invite(token, syn, now_ms);
            return;
        }
        if syn.hop_budget == 0 {
            self.send_failure(
                source,
                request_id,
                StatusCode::HopBudgetExhausted,
                Flow::Invite,
                Role::Relay,
                now_ms,
            );
            return;
        }

        let mut route = InviteRoute {
            upstream: Some(token),
            syn,
            downstream: None,
            tried: HashSet::new(),
            attempts: 0,
            ack1: None,
            started_ms: now_ms,
        };
        if self.forward_invite(&mut route, now_ms) {
            self.invites.insert(request_id, route);
        } else {
            debug!(request = %request_id, "No closer neighbor for INVITE");
            self.send_failure(
                source,
                request_id,
                StatusCode::RouteUnavailable,
                Flow::Invite,
                Role::Relay,
                now_ms,
            );
        }
    }

    /// We are the destination: ask the acceptor and answer with ACK1.
    fn accept_invite(&mut self, upstream: NeighborToken, syn: InviteSyn, now_ms: u64) {
        let request_id = syn.request_id;
        let (status, session_description) =
            match (self.invite_acceptor)(&request_id.requester, &syn.session_description) {
                Ok(mut description) => {
                    description.truncate(MAX_SESSION_DESCRIPTION);
                    (StatusCode::Ok, description)
                }
                Err(code) => (code, Vec::new()),
            };
        let mut ack1 = InviteAck1 {
            request_id,
            seq: self.next_seq(),
            status,
            hops: syn.hops,
            session_description,
            signature: UNSIGNED,
        };
        ack1.signature = self.identity.sign(&ack1.signed_fields(&syn));

        let hop = Hop::Neighbor(upstream);
        let waiter = Waiter::Npack {
            flow: Flow::Invite,
            role: Role::Responder,
            request_id,
            packet: PacketType::InviteAck1,
            hop,
        };
        if let Err(e) = self.send_hop(hop, ack1.seq, |l| ack1.encode(l), waiter, now_ms) {
            debug!(request = %request_id, error = %e, "Failed to send INVITE ACK1");
            return;
        }
        info!(
            request = %request_id,
            from = %request_id.requester.short_hex(),
            hops = syn.hops,
            status = %status,
            "Answered INVITE"
        );
        if status.is_ok() {
            self.invite_acceptances.insert(
                request_id,
                InviteAcceptance {
                    upstream,
                    syn,
                    ack1,
                    started_ms: now_ms,
                },
            );
        }
    }

    /// ACK1 from our downstream hop, relayed back or final.
    pub(in crate::engine) fn on_invite_ack1(
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
        let Ok(Framed { packet: ack1, .. }) = InviteAck1::decode(response, key.as_ref()) else {
            return;
        };
        self.touch(hop, now_ms);

        let Some(route) = self.invites.get(&request_id) else {
            self.acknowledge(response, from, hop, ack1.seq, StatusCode::Ok, now_ms);
            return;
        };
        if !ack1.verify_signature(&route.syn) {
            self.acknowledge(response, from, hop, ack1.seq, StatusCode::BadSignature, now_ms);
            self.retry_invite(request_id, StatusCode::BadSignature, now_ms);
            return;
        }
        let role = route.role();
        let upstream = route.upstream;
        let syn = route.syn.clone();
        self.cancel_syn_attempt(Flow::Invite, role, request_id);
        self.acknowledge(response, from, hop, ack1.seq, StatusCode::Ok, now_ms);

        match upstream {
            Some(token) => {
                let up = Hop::Neighbor(token);
                let mut forward = ack1.clone();
                forward.seq = self.next_seq();
                let waiter = Waiter::Npack {
                    flow: Flow::Invite,
                    role: Role::Relay,
                    request_id,
                    packet: PacketType::InviteAck1,
                    hop: up,
                };
                if let Err(e) = self.send_hop(up, forward.seq, |l| forward.encode(l), waiter, now_ms) {
                    debug!(request = %request_id, error = %e, "Failed to forward INVITE ACK1");
                    self.drop_invite_route(request_id);
                    return;
                }
                if !ack1.status.is_ok() {
                    self.drop_invite_route(request_id);
                    return;
                }
            }
            None => {
                if !ack1.status.is_ok() {
                    self.fail_invite(request_id, HandshakeError::Rejected(ack1.status));
                    return;
                }
                let ack2 = InviteAck2 {
                    request_id,
                    seq: self.next_seq(),
                    signature: self.identity.sign(&InviteAck2::signed_fields(&syn, &ack1)),
                };
                let waiter = Waiter::Npack {
                    flow: Flow::Invite,
                    role: Role::Requester,
                    request_id,
                    packet: PacketType::InviteAck2,
                    hop,
                };
                if let Err(e) = self.send_hop(hop, ack2.seq, |l| ack2.encode(l), waiter, now_ms) {
                    self.fail_invite(request_id, HandshakeError::Resource(e.to_string()));
                    return;
                }
                debug!(request = %request_id, hops = ack1.hops, "Received INVITE ACK1, sent ACK2");
            }
        }
        if let Some(route) = self.invites.get_mut(&request_id) {
            route.ack1 = Some(ack1);
        }
    }

    pub(in crate::engine) fn on_invite_failure(
        &mut self,
        request_id: RequestId,
        hop: Hop,
        response: &[u8],
        now_ms: u64,
    ) {
        if let Some(code) = self.accept_failure(hop, response, now_ms) {
            self.retry_invite(request_id, code, now_ms);
        }
    }

    /// The downstream hop failed before ACK1: try the next closest
    /// neighbor or give up.
    fn retry_invite(&mut self, request_id: RequestId, code: StatusCode, now_ms: u64) {
        let Some(mut route) = self.invites.remove(&request_id) else {
            return;
        };
        if route.ack1.is_some() {
            self.invites.insert(request_id, route);
            return;
        }
        let role = route.role();
        self.cancel_syn_attempt(Flow::Invite, role, request_id);
        if let Some(token) = route.downstream.take() {
            route.tried.insert(token);
        }

        if is_retryable(code) && self.forward_invite(&mut route, now_ms) {
            debug!(request = %request_id, code = %code, "INVITE rerouted");
            self.invites.insert(request_id, route);
            return;
        }
        let code = if is_retryable(code) {
            StatusCode::RouteUnavailable
        } else {
            code
        };
        match route.upstream {
            Some(token) => self.send_failure(
                Hop::Neighbor(token),
                request_id,
                code,
                Flow::Invite,
                Role::Relay,
                now_ms,
            ),
            None => {
                self.cancel_flow(Flow::Invite, Role::Requester, request_id);
                warn!(request = %request_id, code = %code, "Invite failed");
                self.events.push_back(EngineEvent::InviteFailed {
                    request_id,
                    error: HandshakeError::Rejected(code),
                });
            }
        }
    }

    pub(in crate::engine) fn fail_invite(&mut self, request_id: RequestId, error: HandshakeError) {
        let Some(route) = self.invites.remove(&request_id) else {
            return;
        };
        if route.upstream.is_some() {
            self.cancel_flow(Flow::Invite, Role::Relay, request_id);
            return;
        }
        self.cancel_flow(Flow::Invite, Role::Requester, request_id);
        warn!(request = %request_id, error = %error, "Invite failed");
        self.events
            .push_back(EngineEvent::InviteFailed { request_id, error });
    }

    fn drop_invite_route(&mut self, request_id: RequestId) {
        if self.invites.remove(&request_id).is_some() {
            self.cancel_flow(Flow::Invite, Role::Relay, request_id);
        }
    }

    pub(in crate::engine) fn handle_invite_ack2(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        let key = self.key_for(data);
        let Framed { auth, packet: ack2 } = match InviteAck2::decode(data, key.as_ref()) {
            Ok(framed) => framed,
            Err(e) => {
                self.log_decode_failure(PacketType::InviteAck2, from, data, &e);
                return;
            }
        };
        let Some(token) = relayed_source(&auth) else {
            return;
        };
        let source = Hop::Neighbor(token);
        let request_id = ack2.request_id;

        if let Some(acceptance) = self.invite_acceptances.get(&request_id) {
            if acceptance.upstream != token {
                debug!(request = %request_id, source = %source, "INVITE ACK2 from wrong hop");
                return;
            }
            if !ack2.verify_signature(&acceptance.syn, &acceptance.ack1) {
                self.acknowledge(data, from, source, ack2.seq, StatusCode::BadSignature, now_ms);
                return;
            }
            self.touch(source, now_ms);
            self.acknowledge(data, from, source, ack2.seq, StatusCode::Ok, now_ms);
            let Some(acceptance) = self.invite_acceptances.remove(&request_id) else {
                return;
            };
            self.cancel_flow(Flow::Invite, Role::Responder, request_id);

            let cfm = InviteCfm {
                request_id,
                seq: self.next_seq(),
                signature: self
                    .identity
                    .sign(&InviteCfm::signed_fields(&acceptance.syn, &acceptance.ack1)),
            };
            let waiter = Waiter::Npack {
                flow: Flow::Invite,
                role: Role::Responder,
                request_id,
                packet: PacketType::InviteCfm,
                hop: source,
            };
            if let Err(e) = self.send_hop(source, cfm.seq, |l| cfm.encode(l), waiter, now_ms) {
                debug!(request = %request_id, error = %e, "Failed to send INVITE CFM");
            }
            info!(
                request = %request_id,
                from = %request_id.requester.short_hex(),
                hops = acceptance.syn.hops,
                "Invite received"
            );
            self.events.push_back(EngineEvent::InviteReceived {
                request_id,
                from: request_id.requester,
                session_description: acceptance.syn.session_description,
                hops: acceptance.syn.hops,
            });
            return;
        }

        let Some(route) = self.invites.get(&request_id) else {
            debug!(request = %request_id, "INVITE ACK2 for unknown request");
            return;
        };
        if route.upstream != Some(token) {
            debug!(request = %request_id, source = %source, "INVITE ACK2 from wrong hop");
            return;
        }
        let (Some(ack1), Some(downstream)) = (&route.ack1, route.downstream) else {
            return;
        };
        if !ack2.verify_signature(&route.syn, ack1) {
            self.acknowledge(data, from, source, ack2.seq, StatusCode::BadSignature, now_ms);
            return;
        }
        self.touch(source, now_ms);
        self.acknowledge(data, from, source, ack2.seq, StatusCode::Ok, now_ms);

        let hop = Hop::Neighbor(downstream);
        let mut forward = ack2;
        forward.seq = self.next_seq();
        let waiter = Waiter::Npack {
            flow: Flow::Invite,
            role: Role::Relay,
            request_id,
            packet: PacketType::InviteAck2,
            hop,
        };
        if let Err(e) = self.send_hop(hop, forward.seq, |l| forward.encode(l), waiter, now_ms) {
            debug!(request = %request_id, error = %e, "Failed to forward INVITE ACK2");
            self.drop_invite_route(request_id);
        }
    }

    /// CFM travels from the destination back to the requester.
    pub(in crate::engine) fn handle_invite_cfm(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now_ms: u64,
    ) {
        let key = self.key_for(data);
        let Framed { auth, packet: cfm } = match InviteCfm::decode(data, key.as_ref()) {
            Ok(framed) => framed,
            Err(e) => {
                self.log_decode_failure(PacketType::InviteCfm, from, data, &e);
                return;
            }
        };
        let Some(token) = relayed_source(&auth) else {
            return;
        };
        let source = Hop::Neighbor(token);
        let request_id = cfm.request_id;

        let Some(route) = self.invites.get(&request_id) else {
            debug!(request = %request_id, "INVITE CFM for unknown request");
            return;
        };
        if route.downstream != Some(token) {
            debug!(request = %request_id, source = %source, "INVITE CFM from wrong hop");
            return;
        }
        let Some(ack1) = &route.ack1 else {
            return;
        };
        if !cfm.verify_signature(&route.syn, ack1) {
            self.acknowledge(data, from, source, cfm.seq, StatusCode::BadSignature, now_ms);
            return;
        }
        self.touch(source, now_ms);
        self.acknowledge(data, from, source, cfm.seq, StatusCode::Ok, now_ms);

        let Some(route) = self.invites.remove(&request_id) else {
            return;
        };
        self.cancel_flow(Flow::Invite, route.role(), request_id);
        let Some(ack1) = route.ack1 else {
            return;
        };

        match route.upstream {
            Some(upstream) => {
                let hop = Hop::Neighbor(upstream);
                let mut forward = cfm;
                forward.seq = self.next_seq();
                let waiter = Waiter::Npack {
                    flow: Flow::Invite,
                    role: Role::Relay,
                    request_id,
                    packet: PacketType::InviteCfm,
                    hop,
                };
                if let Err(e) = self.send_hop(hop, forward.seq, |l| forward.encode(l), waiter, now_ms)
                {
                    debug!(request = %request_id, error = %e, "Failed to forward INVITE CFM");
                }
                debug!(request = %request_id, "INVITE relayed to completion");
            }
            None => {
                info!(
                    request = %request_id,
                    destination = %route.syn.responder_id.short_hex(),
                    hops = ack1.hops,
                    "Invite completed"
                );
                self.events.push_back(EngineEvent::InviteCompleted {
                    request_id,
                    destination: route.syn.responder_id,
                    session_description: ack1.session_description,
                    hops: ack1.hops,
                });
            }
        }
    }

    /// NPACK (or its absence) for an INVITE packet we sent.
    pub(in crate::engine) fn on_invite_npack(
        &mut self,
        role: Role,
        request_id: RequestId,
        packet: PacketType,
        status: Option<StatusCode>,
        now_ms: u64,
    ) {
        if status == Some(StatusCode::Ok) || packet == PacketType::Failure {
            return;
        }
        match (role, packet) {
            (_, PacketType::InviteSyn) => self.retry_invite(
                request_id,
                status.unwrap_or(StatusCode::RouteUnavailable),
                now_ms,
            ),
            (Role::Responder, _) => {
                debug!(request = %request_id, packet = %packet, "INVITE answer not acknowledged");
                self.invite_acceptances.remove(&request_id);
            }
            (Role::Requester, _) => {
                let error = match status {
                    Some(code) => HandshakeError::Rejected(code),
                    None => HandshakeError::Timeout,
                };
                self.fail_invite(request_id, error);
            }
            (Role::Relay, _) => {
                debug!(request = %request_id, packet = %packet, "Forwarded INVITE packet lost");
                self.drop_invite_route(request_id);
            }
        }
    }

    pub(in crate::engine) fn expire_invites(&mut self, now_ms: u64) {
        let timeout = self.config.handshake.invite_timeout_ms;
        let expired: Vec<RequestId> = self
            .invites
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.started_ms) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            self.fail_invite(request_id, HandshakeError::Timeout);
        }
        self.invite_acceptances
            .retain(|_, a| now_ms.saturating_sub(a.started_ms) < timeout);
    }
}
