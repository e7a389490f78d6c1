//! Responder side of REGISTER.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use super::{Engine, EngineEvent, Flow, Hop, Role, Waiter};
use crate::crypto::{Direction, EphemeralKeypair, TransportParams};
use crate::identity::RegistrationSignature;
use crate::neighbor::{ConnectionRole, NeighborConnection, NeighborToken};
use crate::wire::{
    PacketType, RegisterAck1, RegisterAck2, RegisterCfm, RegisterSyn, RequestId, StatusCode,
    UNSIGNED,
};

/// A REGISTER request this peer accepted and is completing.
pub(in crate::engine) struct Acceptance {
    upstream: Hop,
    token: NeighborToken,
    syn: RegisterSyn,
    ack1: RegisterAck1,
    ack2: Option<RegisterAck2>,
    pub(super) started_ms: u64,
}

impl Engine {
    /// Become the requester's neighbor: derive keys, open a handshaking
    /// connection and answer with ACK1.
    pub(in crate::engine) fn accept_registration(
        &mut self,
        upstream: Hop,
        syn: RegisterSyn,
        now_ms: u64,
    ) {
        let request_id = syn.request_id;
        let keypair = EphemeralKeypair::generate();
        let transcript = syn.key_transcript_hash(keypair.public(), self.identity.id());
        let keys = match keypair.derive(&syn.requester_ecdh, &transcript) {
            Ok(keys) => keys,
            Err(e) => {
                debug!(request = %request_id, error = %e, "Key agreement failed");
                self.send_failure(
                    upstream,
                    request_id,
                    StatusCode::BadSignature,
                    Flow::Register,
                    Role::Responder,
                    now_ms,
                );
                return;
            }
        };

        let requester = request_id.requester;
        let allocated = self.neighbors.allocate(|token| {
            NeighborConnection::new(
                token,
                ConnectionRole::Responder,
                requester,
                request_id,
                keys.clone(),
                now_ms,
            )
        });
        let token = match allocated {
            Ok(token) => token,
            Err(e) => {
                warn!(request = %request_id, error = %e, "Token allocation failed");
                self.send_failure(
                    upstream,
                    request_id,
                    StatusCode::Overloaded,
                    Flow::Register,
                    Role::Responder,
                    now_ms,
                );
                return;
            }
        };

        let mut ack1 = RegisterAck1 {
            request_id,
            seq: self.next_seq(),
            status: StatusCode::Ok,
            responder_ecdh: *keypair.public(),
            encrypted_params: TransportParams::new(self.local_endpoint, token)
                .encrypt(&keys, Direction::ToRequester),
            responder_id: *self.identity.id(),
            signature: UNSIGNED,
            requester_endpoint: match upstream {
                Hop::Direct(addr) => Some(addr),
                Hop::Neighbor(_) => None,
            },
        };
        ack1.signature = self.identity.sign(&ack1.signed_fields(&syn));

        let waiter = Waiter::Npack {
            flow: Flow::Register,
            role: Role::Responder,
            request_id,
            packet: PacketType::RegisterAck1,
            hop: upstream,
        };
        if let Err(e) = self.send_hop(upstream, ack1.seq, |l| ack1.encode(l), waiter, now_ms) {
            debug!(request = %request_id, error = %e, "Failed to send ACK1");
            self.dispose_connection(token, now_ms, "ACK1 not sent");
            return;
        }

        info!(
            request = %request_id,
            requester = %requester.short_hex(),
            token = %token,
            upstream = %upstream,
            "Accepted registration"
        );
        self.acceptances.insert(
            request_id,
            Acceptance {
                upstream,
                token,
                syn,
                ack1,
                ack2: None,
                started_ms: now_ms,
            },
        );
    }

    pub(in crate::engine) fn accept_register_ack2(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        source: Hop,
        ack2: RegisterAck2,
        now_ms: u64,
    ) {
        let request_id = ack2.request_id;
        let Some(acceptance) = self.acceptances.get(&request_id) else {
            return;
        };
        if source != acceptance.upstream {
            debug!(request = %request_id, source = %source, "ACK2 from wrong hop");
            return;
        }
        if acceptance.ack2.is_some() {
            self.acknowledge(data, from, source, ack2.seq, StatusCode::Ok, now_ms);
            return;
        }
        if !ack2.verify_signature(&acceptance.syn, &acceptance.ack1) {
            self.acknowledge(data, from, source, ack2.seq, StatusCode::BadSignature, now_ms);
            return;
        }
        let token = acceptance.token;
        self.touch(source, now_ms);

        let Some(conn) = self.neighbors.get_mut(token) else {
            self.acknowledge(data, from, source, ack2.seq, StatusCode::RouteUnavailable, now_ms);
            self.abort_acceptance(request_id, now_ms, "connection gone");
            return;
        };
        let params = TransportParams::decrypt(
            &ack2.encrypted_params,
            conn.keys(),
            Direction::ToResponder,
        );
        let initialized = params
            .map_err(|e| e.to_string())
            .and_then(|p| {
                conn.init_p2p_stream(p.endpoint, p.token)
                    .map(|_| p)
                    .map_err(|e| e.to_string())
            });
        let params = match initialized {
            Ok(params) => params,
            Err(e) => {
                debug!(request = %request_id, error = %e, "Rejecting ACK2 params");
                self.acknowledge(data, from, source, ack2.seq, StatusCode::BadSignature, now_ms);
                self.abort_acceptance(request_id, now_ms, "bad ACK2 params");
                return;
            }
        };

        self.acknowledge(data, from, source, ack2.seq, StatusCode::Ok, now_ms);
        if let Some(acceptance) = self.acceptances.get_mut(&request_id) {
            acceptance.ack2 = Some(ack2);
        }
        debug!(
            request = %request_id,
            token = %token,
            endpoint = %params.endpoint,
            "Received ACK2, stream initialized"
        );
    }

    /// Our confirmation for the handshake that created `token`, sent back in
    /// the PONG to the requester's confirmation ping.
    pub(in crate::engine) fn registration_confirmation(
        &self,
        token: NeighborToken,
    ) -> Option<RegistrationSignature> {
        let acceptance = self.acceptances.values().find(|a| a.token == token)?;
        let ack2 = acceptance.ack2.as_ref()?;
        Some(self.identity.sign(&RegisterCfm::responder_message(
            &acceptance.syn,
            &acceptance.ack1,
            ack2,
        )))
    }

    pub(in crate::engine) fn accept_register_cfm(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        source: Hop,
        cfm: RegisterCfm,
        now_ms: u64,
    ) {
        let request_id = cfm.request_id;
        let Some(acceptance) = self.acceptances.get(&request_id) else {
            return;
        };
        if source != acceptance.upstream {
            debug!(request = %request_id, source = %source, "CFM from wrong hop");
            return;
        }
        let Some(ack2) = &acceptance.ack2 else {
            debug!(request = %request_id, "CFM before ACK2");
            return;
        };
        if !cfm.verify_signatures(&acceptance.syn, &acceptance.ack1, ack2) {
            self.acknowledge(data, from, source, cfm.seq, StatusCode::BadSignature, now_ms);
            return;
        }
        self.touch(source, now_ms);
        self.acknowledge(data, from, source, cfm.seq, StatusCode::Ok, now_ms);

        let Some(acceptance) = self.acceptances.remove(&request_id) else {
            return;
        };
        self.cancel_flow(Flow::Register, Role::Responder, request_id);
        let token = acceptance.token;
        let established = self
            .neighbors
            .get_mut(token)
            .map(|conn| conn.mark_established(now_ms));
        match established {
            Some(Ok(())) => {
                info!(
                    token = %token,
                    remote = %request_id.requester.short_hex(),
                    role = "responder",
                    "Neighbor established"
                );
                self.events.push_back(EngineEvent::NeighborEstablished {
                    token,
                    remote: request_id.requester,
                    role: ConnectionRole::Responder,
                });
            }
            Some(Err(e)) => {
                debug!(request = %request_id, error = %e, "Cannot establish connection");
                self.dispose_connection(token, now_ms, "establish failed");
            }
            None => debug!(request = %request_id, token = %token, "Connection gone before CFM"),
        }
    }

    /// Drop an unfinished acceptance and its connection.
    pub(in crate::engine) fn abort_acceptance(
        &mut self,
        request_id: RequestId,
        now_ms: u64,
        reason: &str,
    ) {
        let Some(acceptance) = self.acceptances.remove(&request_id) else {
            return;
        };
        self.cancel_flow(Flow::Register, Role::Responder, request_id);
        debug!(request = %request_id, reason, "Acceptance aborted");
        self.dispose_connection(acceptance.token, now_ms, reason);
    }

    pub(in crate::engine) fn on_responder_npack(
        &mut self,
        request_id: RequestId,
        packet: PacketType,
        status: Option<StatusCode>,
        now_ms: u64,
    ) {
        if packet == PacketType::RegisterAck1 && status != Some(StatusCode::Ok) {
            self.abort_acceptance(request_id, now_ms, "ACK1 not acknowledged");
        }
    }

    pub(in crate::engine) fn expire_acceptances(&mut self, now_ms: u64) {
        let timeout = self.config.handshake.registration_timeout_ms;
        let expired: Vec<RequestId> = self
            .acceptances
            .iter()
            .filter(|(_, a)| now_ms.saturating_sub(a.started_ms) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            self.abort_acceptance(request_id, now_ms, "handshake timed out");
        }
    }
}
