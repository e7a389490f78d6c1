//! Neighbor liveness: PING/PONG, teardown and disposal.

use std::net::SocketAddr;

use tracing::{debug, info};

use super::{hop_matcher, Engine, EngineError, EngineEvent, Hop, Waiter};
use crate::neighbor::{ConnectionState, NeighborToken};
use crate::wire::{Framed, HopAuth, PacketType, PingFlags, PingPacket, PongPacket};

impl Engine {
    /// Close an established connection. The remote is told with a teardown
    /// PING; both sides dispose after the grace period.
    pub fn teardown(&mut self, token: NeighborToken, now_ms: u64) -> Result<(), EngineError> {
        let conn = self
            .neighbors
            .get(token)
            .ok_or(EngineError::UnknownNeighbor(token))?;
        if !conn.is_established() {
            return Err(EngineError::NotEstablished(token));
        }
        self.send_ping(token, true, now_ms)?;
        if let Some(conn) = self.neighbors.get_mut(token) {
            conn.begin_teardown(now_ms);
        }
        info!(token = %token, "Tearing down neighbor");
        Ok(())
    }

    fn send_ping(
        &mut self,
        token: NeighborToken,
        teardown: bool,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let (neighbor_count, busy_sectors) = self.advertised_load();
        let key = self.neighbors.hmac_key(token).cloned();
        let conn = self
            .neighbors
            .get_mut(token)
            .ok_or(EngineError::UnknownNeighbor(token))?;
        let (Some(link), Some(addr)) = (conn.link(), conn.remote_endpoint()) else {
            return Err(EngineError::HopUnavailable(Hop::Neighbor(token)));
        };
        let ping_id = conn.begin_ping(now_ms);
        let ping = PingPacket {
            ping_id,
            flags: PingFlags {
                teardown,
                request_confirmation: false,
            },
            neighbor_count,
            busy_sectors,
        };
        let data = ping.encode(&link)?;
        let matcher = hop_matcher(
            addr,
            PongPacket::prefix(&HopAuth::Relayed { token }, 0, ping_id),
            key,
            |d, k| PongPacket::decode(d, k).is_ok(),
        );
        self.pending.send_and_wait(
            addr,
            Some(data),
            matcher,
            now_ms + self.config.handshake.hop_timeout_ms,
            &self.config.retransmit,
            Waiter::Pong { token, ping_id },
            now_ms,
            &mut self.outbox,
        )?;
        debug!(token = %token, ping_id, teardown, "Sent PING");
        Ok(())
    }

    pub(in crate::engine) fn on_pong(
        &mut self,
        token: NeighborToken,
        ping_id: u32,
        response: &[u8],
        now_ms: u64,
    ) {
        let key = self.neighbors.hmac_key(token).cloned();
        let Ok(Framed { packet: pong, .. }) = PongPacket::decode(response, key.as_ref()) else {
            return;
        };
        let Some(conn) = self.neighbors.get_mut(token) else {
            return;
        };
        let rtt = conn.on_pong(ping_id, now_ms);
        conn.update_remote_load(pong.neighbor_count, pong.busy_sectors);
        debug!(token = %token, rtt_ms = ?rtt, "Received PONG");
    }

    pub(in crate::engine) fn handle_ping(&mut self, data: &[u8], from: SocketAddr, now_ms: u64) {
        let key = self.key_for(data);
        let Framed { auth, packet: ping } = match PingPacket::decode(data, key.as_ref()) {
            Ok(framed) => framed,
            Err(e) => {
                self.log_decode_failure(PacketType::Ping, from, data, &e);
                return;
            }
        };
        let HopAuth::Relayed { token } = auth else {
            return;
        };
        let confirmation = if ping.flags.request_confirmation {
            self.registration_confirmation(token)
        } else {
            None
        };
        let (neighbor_count, busy_sectors) = self.advertised_load();

        let Some(conn) = self.neighbors.get_mut(token) else {
            return;
        };
        conn.touch(now_ms);
        conn.update_remote_load(ping.neighbor_count, ping.busy_sectors);
        let Some(link) = conn.link() else {
            return;
        };
        let tearing_down = ping.flags.teardown && conn.begin_teardown(now_ms);

        let pong = PongPacket {
            ping_id: ping.ping_id,
            neighbor_count,
            busy_sectors,
            confirmation,
        };
        match pong.encode(&link) {
            Ok(bytes) => self
                .responder
                .respond(data, from, bytes, now_ms, &mut self.outbox),
            Err(e) => debug!(error = %e, "Failed to encode PONG"),
        }
        if tearing_down {
            info!(token = %token, "Neighbor requested teardown");
        }
    }

    /// Periodic liveness pass over every connection.
    pub(in crate::engine) fn check_neighbors(&mut self, now_ms: u64) {
        let config = &self.config.liveness;
        let mut to_dispose = Vec::new();
        let mut to_ping = Vec::new();
        for token in self.neighbors.tokens() {
            let Some(conn) = self.neighbors.get(token) else {
                continue;
            };
            match conn.state() {
                ConnectionState::Established if conn.timed_out(now_ms, config) => {
                    to_dispose.push((token, "timed out"))
                }
                ConnectionState::Established if conn.ping_due(now_ms, config) => {
                    to_ping.push(token)
                }
                ConnectionState::TearingDown { .. } if conn.teardown_expired(now_ms, config) => {
                    to_dispose.push((token, "teardown complete"))
                }
                _ => {}
            }
        }

        for (token, reason) in to_dispose {
            self.dispose_connection(token, now_ms, reason);
        }
        for token in to_ping {
            if let Err(e) = self.send_ping(token, false, now_ms) {
                debug!(token = %token, error = %e, "Failed to send PING");
            }
        }

        let reclaimed = self.neighbors.reclaim(now_ms, &self.config.liveness);
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "Reclaimed token slots");
        }
    }

    /// Dispose a connection. Only connections that were established are
    /// reported to the application.
    pub(in crate::engine) fn dispose_connection(
        &mut self,
        token: NeighborToken,
        now_ms: u64,
        reason: &str,
    ) {
        let Some(conn) = self.neighbors.get_mut(token) else {
            return;
        };
        let previous = conn.state();
        let remote = *conn.remote_id();
        if !conn.dispose(now_ms) {
            return;
        }
        self.pending
            .cancel_where(|w| matches!(w, Waiter::Pong { token: t, .. } if *t == token));

        match previous {
            ConnectionState::Established | ConnectionState::TearingDown { .. } => {
                info!(token = %token, remote = %remote.short_hex(), reason, "Neighbor disposed");
                self.events
                    .push_back(EngineEvent::NeighborDisposed { token, remote });
            }
            _ => debug!(token = %token, reason, "Handshaking connection disposed"),
        }
    }
}
