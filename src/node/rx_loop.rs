//! Engine event loop.
//!
//! One task owns the engine. It wakes on an inbound datagram, a handle
//! command, a finished proof-of-work search or the periodic tick, feeds the
//! engine, then flushes whatever the engine queued: datagrams to the socket,
//! events to subscribers, puzzles to the blocking pool.

use super::NodeCommand;
use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::engine::{Engine, EngineEvent, PowJob, PowSolution};
use crate::neighbor::{ConnectionState, NeighborToken};
use crate::transport::udp::UdpTransport;
use crate::transport::PacketRx;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Receivers the loop selects over.
pub(super) struct LoopChannels {
    pub packets: PacketRx,
    pub commands: mpsc::Receiver<NodeCommand>,
    pub solutions: mpsc::Receiver<PowSolution>,
}

pub(super) struct EngineLoop {
    engine: Engine,
    transport: UdpTransport,
    clock: Clock,
    pow_tx: mpsc::Sender<PowSolution>,
    event_tx: broadcast::Sender<EngineEvent>,
    tick_interval: Duration,
    resync_interval_ms: u64,
}

impl EngineLoop {
    pub(super) fn new(
        engine: Engine,
        transport: UdpTransport,
        clock: Clock,
        pow_tx: mpsc::Sender<PowSolution>,
        event_tx: broadcast::Sender<EngineEvent>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            engine,
            transport,
            clock,
            pow_tx,
            event_tx,
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            resync_interval_ms: config.clock_resync_secs.saturating_mul(1000),
        }
    }

    /// Run until shutdown is requested or every handle is dropped.
    pub(super) async fn run(mut self, channels: LoopChannels) {
        let LoopChannels {
            mut packets,
            mut commands,
            mut solutions,
        } = channels;

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(id = %self.engine.id().short_hex(), "Engine loop started");

        loop {
            tokio::select! {
                datagram = packets.recv() => {
                    match datagram {
                        Some(d) => {
                            let now_ms = self.clock.now_ms();
                            self.engine.on_datagram(d.from, &d.data, now_ms);
                        }
                        None => {
                            warn!("Packet channel closed");
                            break;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            debug!("All node handles dropped");
                            self.teardown_all().await;
                            break;
                        }
                    }
                }
                Some(solution) = solutions.recv() => {
                    let now_ms = self.clock.now_ms();
                    self.engine.on_pow_solved(solution, now_ms);
                }
                _ = tick.tick() => {
                    self.clock.maybe_resync(self.resync_interval_ms);
                    let now_ms = self.clock.now_ms();
                    self.engine.on_tick(now_ms);
                }
            }
            self.flush().await;
        }

        if let Err(e) = self.transport.stop_async().await {
            debug!(error = %e, "Transport stop failed");
        }
        info!("Engine loop stopped");
    }

    /// Apply one handle command. Returns true when the loop should stop.
    async fn handle_command(&mut self, command: NodeCommand) -> bool {
        let now_ms = self.clock.now_ms();
        match command {
            NodeCommand::Register {
                entry,
                min_distance,
                reply,
            } => {
                let _ = reply.send(self.engine.register(entry, min_distance, now_ms));
            }
            NodeCommand::RegisterViaNeighbor {
                token,
                min_distance,
                reply,
            } => {
                let result = self.engine.register_via_neighbor(token, min_distance, now_ms);
                let _ = reply.send(result);
            }
            NodeCommand::Invite {
                destination,
                session_description,
                reply,
            } => {
                let result = self.engine.invite(destination, session_description, now_ms);
                let _ = reply.send(result);
            }
            NodeCommand::Teardown { token, reply } => {
                let _ = reply.send(self.engine.teardown(token, now_ms));
            }
            NodeCommand::Neighbors { reply } => {
                let _ = reply.send(self.engine.neighbors());
            }
            NodeCommand::SetInviteAcceptor { acceptor } => {
                self.engine.set_invite_acceptor(acceptor);
            }
            NodeCommand::Shutdown { reply } => {
                self.teardown_all().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    /// Send a teardown PING to every established neighbor and flush it.
    async fn teardown_all(&mut self) {
        let now_ms = self.clock.now_ms();
        let tokens: Vec<NeighborToken> = self
            .engine
            .neighbors()
            .into_iter()
            .filter(|n| n.state == ConnectionState::Established)
            .map(|n| n.token)
            .collect();
        for token in tokens {
            if let Err(e) = self.engine.teardown(token, now_ms) {
                debug!(token = %token, error = %e, "Teardown on shutdown failed");
            }
        }
        self.flush().await;
    }

    /// Drain the engine's outputs.
    async fn flush(&mut self) {
        while let Some(job) = self.engine.poll_pow_job() {
            self.spawn_pow(job);
        }

        while let Some(datagram) = self.engine.poll_transmit() {
            if let Err(e) = self.transport.send_async(datagram.to, &datagram.data).await {
                debug!(to = %datagram.to, error = %e, "Dropping outbound datagram");
            }
        }

        while let Some(event) = self.engine.poll_event() {
            trace!(event = ?event, "Engine event");
            // No subscribers is fine
            let _ = self.event_tx.send(event);
        }
    }

    /// Search on the blocking pool so the loop keeps serving packets.
    fn spawn_pow(&self, job: PowJob) {
        let request_id = job.request_id();
        let pow_tx = self.pow_tx.clone();
        debug!(request = %request_id, "Starting proof-of-work search");
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || job.solve()).await {
                Ok(solution) => {
                    if pow_tx.send(solution).await.is_err() {
                        debug!(request = %request_id, "Engine loop gone, discarding proof of work");
                    }
                }
                Err(e) => warn!(request = %request_id, error = %e, "Proof-of-work worker failed"),
            }
        });
    }
}
