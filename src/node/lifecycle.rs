//! Node start and stop.

use super::rx_loop::{EngineLoop, LoopChannels};
use super::{Node, NodeError, NodeHandle, NodeState};
use crate::clock::Clock;
use crate::engine::Engine;
use crate::transport::packet_channel;
use crate::transport::udp::UdpTransport;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

impl Node {
    /// Bind the transport and spawn the engine loop.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&mut self) -> Result<NodeHandle, NodeError> {
        if !self.state.can_start() {
            return Err(NodeError::AlreadyStarted);
        }
        let Some(identity) = self.identity.take() else {
            return Err(NodeError::AlreadyStarted);
        };
        self.state = NodeState::Starting;

        let buffers = self.config.node.buffers.clone();
        let (packet_tx, packet_rx) = packet_channel(buffers.packet_channel);
        let mut transport = UdpTransport::new(self.config.transport.udp.clone(), packet_tx);

        if let Err(e) = transport.start_async().await {
            self.identity = Some(identity);
            self.state = NodeState::Created;
            return Err(e.into());
        }
        let Some(local_addr) = transport.local_addr() else {
            self.identity = Some(identity);
            self.state = NodeState::Created;
            return Err(NodeError::NotStarted);
        };

        let clock = Clock::new();
        let engine = Engine::new(identity, self.config.node.clone(), local_addr, clock.now_ms());

        let (command_tx, command_rx) = mpsc::channel(buffers.command_channel);
        let (event_tx, _) = broadcast::channel(buffers.event_channel);
        // Solutions are bounded by the pending-request cap, not the channel
        let (pow_tx, pow_rx) = mpsc::channel(self.config.node.limits.max_pending_requests.max(1));

        let handle = NodeHandle::new(self.id, local_addr, command_tx, event_tx.clone());
        let engine_loop = EngineLoop::new(engine, transport, clock, pow_tx, event_tx, &self.config.node);
        let channels = LoopChannels {
            packets: packet_rx,
            commands: command_rx,
            solutions: pow_rx,
        };
        self.task = Some(tokio::spawn(engine_loop.run(channels)));
        self.handle = Some(handle.clone());
        self.state = NodeState::Running;

        info!(
            id = %self.id,
            local_addr = %local_addr,
            "Node started"
        );

        Ok(handle)
    }

    /// Tear down neighbors, stop the engine loop and close the socket.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        if !self.state.can_stop() {
            return Err(NodeError::NotStarted);
        }
        self.state = NodeState::Stopping;
        info!(state = %self.state, "Node stopping");

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.shutdown().await {
                warn!(error = %e, "Engine loop already gone");
            }
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine loop task failed");
            }
        }

        self.state = NodeState::Stopped;
        info!(state = %self.state, "Node stopped");
        Ok(())
    }
}
