//! Cloneable front end of a running node.

use super::{NodeCommand, NodeError};
use crate::engine::{EngineEvent, NeighborInfo};
use crate::identity::RegistrationId;
use crate::neighbor::NeighborToken;
use crate::wire::{RequestId, StatusCode};
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Typed API onto the engine loop. Every call is a message to the loop;
/// nothing here touches protocol state directly.
///
/// Requests return as soon as the engine accepted them. Their outcome
/// arrives later as an [`EngineEvent`] carrying the same [`RequestId`].
#[derive(Clone, Debug)]
pub struct NodeHandle {
    id: RegistrationId,
    local_addr: SocketAddr,
    commands: mpsc::Sender<NodeCommand>,
    events: broadcast::Sender<EngineEvent>,
}

impl NodeHandle {
    pub(super) fn new(
        id: RegistrationId,
        local_addr: SocketAddr,
        commands: mpsc::Sender<NodeCommand>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            id,
            local_addr,
            commands,
            events,
        }
    }

    pub fn id(&self) -> &RegistrationId {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Join the overlay through the peer at `entry`.
    pub async fn register(&self, entry: SocketAddr, min_distance: u32) -> Result<RequestId, NodeError> {
        Ok(self
            .request(|reply| NodeCommand::Register {
                entry,
                min_distance,
                reply,
            })
            .await??)
    }

    /// Ask an established neighbor to find us another one.
    pub async fn register_via_neighbor(
        &self,
        token: NeighborToken,
        min_distance: u32,
    ) -> Result<RequestId, NodeError> {
        Ok(self
            .request(|reply| NodeCommand::RegisterViaNeighbor {
                token,
                min_distance,
                reply,
            })
            .await??)
    }

    /// Route a session description to `destination`.
    pub async fn invite(
        &self,
        destination: RegistrationId,
        session_description: Vec<u8>,
    ) -> Result<RequestId, NodeError> {
        Ok(self
            .request(|reply| NodeCommand::Invite {
                destination,
                session_description,
                reply,
            })
            .await??)
    }

    pub async fn teardown(&self, token: NeighborToken) -> Result<(), NodeError> {
        Ok(self
            .request(|reply| NodeCommand::Teardown { token, reply })
            .await??)
    }

    pub async fn neighbors(&self) -> Result<Vec<NeighborInfo>, NodeError> {
        self.request(|reply| NodeCommand::Neighbors { reply }).await
    }

    /// Install the callback that answers INVITEs addressed to us.
    pub async fn set_invite_acceptor(
        &self,
        acceptor: impl FnMut(&RegistrationId, &[u8]) -> Result<Vec<u8>, StatusCode> + Send + 'static,
    ) -> Result<(), NodeError> {
        self.commands
            .send(NodeCommand::SetInviteAcceptor {
                acceptor: Box::new(acceptor),
            })
            .await
            .map_err(|_| NodeError::Stopped)
    }

    /// Stop the engine loop. Established neighbors are sent a teardown
    /// first.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.request(|reply| NodeCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, NodeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        response.await.map_err(|_| NodeError::Stopped)
    }
}
