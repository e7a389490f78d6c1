//! DRP Node
//!
//! Async runtime around the protocol [`Engine`](crate::engine::Engine).
//! The node binds the UDP transport, then hands engine, transport and
//! clock to a single spawned task that owns every piece of protocol state.
//! Applications drive it through a cloneable [`NodeHandle`] and observe
//! progress on a broadcast stream of [`EngineEvent`]s.

mod handle;
mod lifecycle;
mod rx_loop;

pub use handle::NodeHandle;

use crate::config::{Config, ConfigError};
use crate::engine::{EngineError, EngineEvent, InviteAcceptor, NeighborInfo};
use crate::identity::{Identity, RegistrationId};
use crate::neighbor::NeighborToken;
use crate::transport::TransportError;
use crate::wire::RequestId;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Errors related to node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node not started")]
    NotStarted,

    #[error("node already started")]
    AlreadyStarted,

    #[error("node runtime has stopped")]
    Stopped,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Node operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started.
    Created,
    /// Binding the transport.
    Starting,
    /// Engine loop running.
    Running,
    /// Tearing down neighbors and closing the socket.
    Stopping,
    /// Stopped. The identity went with the engine, so a stopped node
    /// cannot be restarted.
    Stopped,
}

impl NodeState {
    /// Check if node is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    /// Check if node can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, NodeState::Created)
    }

    /// Check if node can be stopped.
    pub fn can_stop(&self) -> bool {
        matches!(self, NodeState::Running)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Requests posted from handles onto the engine loop.
pub(crate) enum NodeCommand {
    Register {
        entry: SocketAddr,
        min_distance: u32,
        reply: oneshot::Sender<Result<RequestId, EngineError>>,
    },
    RegisterViaNeighbor {
        token: NeighborToken,
        min_distance: u32,
        reply: oneshot::Sender<Result<RequestId, EngineError>>,
    },
    Invite {
        destination: RegistrationId,
        session_description: Vec<u8>,
        reply: oneshot::Sender<Result<RequestId, EngineError>>,
    },
    Teardown {
        token: NeighborToken,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<NeighborInfo>>,
    },
    SetInviteAcceptor {
        acceptor: InviteAcceptor,
    },
    /// Tear down every neighbor, flush, then stop the loop.
    Shutdown { reply: oneshot::Sender<()> },
}

/// A DRP peer: identity, configuration and, once started, the engine loop.
pub struct Node {
    config: Config,
    id: RegistrationId,
    /// Moved into the engine on start.
    identity: Option<Identity>,
    state: NodeState,
    handle: Option<NodeHandle>,
    task: Option<JoinHandle<()>>,
}

impl Node {
    /// Create a node from configuration. Nothing is bound until
    /// [`start`](Node::start).
    pub fn new(config: Config) -> Result<Self, NodeError> {
        let identity = config.create_identity()?;
        Ok(Self::with_identity(config, identity))
    }

    pub fn with_identity(config: Config, identity: Identity) -> Self {
        Self {
            config,
            id: *identity.id(),
            identity: Some(identity),
            state: NodeState::Created,
            handle: None,
            task: None,
        }
    }

    pub fn id(&self) -> &RegistrationId {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle to the running engine loop.
    pub fn handle(&self) -> Option<NodeHandle> {
        self.handle.clone()
    }

    /// Bound UDP address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().map(|h| h.local_addr())
    }

    /// Subscribe to engine events. Only events emitted after the call are
    /// delivered.
    pub fn subscribe(&self) -> Option<tokio::sync::broadcast::Receiver<EngineEvent>> {
        self.handle.as_ref().map(|h| h.subscribe())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}
