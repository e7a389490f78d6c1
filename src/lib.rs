//! DRP: Decentralized Registration Protocol
//!
//! A peer-to-peer overlay where joining peers acquire neighbors through a
//! multi-hop REGISTER handshake, pay for admission with proof of work, and
//! reach arbitrary peers by greedy routing in an identity-derived vector
//! space.

pub mod admission;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod identity;
pub mod neighbor;
pub mod node;
pub mod reliable;
pub mod routing;
pub mod transport;
pub mod wire;

// Re-export identity types
pub use identity::{Identity, IdentityError, RegistrationId, RegistrationSignature};

// Re-export config types
pub use config::{Config, ConfigError, IdentityConfig, NodeConfig, TransportConfig, UdpConfig};

// Re-export engine types
pub use engine::{
    Engine, EngineError, EngineEvent, HandshakeError, InviteAcceptor, NeighborInfo, PowJob,
    PowSolution,
};

// Re-export neighbor types
pub use neighbor::{ConnectionRole, ConnectionState, NeighborToken};

// Re-export wire types
pub use wire::{DecodeError, PacketType, RequestId, StatusCode};

// Re-export transport types
pub use transport::udp::UdpTransport;
pub use transport::{packet_channel, PacketRx, PacketTx, ReceivedDatagram, TransportError, TransportState};

// Re-export node types
pub use node::{Node, NodeError, NodeHandle, NodeState};
