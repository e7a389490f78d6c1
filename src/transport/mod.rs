//! Datagram transport.
//!
//! The engine speaks raw UDP payloads addressed by `SocketAddr`. The
//! transport owns the socket, runs the receive loop as its own task and
//! hands every datagram to the node over a bounded channel.

pub mod udp;

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use crate::clock::unix_now_ms;

// ============================================================================
// Packet Channel Types
// ============================================================================

/// A datagram read off the socket.
#[derive(Clone, Debug)]
pub struct ReceivedDatagram {
    /// Sender address as reported by the socket.
    pub from: SocketAddr,
    pub data: Vec<u8>,
    /// Receipt timestamp (Unix milliseconds).
    pub timestamp_ms: u64,
}

impl ReceivedDatagram {
    /// Create a received datagram stamped with the current time.
    pub fn new(from: SocketAddr, data: Vec<u8>) -> Self {
        Self::with_timestamp(from, data, unix_now_ms())
    }

    pub fn with_timestamp(from: SocketAddr, data: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            from,
            data,
            timestamp_ms,
        }
    }
}

/// Channel sender for received datagrams.
pub type PacketTx = tokio::sync::mpsc::Sender<ReceivedDatagram>;

/// Channel receiver for received datagrams.
pub type PacketRx = tokio::sync::mpsc::Receiver<ReceivedDatagram>;

/// Create a packet channel with the given buffer size.
pub fn packet_channel(buffer: usize) -> (PacketTx, PacketRx) {
    tokio::sync::mpsc::channel(buffer)
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Errors related to transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport failed to start: {0}")]
    StartFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid transport address: {0}")]
    InvalidAddress(String),

    #[error("mtu exceeded: packet {packet_size} > mtu {mtu}")]
    MtuExceeded { packet_size: usize, mtu: u16 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Transport State
// ============================================================================

/// Transport lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// Configured but not started.
    Configured,
    /// Binding in progress.
    Starting,
    /// Socket bound, receive loop running.
    Up,
    /// Was up, now stopped.
    Down,
    /// Failed to start.
    Failed,
}

impl TransportState {
    /// Check if the transport is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, TransportState::Up)
    }

    /// Check if the transport can be started.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            TransportState::Configured | TransportState::Down | TransportState::Failed
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Configured => "configured",
            TransportState::Starting => "starting",
            TransportState::Up => "up",
            TransportState::Down => "down",
            TransportState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}
