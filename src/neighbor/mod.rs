//! Neighbor Connections
//!
//! A neighbor is a peer with an authenticated direct UDP channel. Each
//! connection lives in a [`TokenTable`] slot owned by the engine and is
//! referenced elsewhere only by its [`NeighborToken`].
//!
//! ```text
//! Handshaking ──► Established ──► TearingDown ──► Disposed ──► (slot freed)
//!      │                                              ▲
//!      └──────────────── failure / timeout ───────────┘
//! ```

mod connection;
mod token;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::config::LivenessConfig;
use crate::crypto::HmacKey;
use crate::identity::RegistrationId;
use crate::routing::{Coordinates, SectorSet};

pub use connection::{ConnectionRole, ConnectionState, NeighborConnection};
pub use token::{NeighborToken, TokenError, TokenTable, TOKEN_SLOTS};

/// Errors from neighbor connection state changes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NeighborError {
    #[error("connection {0} already has its peer-to-peer stream")]
    StreamAlreadyInitialized(NeighborToken),

    #[error("connection {0} is disposed")]
    Disposed(NeighborToken),

    #[error("connection {0} is not handshaking")]
    NotHandshaking(NeighborToken),

    #[error("unknown connection {0}")]
    Unknown(NeighborToken),

    #[error(transparent)]
    Token(#[from] TokenError),
}

/// All neighbor connections of one peer.
pub struct NeighborTable {
    table: TokenTable<NeighborConnection>,
}

impl NeighborTable {
    pub fn new(token_attempts: usize) -> Self {
        Self {
            table: TokenTable::with_max_attempts(token_attempts),
        }
    }

    /// Allocate a token and store the connection `make` builds for it.
    pub fn allocate(
        &mut self,
        make: impl FnOnce(NeighborToken) -> NeighborConnection,
    ) -> Result<NeighborToken, TokenError> {
        self.table.allocate_with(make)
    }

    pub fn get(&self, token: NeighborToken) -> Option<&NeighborConnection> {
        self.table.get(token)
    }

    pub fn get_mut(&mut self, token: NeighborToken) -> Option<&mut NeighborConnection> {
        self.table.get_mut(token)
    }

    /// Key for authenticating a packet addressed to `token`. Disposed
    /// connections have none, so their packets are dropped.
    pub fn hmac_key(&self, token: NeighborToken) -> Option<&HmacKey> {
        self.table
            .get(token)
            .filter(|c| c.is_live())
            .and_then(|c| c.hmac_key())
    }

    /// Connections that count as neighbors for routing and liveness.
    pub fn established(&self) -> impl Iterator<Item = &NeighborConnection> {
        self.table
            .iter()
            .map(|(_, c)| c)
            .filter(|c| c.is_established())
    }

    pub fn established_count(&self) -> usize {
        self.established().count()
    }

    /// Connections not yet disposed, handshaking included.
    pub fn live_count(&self) -> usize {
        self.table.iter().filter(|(_, c)| c.is_live()).count()
    }

    /// Live connection to `remote`, if any.
    pub fn find_by_remote(&self, remote: &RegistrationId) -> Option<NeighborToken> {
        self.table
            .iter()
            .find(|(_, c)| c.is_live() && c.remote_id() == remote)
            .map(|(t, _)| t)
    }

    /// Sectors around `local` already covered by established neighbors.
    pub fn busy_sectors(&self, local: &Coordinates) -> SectorSet {
        let mut set = SectorSet::new();
        for conn in self.established() {
            set.insert(local.sector_of(conn.remote_coordinates()));
        }
        set
    }

    pub fn tokens(&self) -> Vec<NeighborToken> {
        self.table.tokens()
    }

    /// Free slots of connections disposed longer than the grace delay.
    pub fn reclaim(&mut self, now_ms: u64, config: &LivenessConfig) -> Vec<NeighborToken> {
        let expired: Vec<NeighborToken> = self
            .table
            .iter()
            .filter(|(_, c)| c.slot_reclaimable(now_ms, config))
            .map(|(t, _)| t)
            .collect();
        for token in &expired {
            let _ = self.table.remove(*token);
        }
        expired
    }

    /// Slots in use, disposed connections included.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl std::fmt::Debug for NeighborTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborTable")
            .field("slots_used", &self.table.len())
            .finish()
    }
}
