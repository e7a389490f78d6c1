//! Neighbor Token Table
//!
//! Every neighbor connection is addressed locally by a 32-bit token chosen
//! by the receiver. Peers put the receiver's token in front of every
//! relayed or peer-to-peer packet, and the low 16 bits of that token index
//! a dense slot array for O(1) dispatch.
//!
//! ## Design
//!
//! - Tokens are random (cryptographically secure) to prevent guessing
//! - The low 16 bits must be unique among live connections; a collision
//!   triggers regeneration, bounded by `max_attempts`
//! - Slots hold a position into a dense entry list, so iteration only
//!   visits live connections
//! - A slot is only released after the connection's disposal grace period,
//!   so late packets addressed to a disposed token still find it (and are
//!   ignored) instead of hitting a reused slot
//!
//! ## Wire Format
//!
//! ```text
//! [type:1][flags:1][token:4 LE][...body...][hmac:32]
//! ```

use rand::RngExt;
use std::fmt;
use thiserror::Error;

/// Number of slots addressable by the low 16 bits of a token.
pub const TOKEN_SLOTS: usize = 1 << 16;

/// Errors related to token allocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("no available tokens after {attempts} attempts (too many connections)")]
    Exhausted { attempts: usize },

    #[error("token {0} not found")]
    NotFound(NeighborToken),

    #[error("token slot {0:04x} already in use")]
    SlotInUse(u16),
}

/// A 32-bit neighbor connection token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NeighborToken(u32);

impl NeighborToken {
    /// Create from raw u32.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw u32 value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Slot index (low 16 bits).
    pub fn slot(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Create from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for NeighborToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Dense table of values keyed by neighbor token.
///
/// Lookups check the full 32-bit token, not just the slot, so a packet
/// carrying a stale token whose slot was reused is rejected.
pub struct TokenTable<T> {
    /// Per slot, position in `entries` plus one. Zero marks a free slot.
    slots: Vec<u32>,
    entries: Vec<(NeighborToken, T)>,
    max_attempts: usize,
}

impl<T> TokenTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::with_max_attempts(100)
    }

    /// Create with a specific max attempts limit.
    pub fn with_max_attempts(max_attempts: usize) -> Self {
        Self {
            slots: vec![0; TOKEN_SLOTS],
            entries: Vec::new(),
            max_attempts,
        }
    }

    fn slot_free(&self, token: NeighborToken) -> bool {
        self.slots[token.slot() as usize] == 0
    }

    fn position(&self, token: NeighborToken) -> Option<usize> {
        match self.slots[token.slot() as usize] {
            0 => None,
            p => {
                let index = p as usize - 1;
                (self.entries[index].0 == token).then_some(index)
            }
        }
    }

    fn place(&mut self, token: NeighborToken, value: T) {
        self.entries.push((token, value));
        self.slots[token.slot() as usize] = self.entries.len() as u32;
    }

    /// Allocate a fresh random token whose slot is free.
    ///
    /// The value is built by `make` once the token is known, so it can
    /// embed its own token.
    pub fn allocate_with(
        &mut self,
        make: impl FnOnce(NeighborToken) -> T,
    ) -> Result<NeighborToken, TokenError> {
        let mut rng = rand::rng();

        for _ in 0..self.max_attempts {
            let candidate = NeighborToken(rng.random::<u32>());
            if self.slot_free(candidate) {
                self.place(candidate, make(candidate));
                return Ok(candidate);
            }
        }

        Err(TokenError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    /// Insert a value under a specific token (for tests and migration).
    pub fn insert(&mut self, token: NeighborToken, value: T) -> Result<(), TokenError> {
        if !self.slot_free(token) {
            return Err(TokenError::SlotInUse(token.slot()));
        }
        self.place(token, value);
        Ok(())
    }

    /// Look up by full token.
    pub fn get(&self, token: NeighborToken) -> Option<&T> {
        self.position(token).map(|i| &self.entries[i].1)
    }

    /// Mutable lookup by full token.
    pub fn get_mut(&mut self, token: NeighborToken) -> Option<&mut T> {
        match self.position(token) {
            Some(i) => Some(&mut self.entries[i].1),
            None => None,
        }
    }

    /// Remove a token, returning its value.
    pub fn remove(&mut self, token: NeighborToken) -> Result<T, TokenError> {
        let index = self.position(token).ok_or(TokenError::NotFound(token))?;
        self.slots[token.slot() as usize] = 0;
        let (_, value) = self.entries.swap_remove(index);
        if let Some((moved, _)) = self.entries.get(index) {
            self.slots[moved.slot() as usize] = index as u32 + 1;
        }
        Ok(value)
    }

    /// Check if a token is currently allocated.
    pub fn contains(&self, token: NeighborToken) -> bool {
        self.position(token).is_some()
    }

    /// Number of allocated tokens.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all live entries.
    pub fn iter(&self) -> impl Iterator<Item = (NeighborToken, &T)> {
        self.entries.iter().map(|(token, value)| (*token, value))
    }

    /// Iterate mutably over all live entries.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NeighborToken, &mut T)> {
        self.entries.iter_mut().map(|(token, value)| (*token, value))
    }

    /// Collect all tokens.
    pub fn tokens(&self) -> Vec<NeighborToken> {
        self.iter().map(|(t, _)| t).collect()
    }
}

impl<T> Default for TokenTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
