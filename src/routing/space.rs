//! Coordinate space, distance and sectors.
//!
//! Each identity maps deterministically to a point on an 8-dimensional
//! torus of signed 16-bit axes. Per-axis differences wrap around, so every
//! point sees the space the same way and no region is an edge.

use std::fmt;

use crate::crypto::sha256;
use crate::identity::RegistrationId;

/// Number of axes.
pub const DIMENSIONS: usize = 8;

/// Number of sectors (one per sign pattern of the axes).
pub const SECTOR_COUNT: usize = 1 << DIMENSIONS;

/// Size of an encoded sector bitmap.
pub const SECTOR_SET_SIZE: usize = SECTOR_COUNT / 8;

const COORDINATE_DOMAIN: &[u8] = b"drp/v1 coordinates";

/// A point in the coordinate space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coordinates([i16; DIMENSIONS]);

impl Coordinates {
    pub fn from_axes(axes: [i16; DIMENSIONS]) -> Self {
        Self(axes)
    }

    /// Place an identity: domain-separated SHA-256 of the public key, two
    /// bytes per axis.
    pub fn of(id: &RegistrationId) -> Self {
        let mut input = Vec::with_capacity(COORDINATE_DOMAIN.len() + 32);
        input.extend_from_slice(COORDINATE_DOMAIN);
        input.extend_from_slice(id.as_bytes());
        let hash = sha256(&input);
        let mut axes = [0i16; DIMENSIONS];
        for (i, axis) in axes.iter_mut().enumerate() {
            *axis = i16::from_le_bytes([hash[2 * i], hash[2 * i + 1]]);
        }
        Self(axes)
    }

    pub fn axes(&self) -> &[i16; DIMENSIONS] {
        &self.0
    }

    /// Squared distance to `other`.
    pub fn distance(&self, other: &Coordinates) -> Distance {
        let sum = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let d = b.wrapping_sub(*a) as i32;
                (d * d) as u64
            })
            .sum();
        Distance(sum)
    }

    /// Sector containing `other` as seen from here.
    pub fn sector_of(&self, other: &Coordinates) -> Sector {
        let mut bits = 0u8;
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            if b.wrapping_sub(*a) >= 0 {
                bits |= 1 << i;
            }
        }
        Sector(bits)
    }
}

impl fmt::Debug for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coordinates{:?}", self.0)
    }
}

/// Squared Euclidean distance on the torus. Totally ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(u64);

impl Distance {
    pub const ZERO: Distance = Distance(0);

    /// Largest possible norm: every axis at half the ring.
    pub const MAX_NORM: u32 = 92_682;

    pub fn from_squared(v: u64) -> Self {
        Self(v)
    }

    pub fn squared(&self) -> u64 {
        self.0
    }

    /// Integer Euclidean norm, the value carried on the wire.
    pub fn norm(&self) -> u32 {
        self.0.isqrt() as u32
    }

    /// Norm scaled into [0, 1].
    pub fn normalized(&self) -> f64 {
        (self.norm() as f64 / Self::MAX_NORM as f64).min(1.0)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.norm())
    }
}

/// One of the 256 direction buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sector(u8);

impl Sector {
    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn index(&self) -> u8 {
        self.0
    }
}

/// Bitmap of sectors already covered by a peer's neighbors.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SectorSet([u8; SECTOR_SET_SIZE]);

impl SectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: [u8; SECTOR_SET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SET_SIZE] {
        &self.0
    }

    pub fn insert(&mut self, sector: Sector) {
        let i = sector.0 as usize;
        self.0[i / 8] |= 1 << (i % 8);
    }

    pub fn contains(&self, sector: Sector) -> bool {
        let i = sector.0 as usize;
        self.0[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for SectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorSet({} busy)", self.len())
    }
}
