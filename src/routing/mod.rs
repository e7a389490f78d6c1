//! Routing Engine
//!
//! Decides, per hop, whether a REGISTER request is accepted here or proxied
//! to a neighbor, and picks the greedy next hop for INVITE requests.

mod decision;
mod space;

use serde::{Deserialize, Serialize};

pub use decision::{route_invite, route_register, RouteCandidate, RouteDecision, RouteTarget};
pub use space::{
    Coordinates, Distance, Sector, SectorSet, DIMENSIONS, SECTOR_COUNT, SECTOR_SET_SIZE,
};

/// Weights of the mutual-connection-value heuristic.
///
/// These are local policy, not protocol: peers with different weights
/// interoperate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Reward for distance between candidate and requester
    /// (`routing.distance_weight`).
    #[serde(default = "RoutingPolicy::default_distance_weight")]
    pub distance_weight: f64,

    /// Reward when the requester falls in a sector the candidate does not
    /// cover yet (`routing.sector_weight`).
    #[serde(default = "RoutingPolicy::default_sector_weight")]
    pub sector_weight: f64,

    /// Penalty per fraction of the neighbor limit already used
    /// (`routing.load_weight`).
    #[serde(default = "RoutingPolicy::default_load_weight")]
    pub load_weight: f64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            distance_weight: 1.0,
            sector_weight: 0.5,
            load_weight: 0.25,
        }
    }
}

impl RoutingPolicy {
    fn default_distance_weight() -> f64 {
        1.0
    }
    fn default_sector_weight() -> f64 {
        0.5
    }
    fn default_load_weight() -> f64 {
        0.25
    }
}
