//! Per-hop routing decisions.

use std::cmp::Ordering;

use super::{Coordinates, RoutingPolicy, SectorSet};
use crate::neighbor::NeighborToken;

/// Who would take the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    Local,
    Neighbor(NeighborToken),
}

/// One option considered by the routing engine.
#[derive(Clone, Debug)]
pub struct RouteCandidate {
    pub target: RouteTarget,
    pub coordinates: Coordinates,
    /// Neighbors the candidate already has.
    pub neighbor_count: usize,
    /// Sectors the candidate's neighbors already cover.
    pub busy_sectors: SectorSet,
}

/// Outcome for a REGISTER request at this hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteDecision {
    AcceptLocally,
    Proxy(NeighborToken),
    Unavailable,
}

impl From<RouteTarget> for RouteDecision {
    fn from(target: RouteTarget) -> Self {
        match target {
            RouteTarget::Local => RouteDecision::AcceptLocally,
            RouteTarget::Neighbor(token) => RouteDecision::Proxy(token),
        }
    }
}

/// Score of connecting `requester` to `candidate`.
fn mutual_value(
    policy: &RoutingPolicy,
    requester: &Coordinates,
    candidate: &RouteCandidate,
    max_neighbors: usize,
) -> f64 {
    let distance = candidate.coordinates.distance(requester).normalized();
    let sector = candidate.coordinates.sector_of(requester);
    let coverage = if candidate.busy_sectors.contains(sector) {
        0.0
    } else {
        policy.sector_weight
    };
    let load = candidate.neighbor_count as f64 / max_neighbors.max(1) as f64;
    policy.distance_weight * distance + coverage - policy.load_weight * load
}

/// Local acceptance wins ties, then the lower token.
fn tie_break(a: &RouteTarget, b: &RouteTarget) -> Ordering {
    match (a, b) {
        (RouteTarget::Local, RouteTarget::Local) => Ordering::Equal,
        (RouteTarget::Local, _) => Ordering::Less,
        (_, RouteTarget::Local) => Ordering::Greater,
        (RouteTarget::Neighbor(x), RouteTarget::Neighbor(y)) => x.as_u32().cmp(&y.as_u32()),
    }
}

/// Choose where a REGISTER request goes from this hop.
///
/// `candidates` holds the usable neighbors (source and already-tried
/// removed) plus `RouteTarget::Local` when this peer may accept. Among
/// candidates at least `min_distance` (norm) from the requester the highest
/// mutual value wins. When none qualifies, the request is proxied to the
/// neighbor farthest from the requester to escape a dense region; this peer
/// only accepts if it has no neighbor to proxy to.
pub fn route_register(
    policy: &RoutingPolicy,
    requester: &Coordinates,
    min_distance: u32,
    candidates: &[RouteCandidate],
    max_neighbors: usize,
) -> RouteDecision {
    let eligible: Vec<&RouteCandidate> = candidates
        .iter()
        .filter(|c| c.coordinates.distance(requester).norm() >= min_distance)
        .collect();

    if !eligible.is_empty() {
        let mut best: Option<(&RouteCandidate, f64)> = None;
        for candidate in eligible {
            let value = mutual_value(policy, requester, candidate, max_neighbors);
            let better = match &best {
                None => true,
                Some((b, best_value)) => {
                    value > *best_value
                        || (value == *best_value
                            && tie_break(&candidate.target, &b.target) == Ordering::Less)
                }
            };
            if better {
                best = Some((candidate, value));
            }
        }
        return best.map_or(RouteDecision::Unavailable, |(c, _)| c.target.into());
    }

    let neighbors = candidates
        .iter()
        .filter(|c| matches!(c.target, RouteTarget::Neighbor(_)));
    if let Some(c) = farthest_from(requester, neighbors) {
        return c.target.into();
    }
    if candidates.iter().any(|c| c.target == RouteTarget::Local) {
        RouteDecision::AcceptLocally
    } else {
        RouteDecision::Unavailable
    }
}

fn farthest_from<'a>(
    requester: &Coordinates,
    candidates: impl Iterator<Item = &'a RouteCandidate>,
) -> Option<&'a RouteCandidate> {
    let mut farthest: Option<&RouteCandidate> = None;
    for candidate in candidates {
        let better = match farthest {
            None => true,
            Some(f) => {
                let d = candidate.coordinates.distance(requester);
                let fd = f.coordinates.distance(requester);
                d > fd || (d == fd && tie_break(&candidate.target, &f.target) == Ordering::Less)
            }
        };
        if better {
            farthest = Some(candidate);
        }
    }
    farthest
}

/// Greedy next hop toward `destination` for INVITE.
///
/// Returns the neighbor minimizing distance to the destination, but only
/// if it is strictly closer than we are (prevents loops at local minima).
/// Equal distances prefer the lower token. `None` means route-unavailable.
pub fn route_invite(
    local: &Coordinates,
    destination: &Coordinates,
    neighbors: &[RouteCandidate],
) -> Option<NeighborToken> {
    let my_distance = local.distance(destination);

    let mut best: Option<(NeighborToken, _)> = None;
    for candidate in neighbors {
        let RouteTarget::Neighbor(token) = candidate.target else {
            continue;
        };
        let distance = candidate.coordinates.distance(destination);
        let dominated = match &best {
            None => true,
            Some((best_token, best_dist)) => {
                distance < *best_dist
                    || (distance == *best_dist && token.as_u32() < best_token.as_u32())
            }
        };
        if dominated {
            best = Some((token, distance));
        }
    }

    match best {
        Some((token, distance)) if distance < my_distance => Some(token),
        _ => None,
    }
}
