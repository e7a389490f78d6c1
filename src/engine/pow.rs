//! Proof-of-work searches handed to the runtime.
//!
//! The engine never searches nonces itself. It queues a [`PowJob`]; the
//! runtime solves it on a blocking worker and feeds the [`PowSolution`]
//! back through `Engine::on_pow_solved`.

use std::net::IpAddr;

use crate::admission::{solve_pow1, solve_pow2, PowNonce};
use crate::wire::{RequestId, CHALLENGE_SIZE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PowJob {
    /// Stateless puzzle bound to the claimed address.
    Pow1 {
        request_id: RequestId,
        timestamp: u32,
        claimed_ip: IpAddr,
        max_attempts: u64,
    },
    /// Stateful puzzle bound to the entry peer's challenge and our id.
    Pow2 {
        request_id: RequestId,
        challenge: [u8; CHALLENGE_SIZE],
        max_attempts: u64,
    },
}

impl PowJob {
    pub fn request_id(&self) -> RequestId {
        match self {
            PowJob::Pow1 { request_id, .. } | PowJob::Pow2 { request_id, .. } => *request_id,
        }
    }

    pub fn max_attempts(&self) -> u64 {
        match self {
            PowJob::Pow1 { max_attempts, .. } | PowJob::Pow2 { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    /// Run the search. Blocks for as long as the puzzle takes.
    pub fn solve(self) -> PowSolution {
        let nonce = match &self {
            PowJob::Pow1 {
                timestamp,
                claimed_ip,
                max_attempts,
                ..
            } => solve_pow1(*timestamp, claimed_ip, *max_attempts),
            PowJob::Pow2 {
                request_id,
                challenge,
                max_attempts,
            } => solve_pow2(
                challenge,
                &request_id.requester,
                request_id.timestamp,
                *max_attempts,
            ),
        };
        PowSolution { job: self, nonce }
    }
}

/// Result of a search; `nonce` is `None` when the attempt bound was hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowSolution {
    pub job: PowJob,
    pub nonce: Option<PowNonce>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{verify_pow1, verify_pow2};
    use crate::identity::Identity;

    #[test]
    fn test_pow1_job_solves() {
        let request_id = RequestId::new(*Identity::generate().id(), 1_700_000_000);
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let job = PowJob::Pow1 {
            request_id,
            timestamp: request_id.timestamp,
            claimed_ip: ip,
            max_attempts: 1 << 20,
        };
        let solution = job.clone().solve();
        assert_eq!(solution.job, job);
        let nonce = solution.nonce.expect("solvable");
        assert!(verify_pow1(request_id.timestamp, &ip, &nonce));
    }

    #[test]
    fn test_pow2_job_binds_requester() {
        let request_id = RequestId::new(*Identity::generate().id(), 1_700_000_000);
        let challenge = [9u8; CHALLENGE_SIZE];
        let solution = PowJob::Pow2 {
            request_id,
            challenge,
            max_attempts: 1 << 20,
        }
        .solve();
        let nonce = solution.nonce.expect("solvable");
        assert!(verify_pow2(
            &challenge,
            &request_id.requester,
            request_id.timestamp,
            &nonce
        ));
        assert_eq!(solution.job.request_id(), request_id);
    }

    #[test]
    fn test_exhausted_search_reports_none() {
        let request_id = RequestId::new(*Identity::generate().id(), 1_700_000_000);
        let solution = PowJob::Pow1 {
            request_id,
            timestamp: 1,
            claimed_ip: "198.51.100.4".parse().unwrap(),
            max_attempts: 0,
        }
        .solve();
        assert!(solution.nonce.is_none());
    }
}
