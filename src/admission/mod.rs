//! Admission Filter
//!
//! The entry peer admits a joining peer in two proof-of-work stages:
//!
//! 1. **Stateless**: a PoW1 solution over `(timestamp, claimed IP, nonce)`
//!    within clock-skew tolerance and not seen before earns a random
//!    16-byte challenge bound to the requester's endpoint.
//! 2. **Stateful**: the REGISTER SYN must carry a PoW2 solution over that
//!    challenge. Challenges live in a current and a previous table that
//!    rotate on a timer or when the current table fills.
//!
//! Both tables and the recent-nonce set self-evict; nothing here errors on
//! load.

mod pow;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use thiserror::Error;
use tracing::debug;

use crate::config::AdmissionConfig;
use crate::crypto::sha256;
use crate::identity::RegistrationId;
use crate::wire::{encode_ip, Pow1Request, StatusCode, CHALLENGE_SIZE};

pub use pow::{
    pow1_hash, pow2_hash, solve_pow1, solve_pow2, verify_pow1, verify_pow2, PowNonce,
    POW_MAX_ATTEMPTS,
};

/// Rejections issued by the admission filter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("timestamp {timestamp} outside tolerance (now {now})")]
    BadTimestamp { timestamp: u32, now: u32 },

    #[error("proof of work does not meet target")]
    BadProofOfWork,

    #[error("non-unique data (replayed nonce)")]
    NonUniqueData,

    #[error("no challenge issued to {0}")]
    NoChallenge(SocketAddr),
}

impl AdmissionError {
    /// Status code reported to the requester.
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::BadTimestamp { .. } => StatusCode::BadTimestamp,
            AdmissionError::BadProofOfWork | AdmissionError::NoChallenge(_) => {
                StatusCode::BadProofOfWork
            }
            AdmissionError::NonUniqueData => StatusCode::NonUnique,
        }
    }
}

/// Check a wire timestamp (Unix seconds) against the local clock.
pub fn timestamp_within(timestamp: u32, now_ms: u64, tolerance_secs: u32) -> bool {
    let now = (now_ms / 1000) as i64;
    (timestamp as i64 - now).abs() <= tolerance_secs as i64
}

/// Entry-peer admission state.
#[derive(Debug)]
pub struct AdmissionFilter {
    config: AdmissionConfig,
    /// Fingerprints of accepted PoW1 solutions.
    recent: HashSet<[u8; 32]>,
    /// Insertion order with expiry, for eviction.
    recent_order: VecDeque<([u8; 32], u64)>,
    current: HashMap<SocketAddr, [u8; CHALLENGE_SIZE]>,
    previous: HashMap<SocketAddr, [u8; CHALLENGE_SIZE]>,
    period_started_ms: u64,
}

impl AdmissionFilter {
    pub fn new(config: AdmissionConfig, now_ms: u64) -> Self {
        Self {
            config,
            recent: HashSet::new(),
            recent_order: VecDeque::new(),
            current: HashMap::new(),
            previous: HashMap::new(),
            period_started_ms: now_ms,
        }
    }

    /// Stage one: verify a PoW1 request from `from` and issue a challenge.
    pub fn check_pow1(
        &mut self,
        request: &Pow1Request,
        from: SocketAddr,
        now_ms: u64,
    ) -> Result<[u8; CHALLENGE_SIZE], AdmissionError> {
        if !timestamp_within(request.timestamp, now_ms, self.config.timestamp_tolerance_secs) {
            return Err(AdmissionError::BadTimestamp {
                timestamp: request.timestamp,
                now: (now_ms / 1000) as u32,
            });
        }
        if !verify_pow1(request.timestamp, &request.claimed_ip, &request.nonce) {
            return Err(AdmissionError::BadProofOfWork);
        }

        let mut material = Vec::with_capacity(4 + 16 + 64);
        material.extend_from_slice(&request.timestamp.to_le_bytes());
        material.extend_from_slice(&encode_ip(&request.claimed_ip));
        material.extend_from_slice(&request.nonce);
        let fingerprint = sha256(&material);
        if self.recent.contains(&fingerprint) {
            return Err(AdmissionError::NonUniqueData);
        }
        self.remember(fingerprint, now_ms);

        if self.current.len() >= self.config.max_challenges {
            self.rotate(now_ms);
        }
        let challenge: [u8; CHALLENGE_SIZE] = rand::random();
        self.current.insert(from, challenge);
        Ok(challenge)
    }

    /// Stage two: verify the PoW2 nonce carried by a direct SYN.
    pub fn check_pow2(
        &self,
        from: SocketAddr,
        requester: &RegistrationId,
        timestamp: u32,
        nonce: &PowNonce,
    ) -> Result<(), AdmissionError> {
        let challenge = self
            .current
            .get(&from)
            .or_else(|| self.previous.get(&from))
            .ok_or(AdmissionError::NoChallenge(from))?;
        if !verify_pow2(challenge, requester, timestamp, nonce) {
            return Err(AdmissionError::BadProofOfWork);
        }
        Ok(())
    }

    /// Drop the challenge once its SYN was accepted.
    pub fn consume_challenge(&mut self, from: &SocketAddr) {
        self.current.remove(from);
        self.previous.remove(from);
    }

    /// Periodic maintenance: rotate challenge tables and evict old nonces.
    pub fn on_tick(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.period_started_ms)
            >= self.config.challenge_period_secs * 1000
        {
            self.rotate(now_ms);
        }
        while let Some((fingerprint, expires_ms)) = self.recent_order.front().copied() {
            if expires_ms > now_ms {
                break;
            }
            self.recent_order.pop_front();
            self.recent.remove(&fingerprint);
        }
    }

    fn remember(&mut self, fingerprint: [u8; 32], now_ms: u64) {
        if self.recent_order.len() >= self.config.max_recent_nonces {
            if let Some((oldest, _)) = self.recent_order.pop_front() {
                self.recent.remove(&oldest);
            }
        }
        let expires_ms = now_ms + self.config.nonce_retention_secs * 1000;
        self.recent.insert(fingerprint);
        self.recent_order.push_back((fingerprint, expires_ms));
    }

    fn rotate(&mut self, now_ms: u64) {
        debug!(
            issued = self.current.len(),
            "Rotating admission challenge tables"
        );
        self.previous = std::mem::take(&mut self.current);
        self.period_started_ms = now_ms;
    }

    pub fn outstanding_challenges(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    pub fn recent_nonces(&self) -> usize {
        self.recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    const NOW_MS: u64 = 1_700_000_000_000;

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            timestamp_tolerance_secs: 60,
            nonce_retention_secs: 120,
            max_recent_nonces: 4,
            challenge_period_secs: 30,
            max_challenges: 8,
        }
    }

    fn solved_request(timestamp: u32) -> Pow1Request {
        let claimed_ip = "198.51.100.4".parse().unwrap();
        let nonce = solve_pow1(timestamp, &claimed_ip, POW_MAX_ATTEMPTS).unwrap();
        Pow1Request {
            pow_request_id: 1,
            timestamp,
            claimed_ip,
            nonce,
        }
    }

    fn from() -> SocketAddr {
        "198.51.100.4:5000".parse().unwrap()
    }

    #[test]
    fn test_timestamp_within() {
        assert!(timestamp_within(1_700_000_000, NOW_MS, 60));
        assert!(timestamp_within(1_700_000_060, NOW_MS, 60));
        assert!(!timestamp_within(1_700_000_061, NOW_MS, 60));
        assert!(!timestamp_within(1_699_999_939, NOW_MS, 60));
    }

    #[test]
    fn test_full_admission() {
        let mut filter = AdmissionFilter::new(config(), NOW_MS);
        let request = solved_request(1_700_000_000);
        let challenge = filter.check_pow1(&request, from(), NOW_MS).unwrap();

        let id = *Identity::generate().id();
        let nonce = solve_pow2(&challenge, &id, 1_700_000_000, POW_MAX_ATTEMPTS).unwrap();
        assert!(filter.check_pow2(from(), &id, 1_700_000_000, &nonce).is_ok());

        filter.consume_challenge(&from());
        assert_eq!(
            filter.check_pow2(from(), &id, 1_700_000_000, &nonce),
            Err(AdmissionError::NoChallenge(from()))
        );
    }

    #[test]
    fn test_replayed_pow1_rejected() {
        let mut filter = AdmissionFilter::new(config(), NOW_MS);
        let request = solved_request(1_700_000_000);
        filter.check_pow1(&request, from(), NOW_MS).unwrap();
        assert_eq!(
            filter.check_pow1(&request, from(), NOW_MS + 10),
            Err(AdmissionError::NonUniqueData)
        );
        assert_eq!(AdmissionError::NonUniqueData.status(), StatusCode::NonUnique);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let mut filter = AdmissionFilter::new(config(), NOW_MS);
        let request = solved_request(1_699_990_000);
        assert!(matches!(
            filter.check_pow1(&request, from(), NOW_MS),
            Err(AdmissionError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn test_bad_nonce_rejected() {
        let mut filter = AdmissionFilter::new(config(), NOW_MS);
        let mut request = solved_request(1_700_000_000);
        // Find a nonce that misses the target
        loop {
            request.nonce[63] = request.nonce[63].wrapping_add(1);
            if !verify_pow1(request.timestamp, &request.claimed_ip, &request.nonce) {
                break;
            }
        }
        assert_eq!(
            filter.check_pow1(&request, from(), NOW_MS),
            Err(AdmissionError::BadProofOfWork)
        );
    }

    #[test]
    fn test_challenge_survives_one_rotation() {
        let mut filter = AdmissionFilter::new(config(), NOW_MS);
        let request = solved_request(1_700_000_000);
        let challenge = filter.check_pow1(&request, from(), NOW_MS).unwrap();
        let id = *Identity::generate().id();
        let nonce = solve_pow2(&challenge, &id, 1_700_000_000, POW_MAX_ATTEMPTS).unwrap();

        filter.on_tick(NOW_MS + 30_000);
        assert!(filter.check_pow2(from(), &id, 1_700_000_000, &nonce).is_ok());

        filter.on_tick(NOW_MS + 60_000);
        assert!(filter.check_pow2(from(), &id, 1_700_000_000, &nonce).is_err());
    }

    #[test]
    fn test_recent_nonces_bounded_and_expire() {
        let mut filter = AdmissionFilter::new(config(), NOW_MS);
        let requests: Vec<Pow1Request> = (0..6u32)
            .map(|i| solved_request(1_700_000_000 + i))
            .collect();
        for request in &requests {
            filter.check_pow1(request, from(), NOW_MS).unwrap();
        }
        assert_eq!(filter.recent_nonces(), 4);

        // The two oldest were evicted for capacity and count as fresh again
        assert!(filter.check_pow1(&requests[0], from(), NOW_MS + 1_000).is_ok());
        assert_eq!(
            filter.check_pow1(&requests[5], from(), NOW_MS + 1_000),
            Err(AdmissionError::NonUniqueData)
        );

        filter.on_tick(NOW_MS + 121_000);
        assert_eq!(filter.recent_nonces(), 0);
    }

    #[test]
    fn test_nonce_fresh_again_after_retention() {
        let mut config = config();
        config.nonce_retention_secs = 30;
        let mut filter = AdmissionFilter::new(config, NOW_MS);
        let request = solved_request(1_700_000_000);
        filter.check_pow1(&request, from(), NOW_MS).unwrap();

        filter.on_tick(NOW_MS + 29_000);
        assert_eq!(
            filter.check_pow1(&request, from(), NOW_MS + 29_000),
            Err(AdmissionError::NonUniqueData)
        );

        filter.on_tick(NOW_MS + 30_000);
        assert!(filter.check_pow1(&request, from(), NOW_MS + 30_000).is_ok());
        assert_eq!(
            filter.check_pow1(&request, from(), NOW_MS + 30_001),
            Err(AdmissionError::NonUniqueData)
        );
    }
}
