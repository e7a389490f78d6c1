//! Proof-of-work puzzles.
//!
//! Both puzzles hash with SHA-512 and require a narrow byte pattern in the
//! digest rather than leading zero bits. Verification is one hash; search
//! is a nonce walk from a random start.
//!
//! - PoW1 (stateless): `SHA-512(domain || timestamp || claimed_ip || nonce)`
//! - PoW2 (stateful):  `SHA-512(domain || challenge || requester || timestamp || nonce)`
//!
//! Under `cfg(test)` or the `test-pow` feature the patterns shrink to one
//! byte so searches finish in microseconds while using the same code path.

use sha2::{Digest, Sha512};
use std::net::IpAddr;

use crate::identity::RegistrationId;
use crate::wire::{encode_ip, CHALLENGE_SIZE, POW_NONCE_SIZE};

const POW1_DOMAIN: &[u8] = b"drp/v1 pow1";
const POW2_DOMAIN: &[u8] = b"drp/v1 pow2";

/// Nonces tried per search before giving up.
#[cfg(not(any(test, feature = "test-pow")))]
pub const POW_MAX_ATTEMPTS: u64 = 1 << 28;

#[cfg(any(test, feature = "test-pow"))]
pub const POW_MAX_ATTEMPTS: u64 = 1 << 20;

/// A 64-byte puzzle nonce.
pub type PowNonce = [u8; POW_NONCE_SIZE];

pub fn pow1_hash(timestamp: u32, claimed_ip: &IpAddr, nonce: &PowNonce) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(POW1_DOMAIN);
    hasher.update(timestamp.to_le_bytes());
    hasher.update(encode_ip(claimed_ip));
    hasher.update(nonce);
    hasher.finalize().into()
}

pub fn pow2_hash(
    challenge: &[u8; CHALLENGE_SIZE],
    requester: &RegistrationId,
    timestamp: u32,
    nonce: &PowNonce,
) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(POW2_DOMAIN);
    hasher.update(challenge);
    hasher.update(requester.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Stateless target: byte 4 is 7 and byte 5 is 7 or 8 (p = 1/32768).
#[cfg(not(any(test, feature = "test-pow")))]
pub fn pow1_target_met(hash: &[u8; 64]) -> bool {
    hash[4] == 7 && (hash[5] == 7 || hash[5] == 8)
}

#[cfg(any(test, feature = "test-pow"))]
pub fn pow1_target_met(hash: &[u8; 64]) -> bool {
    hash[4] == 7
}

/// Stateful target: bytes 4 and 5 are 7 and byte 6 is below 64 (p = 1/262144).
#[cfg(not(any(test, feature = "test-pow")))]
pub fn pow2_target_met(hash: &[u8; 64]) -> bool {
    hash[4] == 7 && hash[5] == 7 && hash[6] < 64
}

#[cfg(any(test, feature = "test-pow"))]
pub fn pow2_target_met(hash: &[u8; 64]) -> bool {
    hash[4] == 7 && hash[6] < 128
}

pub fn verify_pow1(timestamp: u32, claimed_ip: &IpAddr, nonce: &PowNonce) -> bool {
    pow1_target_met(&pow1_hash(timestamp, claimed_ip, nonce))
}

pub fn verify_pow2(
    challenge: &[u8; CHALLENGE_SIZE],
    requester: &RegistrationId,
    timestamp: u32,
    nonce: &PowNonce,
) -> bool {
    pow2_target_met(&pow2_hash(challenge, requester, timestamp, nonce))
}

/// Walk nonces from a random start, counting in the first 8 bytes.
fn search(mut accept: impl FnMut(&PowNonce) -> bool, max_attempts: u64) -> Option<PowNonce> {
    let mut nonce: PowNonce = [0u8; POW_NONCE_SIZE];
    let start: [u8; 32] = rand::random();
    nonce[..32].copy_from_slice(&start);
    let base = u64::from_le_bytes([
        nonce[0], nonce[1], nonce[2], nonce[3], nonce[4], nonce[5], nonce[6], nonce[7],
    ]);
    for i in 0..max_attempts {
        nonce[..8].copy_from_slice(&base.wrapping_add(i).to_le_bytes());
        if accept(&nonce) {
            return Some(nonce);
        }
    }
    None
}

/// Search a PoW1 nonce. Blocking; run on the background context.
pub fn solve_pow1(timestamp: u32, claimed_ip: &IpAddr, max_attempts: u64) -> Option<PowNonce> {
    search(|n| verify_pow1(timestamp, claimed_ip, n), max_attempts)
}

/// Search a PoW2 nonce. Blocking; run on the background context.
pub fn solve_pow2(
    challenge: &[u8; CHALLENGE_SIZE],
    requester: &RegistrationId,
    timestamp: u32,
    max_attempts: u64,
) -> Option<PowNonce> {
    search(
        |n| verify_pow2(challenge, requester, timestamp, n),
        max_attempts,
    )
}
