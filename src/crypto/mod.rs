//! Handshake cryptography.
//!
//! X25519 ephemeral agreement, HKDF-SHA256 key schedule bound to the
//! handshake transcript, AES-256 protection of transport parameters and
//! HMAC-SHA256 authentication of every packet on a neighbor link.

mod keys;
mod transport_params;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use keys::{EcdhPublicKey, EphemeralKeypair, LinkKeys, ECDH_PUBLIC_KEY_SIZE};
pub use transport_params::{
    Direction, TransportParams, ENCRYPTED_PARAMS_SIZE, MAGIC_TO_REQUESTER, MAGIC_TO_RESPONDER,
};

/// Size of an HMAC-SHA256 tag.
pub const HMAC_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Errors from handshake cryptography.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ECDH produced a non-contributory shared secret")]
    NonContributory,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("transport parameters decrypted with wrong key (magic {found:#06x}, expected {expected:#06x})")]
    WrongMagic { expected: u16, found: u16 },

    #[error("transport parameters carry a malformed endpoint")]
    MalformedParams,
}

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Per-connection HMAC key fixed when the peer-to-peer stream initializes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HmacKey([u8; 32]);

impl HmacKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the tag over `data`.
    pub fn tag(&self, data: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time tag verification.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.0) else {
            return false;
        };
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HmacKey(..)")
    }
}
