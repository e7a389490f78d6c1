//! Registration Identity
//!
//! A peer is identified by its long-term Ed25519 public key (the
//! registration id). The same key signs every handshake transcript, and its
//! hash places the peer in the routing vector space.

mod local;
mod registration_id;


use thiserror::Error;

pub use local::Identity;
pub use registration_id::{RegistrationId, RegistrationSignature};

/// Size of a registration id (Ed25519 public key).
pub const REGISTRATION_ID_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("invalid secret length: expected 32, got {0}")]
    InvalidSecretLength(usize),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}
