//! Public registration id and detached signatures.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::fmt;

use super::{IdentityError, REGISTRATION_ID_SIZE, SIGNATURE_SIZE};

/// 32-byte Ed25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationId([u8; REGISTRATION_ID_SIZE]);

impl RegistrationId {
    /// Create from raw bytes. Validity is checked on verification.
    pub fn from_bytes(bytes: [u8; REGISTRATION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; REGISTRATION_ID_SIZE] {
        &self.0
    }

    /// Verify a detached signature over `message`.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &RegistrationSignature,
    ) -> Result<(), IdentityError> {
        let key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| IdentityError::InvalidPublicKey)?;
        let signature = Signature::from_bytes(&signature.0);
        key.verify(message, &signature)
            .map_err(|_| IdentityError::SignatureVerificationFailed)
    }

    /// Short hex prefix for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistrationId({})", self.short_hex())
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for RegistrationId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Detached Ed25519 signature as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegistrationSignature([u8; SIGNATURE_SIZE]);

impl RegistrationSignature {
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RegistrationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistrationSignature({}..)", hex::encode(&self.0[..4]))
    }
}
