//! Local identity with signing capability.

use ed25519_dalek::{Signer, SigningKey};
use std::fmt;

use super::{IdentityError, RegistrationId, RegistrationSignature};

/// The local peer's long-term keypair.
pub struct Identity {
    signing_key: SigningKey,
    id: RegistrationId,
}

impl Identity {
    /// Create a new random identity.
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self::from_secret_bytes(&secret)
    }

    /// Create an identity from secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let id = RegistrationId::from_bytes(signing_key.verifying_key().to_bytes());
        Self { signing_key, id }
    }

    /// Create an identity from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim())?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidSecretLength(bytes.len()))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Return the registration id.
    pub fn id(&self) -> &RegistrationId {
        &self.id
    }

    /// Sign arbitrary data.
    pub fn sign(&self, data: &[u8]) -> RegistrationSignature {
        RegistrationSignature::from_bytes(self.signing_key.sign(data).to_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
