//! Ephemeral ECDH and the link key schedule.

use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, HmacKey};

/// Size of an X25519 public key.
pub const ECDH_PUBLIC_KEY_SIZE: usize = 32;

const LABEL_TO_REQUESTER: &[u8] = b"drp/v1 params to-requester";
const LABEL_TO_RESPONDER: &[u8] = b"drp/v1 params to-responder";
const LABEL_HMAC: &[u8] = b"drp/v1 link hmac";

/// X25519 public key exchanged in SYN and ACK1.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EcdhPublicKey([u8; ECDH_PUBLIC_KEY_SIZE]);

impl EcdhPublicKey {
    pub fn from_bytes(bytes: [u8; ECDH_PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ECDH_PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EcdhPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EcdhPublicKey({})", hex::encode(&self.0[..6]))
    }
}

/// One handshake's ephemeral keypair. Used for a single agreement.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: EcdhPublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        let secret = StaticSecret::from(bytes);
        let public = EcdhPublicKey(PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> &EcdhPublicKey {
        &self.public
    }

    /// Agree with the remote ephemeral key and run the key schedule.
    ///
    /// `transcript_hash` binds the keys to every public field exchanged so
    /// far; both sides must feed the identical hash.
    pub fn derive(
        &self,
        remote: &EcdhPublicKey,
        transcript_hash: &[u8; 32],
    ) -> Result<LinkKeys, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(remote.0));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        LinkKeys::derive(shared.as_bytes(), transcript_hash)
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// AES-256 key and IV for one direction.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesKeyIv {
    pub(crate) key: [u8; 32],
    pub(crate) iv: [u8; 16],
}

impl AesKeyIv {
    fn expand(hk: &Hkdf<Sha256>, label: &[u8]) -> Result<Self, CryptoError> {
        let mut okm = [0u8; 48];
        hk.expand(label, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&okm[..32]);
        iv.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok(Self { key, iv })
    }
}

/// Keys for one neighbor connection.
#[derive(Clone)]
pub struct LinkKeys {
    pub(crate) to_requester: AesKeyIv,
    pub(crate) to_responder: AesKeyIv,
    hmac: HmacKey,
}

impl LinkKeys {
    fn derive(shared_secret: &[u8; 32], transcript_hash: &[u8; 32]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(transcript_hash), shared_secret);
        let to_requester = AesKeyIv::expand(&hk, LABEL_TO_REQUESTER)?;
        let to_responder = AesKeyIv::expand(&hk, LABEL_TO_RESPONDER)?;
        let mut hmac = [0u8; 32];
        hk.expand(LABEL_HMAC, &mut hmac)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Self {
            to_requester,
            to_responder,
            hmac: HmacKey::from_bytes(hmac),
        })
    }

    /// Key authenticating every packet on the established link.
    pub fn hmac_key(&self) -> &HmacKey {
        &self.hmac
    }
}

impl fmt::Debug for LinkKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LinkKeys(..)")
    }
}
