//! End-to-end encrypted transport parameters.
//!
//! Each side tells the other how to reach it directly (endpoint) and which
//! token to put on packets addressed to it. Relays forward the ciphertext
//! untouched.
//!
//! ```text
//! plaintext (32 bytes, two AES blocks, CBC):
//! [endpoint:18][token:4 LE][magic:2 LE][zero:8]
//! ```

use aes_gcm::aes::Aes256;
use aes_gcm::aes::cipher::generic_array::GenericArray;
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use std::net::SocketAddr;

use super::keys::{AesKeyIv, LinkKeys};
use super::CryptoError;
use crate::neighbor::NeighborToken;
use crate::wire::{decode_endpoint, encode_endpoint, ENDPOINT_SIZE};

/// Size of the encrypted transport parameter field.
pub const ENCRYPTED_PARAMS_SIZE: usize = 32;

/// Magic for parameters travelling responder to requester (ACK1).
pub const MAGIC_TO_REQUESTER: u16 = 0xA51E;

/// Magic for parameters travelling requester to responder (ACK2).
pub const MAGIC_TO_RESPONDER: u16 = 0x5EA1;

/// Which way the parameters flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ToRequester,
    ToResponder,
}

impl Direction {
    fn magic(&self) -> u16 {
        match self {
            Direction::ToRequester => MAGIC_TO_REQUESTER,
            Direction::ToResponder => MAGIC_TO_RESPONDER,
        }
    }

    fn key_iv<'a>(&self, keys: &'a LinkKeys) -> &'a AesKeyIv {
        match self {
            Direction::ToRequester => &keys.to_requester,
            Direction::ToResponder => &keys.to_responder,
        }
    }
}

/// How to reach the sender directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportParams {
    pub endpoint: SocketAddr,
    pub token: NeighborToken,
}

impl TransportParams {
    pub fn new(endpoint: SocketAddr, token: NeighborToken) -> Self {
        Self { endpoint, token }
    }

    /// Encrypt for the given direction.
    pub fn encrypt(&self, keys: &LinkKeys, direction: Direction) -> [u8; ENCRYPTED_PARAMS_SIZE] {
        let mut block = [0u8; ENCRYPTED_PARAMS_SIZE];
        block[..ENDPOINT_SIZE].copy_from_slice(&encode_endpoint(&self.endpoint));
        block[18..22].copy_from_slice(&self.token.to_le_bytes());
        block[22..24].copy_from_slice(&direction.magic().to_le_bytes());

        let key_iv = direction.key_iv(keys);
        let cipher = Aes256::new(GenericArray::from_slice(&key_iv.key));
        let mut chain = key_iv.iv;
        for chunk in block.chunks_exact_mut(16) {
            for (b, c) in chunk.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
            chain.copy_from_slice(chunk);
        }
        block
    }

    /// Decrypt and check the direction magic.
    ///
    /// A wrong key or a reflected ciphertext shows up as a magic mismatch.
    pub fn decrypt(
        ciphertext: &[u8; ENCRYPTED_PARAMS_SIZE],
        keys: &LinkKeys,
        direction: Direction,
    ) -> Result<Self, CryptoError> {
        let key_iv = direction.key_iv(keys);
        let cipher = Aes256::new(GenericArray::from_slice(&key_iv.key));
        let mut block = *ciphertext;
        let mut chain = key_iv.iv;
        for chunk in block.chunks_exact_mut(16) {
            let mut saved = [0u8; 16];
            saved.copy_from_slice(chunk);
            cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
            for (b, c) in chunk.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            chain = saved;
        }

        let found = u16::from_le_bytes([block[22], block[23]]);
        let expected = direction.magic();
        if found != expected {
            return Err(CryptoError::WrongMagic { expected, found });
        }
        if block[24..].iter().any(|&b| b != 0) {
            return Err(CryptoError::MalformedParams);
        }

        let mut endpoint = [0u8; ENDPOINT_SIZE];
        endpoint.copy_from_slice(&block[..ENDPOINT_SIZE]);
        let endpoint = decode_endpoint(&endpoint).ok_or(CryptoError::MalformedParams)?;
        let token = NeighborToken::from_le_bytes([block[18], block[19], block[20], block[21]]);
        Ok(Self { endpoint, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EphemeralKeypair;

    fn key_pair() -> (LinkKeys, LinkKeys) {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let transcript = [5u8; 32];
        (
            a.derive(b.public(), &transcript).unwrap(),
            b.derive(a.public(), &transcript).unwrap(),
        )
    }

    #[test]
    fn test_params_cross_decrypt() {
        let (requester, responder) = key_pair();
        let params = TransportParams::new(
            "192.0.2.7:4000".parse().unwrap(),
            NeighborToken::new(0xCAFE_0102),
        );

        let ct = params.encrypt(&responder, Direction::ToRequester);
        let got = TransportParams::decrypt(&ct, &requester, Direction::ToRequester).unwrap();
        assert_eq!(got, params);
    }

    #[test]
    fn test_reflected_direction_rejected() {
        let (requester, responder) = key_pair();
        let params = TransportParams::new("[2001:db8::1]:9".parse().unwrap(), NeighborToken::new(1));

        let ct = params.encrypt(&responder, Direction::ToRequester);
        assert!(TransportParams::decrypt(&ct, &requester, Direction::ToResponder).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (requester, _) = key_pair();
        let (other, _) = key_pair();
        let params = TransportParams::new("10.0.0.1:1".parse().unwrap(), NeighborToken::new(7));

        let ct = params.encrypt(&requester, Direction::ToResponder);
        assert!(TransportParams::decrypt(&ct, &other, Direction::ToResponder).is_err());
    }

    #[test]
    fn test_ciphertext_not_plaintext() {
        let (keys, _) = key_pair();
        let params = TransportParams::new("10.0.0.1:1".parse().unwrap(), NeighborToken::new(7));
        let ct = params.encrypt(&keys, Direction::ToResponder);
        assert_ne!(&ct[24..], &[0u8; 8]);
    }
}
