//! AES-256-GCM sealing for thread keys.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Length of the GCM nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Length of a raw symmetric key.
pub const KEY_LEN: usize = 32;

/// A 32-byte symmetric key performing AES-256-GCM with a random nonce
/// prepended to the ciphertext.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymKey([u8; KEY_LEN]);

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        write!(f, "SymKey(..)")
    }
}

impl SymKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut raw = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        SymKey(raw)
    }

    /// Build a key from raw bytes, which must be exactly [`KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
        Ok(SymKey(raw))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Seal `plaintext`, returning `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .expect("aes-gcm encryption is infallible for in-memory buffers");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Open `nonce || ciphertext` produced by [`SymKey::seal`].
    ///
    /// Fails if the ciphertext is truncated, tampered with, or sealed under
    /// a different key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::InvalidKey);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::InvalidKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = SymKey::generate();
        let sealed = key.seal(b"secret payload");
        assert_ne!(&sealed[NONCE_LEN..], b"secret payload".as_slice());
        let opened = key.open(&sealed).unwrap();
        assert_eq!(opened, b"secret payload");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealed = SymKey::generate().seal(b"payload");
        assert!(SymKey::generate().open(&sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SymKey::generate();
        let mut sealed = key.seal(b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn rejects_short_input() {
        let key = SymKey::generate();
        assert!(key.open(&[0u8; 4]).is_err());
    }
}
