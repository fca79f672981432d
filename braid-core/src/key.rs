//! Key material for threads and logs.
//!
//! A thread carries two symmetric keys: the *service key* gates record
//! envelope encryption and is required for any participation; the *read
//! key* gates event-body decryption and may be withheld from followers
//! that should replicate without reading. Logs are signed with an ed25519
//! keypair whose public half doubles as the log identity.

use std::fmt;
use std::str::FromStr;

use libp2p_identity::{Keypair, PublicKey, SigningError};
use serde::{Deserialize, Serialize};

use crate::cipher::{SymKey, KEY_LEN};
use crate::error::Error;
use crate::thread::LogId;

/// Symmetric key gating record envelope encryption (participation key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceKey(pub(crate) SymKey);

/// Symmetric key gating event-body decryption (can-read capability).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadKey(pub(crate) SymKey);

macro_rules! sym_key_impls {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh random key.
            pub fn generate() -> Self {
                $name(SymKey::generate())
            }

            /// Build from exactly 32 raw bytes.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
                Ok($name(SymKey::from_bytes(bytes)?))
            }

            /// Raw key bytes.
            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                self.0.as_bytes()
            }

            /// Access the underlying cipher.
            pub fn cipher(&self) -> &SymKey {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&multibase::encode(
                    multibase::Base::Base32Lower,
                    self.as_bytes(),
                ))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let (_, bytes) = multibase::decode(s).map_err(|_| Error::InvalidKey)?;
                Self::from_bytes(&bytes)
            }
        }
    };
}

sym_key_impls!(ServiceKey);
sym_key_impls!(ReadKey);

/// The combined thread key: a service key plus an optional read key.
///
/// This is the unit handed to a joining peer. Encoded as multibase base32
/// over the concatenated raw bytes, 32 or 64 bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadKey {
    service: ServiceKey,
    read: Option<ReadKey>,
}

impl ThreadKey {
    /// Assemble from existing keys.
    pub fn new(service: ServiceKey, read: Option<ReadKey>) -> Self {
        Self { service, read }
    }

    /// Generate a full key set (service + read).
    pub fn generate() -> Self {
        Self {
            service: ServiceKey::generate(),
            read: Some(ReadKey::generate()),
        }
    }

    /// The service key.
    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// The read key, if this key set can read event bodies.
    pub fn read(&self) -> Option<&ReadKey> {
        self.read.as_ref()
    }

    /// True if this key set can decrypt event bodies.
    pub fn can_read(&self) -> bool {
        self.read.is_some()
    }

    /// Concatenated raw bytes, service first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * KEY_LEN);
        out.extend_from_slice(self.service.as_bytes());
        if let Some(read) = &self.read {
            out.extend_from_slice(read.as_bytes());
        }
        out
    }

    /// Decode from 32 (service only) or 64 (service + read) raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.len() {
            KEY_LEN => Ok(Self {
                service: ServiceKey::from_bytes(bytes)?,
                read: None,
            }),
            len if len == 2 * KEY_LEN => Ok(Self {
                service: ServiceKey::from_bytes(&bytes[..KEY_LEN])?,
                read: Some(ReadKey::from_bytes(&bytes[KEY_LEN..])?),
            }),
            _ => Err(Error::InvalidKey),
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&multibase::encode(
            multibase::Base::Base32Lower,
            self.to_bytes(),
        ))
    }
}

impl FromStr for ThreadKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, bytes) = multibase::decode(s).map_err(|_| Error::InvalidKey)?;
        Self::from_bytes(&bytes)
    }
}

/// An ed25519 keypair identifying and signing one log.
#[derive(Clone)]
pub struct LogKeypair(Keypair);

impl fmt::Debug for LogKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogKeypair({})", self.id())
    }
}

impl LogKeypair {
    /// Generate a fresh ed25519 keypair.
    pub fn generate() -> Self {
        LogKeypair(Keypair::generate_ed25519())
    }

    /// The log identity derived from the public key.
    pub fn id(&self) -> LogId {
        LogId::from_public_key(&self.0.public())
    }

    /// The public half.
    pub fn public(&self) -> PublicKey {
        self.0.public()
    }

    /// Sign a message with the private half.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, SigningError> {
        self.0.sign(msg)
    }

    /// Protobuf encoding of the whole keypair for at-rest storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0
            .to_protobuf_encoding()
            .expect("ed25519 keypairs always encode")
    }

    /// Decode a keypair previously written by [`LogKeypair::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Keypair::from_protobuf_encoding(bytes)
            .map(LogKeypair)
            .map_err(|_| Error::InvalidKey)
    }
}

impl From<Keypair> for LogKeypair {
    fn from(keypair: Keypair) -> Self {
        LogKeypair(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_key_encoding_round_trip() {
        let full = ThreadKey::generate();
        let parsed: ThreadKey = full.to_string().parse().unwrap();
        assert_eq!(full, parsed);
        assert!(parsed.can_read());

        let service_only = ThreadKey::new(ServiceKey::generate(), None);
        let parsed: ThreadKey = service_only.to_string().parse().unwrap();
        assert_eq!(service_only, parsed);
        assert!(!parsed.can_read());
    }

    #[test]
    fn thread_key_rejects_odd_lengths() {
        assert!(ThreadKey::from_bytes(&[0u8; 16]).is_err());
        assert!(ThreadKey::from_bytes(&[0u8; 48]).is_err());
    }

    #[test]
    fn keypair_round_trip_preserves_identity() {
        let keypair = LogKeypair::generate();
        let restored = LogKeypair::from_bytes(&keypair.to_bytes()).unwrap();
        assert_eq!(keypair.id(), restored.id());
    }

    #[test]
    fn signature_verifies_under_public_key() {
        let keypair = LogKeypair::generate();
        let sig = keypair.sign(b"chained payload").unwrap();
        assert!(keypair.public().verify(b"chained payload", &sig));
        assert!(!keypair.public().verify(b"other payload", &sig));
    }
}
