//! Thread and log identities.

use std::fmt;
use std::str::FromStr;

use libp2p_identity::{PeerId, PublicKey};
use multiaddr::Multiaddr;
use rand::RngCore;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Thread id format version.
pub const VERSION: u64 = 0x01;

/// Minimum length of the random payload of a thread id.
pub const MIN_PAYLOAD_LEN: usize = 16;

const DEFAULT_PAYLOAD_LEN: usize = 32;

/// Thread variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u64)]
pub enum Variant {
    /// Raw threads impose no structure on record bodies.
    Raw = 0x55,
    /// Access-controlled threads reserve an interior ACL document.
    AccessControlled = 0x70,
}

impl Variant {
    fn from_code(code: u64) -> Option<Self> {
        match code {
            0x55 => Some(Variant::Raw),
            0x70 => Some(Variant::AccessControlled),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Raw => f.write_str("raw"),
            Variant::AccessControlled => f.write_str("access-controlled"),
        }
    }
}

/// A stable opaque thread identifier.
///
/// Binary layout: unsigned-varint version tag, unsigned-varint variant tag,
/// then at least [`MIN_PAYLOAD_LEN`] random bytes. The textual form is
/// base32-lowercase-no-pad over the whole encoding.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    variant: Variant,
    payload: Vec<u8>,
}

impl ThreadId {
    /// Generate a fresh random id of the given variant.
    pub fn new(variant: Variant) -> Self {
        let mut payload = vec![0u8; DEFAULT_PAYLOAD_LEN];
        rand::thread_rng().fill_bytes(&mut payload);
        ThreadId { variant, payload }
    }

    /// The variant tag.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Binary encoding: varint version, varint variant, payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = unsigned_varint::encode::u64_buffer();
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.extend_from_slice(unsigned_varint::encode::u64(VERSION, &mut buf));
        out.extend_from_slice(unsigned_varint::encode::u64(
            self.variant as u64,
            &mut buf,
        ));
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode and validate a binary thread id.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let (version, rest) = unsigned_varint::decode::u64(bytes)
            .map_err(|_| Error::InvalidThreadId("truncated version tag".into()))?;
        if version != VERSION {
            return Err(Error::InvalidThreadId(format!(
                "unknown version {version}"
            )));
        }
        let (code, payload) = unsigned_varint::decode::u64(rest)
            .map_err(|_| Error::InvalidThreadId("truncated variant tag".into()))?;
        let variant = Variant::from_code(code)
            .ok_or_else(|| Error::InvalidThreadId(format!("unknown variant {code:#x}")))?;
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(Error::InvalidThreadId(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }
        Ok(ThreadId {
            variant,
            payload: payload.to_vec(),
        })
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut encoded = data_encoding::BASE32_NOPAD.encode(&self.to_bytes());
        encoded.make_ascii_lowercase();
        f.write_str(&encoded)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({self})")
    }
}

impl FromStr for ThreadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let bytes = data_encoding::BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|err| Error::InvalidThreadId(err.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for ThreadId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for ThreadId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ThreadIdVisitor;

        impl<'de> Visitor<'de> for ThreadIdVisitor {
            type Value = ThreadId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a thread id as bytes or base32 string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<ThreadId, E> {
                ThreadId::from_bytes(v).map_err(E::custom)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ThreadId, E> {
                v.parse().map_err(E::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(ThreadIdVisitor)
        } else {
            deserializer.deserialize_bytes(ThreadIdVisitor)
        }
    }
}

/// Identity of a single-author log: the peer id derived from the author's
/// public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogId(PeerId);

impl LogId {
    /// Derive from a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        LogId(key.to_peer_id())
    }

    /// The underlying peer id.
    pub fn peer_id(&self) -> PeerId {
        self.0
    }

    /// Canonical binary form, used as the sort key in edge digests.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// Decode the binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        PeerId::from_bytes(bytes)
            .map(LogId)
            .map_err(|_| Error::InvalidKey)
    }
}

impl From<PeerId> for LogId {
    fn from(peer: PeerId) -> Self {
        LogId(peer)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.0)
    }
}

impl Serialize for LogId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.0.to_string())
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for LogId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LogIdVisitor;

        impl<'de> Visitor<'de> for LogIdVisitor {
            type Value = LogId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a log id as bytes or base58 string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<LogId, E> {
                LogId::from_bytes(v).map_err(E::custom)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<LogId, E> {
                v.parse::<PeerId>().map(LogId).map_err(E::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(LogIdVisitor)
        } else {
            deserializer.deserialize_bytes(LogIdVisitor)
        }
    }
}

/// A dialable thread address: host multiaddress, hosting peer, thread id.
///
/// Textual form `<host>/p2p/<peer-id>/thread/<thread-id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAddr {
    /// Host part, without the trailing `/p2p` component.
    pub host: Multiaddr,
    /// The peer hosting the thread.
    pub peer: PeerId,
    /// The thread to add.
    pub thread: ThreadId,
}

impl ThreadAddr {
    /// Compose an address.
    pub fn new(host: Multiaddr, peer: PeerId, thread: ThreadId) -> Self {
        Self { host, peer, thread }
    }
}

impl fmt::Display for ThreadAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p2p/{}/thread/{}", self.host, self.peer, self.thread)
    }
}

impl FromStr for ThreadAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (left, thread) = s
            .rsplit_once("/thread/")
            .ok_or_else(|| Error::InvalidThreadId("missing /thread component".into()))?;
        let thread: ThreadId = thread.parse()?;
        let (host, peer) = left
            .rsplit_once("/p2p/")
            .ok_or_else(|| Error::InvalidThreadId("missing /p2p component".into()))?;
        let host: Multiaddr = host
            .parse()
            .map_err(|_| Error::InvalidThreadId("invalid host multiaddress".into()))?;
        let peer: PeerId = peer
            .parse()
            .map_err(|_| Error::InvalidThreadId("invalid peer id".into()))?;
        Ok(ThreadAddr { host, peer, thread })
    }
}
