//! Wire protocol messages and framing.
//!
//! Four request/reply pairs plus the gossip envelope, exchanged over
//! authenticated peer streams. Messages are postcard-encoded and framed
//! with a u32-BE length prefix; the same [`PushRecord`](Request::PushRecord)
//! envelope doubles as the gossip payload for a thread topic.

use braid_core::{LogId, LogInfo, ThreadId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use libp2p_identity::PublicKey;
use multiaddr::Multiaddr;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::NetError;

/// Upper bound on one framed message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum records returned per pull, divided across the thread's logs.
pub const MAX_PULL_LIMIT: usize = 10_000;

/// Wire form of a log description. Heads never travel with a log: they
/// advance locally only through verified record application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLog {
    /// The log id.
    pub id: LogId,
    /// Protobuf-encoded public key.
    pub pub_key: Vec<u8>,
    /// Binary multiaddresses.
    pub addrs: Vec<Vec<u8>>,
}

impl WireLog {
    /// Describe a local log for the wire. Private keys never leave a peer.
    pub fn from_info(info: &LogInfo) -> Self {
        WireLog {
            id: info.id,
            pub_key: info.pub_key.encode_protobuf(),
            addrs: info.addrs.iter().map(|addr| addr.to_vec()).collect(),
        }
    }

    /// Decode into a local log description, dropping malformed addresses.
    pub fn into_info(self) -> Result<LogInfo, NetError> {
        let pub_key = PublicKey::try_decode_protobuf(&self.pub_key)
            .map_err(|_| NetError::Core(braid_core::Error::InvalidKey))?;
        let mut addrs = Vec::with_capacity(self.addrs.len());
        for raw in self.addrs {
            match Multiaddr::try_from(raw) {
                Ok(addr) => addrs.push(addr),
                Err(err) => warn!("dropping undecodable address in wire log: {err}"),
            }
        }
        Ok(LogInfo {
            id: self.id,
            pub_key,
            priv_key: None,
            addrs,
            heads: Vec::new(),
        })
    }
}

/// A sealed record in transit, together with its sealed header and event
/// blocks so the receiver can serve and (with the read key) open them
/// without a separate block fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRecord {
    /// Sealed envelope bytes; the CID is recomputed on receipt.
    pub sealed: Bytes,
    /// Sealed header block, when the sender holds it.
    pub header: Option<Bytes>,
    /// Sealed event block, when the sender holds it.
    pub body: Option<Bytes>,
}

/// Per-log offset entry of a [`Request::GetRecords`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOffset {
    /// The log to pull.
    pub log: LogId,
    /// Last record the requester already holds, or `None` for everything.
    pub offset: Option<Vec<u8>>,
    /// Requester-side cap for this log.
    pub limit: usize,
}

/// Per-thread entry of a [`Request::ExchangeEdges`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEdges {
    /// The thread in question.
    pub thread: ThreadId,
    /// Digest of the sender's address book state.
    pub addrs_edge: u64,
    /// Digest of the sender's head book state.
    pub heads_edge: u64,
}

/// Requests exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Return all logs of a thread. Requires the service key.
    GetLogs {
        /// Target thread.
        thread: ThreadId,
        /// Proof of participation.
        service_key: Vec<u8>,
    },
    /// Install or update a log, optionally seeding thread keys.
    PushLog {
        /// Target thread.
        thread: ThreadId,
        /// The log to install.
        log: WireLog,
        /// Installs the thread if absent.
        service_key: Option<Vec<u8>>,
        /// Installed if absent and the receiver cannot read yet.
        read_key: Option<Vec<u8>>,
    },
    /// Return records strictly after each offset.
    GetRecords {
        /// Target thread.
        thread: ThreadId,
        /// Proof of participation.
        service_key: Vec<u8>,
        /// Per-log offsets.
        logs: Vec<LogOffset>,
    },
    /// Deliver one new record.
    PushRecord {
        /// Target thread.
        thread: ThreadId,
        /// The log the record belongs to.
        log: LogId,
        /// The sealed record.
        record: WireRecord,
    },
    /// Compare per-thread address/head digests.
    ExchangeEdges {
        /// The sender's view.
        threads: Vec<ThreadEdges>,
    },
}

/// Per-log entry of a [`Reply::Records`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecords {
    /// The log the records belong to.
    pub log: LogId,
    /// Chain segment, oldest first.
    pub records: Vec<WireRecord>,
    /// Present when the requester did not know this log.
    pub info: Option<WireLog>,
}

/// Responder's view of one thread's edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeReply {
    /// The thread in question.
    pub thread: ThreadId,
    /// False when the responder does not know the thread.
    pub exists: bool,
    /// Responder's address digest; meaningful only when `exists`.
    pub addrs_edge: u64,
    /// Responder's head digest; meaningful only when `exists`.
    pub heads_edge: u64,
}

/// Error codes carried in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The referenced log (or thread) is unknown to the responder.
    NotFound,
    /// Credentials or signature rejected.
    Unauthenticated,
    /// Transient failure; retry later.
    Unavailable,
    /// The responder does not implement this request.
    Unimplemented,
}

/// Replies to [`Request`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Logs of the requested thread.
    Logs(Vec<WireLog>),
    /// Acknowledgement with no payload.
    Ok,
    /// Records per log.
    Records(Vec<LogRecords>),
    /// Edge comparison results, one per requested thread, same order.
    Edges(Vec<EdgeReply>),
    /// The request failed with a protocol error.
    Error(ErrorCode),
}

impl Reply {
    /// Convert an error reply into `Err`, passing others through.
    pub fn into_result(self) -> Result<Reply, NetError> {
        match self {
            Reply::Error(ErrorCode::NotFound) => Err(NetError::Other(anyhow::anyhow!(
                "remote replied not-found"
            ))),
            Reply::Error(ErrorCode::Unauthenticated) => Err(NetError::Unauthenticated),
            Reply::Error(ErrorCode::Unavailable) => Err(NetError::Unavailable),
            Reply::Error(ErrorCode::Unimplemented) => Err(NetError::Unimplemented),
            other => Ok(other),
        }
    }
}

/// Length-prefixed postcard framing for one message type.
///
/// A u32-BE length precedes each postcard payload. Oversized frames are
/// rejected on both sides.
#[derive(Debug, Default)]
pub struct MessageCodec<T> {
    _marker: std::marker::PhantomData<T>,
}

impl<T> MessageCodec<T> {
    /// A fresh codec.
    pub fn new() -> Self {
        MessageCodec {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = T;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().expect("4 bytes")) as usize;
        anyhow::ensure!(len <= MAX_MESSAGE_SIZE, "frame too large: {len}");
        if src.len() < 4 + len {
            return Ok(None);
        }
        let message = postcard::from_bytes(&src[4..4 + len])?;
        src.advance(4 + len);
        Ok(Some(message))
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec<T> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = postcard::to_stdvec(&item)?;
        anyhow::ensure!(
            payload.len() <= MAX_MESSAGE_SIZE,
            "frame too large: {}",
            payload.len()
        );
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Encode a message with the wire framing into a standalone buffer.
pub fn encode_framed<T: Serialize>(message: &T) -> Result<Bytes, anyhow::Error> {
    let payload = postcard::to_stdvec(message)?;
    anyhow::ensure!(payload.len() <= MAX_MESSAGE_SIZE, "frame too large");
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decode one framed message from a standalone buffer.
pub fn decode_framed<T: DeserializeOwned>(data: Bytes) -> Result<T, anyhow::Error> {
    let mut buf = BytesMut::from(data.as_ref());
    let mut codec = MessageCodec::<T>::new();
    codec
        .decode(&mut buf)?
        .ok_or_else(|| anyhow::anyhow!("truncated frame"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::{LogKeypair, ThreadId, Variant};

    #[test]
    fn framed_round_trip() {
        let request = Request::GetLogs {
            thread: ThreadId::new(Variant::Raw),
            service_key: vec![7u8; 32],
        };
        let framed = encode_framed(&request).unwrap();
        let decoded: Request = decode_framed(framed).unwrap();
        match decoded {
            Request::GetLogs { service_key, .. } => assert_eq!(service_key, vec![7u8; 32]),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn codec_handles_partial_frames() {
        let reply = Reply::Ok;
        let framed = encode_framed(&reply).unwrap();

        let mut codec = MessageCodec::<Reply>::new();
        let mut buf = BytesMut::from(&framed[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&framed[2..]);
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Reply::Ok)));
        assert!(buf.is_empty());
    }

    #[test]
    fn wire_log_round_trip() {
        let keypair = LogKeypair::generate();
        let info = braid_core::LogInfo::own(
            keypair,
            vec!["/ip4/127.0.0.1/tcp/4006".parse().unwrap()],
        );
        let wire = WireLog::from_info(&info);
        let back = wire.into_info().unwrap();
        assert_eq!(back.id, info.id);
        assert_eq!(back.addrs, info.addrs);
        // private keys never cross the wire
        assert!(back.priv_key.is_none());
    }

    #[test]
    fn error_replies_convert() {
        assert!(matches!(
            Reply::Error(ErrorCode::Unauthenticated).into_result(),
            Err(NetError::Unauthenticated)
        ));
        assert!(Reply::Ok.into_result().is_ok());
    }
}
