//! The transport and gossip seams.
//!
//! The network is an external collaborator: braid only assumes
//! authenticated peer-to-peer request streams and a topic-based gossip
//! primitive. Both are expressed as traits here; [`crate::mem`] provides
//! the in-process implementation used by tests and embedded nodes.

use async_trait::async_trait;
use bytes::Bytes;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::proto::{Reply, Request};

/// One multiplexed, authenticated connection to a peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Issue one request and await its reply over a fresh stream.
    async fn request(&self, request: Request) -> anyhow::Result<Reply>;

    /// True once the connection is no longer usable and should be
    /// evicted from the cache.
    fn is_closed(&self) -> bool;
}

/// An inbound request awaiting a reply.
#[derive(Debug)]
pub struct Inbound {
    /// The authenticated remote peer.
    pub from: PeerId,
    /// The decoded request.
    pub request: Request,
    /// Send exactly one reply here.
    pub reply: oneshot::Sender<Reply>,
}

/// Authenticated peer-to-peer byte streams.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This peer's identity.
    fn local_peer(&self) -> PeerId;

    /// Addresses other peers can dial this transport at.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Open (or reuse) a connection to a peer reachable at `addrs`.
    async fn dial(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
    ) -> anyhow::Result<Box<dyn Connection>>;

    /// Take the stream of inbound requests. Yields `None` once per
    /// transport; subsequent calls return an empty channel.
    fn incoming(&self) -> mpsc::Receiver<Inbound>;
}

/// A message received from a gossip topic.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// The publishing peer.
    pub from: PeerId,
    /// The topic the message was published to.
    pub topic: Bytes,
    /// Framed payload.
    pub data: Bytes,
}

/// Topic-based gossip fan-out.
#[async_trait]
pub trait Gossip: Send + Sync + 'static {
    /// Join a topic, receiving its messages on [`Gossip::subscribe`].
    async fn join(&self, topic: &[u8]) -> anyhow::Result<()>;

    /// Leave a topic.
    async fn leave(&self, topic: &[u8]) -> anyhow::Result<()>;

    /// Publish to every current member of a topic. Best effort.
    async fn publish(&self, topic: &[u8], data: Bytes) -> anyhow::Result<()>;

    /// Subscribe to messages of all joined topics.
    fn subscribe(&self) -> broadcast::Receiver<GossipMessage>;
}
