//! In-process transport and gossip.
//!
//! A [`MemNetwork`] is a registry of attached peers. Requests are routed
//! through the same wire framing as a real transport (encode -> decode on
//! both legs), so protocol codec bugs surface in multi-peer tests. Peers
//! can be taken offline to exercise divergence and back-fill paths.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use crate::proto::{decode_framed, encode_framed, Reply, Request};
use crate::transport::{Connection, Gossip, GossipMessage, Inbound, Transport};

const INBOUND_CAP: usize = 256;
const GOSSIP_CAP: usize = 256;

#[derive(Debug)]
struct PeerSlot {
    inbound: mpsc::Sender<Inbound>,
    gossip: broadcast::Sender<GossipMessage>,
    topics: HashSet<Vec<u8>>,
    online: bool,
}

#[derive(Debug, Default)]
struct Registry {
    peers: HashMap<PeerId, PeerSlot>,
}

/// A shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl MemNetwork {
    /// A fresh, empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer, returning its transport and gossip handles.
    pub fn attach(&self, peer: PeerId) -> (MemTransport, MemGossip) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAP);
        let (gossip_tx, _) = broadcast::channel(GOSSIP_CAP);
        self.registry.write().peers.insert(
            peer,
            PeerSlot {
                inbound: inbound_tx,
                gossip: gossip_tx.clone(),
                topics: HashSet::new(),
                online: true,
            },
        );
        (
            MemTransport {
                registry: self.registry.clone(),
                local: peer,
                inbound: Arc::new(Mutex::new(Some(inbound_rx))),
            },
            MemGossip {
                registry: self.registry.clone(),
                local: peer,
                sender: gossip_tx,
            },
        )
    }

    /// Take a peer offline (dials fail, gossip is not delivered) or bring
    /// it back.
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        if let Some(slot) = self.registry.write().peers.get_mut(peer) {
            slot.online = online;
        }
    }
}

/// In-process transport handle for one peer.
#[derive(Debug, Clone)]
pub struct MemTransport {
    registry: Arc<RwLock<Registry>>,
    local: PeerId,
    inbound: Arc<Mutex<Option<mpsc::Receiver<Inbound>>>>,
}

#[async_trait]
impl Transport for MemTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        // in-process peers are "reachable" at a memory address carrying
        // their own identity
        vec![format!("/memory/0/p2p/{}", self.local)
            .parse()
            .expect("static multiaddr")]
    }

    async fn dial(
        &self,
        peer: &PeerId,
        _addrs: &[Multiaddr],
    ) -> anyhow::Result<Box<dyn Connection>> {
        let registry = self.registry.read();
        let slot = registry
            .peers
            .get(peer)
            .ok_or_else(|| anyhow::anyhow!("unknown peer {peer}"))?;
        anyhow::ensure!(slot.online, "peer {peer} is offline");
        Ok(Box::new(MemConnection {
            registry: self.registry.clone(),
            local: self.local,
            remote: *peer,
        }))
    }

    fn incoming(&self) -> mpsc::Receiver<Inbound> {
        self.inbound
            .lock()
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1)
    }
}

#[derive(Debug)]
struct MemConnection {
    registry: Arc<RwLock<Registry>>,
    local: PeerId,
    remote: PeerId,
}

#[async_trait]
impl Connection for MemConnection {
    async fn request(&self, request: Request) -> anyhow::Result<Reply> {
        // run the request through the real wire framing on both legs
        let framed = encode_framed(&request)?;
        let request: Request = decode_framed(framed)?;

        let inbound = {
            let registry = self.registry.read();
            let slot = registry
                .peers
                .get(&self.remote)
                .ok_or_else(|| anyhow::anyhow!("peer {} went away", self.remote))?;
            anyhow::ensure!(slot.online, "peer {} is offline", self.remote);
            slot.inbound.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        inbound
            .send(Inbound {
                from: self.local,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("peer {} stopped serving", self.remote))?;
        let reply = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("peer {} dropped the request", self.remote))?;

        let framed = encode_framed(&reply)?;
        Ok(decode_framed(framed)?)
    }

    fn is_closed(&self) -> bool {
        let registry = self.registry.read();
        !registry
            .peers
            .get(&self.remote)
            .map(|slot| slot.online)
            .unwrap_or(false)
    }
}

/// In-process gossip handle for one peer.
#[derive(Debug, Clone)]
pub struct MemGossip {
    registry: Arc<RwLock<Registry>>,
    local: PeerId,
    sender: broadcast::Sender<GossipMessage>,
}

#[async_trait]
impl Gossip for MemGossip {
    async fn join(&self, topic: &[u8]) -> anyhow::Result<()> {
        if let Some(slot) = self.registry.write().peers.get_mut(&self.local) {
            slot.topics.insert(topic.to_vec());
        }
        Ok(())
    }

    async fn leave(&self, topic: &[u8]) -> anyhow::Result<()> {
        if let Some(slot) = self.registry.write().peers.get_mut(&self.local) {
            slot.topics.remove(topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &[u8], data: Bytes) -> anyhow::Result<()> {
        let message = GossipMessage {
            from: self.local,
            topic: Bytes::copy_from_slice(topic),
            data,
        };
        let targets: Vec<broadcast::Sender<GossipMessage>> = {
            let registry = self.registry.read();
            registry
                .peers
                .iter()
                .filter(|(peer, slot)| {
                    **peer != self.local && slot.online && slot.topics.contains(topic)
                })
                .map(|(_, slot)| slot.gossip.clone())
                .collect()
        };
        for target in targets {
            if target.send(message.clone()).is_err() {
                warn!("gossip member has no active subscriber, dropping message");
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<GossipMessage> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::{ThreadId, Variant};
    use libp2p_identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let network = MemNetwork::new();
        let alice = peer();
        let bob = peer();
        let (alice_transport, _) = network.attach(alice);
        let (bob_transport, _) = network.attach(bob);

        let mut inbound = bob_transport.incoming();
        tokio::spawn(async move {
            while let Some(call) = inbound.recv().await {
                let _ = call.reply.send(Reply::Ok);
            }
        });

        let conn = alice_transport.dial(&bob, &[]).await.unwrap();
        let reply = conn
            .request(Request::ExchangeEdges { threads: vec![] })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Ok));
    }

    #[tokio::test]
    async fn offline_peer_refuses_dials() {
        let network = MemNetwork::new();
        let alice = peer();
        let bob = peer();
        let (alice_transport, _) = network.attach(alice);
        let _bob_handles = network.attach(bob);

        network.set_online(&bob, false);
        assert!(alice_transport.dial(&bob, &[]).await.is_err());
        network.set_online(&bob, true);
        assert!(alice_transport.dial(&bob, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn gossip_reaches_topic_members_only() {
        let network = MemNetwork::new();
        let alice = peer();
        let bob = peer();
        let carol = peer();
        let (_, alice_gossip) = network.attach(alice);
        let (_, bob_gossip) = network.attach(bob);
        let (_, carol_gossip) = network.attach(carol);

        let topic = ThreadId::new(Variant::Raw).to_bytes();
        bob_gossip.join(&topic).await.unwrap();
        let mut bob_rx = bob_gossip.subscribe();
        let mut carol_rx = carol_gossip.subscribe();

        alice_gossip
            .publish(&topic, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let message = bob_rx.recv().await.unwrap();
        assert_eq!(message.data, Bytes::from_static(b"hello"));
        assert_eq!(message.from, alice);
        assert!(carol_rx.try_recv().is_err());
    }
}
