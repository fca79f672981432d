//! Node wiring: datastore, replication engine and database manager.

use std::sync::Arc;

use anyhow::Context;
use braid_db::Manager;
use braid_net::{Gossip, Net, NetConfig, Transport};
use braid_store::{Datastore, DatastoreBlocks, Logstore};
use libp2p_identity::Keypair;
use tracing::info;

use crate::config::Config;

const IDENTITY_KEY: &[u8] = b"/node/identity";

/// A running braid node: one datastore, one replication engine, many
/// databases.
#[derive(Debug)]
pub struct Node {
    datastore: Datastore,
    net: Net,
    manager: Manager,
}

impl Node {
    /// Open the repo at `config.repo_path`, returning the datastore and
    /// this node's stable identity. The identity is what the transport
    /// must authenticate as; hand both to [`Node::spawn`].
    pub fn open_repo(config: &Config) -> anyhow::Result<(Datastore, Keypair)> {
        std::fs::create_dir_all(&config.repo_path)
            .with_context(|| format!("creating repo at {}", config.repo_path.display()))?;
        let datastore = Datastore::persistent(config.repo_path.join("braid.db"))
            .context("opening datastore")?;
        let identity = Self::identity(&datastore)?;
        Ok((datastore, identity))
    }

    /// An ephemeral in-memory node, used by tests and embedders.
    pub async fn memory(
        transport: Arc<dyn Transport>,
        gossip: Arc<dyn Gossip>,
        net_config: NetConfig,
    ) -> anyhow::Result<Node> {
        let datastore = Datastore::memory().context("opening datastore")?;
        Self::spawn(datastore, transport, gossip, net_config).await
    }

    /// Start the node over an opened datastore and the given transport and
    /// gossip implementations.
    pub async fn spawn(
        datastore: Datastore,
        transport: Arc<dyn Transport>,
        gossip: Arc<dyn Gossip>,
        net_config: NetConfig,
    ) -> anyhow::Result<Node> {
        let logstore = Logstore::new(datastore.clone());
        let blocks = Arc::new(DatastoreBlocks::new(datastore.clone()));
        let net = Net::new(logstore, blocks, transport, gossip, net_config);
        let manager = Manager::new(datastore.clone(), net.clone())
            .await
            .context("hydrating databases")?;
        info!(peer = %net.local_peer(), "node started");
        Ok(Node {
            datastore,
            net,
            manager,
        })
    }

    /// Load or mint this node's identity keypair from a datastore.
    ///
    /// Transports authenticate peers with this identity, so it must be
    /// stable across restarts of a persistent repo.
    pub fn identity(datastore: &Datastore) -> anyhow::Result<Keypair> {
        if let Some(bytes) = datastore.get(IDENTITY_KEY)? {
            return Ok(Keypair::from_protobuf_encoding(&bytes)?);
        }
        let keypair = Keypair::generate_ed25519();
        datastore.put(IDENTITY_KEY, &keypair.to_protobuf_encoding()?)?;
        Ok(keypair)
    }

    /// The database manager.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// The replication engine.
    pub fn net(&self) -> &Net {
        &self.net
    }

    /// The shared datastore.
    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    /// Close databases first, then drain the replication engine.
    pub async fn close(&self) {
        self.manager.close().await;
        self.net.close().await;
    }
}
