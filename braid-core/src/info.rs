//! Aggregated thread and log descriptions, as handed between the log
//! store, the replication engine and the database layer.

use cid::Cid;
use libp2p_identity::PublicKey;
use multiaddr::Multiaddr;

use crate::key::{LogKeypair, ThreadKey};
use crate::thread::{LogId, ThreadId};

/// Everything known locally about one log.
#[derive(Debug, Clone)]
pub struct LogInfo {
    /// The log identity.
    pub id: LogId,
    /// The author's public key.
    pub pub_key: PublicKey,
    /// The full keypair, present only if this peer authors the log.
    pub priv_key: Option<LogKeypair>,
    /// Multiaddresses other peers can pull this log from.
    pub addrs: Vec<Multiaddr>,
    /// Current heads. Canonically one; concurrent heads are retained.
    pub heads: Vec<Cid>,
}

impl LogInfo {
    /// Describe a log this peer authors.
    pub fn own(keypair: LogKeypair, addrs: Vec<Multiaddr>) -> Self {
        LogInfo {
            id: keypair.id(),
            pub_key: keypair.public(),
            priv_key: Some(keypair),
            addrs,
            heads: Vec::new(),
        }
    }

    /// The most recent head, when the log is single-headed.
    pub fn head(&self) -> Option<Cid> {
        self.heads.first().copied()
    }

    /// True if this peer can append to the log.
    pub fn is_own(&self) -> bool {
        self.priv_key.is_some()
    }
}

/// Everything known locally about one thread.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// The thread identity.
    pub id: ThreadId,
    /// Service and (optionally) read key.
    pub key: ThreadKey,
    /// All known logs.
    pub logs: Vec<LogInfo>,
}

impl ThreadInfo {
    /// The log authored by this peer, if one exists yet.
    pub fn own_log(&self) -> Option<&LogInfo> {
        self.logs.iter().find(|log| log.is_own())
    }

    /// Look up a log by id.
    pub fn log(&self, id: &LogId) -> Option<&LogInfo> {
        self.logs.iter().find(|log| log.id == *id)
    }
}
