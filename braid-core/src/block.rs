//! The content-addressed block store seam.
//!
//! Records and their header/body blocks are opaque sealed bytes owned by a
//! block store. The store is an external collaborator; braid only needs
//! `put`/`get` keyed by CID. Persistent implementations live alongside the
//! datastore; [`MemBlockStore`] backs tests and in-process nodes.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use parking_lot::RwLock;

use crate::content::content_cid;
use crate::error::Error;

/// Put/get opaque content-addressed blocks.
///
/// `put` computes and returns the block's CID; storing the same bytes twice
/// is an idempotent no-op. Calls may block for seconds on remote-backed
/// implementations, hence async.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Store a block, returning its content address.
    async fn put(&self, data: Bytes) -> Result<Cid, Error>;

    /// Fetch a block by content address.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, Error>;

    /// True if the block is present locally.
    async fn has(&self, cid: &Cid) -> Result<bool, Error> {
        Ok(self.get(cid).await?.is_some())
    }
}

/// In-memory block store.
#[derive(Debug, Default, Clone)]
pub struct MemBlockStore {
    blocks: std::sync::Arc<RwLock<HashMap<Cid, Bytes>>>,
}

impl MemBlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for MemBlockStore {
    async fn put(&self, data: Bytes) -> Result<Cid, Error> {
        let cid = content_cid(&data);
        self.blocks.write().entry(cid).or_insert(data);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, Error> {
        Ok(self.blocks.read().get(cid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemBlockStore::new();
        let cid = store.put(Bytes::from_static(b"block")).await.unwrap();
        assert_eq!(cid, content_cid(b"block"));
        assert_eq!(
            store.get(&cid).await.unwrap(),
            Some(Bytes::from_static(b"block"))
        );
        assert!(store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn missing_block_is_none() {
        let store = MemBlockStore::new();
        let cid = content_cid(b"nope");
        assert_eq!(store.get(&cid).await.unwrap(), None);
    }
}
