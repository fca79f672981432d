//! Persistent block store backed by the shared datastore.

use async_trait::async_trait;
use braid_core::{content_cid, BlockStore};
use bytes::Bytes;
use cid::Cid;

use crate::datastore::Datastore;

const PREFIX: &[u8] = b"/blocks/";

fn block_key(cid: &Cid) -> Vec<u8> {
    let mut key = PREFIX.to_vec();
    key.extend_from_slice(&cid.to_bytes());
    key
}

/// Content-addressed blocks stored in the node datastore.
#[derive(Debug, Clone)]
pub struct DatastoreBlocks {
    store: Datastore,
}

impl DatastoreBlocks {
    /// Wrap a datastore handle.
    pub fn new(store: Datastore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockStore for DatastoreBlocks {
    async fn put(&self, data: Bytes) -> Result<Cid, braid_core::Error> {
        let cid = content_cid(&data);
        let key = block_key(&cid);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.put(&key, &data))
            .await
            .map_err(|err| braid_core::Error::Blockstore(err.to_string()))?
            .map_err(|err| braid_core::Error::Blockstore(err.to_string()))?;
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, braid_core::Error> {
        let key = block_key(cid);
        let store = self.store.clone();
        let value = tokio::task::spawn_blocking(move || store.get(&key))
            .await
            .map_err(|err| braid_core::Error::Blockstore(err.to_string()))?
            .map_err(|err| braid_core::Error::Blockstore(err.to_string()))?;
        Ok(value.map(Bytes::from))
    }
}
