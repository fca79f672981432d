//! The manager: many databases over one datastore and one network.

use std::collections::HashMap;

use braid_core::{ThreadAddr, ThreadId, ThreadKey, Variant};
use braid_net::Net;
use braid_store::Datastore;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::DbError;

const MANAGER_PREFIX: &str = "/manager/";

/// Owns every database of a node. At most one in-memory [`Db`] exists per
/// thread id.
#[derive(Debug)]
pub struct Manager {
    store: Datastore,
    net: Net,
    dbs: tokio::sync::RwLock<HashMap<ThreadId, Db>>,
}

impl Manager {
    /// Hydrate all previously created databases from the datastore.
    pub async fn new(store: Datastore, net: Net) -> Result<Manager, DbError> {
        let manager = Manager {
            store,
            net,
            dbs: tokio::sync::RwLock::new(HashMap::new()),
        };
        let mut hydrated = 0usize;
        for (key, _) in manager.store.scan_prefix(MANAGER_PREFIX.as_bytes())? {
            let Some(thread) = std::str::from_utf8(&key[MANAGER_PREFIX.len()..])
                .ok()
                .and_then(|text| text.parse::<ThreadId>().ok())
            else {
                warn!("skipping undecodable manager entry");
                continue;
            };
            let db = Db::open(manager.store.clone(), manager.net.clone(), thread.clone()).await?;
            manager.dbs.write().await.insert(thread, db);
            hydrated += 1;
        }
        if hydrated > 0 {
            info!(count = hydrated, "databases hydrated");
        }
        Ok(manager)
    }

    fn manager_key(thread: &ThreadId) -> Vec<u8> {
        format!("{MANAGER_PREFIX}{thread}").into_bytes()
    }

    /// Create a database on a brand-new thread with fresh service and read
    /// keys.
    pub async fn new_db(&self) -> Result<Db, DbError> {
        let thread = ThreadId::new(Variant::Raw);
        self.net
            .create_thread(&thread, ThreadKey::generate())
            .await?;
        self.store.put(&Self::manager_key(&thread), &[])?;
        let db = Db::open(self.store.clone(), self.net.clone(), thread.clone()).await?;
        self.dbs.write().await.insert(thread.clone(), db.clone());
        debug!(%thread, "database created");
        Ok(db)
    }

    /// Join a thread hosted elsewhere and open its database. Requires the
    /// service key; a missing read key leaves this peer a replicate-only
    /// follower.
    pub async fn new_db_from_addr(
        &self,
        addr: &ThreadAddr,
        key: ThreadKey,
    ) -> Result<Db, DbError> {
        if self.dbs.read().await.contains_key(&addr.thread) {
            return Err(DbError::Store(braid_store::StoreError::ThreadExists));
        }
        self.net.add_thread(addr, key).await?;
        self.store.put(&Self::manager_key(&addr.thread), &[])?;
        // the database (and its event sink) must exist before the first
        // records are pulled
        let db = Db::open(self.store.clone(), self.net.clone(), addr.thread.clone()).await?;
        self.net.bootstrap_thread(addr).await?;
        self.dbs
            .write()
            .await
            .insert(addr.thread.clone(), db.clone());
        debug!(thread = %addr.thread, "database joined from address");
        Ok(db)
    }

    /// The database of a thread, if one is open.
    pub async fn get_db(&self, thread: &ThreadId) -> Option<Db> {
        self.dbs.read().await.get(thread).cloned()
    }

    /// Tear down a database and detach it from the network. Log store
    /// entries and instance data survive unless `purge` is set.
    pub async fn delete_db(&self, thread: &ThreadId, purge: bool) -> Result<(), DbError> {
        let Some(db) = self.dbs.write().await.remove(thread) else {
            return Err(DbError::Store(braid_store::StoreError::ThreadNotFound));
        };
        db.close();
        self.store.delete(&Self::manager_key(thread))?;
        if purge {
            self.net.delete_thread(thread).await?;
            let prefix = format!("/db/{thread}/");
            self.store.write(|tx| {
                tx.delete_prefix(prefix.as_bytes())?;
                Ok::<_, DbError>(())
            })?;
        } else {
            self.net.detach_thread(thread).await?;
        }
        Ok(())
    }

    /// Close every database.
    pub async fn close(&self) {
        for (_, db) in self.dbs.write().await.drain() {
            db.close();
        }
    }
}
