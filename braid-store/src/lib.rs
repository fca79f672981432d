//! Persistence for braid threads.
//!
//! One transactional [`Datastore`] carries every documented key prefix of a
//! node. On top of it sit the four log-store *books* (keys, addresses,
//! heads and metadata), composed into a [`Logstore`] shared by all
//! databases under one manager, plus a persistent block store.
//!
//! Mutations are transactional within one book. Operations spanning books
//! ([`Logstore::add_thread`], [`Logstore::delete_thread`]) compose several
//! single-book transactions and are therefore not atomic as a whole; a
//! crash in between leaves partial thread state that is repaired by the
//! next replication pass.

pub mod addrbook;
pub mod blocks;
pub mod datastore;
pub mod edges;
mod error;
pub mod headbook;
pub mod keybook;
mod keys;
pub mod metadata;

pub use self::addrbook::{AddrBook, PERMANENT_TTL};
pub use self::blocks::DatastoreBlocks;
pub use self::datastore::{Datastore, WriteBatch};
pub use self::error::StoreError;
pub use self::headbook::HeadBook;
pub use self::keybook::KeyBook;
pub use self::metadata::MetadataBook;

use braid_core::{LogId, LogInfo, LogKeypair, ReadKey, ServiceKey, ThreadId, ThreadInfo, ThreadKey};
use multiaddr::Multiaddr;

/// The four books over one shared datastore.
#[derive(Debug, Clone)]
pub struct Logstore {
    keys: KeyBook,
    addrs: AddrBook,
    heads: HeadBook,
    metadata: MetadataBook,
}

impl Logstore {
    /// Build the books over a datastore handle.
    pub fn new(store: Datastore) -> Self {
        Logstore {
            keys: KeyBook::new(store.clone()),
            addrs: AddrBook::new(store.clone()),
            heads: HeadBook::new(store.clone()),
            metadata: MetadataBook::new(store),
        }
    }

    /// The key book.
    pub fn keys(&self) -> &KeyBook {
        &self.keys
    }

    /// The address book.
    pub fn addrs(&self) -> &AddrBook {
        &self.addrs
    }

    /// The head book.
    pub fn heads(&self) -> &HeadBook {
        &self.heads
    }

    /// The metadata book.
    pub fn metadata(&self) -> &MetadataBook {
        &self.metadata
    }

    /// Install a thread's keys. Fails with [`StoreError::ThreadExists`] if
    /// a service key is already present.
    pub fn add_thread(&self, thread: &ThreadId, key: &ThreadKey) -> Result<(), StoreError> {
        if self.keys.service_key(thread)?.is_some() {
            return Err(StoreError::ThreadExists);
        }
        self.keys.add_service_key(thread, key.service())?;
        if let Some(read) = key.read() {
            self.keys.add_read_key(thread, read)?;
        }
        Ok(())
    }

    /// All thread ids known to any book.
    pub fn threads(&self) -> Result<Vec<ThreadId>, StoreError> {
        let mut threads = self.keys.threads_from_keys()?;
        for thread in self.addrs.threads_from_addrs()? {
            if !threads.contains(&thread) {
                threads.push(thread);
            }
        }
        Ok(threads)
    }

    /// All logs of a thread known to the key or address book.
    pub fn logs(&self, thread: &ThreadId) -> Result<Vec<LogId>, StoreError> {
        let mut logs = self.keys.logs_with_keys(thread)?;
        for log in self.addrs.logs_with_addrs(thread)? {
            if !logs.contains(&log) {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    /// Logs whose addresses are known but whose public key has not yet
    /// been observed; their records cannot be verified until a key
    /// arrives.
    pub fn logs_without_keys(&self, thread: &ThreadId) -> Result<Vec<LogId>, StoreError> {
        let with_keys = self.keys.logs_with_keys(thread)?;
        Ok(self
            .addrs
            .logs_with_addrs(thread)?
            .into_iter()
            .filter(|log| !with_keys.contains(log))
            .collect())
    }

    /// Assemble everything known about one log.
    pub fn log_info(&self, thread: &ThreadId, log: &LogId) -> Result<LogInfo, StoreError> {
        let pub_key = self
            .keys
            .public_key(thread, log)?
            .ok_or(StoreError::LogNotFound)?;
        Ok(LogInfo {
            id: *log,
            pub_key,
            priv_key: self.keys.keypair(thread, log)?,
            addrs: self.addrs.addrs(thread, log)?,
            heads: self.heads.heads(thread, log)?,
        })
    }

    /// Assemble everything known about one thread.
    pub fn thread_info(&self, thread: &ThreadId) -> Result<ThreadInfo, StoreError> {
        let service = self
            .keys
            .service_key(thread)?
            .ok_or(StoreError::ThreadNotFound)?;
        let read = self.keys.read_key(thread)?;
        let mut logs = Vec::new();
        for log in self.keys.logs_with_keys(thread)? {
            logs.push(self.log_info(thread, &log)?);
        }
        Ok(ThreadInfo {
            id: thread.clone(),
            key: ThreadKey::new(service, read),
            logs,
        })
    }

    /// Install a log observed from a peer: public key and addresses.
    /// Identity fields of an already-known log are kept (non-owner updates
    /// only extend addresses); heads advance only through verified record
    /// application.
    pub fn add_log(&self, thread: &ThreadId, info: &LogInfo) -> Result<(), StoreError> {
        if self.keys.public_key(thread, &info.id)?.is_none() {
            self.keys.add_public_key(thread, &info.id, &info.pub_key)?;
            if let Some(keypair) = &info.priv_key {
                self.keys.add_keypair(thread, keypair)?;
            }
        }
        self.addrs
            .add_addrs(thread, &info.id, &info.addrs, PERMANENT_TTL)?;
        Ok(())
    }

    /// Create this peer's own log for a thread.
    pub fn create_own_log(
        &self,
        thread: &ThreadId,
        keypair: LogKeypair,
        addrs: Vec<Multiaddr>,
    ) -> Result<LogInfo, StoreError> {
        self.keys.add_keypair(thread, &keypair)?;
        self.addrs
            .add_addrs(thread, &keypair.id(), &addrs, PERMANENT_TTL)?;
        Ok(LogInfo::own(keypair, addrs))
    }

    /// The log this peer authors in a thread, if one exists.
    pub fn own_log(&self, thread: &ThreadId) -> Result<Option<LogInfo>, StoreError> {
        for log in self.keys.logs_with_keys(thread)? {
            if self.keys.keypair(thread, &log)?.is_some() {
                return Ok(Some(self.log_info(thread, &log)?));
            }
        }
        Ok(None)
    }

    /// Shorthand for the service key.
    pub fn service_key(&self, thread: &ThreadId) -> Result<Option<ServiceKey>, StoreError> {
        self.keys.service_key(thread)
    }

    /// Shorthand for the read key.
    pub fn read_key(&self, thread: &ThreadId) -> Result<Option<ReadKey>, StoreError> {
        self.keys.read_key(thread)
    }

    /// Remove every book entry for a thread. Stored records stay in the
    /// block store; only the keys, addresses, heads and metadata go.
    pub fn delete_thread(&self, thread: &ThreadId) -> Result<(), StoreError> {
        self.keys.clear_thread(thread)?;
        self.addrs.clear_thread(thread)?;
        self.heads.clear_thread(thread)?;
        self.metadata.clear_thread(thread)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::Variant;

    fn logstore() -> Logstore {
        Logstore::new(Datastore::memory().unwrap())
    }

    #[test]
    fn add_thread_then_info() {
        let store = logstore();
        let thread = ThreadId::new(Variant::Raw);
        let key = ThreadKey::generate();
        store.add_thread(&thread, &key).unwrap();
        assert!(matches!(
            store.add_thread(&thread, &key),
            Err(StoreError::ThreadExists)
        ));

        let info = store.thread_info(&thread).unwrap();
        assert_eq!(info.id, thread);
        assert!(info.key.can_read());
        assert!(info.logs.is_empty());
    }

    #[test]
    fn own_log_and_external_log() {
        let store = logstore();
        let thread = ThreadId::new(Variant::Raw);
        store.add_thread(&thread, &ThreadKey::generate()).unwrap();

        let own = store
            .create_own_log(
                &thread,
                LogKeypair::generate(),
                vec!["/ip4/127.0.0.1/tcp/4006".parse().unwrap()],
            )
            .unwrap();
        assert!(store.own_log(&thread).unwrap().is_some());

        let external = LogKeypair::generate();
        store
            .add_log(
                &thread,
                &LogInfo {
                    id: external.id(),
                    pub_key: external.public(),
                    priv_key: None,
                    addrs: vec!["/ip4/10.0.0.2/tcp/4006".parse().unwrap()],
                    heads: Vec::new(),
                },
            )
            .unwrap();

        let info = store.thread_info(&thread).unwrap();
        assert_eq!(info.logs.len(), 2);
        assert_eq!(info.own_log().unwrap().id, own.id);
        assert!(store.logs(&thread).unwrap().contains(&external.id()));
    }

    #[test]
    fn unknown_thread_is_not_found() {
        let store = logstore();
        assert!(matches!(
            store.thread_info(&ThreadId::new(Variant::Raw)),
            Err(StoreError::ThreadNotFound)
        ));
    }

    #[test]
    fn delete_thread_clears_books() {
        let store = logstore();
        let thread = ThreadId::new(Variant::Raw);
        store.add_thread(&thread, &ThreadKey::generate()).unwrap();
        store
            .create_own_log(&thread, LogKeypair::generate(), Vec::new())
            .unwrap();
        store.metadata().put(&thread, "name", b"x").unwrap();

        store.delete_thread(&thread).unwrap();
        assert!(store.threads().unwrap().is_empty());
        assert_eq!(store.metadata().get(&thread, "name").unwrap(), None);
    }
}
