//! The key book: thread symmetric keys and per-log keypairs.

use braid_core::{LogId, LogKeypair, ReadKey, ServiceKey, ThreadId};
use libp2p_identity::PublicKey;

use crate::datastore::Datastore;
use crate::error::StoreError;
use crate::keys::{b32, book_prefix, thread_component, thread_prefix};

const BOOK: &str = "keys";

/// Per-thread key material: service key, read key, and the set of log
/// public keys (plus private keys for logs this peer authors).
#[derive(Debug, Clone)]
pub struct KeyBook {
    store: Datastore,
}

impl KeyBook {
    pub(crate) fn new(store: Datastore) -> Self {
        Self { store }
    }

    fn service_key_path(thread: &ThreadId) -> Vec<u8> {
        let mut key = thread_prefix(BOOK, thread);
        key.extend_from_slice(b"service");
        key
    }

    fn read_key_path(thread: &ThreadId) -> Vec<u8> {
        let mut key = thread_prefix(BOOK, thread);
        key.extend_from_slice(b"read");
        key
    }

    fn pub_key_path(thread: &ThreadId, log: &LogId) -> Vec<u8> {
        let mut key = thread_prefix(BOOK, thread);
        key.extend_from_slice(b"pub/");
        key.extend_from_slice(b32(&log.to_bytes()).as_bytes());
        key
    }

    fn priv_key_path(thread: &ThreadId, log: &LogId) -> Vec<u8> {
        let mut key = thread_prefix(BOOK, thread);
        key.extend_from_slice(b"priv/");
        key.extend_from_slice(b32(&log.to_bytes()).as_bytes());
        key
    }

    /// Install the thread service key. Idempotent for an equal key.
    pub fn add_service_key(&self, thread: &ThreadId, key: &ServiceKey) -> Result<(), StoreError> {
        self.store
            .put(&Self::service_key_path(thread), key.as_bytes())
    }

    /// The thread service key, if the thread is known.
    pub fn service_key(&self, thread: &ThreadId) -> Result<Option<ServiceKey>, StoreError> {
        match self.store.get(&Self::service_key_path(thread))? {
            Some(bytes) => Ok(Some(ServiceKey::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Install the thread read key.
    pub fn add_read_key(&self, thread: &ThreadId, key: &ReadKey) -> Result<(), StoreError> {
        self.store.put(&Self::read_key_path(thread), key.as_bytes())
    }

    /// The thread read key, if this peer can read event bodies.
    pub fn read_key(&self, thread: &ThreadId) -> Result<Option<ReadKey>, StoreError> {
        match self.store.get(&Self::read_key_path(thread))? {
            Some(bytes) => Ok(Some(ReadKey::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record a log's public key, installing the log on first observation.
    pub fn add_public_key(
        &self,
        thread: &ThreadId,
        log: &LogId,
        key: &PublicKey,
    ) -> Result<(), StoreError> {
        self.store
            .put(&Self::pub_key_path(thread, log), &key.encode_protobuf())
    }

    /// A log's public key.
    pub fn public_key(
        &self,
        thread: &ThreadId,
        log: &LogId,
    ) -> Result<Option<PublicKey>, StoreError> {
        match self.store.get(&Self::pub_key_path(thread, log))? {
            Some(bytes) => Ok(Some(
                PublicKey::try_decode_protobuf(&bytes)
                    .map_err(|_| StoreError::Core(braid_core::Error::InvalidKey))?,
            )),
            None => Ok(None),
        }
    }

    /// Store a full keypair for a log this peer authors. Also records the
    /// public half.
    pub fn add_keypair(&self, thread: &ThreadId, keypair: &LogKeypair) -> Result<(), StoreError> {
        let id = keypair.id();
        self.store.write(|tx| {
            tx.put(&Self::pub_key_path(thread, &id), &keypair.public().encode_protobuf())?;
            tx.put(&Self::priv_key_path(thread, &id), &keypair.to_bytes())?;
            Ok(())
        })
    }

    /// A log's keypair, present only for logs this peer authors.
    pub fn keypair(
        &self,
        thread: &ThreadId,
        log: &LogId,
    ) -> Result<Option<LogKeypair>, StoreError> {
        match self.store.get(&Self::priv_key_path(thread, log))? {
            Some(bytes) => Ok(Some(LogKeypair::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Logs of a thread that have a known public key.
    pub fn logs_with_keys(&self, thread: &ThreadId) -> Result<Vec<LogId>, StoreError> {
        let mut prefix = thread_prefix(BOOK, thread);
        prefix.extend_from_slice(b"pub/");
        let mut logs = Vec::new();
        for (key, _) in self.store.scan_prefix(&prefix)? {
            if let Some(log) = crate::keys::log_component(&key) {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    /// All threads that have any key material.
    pub fn threads_from_keys(&self) -> Result<Vec<ThreadId>, StoreError> {
        let mut threads = Vec::new();
        for (key, _) in self.store.scan_prefix(&book_prefix(BOOK))? {
            if let Some(thread) = thread_component(BOOK, &key) {
                if !threads.contains(&thread) {
                    threads.push(thread);
                }
            }
        }
        Ok(threads)
    }

    /// Remove all key material for a thread.
    pub fn clear_thread(&self, thread: &ThreadId) -> Result<(), StoreError> {
        let prefix = thread_prefix(BOOK, thread);
        self.store.write(|tx| {
            tx.delete_prefix(&prefix)?;
            Ok(())
        })
    }

    /// Raw contents for backup.
    pub fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.store.scan_prefix(&book_prefix(BOOK))
    }

    /// Replace the book contents with a previous [`KeyBook::dump`].
    pub fn restore(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), StoreError> {
        self.store.write(|tx| {
            tx.delete_prefix(&book_prefix(BOOK))?;
            for (key, value) in entries {
                tx.put(key, value)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::Variant;

    fn book() -> KeyBook {
        KeyBook::new(Datastore::memory().unwrap())
    }

    #[test]
    fn thread_keys_round_trip() {
        let book = book();
        let thread = ThreadId::new(Variant::Raw);
        let service = ServiceKey::generate();
        let read = ReadKey::generate();

        assert!(book.service_key(&thread).unwrap().is_none());
        book.add_service_key(&thread, &service).unwrap();
        book.add_read_key(&thread, &read).unwrap();
        assert_eq!(book.service_key(&thread).unwrap(), Some(service));
        assert_eq!(book.read_key(&thread).unwrap(), Some(read));
    }

    #[test]
    fn log_keys_and_enumeration() {
        let book = book();
        let thread = ThreadId::new(Variant::Raw);
        let own = LogKeypair::generate();
        let external = LogKeypair::generate();

        book.add_keypair(&thread, &own).unwrap();
        book.add_public_key(&thread, &external.id(), &external.public())
            .unwrap();

        let mut logs = book.logs_with_keys(&thread).unwrap();
        logs.sort_by_key(|log| log.to_bytes());
        let mut expected = vec![own.id(), external.id()];
        expected.sort_by_key(|log| log.to_bytes());
        assert_eq!(logs, expected);

        assert!(book.keypair(&thread, &own.id()).unwrap().is_some());
        assert!(book.keypair(&thread, &external.id()).unwrap().is_none());
        assert_eq!(book.threads_from_keys().unwrap(), vec![thread]);
    }

    #[test]
    fn dump_restore_round_trip() {
        let book = book();
        let thread = ThreadId::new(Variant::Raw);
        book.add_service_key(&thread, &ServiceKey::generate()).unwrap();
        let dump = book.dump().unwrap();
        assert!(!dump.is_empty());

        book.clear_thread(&thread).unwrap();
        assert!(book.service_key(&thread).unwrap().is_none());
        book.restore(&dump).unwrap();
        assert!(book.service_key(&thread).unwrap().is_some());
    }
}
