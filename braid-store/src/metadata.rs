//! Per-thread opaque metadata used by applications.

use braid_core::ThreadId;

use crate::datastore::Datastore;
use crate::error::StoreError;
use crate::keys::{book_prefix, thread_prefix};

const BOOK: &str = "meta";

/// Small opaque key-value pairs scoped to one thread.
#[derive(Debug, Clone)]
pub struct MetadataBook {
    store: Datastore,
}

impl MetadataBook {
    pub(crate) fn new(store: Datastore) -> Self {
        Self { store }
    }

    fn path(thread: &ThreadId, name: &str) -> Vec<u8> {
        let mut key = thread_prefix(BOOK, thread);
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// Store a value under `name`.
    pub fn put(&self, thread: &ThreadId, name: &str, value: &[u8]) -> Result<(), StoreError> {
        self.store.put(&Self::path(thread, name), value)
    }

    /// Read a value by `name`.
    pub fn get(&self, thread: &ThreadId, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(&Self::path(thread, name))
    }

    /// Remove all metadata for a thread.
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

    /// Replace the book contents with a previous [`MetadataBook::dump`].
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

    #[test]
    fn metadata_round_trip() {
        let book = MetadataBook::new(Datastore::memory().unwrap());
        let thread = ThreadId::new(Variant::Raw);
        book.put(&thread, "name", b"inventory").unwrap();
        assert_eq!(book.get(&thread, "name").unwrap(), Some(b"inventory".to_vec()));
        book.clear_thread(&thread).unwrap();
        assert_eq!(book.get(&thread, "name").unwrap(), None);
    }
}
