//! The head book: the current chain tip(s) of every log.

use braid_core::{LogId, ThreadId};
use cid::Cid;

use crate::datastore::Datastore;
use crate::edges;
use crate::error::StoreError;
use crate::keys::{book_prefix, log_component, log_key, thread_prefix};

const BOOK: &str = "heads";

/// Per-(thread, log) ordered head lists.
///
/// The canonical case is a single head; concurrent heads observed on one
/// log are all retained and replicated.
#[derive(Debug, Clone)]
pub struct HeadBook {
    store: Datastore,
}

impl HeadBook {
    pub(crate) fn new(store: Datastore) -> Self {
        Self { store }
    }

    /// Current heads of a log, most recent first. Empty if none recorded.
    pub fn heads(&self, thread: &ThreadId, log: &LogId) -> Result<Vec<Cid>, StoreError> {
        match self.store.get(&log_key(BOOK, thread, log))? {
            Some(bytes) => {
                let raw: Vec<Vec<u8>> = postcard::from_bytes(&bytes)?;
                let mut heads = Vec::with_capacity(raw.len());
                for bytes in raw {
                    heads.push(
                        Cid::try_from(bytes)
                            .map_err(|_| StoreError::Core(braid_core::Error::InvalidKey))?,
                    );
                }
                Ok(heads)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Replace the head list of a log.
    pub fn set_heads(
        &self,
        thread: &ThreadId,
        log: &LogId,
        heads: &[Cid],
    ) -> Result<(), StoreError> {
        let key = log_key(BOOK, thread, log);
        if heads.is_empty() {
            return self.store.delete(&key);
        }
        let raw: Vec<Vec<u8>> = heads.iter().map(|cid| cid.to_bytes()).collect();
        self.store.put(&key, &postcard::to_stdvec(&raw)?)
    }

    /// Advance a log from `old` (if present) to `new`, retaining any other
    /// concurrent heads.
    pub fn advance_head(
        &self,
        thread: &ThreadId,
        log: &LogId,
        old: Option<Cid>,
        new: Cid,
    ) -> Result<(), StoreError> {
        let mut heads = self.heads(thread, log)?;
        if let Some(old) = old {
            heads.retain(|head| *head != old);
        }
        if !heads.contains(&new) {
            heads.insert(0, new);
        }
        self.set_heads(thread, log, &heads)
    }

    /// Logs of a thread that have any recorded head.
    pub fn logs_with_heads(&self, thread: &ThreadId) -> Result<Vec<LogId>, StoreError> {
        let mut logs = Vec::new();
        for (key, _) in self.store.scan_prefix(&thread_prefix(BOOK, thread))? {
            if let Some(log) = log_component(&key) {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    /// 64-bit digest over the thread's `(log, head)` pairs.
    pub fn heads_edge(&self, thread: &ThreadId) -> Result<u64, StoreError> {
        let mut entries = Vec::new();
        for log in self.logs_with_heads(thread)? {
            for head in self.heads(thread, &log)? {
                let mut entry = log.to_bytes();
                entry.extend_from_slice(&head.to_bytes());
                entries.push(entry);
            }
        }
        Ok(edges::digest(entries))
    }

    /// Remove all heads for a thread.
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

    /// Replace the book contents with a previous [`HeadBook::dump`].
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
    use braid_core::{content_cid, LogKeypair, Variant};

    #[test]
    fn set_and_advance_heads() {
        let book = HeadBook::new(Datastore::memory().unwrap());
        let thread = ThreadId::new(Variant::Raw);
        let log = LogKeypair::generate().id();
        let first = content_cid(b"r1");
        let second = content_cid(b"r2");

        assert!(book.heads(&thread, &log).unwrap().is_empty());
        book.advance_head(&thread, &log, None, first).unwrap();
        assert_eq!(book.heads(&thread, &log).unwrap(), vec![first]);
        book.advance_head(&thread, &log, Some(first), second).unwrap();
        assert_eq!(book.heads(&thread, &log).unwrap(), vec![second]);
    }

    #[test]
    fn concurrent_heads_are_retained() {
        let book = HeadBook::new(Datastore::memory().unwrap());
        let thread = ThreadId::new(Variant::Raw);
        let log = LogKeypair::generate().id();
        let a = content_cid(b"a");
        let b = content_cid(b"b");

        book.advance_head(&thread, &log, None, a).unwrap();
        book.advance_head(&thread, &log, None, b).unwrap();
        let heads = book.heads(&thread, &log).unwrap();
        assert!(heads.contains(&a) && heads.contains(&b));
    }

    #[test]
    fn heads_edge_reflects_tips() {
        let book = HeadBook::new(Datastore::memory().unwrap());
        let thread = ThreadId::new(Variant::Raw);
        let log = LogKeypair::generate().id();

        let empty = book.heads_edge(&thread).unwrap();
        book.set_heads(&thread, &log, &[content_cid(b"r1")]).unwrap();
        let one = book.heads_edge(&thread).unwrap();
        assert_ne!(empty, one);
        book.set_heads(&thread, &log, &[content_cid(b"r2")]).unwrap();
        assert_ne!(one, book.heads_edge(&thread).unwrap());
    }
}
