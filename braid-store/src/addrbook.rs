//! The address book: where each log can be pulled from, with TTLs.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use braid_core::{LogId, ThreadId};
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::datastore::Datastore;
use crate::edges;
use crate::error::StoreError;
use crate::keys::{book_prefix, log_component, log_key, thread_component, thread_prefix};

const BOOK: &str = "addrs";

/// TTL for addresses that should never expire.
pub const PERMANENT_TTL: Duration = Duration::from_secs(u64::MAX);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddrEntry {
    addr: Vec<u8>,
    /// Unix seconds; `u64::MAX` means permanent.
    expires_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-(thread, log) multiaddress sets with expiry.
#[derive(Debug, Clone)]
pub struct AddrBook {
    store: Datastore,
}

impl AddrBook {
    pub(crate) fn new(store: Datastore) -> Self {
        Self { store }
    }

    /// Add addresses for a log, refreshing the TTL of known ones.
    pub fn add_addrs(
        &self,
        thread: &ThreadId,
        log: &LogId,
        addrs: &[Multiaddr],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if addrs.is_empty() {
            return Ok(());
        }
        let expires_at = now_secs().saturating_add(ttl.as_secs());
        let key = log_key(BOOK, thread, log);
        self.store.write(|tx| {
            let mut entries: Vec<AddrEntry> = match tx.get(&key)? {
                Some(bytes) => postcard::from_bytes(&bytes)?,
                None => Vec::new(),
            };
            for addr in addrs {
                let raw = addr.to_vec();
                match entries.iter_mut().find(|entry| entry.addr == raw) {
                    Some(entry) => entry.expires_at = entry.expires_at.max(expires_at),
                    None => entries.push(AddrEntry {
                        addr: raw,
                        expires_at,
                    }),
                }
            }
            tx.put(&key, &postcard::to_stdvec(&entries)?)?;
            Ok(())
        })
    }

    /// Current (unexpired) addresses of a log. Expired entries are pruned
    /// on read.
    pub fn addrs(&self, thread: &ThreadId, log: &LogId) -> Result<Vec<Multiaddr>, StoreError> {
        let key = log_key(BOOK, thread, log);
        let now = now_secs();
        self.store.write(|tx| {
            let entries: Vec<AddrEntry> = match tx.get(&key)? {
                Some(bytes) => postcard::from_bytes(&bytes)?,
                None => return Ok(Vec::new()),
            };
            let (live, expired): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|entry| entry.expires_at > now);
            if !expired.is_empty() {
                if live.is_empty() {
                    tx.delete(&key)?;
                } else {
                    tx.put(&key, &postcard::to_stdvec(&live)?)?;
                }
            }
            let mut out = Vec::with_capacity(live.len());
            for entry in live {
                match Multiaddr::try_from(entry.addr.clone()) {
                    Ok(addr) => out.push(addr),
                    Err(err) => warn!("dropping undecodable stored address: {err}"),
                }
            }
            Ok(out)
        })
    }

    /// Drop all addresses of a log.
    pub fn clear_addrs(&self, thread: &ThreadId, log: &LogId) -> Result<(), StoreError> {
        self.store.delete(&log_key(BOOK, thread, log))
    }

    /// Logs of a thread that have any stored address.
    pub fn logs_with_addrs(&self, thread: &ThreadId) -> Result<Vec<LogId>, StoreError> {
        let mut logs = Vec::new();
        for (key, _) in self.store.scan_prefix(&thread_prefix(BOOK, thread))? {
            if let Some(log) = log_component(&key) {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    /// All threads that have any stored address.
    pub fn threads_from_addrs(&self) -> Result<Vec<ThreadId>, StoreError> {
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

    /// 64-bit digest of the thread's canonicalized address set.
    pub fn addrs_edge(&self, thread: &ThreadId) -> Result<u64, StoreError> {
        let mut entries = Vec::new();
        for log in self.logs_with_addrs(thread)? {
            for addr in self.addrs(thread, &log)? {
                let mut entry = log.to_bytes();
                entry.extend_from_slice(&addr.to_vec());
                entries.push(entry);
            }
        }
        Ok(edges::digest(entries))
    }

    /// Remove all addresses for a thread.
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

    /// Replace the book contents with a previous [`AddrBook::dump`].
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
    use braid_core::{LogKeypair, Variant};

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn add_and_read_addrs() {
        let book = AddrBook::new(Datastore::memory().unwrap());
        let thread = ThreadId::new(Variant::Raw);
        let log = LogKeypair::generate().id();

        book.add_addrs(&thread, &log, &[addr(4001), addr(4002)], PERMANENT_TTL)
            .unwrap();
        // duplicate add is idempotent
        book.add_addrs(&thread, &log, &[addr(4001)], PERMANENT_TTL)
            .unwrap();
        assert_eq!(book.addrs(&thread, &log).unwrap().len(), 2);
        assert_eq!(book.logs_with_addrs(&thread).unwrap(), vec![log]);
        assert_eq!(book.threads_from_addrs().unwrap(), vec![thread]);
    }

    #[test]
    fn expired_addrs_are_pruned() {
        let book = AddrBook::new(Datastore::memory().unwrap());
        let thread = ThreadId::new(Variant::Raw);
        let log = LogKeypair::generate().id();

        book.add_addrs(&thread, &log, &[addr(4001)], Duration::ZERO)
            .unwrap();
        assert!(book.addrs(&thread, &log).unwrap().is_empty());
        assert!(book.logs_with_addrs(&thread).unwrap().is_empty());
    }

    #[test]
    fn edge_tracks_address_changes() {
        let book = AddrBook::new(Datastore::memory().unwrap());
        let thread = ThreadId::new(Variant::Raw);
        let log = LogKeypair::generate().id();

        let empty = book.addrs_edge(&thread).unwrap();
        book.add_addrs(&thread, &log, &[addr(4001)], PERMANENT_TTL)
            .unwrap();
        let one = book.addrs_edge(&thread).unwrap();
        assert_ne!(empty, one);

        // identical content, identical edge
        book.add_addrs(&thread, &log, &[addr(4001)], PERMANENT_TTL)
            .unwrap();
        assert_eq!(one, book.addrs_edge(&thread).unwrap());
    }
}
