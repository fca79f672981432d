//! A transactional byte-keyed datastore over a single `redb` table.
//!
//! Every persisted structure in braid lives under a documented key prefix
//! in this one namespace, so a whole node (or several databases sharing a
//! manager) can be carried by a single file.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("braid-v1");

/// Shared handle to the node-wide key-value namespace.
#[derive(Debug, Clone)]
pub struct Datastore {
    db: Arc<Database>,
}

impl Datastore {
    /// Open an in-memory datastore, dropped with the last handle.
    pub fn memory() -> Result<Self, StoreError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    /// Create or open a single-file datastore at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Database::create(path)?)
    }

    fn init(db: Database) -> Result<Self, StoreError> {
        let tx = db.begin_write()?;
        {
            tx.open_table(TABLE)?;
        }
        tx.commit()?;
        Ok(Datastore { db: Arc::new(db) })
    }

    /// Read a single value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TABLE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// True if the key is present.
    pub fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Write a single value in its own transaction.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(|tx| tx.put(key, value))
    }

    /// Delete a single key in its own transaction.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.write(|tx| tx.delete(key))
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TABLE)?;
        let end = prefix_end(prefix);
        let upper = match &end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for item in table.range::<&[u8]>((Bound::Included(prefix), upper))? {
            let (key, value) = item?;
            out.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(out)
    }

    /// Run several mutations in one transaction; commits on `Ok`, rolls
    /// back on `Err`. The error type is anything a [`StoreError`] converts
    /// into, so callers can thread their own domain errors through.
    pub fn write<T, E>(&self, f: impl FnOnce(&mut WriteBatch<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let tx = self.db.begin_write().map_err(StoreError::from)?;
        let out = {
            let table = tx.open_table(TABLE).map_err(StoreError::from)?;
            let mut batch = WriteBatch { table };
            f(&mut batch)?
        };
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

/// Mutation view inside [`Datastore::write`].
pub struct WriteBatch<'a> {
    table: redb::Table<'a, &'static [u8], &'static [u8]>,
}

impl WriteBatch<'_> {
    /// Insert or replace a value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.table.insert(key, value)?;
        Ok(())
    }

    /// Remove a key if present.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.table.remove(key)?;
        Ok(())
    }

    /// Read a value through the uncommitted transaction.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Prefix scan through the uncommitted transaction.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let end = prefix_end(prefix);
        let upper = match &end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for item in self
            .table
            .range::<&[u8]>((Bound::Included(prefix), upper))?
        {
            let (key, value) = item?;
            out.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(out)
    }

    /// Delete every key under a prefix, returning how many were removed.
    pub fn delete_prefix(&mut self, prefix: &[u8]) -> Result<usize, StoreError> {
        let keys: Vec<Vec<u8>> = self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.table.remove(key.as_slice())?;
        }
        Ok(keys.len())
    }
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when no such bound exists (all-0xff prefixes).
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last == 0xff {
            end.pop();
        } else {
            *last += 1;
            return Some(end);
        }
    }
    None
}
