//! Store error kinds.

/// Errors from the datastore and the log-store books.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The thread is not present in the key book.
    #[error("thread not found")]
    ThreadNotFound,
    /// The log is not present in the thread.
    #[error("log not found")]
    LogNotFound,
    /// A thread with this id already has keys installed.
    #[error("thread already exists")]
    ThreadExists,
    /// Core key/id decode failure while reading stored state.
    #[error(transparent)]
    Core(#[from] braid_core::Error),
    /// A stored value failed to decode.
    #[error("decode failed: {0}")]
    Decode(#[from] postcard::Error),
    /// Underlying database errors.
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
}
