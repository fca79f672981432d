//! Replication error kinds.

use braid_core::{LogId, ThreadId};

/// Errors surfaced by the replication engine.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The thread is unknown locally.
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
    /// The log is unknown locally.
    #[error("log {0} not found")]
    LogNotFound(LogId),
    /// Dialing the peer failed.
    #[error("dial failed: {0}")]
    DialFailed(String),
    /// A call exceeded its deadline.
    #[error("deadline exceeded")]
    Timeout,
    /// The peer is transiently unavailable.
    #[error("peer unavailable")]
    Unavailable,
    /// The peer rejected our credentials or signature.
    #[error("unauthenticated")]
    Unauthenticated,
    /// The peer does not implement the requested call.
    #[error("unimplemented")]
    Unimplemented,
    /// A record does not chain onto the local head and back-fill failed.
    #[error("gap in log {log}: record does not chain onto local head")]
    Gap {
        /// The log with the broken chain.
        log: LogId,
    },
    /// The engine is shut down.
    #[error("closed")]
    Closed,
    /// Core codec or crypto failure.
    #[error(transparent)]
    Core(#[from] braid_core::Error),
    /// Log store failure.
    #[error(transparent)]
    Store(#[from] braid_store::StoreError),
    /// Event delivery into the local database failed. Fatal for the DB.
    #[error("event dispatch failed: {0}")]
    Dispatch(String),
    /// Catch-all transport plumbing error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
