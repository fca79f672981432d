//! Error kinds shared by the core types.

use cid::Cid;

/// Errors produced by core thread, key and record operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A symmetric key was the wrong length or failed to decode.
    #[error("invalid key")]
    InvalidKey,
    /// A thread id failed to decode or carried an unknown tag.
    #[error("invalid thread id: {0}")]
    InvalidThreadId(String),
    /// The record envelope could not be opened with the thread service key.
    #[error("record not authorized for this thread")]
    UnauthorizedRecord,
    /// The record signature does not match the log public key.
    #[error("invalid record signature")]
    InvalidSignature,
    /// A referenced block is not present in the block store.
    #[error("block {0} not found")]
    BlockNotFound(Cid),
    /// The event body cannot be read without the thread read key.
    #[error("a read key is required to open the event body")]
    CannotRead,
    /// A block failed to decode into the expected shape.
    #[error("decode failed: {0}")]
    Decode(#[from] postcard::Error),
    /// Block store failure.
    #[error("block store: {0}")]
    Blockstore(String),
}
