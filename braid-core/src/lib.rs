//! Core types for braid threads.
//!
//! A *thread* is an append-only replication domain made of per-author
//! *logs*. Each log is a chain of sealed [`Record`]s, every record carrying
//! the content address of an encrypted block of [`Event`]s produced by one
//! transaction. Participation in a thread is gated by its symmetric
//! [`ServiceKey`]; reading event bodies additionally requires the thread's
//! [`ReadKey`].
//!
//! This crate holds the pieces every other braid crate builds on: thread
//! and log identities, key material, AES-256-GCM sealing, BLAKE3 content
//! addressing, the block store seam, and the record codec.

pub mod block;
pub mod cipher;
pub mod content;
pub mod error;
pub mod event;
pub mod info;
pub mod key;
pub mod record;
pub mod thread;
pub mod time;

pub use self::block::{BlockStore, MemBlockStore};
pub use self::cipher::SymKey;
pub use self::content::content_cid;
pub use self::error::Error;
pub use self::event::{Event, EventKind, InstanceId};
pub use self::info::{LogInfo, ThreadInfo};
pub use self::key::{LogKeypair, ReadKey, ServiceKey, ThreadKey};
pub use self::record::Record;
pub use self::thread::{LogId, ThreadAddr, ThreadId, Variant};

/// Convenience result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
