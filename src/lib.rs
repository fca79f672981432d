//! braid: a peer-to-peer replicated document database.
//!
//! Each database is bound to a single *thread*, an append-only,
//! multi-writer, content-addressed log of encrypted records, and exposes
//! JSON-schema-constrained collections whose state is derived by reducing
//! the ordered events carried in that thread's records.
//!
//! The workspace splits along the natural seams: [`braid_core`] for
//! identities, keys and the record codec, [`braid_store`] for the
//! datastore and log-store books, [`braid_db`] for collections and the
//! dispatcher, [`braid_net`] for replication. This crate wires them into
//! a [`Node`] and hosts the daemon binary.

pub mod config;
pub mod node;

pub use braid_core::{
    Event, EventKind, InstanceId, LogId, ReadKey, ServiceKey, ThreadAddr, ThreadId, ThreadKey,
    Variant,
};
pub use braid_db::{
    Action, ActionFilter, Collection, CollectionConfig, Db, DbError, Filter, IndexConfig,
    Listener, Manager, Query,
};
pub use braid_net::{Net, NetConfig};

pub use self::config::Config;
pub use self::node::Node;
