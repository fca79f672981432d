//! Schema-constrained, replicated document collections.
//!
//! A [`Db`] is bound to one thread: local writes buffer in a transaction,
//! commit as one event batch, and append to this peer's log; remote
//! records replay the same events through the same [`Dispatcher`], so all
//! peers holding the read key converge on the same collection state.
//!
//! Collections validate instances against a JSON schema requiring a
//! string `_id` (a UUIDv4 in textual form), maintain path-based secondary
//! indexes, and answer [`Query`]s over the materialized state. A
//! [`Manager`] owns many databases over one shared datastore and one
//! replication engine.

mod collection;
mod db;
mod dispatcher;
mod error;
mod index;
mod listeners;
mod manager;
mod path;
mod query;

pub use self::collection::{Collection, CollectionConfig};
pub use self::db::{Db, ReadTxn, WriteTxn};
pub use self::dispatcher::{Dispatcher, Reducer};
pub use self::error::DbError;
pub use self::index::IndexConfig;
pub use self::listeners::{Action, ActionFilter, Listener};
pub use self::manager::Manager;
pub use self::query::{Criterion, Filter, Operation, Query, SortDirection};
