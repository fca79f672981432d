//! Replication for braid threads.
//!
//! Peers exchange four request/reply pairs (`GetLogs`, `PushLog`,
//! `GetRecords`, `PushRecord`) plus an `ExchangeEdges` digest comparison
//! over authenticated streams, and fan records out through a per-thread
//! gossip topic. Per-(peer, thread) call queues bound concurrent work; the
//! edge exchange keeps divergence discovery cheap.
//!
//! The transport itself is a collaborator behind the [`Transport`] and
//! [`Gossip`] traits. [`mem`] hosts the in-process implementation.

mod client;
mod error;
pub mod mem;
mod net;
pub mod proto;
pub mod queue;
mod server;
pub mod transport;

pub use self::error::NetError;
pub use self::net::{EventSink, Net, NetConfig, DIAL_TIMEOUT, PULL_TIMEOUT, PUSH_TIMEOUT};
pub use self::queue::{CallPriority, CallQueue};
pub use self::transport::{Connection, Gossip, GossipMessage, Inbound, Transport};
