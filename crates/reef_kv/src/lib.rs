//! Data-plane engine for the ReefDB client.
//!
//! A [`dispatcher::KvDispatcher`] routes each operation to the node owning
//! its partition, over a bounded per-node pool of multiplexed connections.
//! Failures are classified and retried under the caller's deadline by the
//! [`retry::RetrySupervisor`].

pub mod compress;
pub mod connection;
pub mod dispatcher;
pub mod pool;
pub mod retry;
pub mod sasl;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use dispatcher::{GetResult, KvDispatcher, MutationResult, ObserveResult};
pub use pool::{ConnectionLease, NodePool};
pub use retry::{RetryDecision, RetrySupervisor};
