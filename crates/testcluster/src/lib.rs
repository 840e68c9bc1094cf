//! An in-process multi-node cluster for exercising replication, lease and
//! membership behaviour end to end.
//!
//! [`ClusterContext`] owns every node of a simulated cluster: one engine,
//! store, gossip handle, raft transport and lifecycle controller per slot,
//! all sharing a single manually advanced clock and one simulated network.
//! Requests issued through [`ClusterContext::db`] are routed by a
//! [`ranger_kv::DistSender`] whose replica transport dispatches straight into
//! the destination node's stores, failing fast when that node is stopped.
//!
//! Slot `i` always holds node id and store id `i + 1`, including after the
//! node is stopped and restarted.
//!
//! The registry of slots is guarded by one reader/writer lock. That lock is
//! only ever taken to snapshot or mutate a slot and is never held across an
//! await, so a request holding a snapshot while it waits on raft cannot block
//! a concurrent [`ClusterContext::stop_node`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cluster;
mod config;
mod descriptor;
mod diagnostics;
mod error;
mod test_store;
mod topology;
mod transport;

pub use cluster::ClusterContext;
pub use config::ClusterConfig;
pub use descriptor::{cmp_by_age, sort_by_age};
pub use diagnostics::RaftLeader;
pub use error::{HarnessError, HarnessResult};
pub use test_store::{TestStore, create_test_store};
