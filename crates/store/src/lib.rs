//! The per-node store: range replicas driven by raft, range leases, replica
//! garbage collection, raft message transport, node liveness and the store
//! pool.
//!
//! A [`Store`] owns an [`ranger_storage::Engine`] and the [`Replica`]s living
//! on it. Each replica runs its own openraft group whose log, vote and
//! applied state live in the store's engine; raft RPCs between replicas
//! travel over the node's [`RaftTransport`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod liveness;
pub mod raft;
mod replica;
mod store;
mod store_pool;
mod stores;
pub mod transport;

pub use config::{StoreConfig, StoreSettings, StoreTestingKnobs};
pub use error::{StoreError, StoreResult};
pub use liveness::{Liveness, NodeLiveness};
pub use raft::{CommandResponse, RaftCommand, RaftStatus, RangeTypeConfig, ServerState};
pub use replica::{Replica, ReplicaState};
pub use store::{FIRST_RANGE_ID, Store};
pub use store_pool::StorePool;
pub use stores::Stores;
pub use transport::{
    NodeAddressResolver, RaftMessageHandler, RaftMessageRequest, RaftMessageResponse, RaftPayload,
    RaftTransport, RaftTransportError,
};
