//! Data model shared by every layer of the store: identifiers, keys, range
//! descriptors, values and the batch request/response protocol.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod api;
pub mod descriptors;
pub mod error;
pub mod ids;
pub mod keys;
pub mod value;

pub use api::{
    BatchRequest, BatchResponse, ChangeReplicasRequest, DeleteRequest, GetRequest, GetResponse,
    Header, IncrementRequest, IncrementResponse, PutRequest, Request, Response, Transaction,
    TruncateLogRequest, TruncateLogResponse,
};
pub use descriptors::{
    ChangeReplicasType, Lease, NodeDescriptor, RangeDescriptor, ReplicaDescriptor,
    StoreCapacity, StoreDescriptor, StoreIdent,
};
pub use error::{KvError, KvResult, ValueError};
pub use ids::{NodeId, RangeId, ReplicaId, StoreId};
pub use keys::Key;
pub use value::Value;
