use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptors::ReplicaDescriptor;
use crate::ids::{RangeId, StoreId};
use crate::keys::Key;

/// Errors decoding a [`crate::Value`].
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueError {
    /// The value has no tag.
    #[error("value is empty")]
    Empty,

    /// The value carries a different type.
    #[error("unexpected value tag {found}, expected {expected}")]
    UnexpectedTag {
        /// Tag requested.
        expected: u8,
        /// Tag present.
        found: u8,
    },

    /// A fixed-width payload has the wrong length.
    #[error("malformed payload of {0} bytes")]
    Malformed(usize),

    /// Message encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Message decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors returned while serving or routing a batch. Errors raised while
/// applying a raft command travel back to the proposer, so they serialize.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvError {
    /// The replica cannot serve the request; `lease_holder` names the
    /// replica believed to hold the lease, if any.
    #[error("range {range_id}: {replica:?} is not the lease holder; holder: {lease_holder:?}")]
    NotLeaseHolder {
        /// Range addressed.
        range_id: RangeId,
        /// Replica that refused.
        replica: Option<ReplicaDescriptor>,
        /// Suspected lease holder.
        lease_holder: Option<ReplicaDescriptor>,
    },

    /// The store has no replica of the range.
    #[error("range {0} was not found")]
    RangeNotFound(RangeId),

    /// The key is outside the replica's span.
    #[error("key {key} outside bounds of range {range_id}")]
    RangeKeyMismatch {
        /// Key requested.
        key: Key,
        /// Range addressed.
        range_id: RangeId,
    },

    /// The routing handle has no such store.
    #[error("store {0} was not found")]
    StoreNotFound(StoreId),

    /// The destination could not be reached.
    #[error("send error: {0}")]
    SendError(String),

    /// The node is shutting down.
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    /// A raft proposal was abandoned before it was known to apply.
    #[error("proposal dropped: {0}")]
    ProposalDropped(String),

    /// A compare-and-swap precondition did not hold.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// A stored value could not be decoded.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// The storage engine failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KvError {
    /// Whether a router may retry the request against another replica or
    /// after refreshing its routing information.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotLeaseHolder { .. }
                | Self::RangeNotFound(_)
                | Self::RangeKeyMismatch { .. }
                | Self::StoreNotFound(_)
                | Self::SendError(_)
                | Self::NodeUnavailable(_)
                | Self::ProposalDropped(_)
        )
    }
}

/// Result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;
