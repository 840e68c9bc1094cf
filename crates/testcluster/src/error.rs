use ranger_gossip::GossipError;
use ranger_kvpb::{KvError, NodeId, RangeId};
use ranger_network::NetworkError;
use ranger_storage::{MvccStats, StorageError};
use ranger_store::StoreError;
use ranger_util::{StopperError, SucceedsSoonError};
use thiserror::Error;

/// Errors returned by the cluster harness. Every one of them is fatal to the
/// run that produced it.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A node's store could not be bootstrapped.
    #[error("node {index}: bootstrap failed: {source}")]
    Bootstrap {
        /// Slot being added.
        index: usize,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },

    /// Two nodes claimed the same node id.
    #[error("an address is already registered for node {0}")]
    DuplicateNodeAddress(NodeId),

    /// No slot with that index exists.
    #[error("node index {0} is out of range")]
    NoSuchNode(usize),

    /// The slot's node is stopped.
    #[error("node {0} is not running")]
    NodeNotRunning(usize),

    /// The slot's node is already running.
    #[error("node {0} is already running")]
    NodeAlreadyRunning(usize),

    /// No store in the cluster holds any copy of the first range.
    #[error("no store holds a replica of the first range")]
    FirstRangeMissing,

    /// No live store is a member of the range.
    #[error("no live store holds a replica of range {0}")]
    NoLiveMember(RangeId),

    /// The range descriptor could not be read at the range's start key.
    #[error("no descriptor found for range {0}")]
    DescriptorMissing(RangeId),

    /// Persisted range statistics differ from what was expected.
    #[error(
        "range {range_id} on node {index}: stats mismatch: expected {expected:?}, found {actual:?}"
    )]
    StatsMismatch {
        /// Slot checked.
        index: usize,
        /// Range checked.
        range_id: RangeId,
        /// Expected statistics.
        expected: MvccStats,
        /// Statistics found.
        actual: MvccStats,
    },

    /// A convergence wait exceeded its bound.
    #[error(transparent)]
    Timeout(#[from] SucceedsSoonError),

    /// Simulated network failure.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Request failure.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Engine failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Gossip failure.
    #[error(transparent)]
    Gossip(#[from] GossipError),

    /// A lifecycle controller refused new work.
    #[error(transparent)]
    Stopper(#[from] StopperError),
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
