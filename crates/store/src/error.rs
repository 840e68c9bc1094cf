use ranger_gossip::GossipError;
use ranger_kvpb::{KvError, RangeId, StoreIdent};
use ranger_storage::StorageError;
use ranger_util::StopperError;
use thiserror::Error;

/// Errors returned by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The engine holds no store identity.
    #[error("store has not been bootstrapped")]
    NotBootstrapped,

    /// The engine already holds a store identity.
    #[error("store already bootstrapped as {0:?}")]
    AlreadyBootstrapped(StoreIdent),

    /// `start` was called twice.
    #[error("store already started")]
    AlreadyStarted,

    /// The store was used before `start`.
    #[error("store not started")]
    NotStarted,

    /// No replica of the range lives on this store.
    #[error("range {0} was not found")]
    RangeNotFound(RangeId),

    /// Engine failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Gossip failure.
    #[error(transparent)]
    Gossip(#[from] GossipError),

    /// The stopper refused new work.
    #[error(transparent)]
    Stopper(#[from] StopperError),

    /// Request evaluation failure.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The replica's raft group failed.
    #[error("raft error: {0}")]
    Raft(String),
}

impl From<StoreError> for KvError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Kv(err) => err,
            StoreError::RangeNotFound(range_id) => Self::RangeNotFound(range_id),
            StoreError::Storage(err) => err.into(),
            StoreError::Stopper(err) => Self::NodeUnavailable(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
