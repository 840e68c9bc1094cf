use ranger_kvpb::{KvError, ValueError};
use thiserror::Error;

/// Errors returned by engines and the MVCC layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The engine was closed.
    #[error("engine is closed")]
    Closed,

    /// A record could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A record could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A stored value had an unexpected shape.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// Backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for KvError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Value(err) => Self::Value(err),
            StorageError::Closed => Self::NodeUnavailable(err.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
