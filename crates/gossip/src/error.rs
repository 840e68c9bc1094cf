use ranger_network::NetworkError;
use ranger_util::StopperError;
use thiserror::Error;

/// Errors returned by gossip.
#[derive(Debug, Error)]
pub enum GossipError {
    /// `start` was called twice.
    #[error("gossip already started")]
    AlreadyStarted,

    /// A message or info could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message or info could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Network failure.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// No info under the key.
    #[error("no info for key {0}")]
    NotFound(String),

    /// The owning stopper refused the worker.
    #[error(transparent)]
    Stopper(#[from] StopperError),
}

/// Result type for gossip operations.
pub type GossipResult<T> = Result<T, GossipError>;
