use std::fmt::Debug;

use bytes::Bytes;
use ranger_hlc::Timestamp;
use ranger_kvpb::Key;
use serde::{Deserialize, Serialize};

use crate::StorageResult;

/// One version of a versioned key. A `None` value is a deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Write timestamp.
    pub timestamp: Timestamp,
    /// Encoded value, or `None` for a deletion.
    pub value: Option<Bytes>,
}

/// A synchronous key-value engine.
///
/// Versioned accessors return versions newest first. All methods fail with
/// [`crate::StorageError::Closed`] after [`Engine::close`].
pub trait Engine: Debug + Send + Sync + 'static {
    /// Read a raw record.
    fn get_raw(&self, key: &Key) -> StorageResult<Option<Bytes>>;

    /// Write a raw record.
    fn put_raw(&self, key: &Key, value: Bytes) -> StorageResult<()>;

    /// Delete a raw record.
    fn delete_raw(&self, key: &Key) -> StorageResult<()>;

    /// Raw records in `[start, end)`, in key order.
    fn scan_raw(&self, start: &Key, end: &Key) -> StorageResult<Vec<(Key, Bytes)>>;

    /// Delete raw records in `[start, end)`.
    fn clear_raw_range(&self, start: &Key, end: &Key) -> StorageResult<()>;

    /// All versions of `key`, newest first.
    fn get_versions(&self, key: &Key) -> StorageResult<Vec<Version>>;

    /// Replace the version history of `key`. An empty history removes it.
    fn set_versions(&self, key: &Key, versions: Vec<Version>) -> StorageResult<()>;

    /// Versioned keys in `[start, end)`, in key order.
    fn scan_versioned_keys(&self, start: &Key, end: &Key) -> StorageResult<Vec<Key>>;

    /// Remove every versioned key in `[start, end)`.
    fn clear_versioned_range(&self, start: &Key, end: &Key) -> StorageResult<()>;

    /// Close the engine.
    fn close(&self);

    /// Whether the engine was closed.
    fn is_closed(&self) -> bool;
}
