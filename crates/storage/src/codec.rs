//! CBOR encoding for raw records.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{StorageError, StorageResult};

/// Encode `value` for storage or the wire.
///
/// # Errors
///
/// Fails if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> StorageResult<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StorageError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a value produced by [`encode`].
///
/// # Errors
///
/// Fails if the bytes do not decode as `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Decode(e.to_string()))
}
