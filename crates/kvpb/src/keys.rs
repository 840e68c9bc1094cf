//! Key type and the layout of system keys.
//!
//! User keys sort after [`LOCAL_MAX`]. Range-local keys (`\x01k`) embed the
//! user key they are addressed by; range-id local keys (`\x01i`) embed the
//! range id and hold per-replica raft and bookkeeping state.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::ids::RangeId;

/// Smallest possible key.
pub const KEY_MIN: &[u8] = b"";
/// Upper bound of the addressable key space.
pub const KEY_MAX: &[u8] = b"\xff\xff";
/// Prefix shared by all local keys.
pub const LOCAL_PREFIX: &[u8] = b"\x01";
/// End of the local key space.
pub const LOCAL_MAX: &[u8] = b"\x02";

const LOCAL_RANGE_ID_PREFIX: &[u8] = b"\x01i";
const LOCAL_RANGE_PREFIX: &[u8] = b"\x01k";
const LOCAL_STORE_PREFIX: &[u8] = b"\x01s";

const RANGE_DESCRIPTOR_SUFFIX: &[u8] = b"\x00rdsc";
const RAFT_HARD_STATE_SUFFIX: &[u8] = b"rfth";
const RAFT_LOG_SUFFIX: &[u8] = b"rftl";
const RAFT_TOMBSTONE_SUFFIX: &[u8] = b"rftb";
const RAFT_TRUNCATED_STATE_SUFFIX: &[u8] = b"rftt";
const RAFT_COMMITTED_SUFFIX: &[u8] = b"rftc";
const REPLICA_STATE_SUFFIX: &[u8] = b"rsta";
const RANGE_STATS_SUFFIX: &[u8] = b"stat";

/// An ordered byte-string key.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// [`KEY_MIN`].
    #[must_use]
    pub const fn min() -> Self {
        Self(Bytes::from_static(KEY_MIN))
    }

    /// [`KEY_MAX`].
    #[must_use]
    pub const fn max() -> Self {
        Self(Bytes::from_static(KEY_MAX))
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the key starts with `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// The smallest key sorting after this one.
    #[must_use]
    pub fn next(&self) -> Self {
        let mut buf = BytesMut::with_capacity(self.len() + 1);
        buf.put_slice(&self.0);
        buf.put_u8(0);
        Self(buf.freeze())
    }

    /// Whether this key lives in the local (non-addressable) key space.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.has_prefix(LOCAL_PREFIX)
    }
}

impl From<&'static str> for Key {
    fn from(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<Bytes> for Key {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("/Min");
        }
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic() || c == ' ') => write!(f, "\"{s}\""),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn concat(parts: &[&[u8]]) -> Key {
    let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        buf.put_slice(part);
    }
    Key(buf.freeze())
}

/// Key of the range descriptor for the range starting at `start`.
#[must_use]
pub fn range_descriptor_key(start: &Key) -> Key {
    concat(&[LOCAL_RANGE_PREFIX, start.as_bytes(), RANGE_DESCRIPTOR_SUFFIX])
}

/// Prefix of every range-local key addressed by `key`.
#[must_use]
pub fn range_local_prefix(key: &Key) -> Key {
    concat(&[LOCAL_RANGE_PREFIX, key.as_bytes()])
}

/// The address of `key`: range-local keys map to the user key they embed,
/// other local keys to [`KEY_MIN`], user keys to themselves.
#[must_use]
pub fn addr(key: &Key) -> Key {
    if let Some(rest) = key.as_bytes().strip_prefix(LOCAL_RANGE_PREFIX) {
        let user = rest.strip_suffix(RANGE_DESCRIPTOR_SUFFIX).unwrap_or(rest);
        return Key::from(user);
    }
    if key.is_local() {
        return Key::min();
    }
    key.clone()
}

/// Prefix of all range-id local keys for `range_id`.
#[must_use]
pub fn range_id_prefix(range_id: RangeId) -> Key {
    concat(&[LOCAL_RANGE_ID_PREFIX, &range_id.value().to_be_bytes()])
}

fn range_id_key(range_id: RangeId, suffix: &[u8]) -> Key {
    concat(&[LOCAL_RANGE_ID_PREFIX, &range_id.value().to_be_bytes(), suffix])
}

/// Persisted raft vote.
#[must_use]
pub fn raft_hard_state_key(range_id: RangeId) -> Key {
    range_id_key(range_id, RAFT_HARD_STATE_SUFFIX)
}

/// Prefix of the raft log.
#[must_use]
pub fn raft_log_prefix(range_id: RangeId) -> Key {
    range_id_key(range_id, RAFT_LOG_SUFFIX)
}

/// A single raft log entry.
#[must_use]
pub fn raft_log_key(range_id: RangeId, index: u64) -> Key {
    concat(&[
        LOCAL_RANGE_ID_PREFIX,
        &range_id.value().to_be_bytes(),
        RAFT_LOG_SUFFIX,
        &index.to_be_bytes(),
    ])
}

/// Id of the last log entry discarded by truncation.
#[must_use]
pub fn raft_truncated_state_key(range_id: RangeId) -> Key {
    range_id_key(range_id, RAFT_TRUNCATED_STATE_SUFFIX)
}

/// Id of the last entry known committed.
#[must_use]
pub fn raft_committed_key(range_id: RangeId) -> Key {
    range_id_key(range_id, RAFT_COMMITTED_SUFFIX)
}

/// Smallest replica id still allowed for a range on this store.
#[must_use]
pub fn raft_tombstone_key(range_id: RangeId) -> Key {
    range_id_key(range_id, RAFT_TOMBSTONE_SUFFIX)
}

/// Applied replica state (descriptor, lease, applied index).
#[must_use]
pub fn replica_state_key(range_id: RangeId) -> Key {
    range_id_key(range_id, REPLICA_STATE_SUFFIX)
}

/// Persisted aggregate MVCC statistics.
#[must_use]
pub fn range_stats_key(range_id: RangeId) -> Key {
    range_id_key(range_id, RANGE_STATS_SUFFIX)
}

/// Start of the range-id local key space.
#[must_use]
pub fn local_range_id_min() -> Key {
    Key::from(LOCAL_RANGE_ID_PREFIX)
}

/// End of the range-id local key space.
#[must_use]
pub fn local_range_id_max() -> Key {
    Key::from(&b"\x01j"[..])
}

/// Store identity record.
#[must_use]
pub fn store_ident_key() -> Key {
    concat(&[LOCAL_STORE_PREFIX, b"iden"])
}

/// Parse a replica state key back into its range id.
#[must_use]
pub fn decode_replica_state_key(key: &Key) -> Option<RangeId> {
    let rest = key.as_bytes().strip_prefix(LOCAL_RANGE_ID_PREFIX)?;
    let (id, suffix) = rest.split_at_checked(8)?;
    if suffix != REPLICA_STATE_SUFFIX {
        return None;
    }
    let id = u64::from_be_bytes(id.try_into().ok()?);
    Some(RangeId::new(id))
}

/// Parse a tombstone key back into its range id.
#[must_use]
pub fn decode_tombstone_key(key: &Key) -> Option<RangeId> {
    let rest = key.as_bytes().strip_prefix(LOCAL_RANGE_ID_PREFIX)?;
    let (id, suffix) = rest.split_at_checked(8)?;
    if suffix != RAFT_TOMBSTONE_SUFFIX {
        return None;
    }
    let id = u64::from_be_bytes(id.try_into().ok()?);
    Some(RangeId::new(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_key_addresses_its_start_key() {
        let start = Key::from("m");
        assert_eq!(addr(&range_descriptor_key(&start)), start);
        assert_eq!(addr(&range_descriptor_key(&Key::min())), Key::min());
    }

    #[test]
    fn user_keys_address_themselves() {
        let key = Key::from("apple");
        assert_eq!(addr(&key), key);
    }

    #[test]
    fn range_id_keys_sort_within_local_span() {
        let key = replica_state_key(RangeId::new(7));
        assert!(key >= local_range_id_min() && key < local_range_id_max());
        assert!(key.as_bytes() < LOCAL_MAX);
        assert_eq!(decode_replica_state_key(&key), Some(RangeId::new(7)));
        assert_eq!(decode_replica_state_key(&raft_hard_state_key(RangeId::new(7))), None);
    }

    #[test]
    fn log_keys_sort_by_index() {
        let rid = RangeId::new(1);
        assert!(raft_log_key(rid, 9) < raft_log_key(rid, 10));
        assert!(raft_log_key(rid, 10).has_prefix(raft_log_prefix(rid).as_bytes()));
    }

    #[test]
    fn range_local_keys_stay_below_local_max() {
        let desc_key = range_descriptor_key(&Key::min());
        assert!(desc_key >= range_local_prefix(&Key::min()));
        assert!(desc_key < range_local_prefix(&Key::max()));
        assert!(range_local_prefix(&Key::max()).as_bytes() < LOCAL_MAX);
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(Key::from("abc").to_string(), "\"abc\"");
        assert_eq!(Key::min().to_string(), "/Min");
        assert_eq!(Key::max().to_string(), "0xffff");
    }
}
