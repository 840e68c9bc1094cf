//! Versioned reads and writes with incremental statistics.
//!
//! Every write computes the statistics of the affected key before and after
//! and applies the difference to the caller's [`MvccStats`], so a range's
//! persisted aggregate always equals [`compute_stats_for_range`] over its
//! data.

use bytes::Bytes;
use ranger_hlc::Timestamp;
use ranger_kvpb::keys::{self, LOCAL_MAX};
use ranger_kvpb::{Key, RangeDescriptor, RangeId, Value};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::{Engine, MvccStats, StorageResult, Version, codec};

/// Bytes accounted per version for its timestamp.
pub const MVCC_VERSION_TIMESTAMP_SIZE: i64 = 12;

#[allow(clippy::cast_possible_wrap)]
const fn len_i64(len: usize) -> i64 {
    len as i64
}

fn key_stats(key: &Key, versions: &[Version]) -> MvccStats {
    let mut ms = MvccStats::default();
    let Some(newest) = versions.first() else {
        return ms;
    };
    let key_len = len_i64(key.len());
    let val_bytes: i64 = versions
        .iter()
        .map(|v| len_i64(v.value.as_ref().map_or(0, Bytes::len)))
        .sum();
    let versions_len = len_i64(versions.len());
    if key.is_local() {
        ms.sys_bytes = key_len + MVCC_VERSION_TIMESTAMP_SIZE * versions_len + val_bytes;
        ms.sys_count = 1;
        return ms;
    }
    ms.key_count = 1;
    ms.key_bytes = key_len + MVCC_VERSION_TIMESTAMP_SIZE * versions_len;
    ms.val_count = versions_len;
    ms.val_bytes = val_bytes;
    if let Some(value) = &newest.value {
        ms.live_count = 1;
        ms.live_bytes = key_len + MVCC_VERSION_TIMESTAMP_SIZE + len_i64(value.len());
    }
    ms
}

fn write_version<E: Engine + ?Sized>(
    engine: &E,
    ms: Option<&mut MvccStats>,
    key: &Key,
    timestamp: Timestamp,
    value: Option<Bytes>,
) -> StorageResult<Timestamp> {
    let mut versions = engine.get_versions(key)?;
    let before = key_stats(key, &versions);
    // Writes never land below an existing version.
    let timestamp = match versions.first() {
        Some(newest) if newest.timestamp >= timestamp => newest.timestamp.next(),
        _ => timestamp,
    };
    versions.insert(0, Version { timestamp, value });
    if let Some(ms) = ms {
        *ms -= before;
        *ms += key_stats(key, &versions);
    }
    engine.set_versions(key, versions)?;
    trace!(%key, %timestamp, "wrote version");
    Ok(timestamp)
}

/// The value of `key` visible at `timestamp`.
///
/// # Errors
///
/// Propagates engine failures.
pub fn mvcc_get<E: Engine + ?Sized>(
    engine: &E,
    key: &Key,
    timestamp: Timestamp,
) -> StorageResult<Option<Value>> {
    let versions = engine.get_versions(key)?;
    Ok(versions
        .into_iter()
        .find(|v| v.timestamp <= timestamp)
        .and_then(|v| v.value)
        .map(Value::from_raw))
}

/// Decode the message stored at `key` as of `timestamp`.
///
/// # Errors
///
/// Propagates engine and decoding failures.
pub fn mvcc_get_message<E: Engine + ?Sized, T: DeserializeOwned>(
    engine: &E,
    key: &Key,
    timestamp: Timestamp,
) -> StorageResult<Option<T>> {
    match mvcc_get(engine, key, timestamp)? {
        Some(value) => Ok(Some(value.get_message()?)),
        None => Ok(None),
    }
}

/// Write `value` at `timestamp`.
///
/// # Errors
///
/// Propagates engine failures.
pub fn mvcc_put<E: Engine + ?Sized>(
    engine: &E,
    ms: Option<&mut MvccStats>,
    key: &Key,
    timestamp: Timestamp,
    value: &Value,
) -> StorageResult<()> {
    write_version(engine, ms, key, timestamp, Some(value.raw().clone()))?;
    Ok(())
}

/// Encode and write a message at `timestamp`.
///
/// # Errors
///
/// Propagates engine and encoding failures.
pub fn mvcc_put_message<E: Engine + ?Sized, T: Serialize>(
    engine: &E,
    ms: Option<&mut MvccStats>,
    key: &Key,
    timestamp: Timestamp,
    message: &T,
) -> StorageResult<()> {
    let value = Value::from_message(message)?;
    mvcc_put(engine, ms, key, timestamp, &value)
}

/// Delete `key` at `timestamp`. Deleting an absent key writes nothing.
///
/// # Errors
///
/// Propagates engine failures.
pub fn mvcc_delete<E: Engine + ?Sized>(
    engine: &E,
    ms: Option<&mut MvccStats>,
    key: &Key,
    timestamp: Timestamp,
) -> StorageResult<()> {
    let live = engine
        .get_versions(key)?
        .first()
        .is_some_and(|v| v.value.is_some());
    if live {
        write_version(engine, ms, key, timestamp, None)?;
    }
    Ok(())
}

/// Add `increment` to the integer at `key`, treating a missing key as zero.
/// Returns the new value.
///
/// # Errors
///
/// Fails if the current value is not an integer, or on engine failure.
pub fn mvcc_increment<E: Engine + ?Sized>(
    engine: &E,
    ms: Option<&mut MvccStats>,
    key: &Key,
    timestamp: Timestamp,
    increment: i64,
) -> StorageResult<i64> {
    let current = match engine.get_versions(key)?.into_iter().next().and_then(|v| v.value) {
        Some(raw) => Value::from_raw(raw).get_int()?,
        None => 0,
    };
    let updated = current.wrapping_add(increment);
    write_version(engine, ms, key, timestamp, Some(Value::from_int(updated).raw().clone()))?;
    Ok(updated)
}

/// Persisted aggregate statistics for `range_id`; zero if none were written.
///
/// # Errors
///
/// Propagates engine and decoding failures.
pub fn mvcc_get_range_stats<E: Engine + ?Sized>(
    engine: &E,
    range_id: RangeId,
) -> StorageResult<MvccStats> {
    match engine.get_raw(&keys::range_stats_key(range_id))? {
        Some(raw) => codec::decode(&raw),
        None => Ok(MvccStats::default()),
    }
}

/// Persist aggregate statistics for `range_id`.
///
/// # Errors
///
/// Propagates engine and encoding failures.
pub fn mvcc_set_range_stats<E: Engine + ?Sized>(
    engine: &E,
    range_id: RangeId,
    ms: &MvccStats,
) -> StorageResult<()> {
    engine.put_raw(&keys::range_stats_key(range_id), codec::encode(ms)?)
}

/// Statistics of the versioned keys in `[start, end)`, recomputed from
/// scratch.
///
/// # Errors
///
/// Propagates engine failures.
pub fn compute_stats<E: Engine + ?Sized>(
    engine: &E,
    start: &Key,
    end: &Key,
) -> StorageResult<MvccStats> {
    let mut ms = MvccStats::default();
    for key in engine.scan_versioned_keys(start, end)? {
        ms += key_stats(&key, &engine.get_versions(&key)?);
    }
    Ok(ms)
}

/// Statistics of everything a range owns: its range-local keys plus its user
/// span, recomputed from scratch.
///
/// # Errors
///
/// Propagates engine failures.
pub fn compute_stats_for_range<E: Engine + ?Sized>(
    engine: &E,
    desc: &RangeDescriptor,
) -> StorageResult<MvccStats> {
    let mut ms = compute_stats(
        engine,
        &keys::range_local_prefix(&desc.start_key),
        &keys::range_local_prefix(&desc.end_key),
    )?;
    let user_start = std::cmp::max(desc.start_key.clone(), Key::from(LOCAL_MAX));
    ms += compute_stats(engine, &user_start, &desc.end_key)?;
    Ok(ms)
}

/// Every versioned key a range owns with its full history, in key order.
///
/// # Errors
///
/// Propagates engine failures.
pub fn range_versioned_data<E: Engine + ?Sized>(
    engine: &E,
    desc: &RangeDescriptor,
) -> StorageResult<Vec<(Key, Vec<Version>)>> {
    let user_start = std::cmp::max(desc.start_key.clone(), Key::from(LOCAL_MAX));
    let spans = [
        (
            keys::range_local_prefix(&desc.start_key),
            keys::range_local_prefix(&desc.end_key),
        ),
        (user_start, desc.end_key.clone()),
    ];
    let mut data = Vec::new();
    for (start, end) in &spans {
        for key in engine.scan_versioned_keys(start, end)? {
            let versions = engine.get_versions(&key)?;
            data.push((key, versions));
        }
    }
    Ok(data)
}

/// Remove every versioned key a range owns.
///
/// # Errors
///
/// Propagates engine failures.
pub fn clear_range_versioned_data<E: Engine + ?Sized>(
    engine: &E,
    desc: &RangeDescriptor,
) -> StorageResult<()> {
    engine.clear_versioned_range(
        &keys::range_local_prefix(&desc.start_key),
        &keys::range_local_prefix(&desc.end_key),
    )?;
    let user_start = std::cmp::max(desc.start_key.clone(), Key::from(LOCAL_MAX));
    engine.clear_versioned_range(&user_start, &desc.end_key)
}
