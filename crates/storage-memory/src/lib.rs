//! In-memory storage engine.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use ranger_kvpb::Key;
use ranger_storage::{Engine, StorageError, StorageResult, Version};
use tracing::debug;

/// An [`Engine`] keeping everything in ordered maps.
///
/// Survives store restarts as long as the value itself is kept alive, which
/// is how simulated nodes keep their state across a stop and restart.
#[derive(Debug, Default)]
pub struct InMemEngine {
    raw: RwLock<BTreeMap<Key, Bytes>>,
    versioned: RwLock<BTreeMap<Key, Vec<Version>>>,
    closed: AtomicBool,
}

impl InMemEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn span(start: &Key, end: &Key) -> Option<(Bound<Key>, Bound<Key>)> {
        (start < end).then(|| (Bound::Included(start.clone()), Bound::Excluded(end.clone())))
    }
}

impl Engine for InMemEngine {
    fn get_raw(&self, key: &Key) -> StorageResult<Option<Bytes>> {
        self.check_open()?;
        Ok(self.raw.read().get(key).cloned())
    }

    fn put_raw(&self, key: &Key, value: Bytes) -> StorageResult<()> {
        self.check_open()?;
        self.raw.write().insert(key.clone(), value);
        Ok(())
    }

    fn delete_raw(&self, key: &Key) -> StorageResult<()> {
        self.check_open()?;
        self.raw.write().remove(key);
        Ok(())
    }

    fn scan_raw(&self, start: &Key, end: &Key) -> StorageResult<Vec<(Key, Bytes)>> {
        self.check_open()?;
        let Some(span) = Self::span(start, end) else {
            return Ok(Vec::new());
        };
        Ok(self
            .raw
            .read()
            .range(span)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear_raw_range(&self, start: &Key, end: &Key) -> StorageResult<()> {
        self.check_open()?;
        let Some(span) = Self::span(start, end) else {
            return Ok(());
        };
        let mut raw = self.raw.write();
        let doomed: Vec<Key> = raw.range(span).map(|(k, _)| k.clone()).collect();
        for key in doomed {
            raw.remove(&key);
        }
        Ok(())
    }

    fn get_versions(&self, key: &Key) -> StorageResult<Vec<Version>> {
        self.check_open()?;
        Ok(self.versioned.read().get(key).cloned().unwrap_or_default())
    }

    fn set_versions(&self, key: &Key, mut versions: Vec<Version>) -> StorageResult<()> {
        self.check_open()?;
        let mut versioned = self.versioned.write();
        if versions.is_empty() {
            versioned.remove(key);
        } else {
            versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            versioned.insert(key.clone(), versions);
        }
        Ok(())
    }

    fn scan_versioned_keys(&self, start: &Key, end: &Key) -> StorageResult<Vec<Key>> {
        self.check_open()?;
        let Some(span) = Self::span(start, end) else {
            return Ok(Vec::new());
        };
        Ok(self.versioned.read().range(span).map(|(k, _)| k.clone()).collect())
    }

    fn clear_versioned_range(&self, start: &Key, end: &Key) -> StorageResult<()> {
        self.check_open()?;
        let Some(span) = Self::span(start, end) else {
            return Ok(());
        };
        let mut versioned = self.versioned.write();
        let doomed: Vec<Key> = versioned.range(span).map(|(k, _)| k.clone()).collect();
        for key in doomed {
            versioned.remove(&key);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closed in-memory engine");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_scan_is_ordered_and_half_open() {
        let engine = InMemEngine::new();
        for k in ["c", "a", "b", "d"] {
            engine.put_raw(&Key::from(k), Bytes::from_static(b"v")).unwrap();
        }
        let keys: Vec<Key> = engine
            .scan_raw(&Key::from("a"), &Key::from("d"))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![Key::from("a"), Key::from("b"), Key::from("c")]);
    }

    #[test]
    fn inverted_span_is_empty() {
        let engine = InMemEngine::new();
        engine.put_raw(&Key::from("a"), Bytes::new()).unwrap();
        assert!(engine.scan_raw(&Key::from("z"), &Key::from("a")).unwrap().is_empty());
        engine.clear_raw_range(&Key::from("z"), &Key::from("a")).unwrap();
        assert!(engine.get_raw(&Key::from("a")).unwrap().is_some());
    }

    #[test]
    fn closed_engine_rejects_access() {
        let engine = InMemEngine::new();
        engine.close();
        assert!(engine.is_closed());
        assert_eq!(engine.get_raw(&Key::from("a")), Err(StorageError::Closed));
    }

    #[test]
    fn empty_history_removes_key() {
        let engine = InMemEngine::new();
        let key = Key::from("k");
        engine
            .set_versions(
                &key,
                vec![Version {
                    timestamp: ranger_hlc::Timestamp::new(1, 0),
                    value: None,
                }],
            )
            .unwrap();
        engine.set_versions(&key, Vec::new()).unwrap();
        assert!(engine.scan_versioned_keys(&Key::min(), &Key::max()).unwrap().is_empty());
    }
}
