//! Raft log and vote persisted in the store's engine.
//!
//! Entries live at [`keys::raft_log_key`], indexed by their raft index. The
//! vote, the last committed id and the last truncated id are single records
//! next to them, so destroying a replica's range-id local keys removes all
//! of its raft state.

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use openraft::storage::{IOFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, StorageError, Vote};
use ranger_kvpb::{Key, RangeId, keys};
use ranger_storage::{Engine, codec};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use super::{RangeLogId, RangeTypeConfig};

type Result<T> = std::result::Result<T, StorageError<RangeTypeConfig>>;

/// Log storage of one range.
#[derive(Debug, Clone)]
pub(crate) struct RangeLogStore {
    range_id: RangeId,
    engine: Arc<dyn Engine>,
}

impl RangeLogStore {
    pub(crate) fn new(range_id: RangeId, engine: Arc<dyn Engine>) -> Self {
        Self { range_id, engine }
    }

    fn read_record<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>> {
        let raw = self.engine.get_raw(key).map_err(|e| StorageError::read(&e))?;
        raw.map(|raw| codec::decode(&raw).map_err(|e| StorageError::read(&e)))
            .transpose()
    }

    fn write_record<T: Serialize>(&self, key: &Key, value: &T) -> Result<()> {
        let raw = codec::encode(value).map_err(|e| StorageError::write(&e))?;
        self.engine.put_raw(key, raw).map_err(|e| StorageError::write(&e))
    }

    fn log_key(&self, index: u64) -> Key {
        keys::raft_log_key(self.range_id, index)
    }

    fn log_end(&self) -> Key {
        keys::raft_log_key(self.range_id, u64::MAX)
    }

    /// Whether any raft state was ever persisted for the range.
    pub(crate) fn is_empty(&self) -> Result<bool> {
        let vote: Option<Vote<RangeTypeConfig>> =
            self.read_record(&keys::raft_hard_state_key(self.range_id))?;
        let entries = self
            .engine
            .scan_raw(&self.log_key(0), &self.log_end())
            .map_err(|e| StorageError::read(&e))?;
        Ok(vote.is_none() && entries.is_empty())
    }
}

impl RaftLogReader<RangeTypeConfig> for RangeLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<RangeTypeConfig>>> {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => self.log_key(n.saturating_add(1)),
            Bound::Excluded(&n) => self.log_key(n),
            Bound::Unbounded => self.log_end(),
        };
        self.engine
            .scan_raw(&self.log_key(start), &end)
            .map_err(|e| StorageError::read(&e))?
            .iter()
            .map(|(_, raw)| codec::decode(raw).map_err(|e| StorageError::read(&e)))
            .collect()
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RangeTypeConfig>>> {
        self.read_record(&keys::raft_hard_state_key(self.range_id))
    }
}

impl RaftLogStorage<RangeTypeConfig> for RangeLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<RangeTypeConfig>> {
        let last_purged_log_id: Option<RangeLogId> =
            self.read_record(&keys::raft_truncated_state_key(self.range_id))?;
        let last = self
            .engine
            .scan_raw(&self.log_key(0), &self.log_end())
            .map_err(|e| StorageError::read(&e))?
            .pop();
        let last_log_id = match last {
            Some((_, raw)) => {
                let entry: Entry<RangeTypeConfig> =
                    codec::decode(&raw).map_err(|e| StorageError::read(&e))?;
                Some(entry.log_id)
            }
            None => last_purged_log_id.clone(),
        };
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<RangeTypeConfig>) -> Result<()> {
        self.write_record(&keys::raft_hard_state_key(self.range_id), vote)
    }

    async fn save_committed(&mut self, committed: Option<RangeLogId>) -> Result<()> {
        self.write_record(&keys::raft_committed_key(self.range_id), &committed)
    }

    async fn read_committed(&mut self) -> Result<Option<RangeLogId>> {
        Ok(self
            .read_record::<Option<RangeLogId>>(&keys::raft_committed_key(self.range_id))?
            .flatten())
    }

    async fn append<I>(&mut self, entries: I, callback: IOFlushed<RangeTypeConfig>) -> Result<()>
    where
        I: IntoIterator<Item = Entry<RangeTypeConfig>> + Send,
        I::IntoIter: Send,
    {
        for entry in entries {
            self.write_record(&self.log_key(entry.log_id.index), &entry)?;
        }
        callback.io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: RangeLogId) -> Result<()> {
        trace!(range_id = %self.range_id, index = log_id.index, "truncating log suffix");
        self.engine
            .clear_raw_range(&self.log_key(log_id.index), &self.log_end())
            .map_err(|e| StorageError::write(&e))
    }

    async fn purge(&mut self, log_id: RangeLogId) -> Result<()> {
        self.write_record(&keys::raft_truncated_state_key(self.range_id), &log_id)?;
        self.engine
            .clear_raw_range(&self.log_key(0), &self.log_key(log_id.index + 1))
            .map_err(|e| StorageError::write(&e))?;
        trace!(range_id = %self.range_id, index = log_id.index, "purged log prefix");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::EntryPayload;
    use openraft::vote::leader_id_adv::LeaderId;
    use ranger_storage_memory::InMemEngine;

    fn log_id(term: u64, index: u64) -> RangeLogId {
        let leader = LeaderId {
            term,
            node_id: ranger_kvpb::ReplicaId::new(1),
        };
        RangeLogId {
            leader_id: leader,
            index,
        }
    }

    fn blank(term: u64, index: u64) -> Entry<RangeTypeConfig> {
        Entry {
            log_id: log_id(term, index),
            payload: EntryPayload::Blank,
        }
    }

    fn append(store: &RangeLogStore, entries: Vec<Entry<RangeTypeConfig>>) {
        for entry in entries {
            store
                .write_record(&store.log_key(entry.log_id.index), &entry)
                .unwrap();
        }
    }

    fn store() -> RangeLogStore {
        RangeLogStore::new(RangeId::new(1), Arc::new(InMemEngine::new()))
    }

    #[tokio::test]
    async fn entries_read_back_by_range() {
        let mut store = store();
        assert!(store.is_empty().unwrap());
        append(&store, (0..5).map(|i| blank(1, i)).collect());
        assert!(!store.is_empty().unwrap());

        let all = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(all.len(), 5);
        let middle = store.try_get_log_entries(1..=3).await.unwrap();
        let indexes: Vec<u64> = middle.iter().map(|e| e.log_id.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert!(store.try_get_log_entries(7..9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncate_drops_the_suffix_and_purge_the_prefix() {
        let mut store = store();
        append(&store, (0..6).map(|i| blank(1, i)).collect());

        store.truncate(log_id(1, 4)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|id| id.index), Some(3));
        assert!(state.last_purged_log_id.is_none());

        store.purge(log_id(1, 3)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|id| id.index), Some(3));
        assert_eq!(state.last_log_id.map(|id| id.index), Some(3));
        assert!(store.try_get_log_entries(..).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_id_is_optional() {
        let mut store = store();
        assert!(store.read_committed().await.unwrap().is_none());
        store.save_committed(Some(log_id(2, 9))).await.unwrap();
        assert_eq!(store.read_committed().await.unwrap().map(|id| id.index), Some(9));
        store.save_committed(None).await.unwrap();
        assert!(store.read_committed().await.unwrap().is_none());
    }
}
