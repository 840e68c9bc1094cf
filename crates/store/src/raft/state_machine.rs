//! Applies committed raft entries to a replica's MVCC data.
//!
//! Applying runs under the replica mutex so readers never observe a half
//! applied batch. A write batch either applies completely or leaves the
//! data, statistics and replica state exactly as they were.

use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, RaftSnapshotBuilder, SnapshotMeta, StorageError, StoredMembership,
};
use ranger_hlc::Timestamp;
use ranger_kvpb::keys;
use ranger_kvpb::{
    GetResponse, IncrementResponse, Key, KvError, KvResult, Lease, RangeDescriptor, Request,
    Response,
};
use ranger_storage::mvcc::{
    clear_range_versioned_data, mvcc_delete, mvcc_get, mvcc_increment, mvcc_put,
    mvcc_put_message, mvcc_set_range_stats, range_versioned_data,
};
use ranger_storage::{MvccStats, Version, codec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CommandResponse, RaftCommand, RangeLogId, RangeTypeConfig};
use crate::StoreResult;
use crate::replica::{ReplicaCore, ReplicaMu};

type Result<T> = std::result::Result<T, StorageError<RangeTypeConfig>>;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    desc: RangeDescriptor,
    lease: Option<Lease>,
    stats: MvccStats,
    data: Vec<(Key, Vec<Version>)>,
}

/// State machine of one replica, shared with the replica itself.
#[derive(Debug, Clone)]
pub(crate) struct RangeStateMachine {
    core: Arc<ReplicaCore>,
}

impl RangeStateMachine {
    pub(crate) const fn new(core: Arc<ReplicaCore>) -> Self {
        Self { core }
    }

    fn snapshot(&self) -> Result<Snapshot<RangeTypeConfig>> {
        let mu = self.core.mu.lock();
        let engine = self.core.env.engine.as_ref();
        let data = if mu.state.desc.is_initialized() {
            range_versioned_data(engine, &mu.state.desc)
                .map_err(|e| StorageError::read_state_machine(&e))?
        } else {
            Vec::new()
        };
        let payload = SnapshotData {
            desc: mu.state.desc.clone(),
            lease: mu.state.lease,
            stats: mu.stats,
            data,
        };
        let raw = codec::encode(&payload).map_err(|e| StorageError::read_state_machine(&e))?;
        let index = mu.state.applied.as_ref().map_or(0, |id| id.index);
        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: mu.state.applied.clone(),
                last_membership: mu.state.membership.clone(),
                snapshot_id: format!("{}-{index}", self.core.range_id),
            },
            snapshot: Cursor::new(raw.to_vec()),
        })
    }
}

impl ReplicaCore {
    pub(crate) fn persist_state(&self, mu: &ReplicaMu) -> StoreResult<()> {
        let engine = self.env.engine.as_ref();
        engine.put_raw(&keys::replica_state_key(self.range_id), codec::encode(&mu.state)?)?;
        mvcc_set_range_stats(engine, self.range_id, &mu.stats)?;
        Ok(())
    }

    fn apply_command(&self, mu: &mut ReplicaMu, command: RaftCommand) -> KvResult<Vec<Response>> {
        match command {
            RaftCommand::RequestLease { lease } => {
                if let Some(current) = mu.state.lease {
                    let other = current.replica.replica_id != lease.replica.replica_id;
                    if other && current.covers(lease.start) {
                        return Err(KvError::ConditionFailed(format!(
                            "lease held by {} until {}",
                            current.replica, current.expiration
                        )));
                    }
                }
                debug!(range_id = %self.range_id, holder = %lease.replica, "lease applied");
                mu.state.lease = Some(lease);
                Ok(Vec::new())
            }
            RaftCommand::Write {
                proposer,
                timestamp,
                requests,
            } => {
                let owned = mu
                    .state
                    .lease
                    .is_some_and(|l| l.replica.replica_id == proposer.replica_id);
                if !owned {
                    return Err(KvError::NotLeaseHolder {
                        range_id: self.range_id,
                        replica: Some(proposer),
                        lease_holder: mu.state.lease.map(|l| l.replica),
                    });
                }
                self.apply_batch(mu, timestamp, requests)
            }
        }
    }

    /// Apply `requests` in order. On the first failure every key touched so
    /// far gets its previous version history back, and the statistics and
    /// descriptor are restored, before the error is returned.
    fn apply_batch(
        &self,
        mu: &mut ReplicaMu,
        timestamp: Timestamp,
        requests: Vec<Request>,
    ) -> KvResult<Vec<Response>> {
        let engine = self.env.engine.as_ref();
        let saved_stats = mu.stats;
        let saved_desc = mu.state.desc.clone();
        let saved_lease = mu.state.lease;
        let mut undo: Vec<(Key, Vec<Version>)> = Vec::new();
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            if request.is_write() {
                let key = request.key();
                if !undo.iter().any(|(touched, _)| *touched == key) {
                    let versions = engine.get_versions(&key)?;
                    undo.push((key, versions));
                }
            }
            match self.apply_request(mu, timestamp, request) {
                Ok(response) => responses.push(response),
                Err(err) => {
                    for (key, versions) in undo.into_iter().rev() {
                        engine.set_versions(&key, versions)?;
                    }
                    mu.stats = saved_stats;
                    mu.state.desc = saved_desc;
                    mu.state.lease = saved_lease;
                    debug!(range_id = %self.range_id, error = %err, "batch rolled back");
                    return Err(err);
                }
            }
        }
        Ok(responses)
    }

    fn apply_request(
        &self,
        mu: &mut ReplicaMu,
        timestamp: Timestamp,
        request: Request,
    ) -> KvResult<Response> {
        let engine = self.env.engine.as_ref();
        let ms = Some(&mut mu.stats);
        Ok(match request {
            Request::Get(get) => Response::Get(GetResponse {
                value: mvcc_get(engine, &get.key, timestamp)?,
            }),
            Request::Put(put) => {
                mvcc_put(engine, ms, &put.key, timestamp, &put.value)?;
                Response::Put
            }
            Request::Increment(inc) => Response::Increment(IncrementResponse {
                new_value: mvcc_increment(engine, ms, &inc.key, timestamp, inc.increment)?,
            }),
            Request::Delete(del) => {
                mvcc_delete(engine, ms, &del.key, timestamp)?;
                Response::Delete
            }
            Request::ChangeReplicas(change) => {
                if mu.state.desc != change.expected {
                    return Err(KvError::ConditionFailed(format!(
                        "descriptor changed: expected {}, found {}",
                        change.expected, mu.state.desc
                    )));
                }
                let updated = change.updated;
                mvcc_put_message(
                    engine,
                    ms,
                    &keys::range_descriptor_key(&updated.start_key),
                    timestamp,
                    &updated,
                )?;
                let holder_removed = mu
                    .state
                    .lease
                    .is_some_and(|l| updated.replica_by_id(l.replica.replica_id).is_none());
                if holder_removed {
                    mu.state.lease = None;
                }
                info!(range_id = %self.range_id, desc = %updated, "applied membership change");
                mu.state.desc = updated.clone();
                Response::ChangeReplicas(updated)
            }
            Request::TruncateLog(_) => {
                return Err(KvError::Internal(
                    "log truncation is not replicated".to_string(),
                ));
            }
        })
    }

    /// Queue this replica for collection once its descriptor drops it.
    fn collect_if_removed(&self, mu: &ReplicaMu) {
        let desc = &mu.state.desc;
        if desc.is_initialized() && desc.replica_by_id(self.replica_id).is_none() {
            debug!(range_id = %self.range_id, replica_id = %self.replica_id, "replica removed");
            self.env.enqueue_gc(self.range_id, self.replica_id);
        }
    }
}

impl RaftStateMachine<RangeTypeConfig> for RangeStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<RangeLogId>, StoredMembership<RangeTypeConfig>)> {
        let mu = self.core.mu.lock();
        Ok((mu.state.applied.clone(), mu.state.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>>
    where
        I: IntoIterator<Item = Entry<RangeTypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let core = &self.core;
        let mut guard = core.mu.lock();
        let mu = &mut *guard;
        let mut responses = Vec::new();
        for entry in entries {
            let log_id = entry.log_id.clone();
            if mu.destroyed {
                responses.push(CommandResponse {
                    result: Err(KvError::RangeNotFound(core.range_id)),
                });
                continue;
            }
            let response = match entry.payload {
                EntryPayload::Blank => CommandResponse::empty(),
                EntryPayload::Normal(command) => CommandResponse {
                    result: core.apply_command(mu, command),
                },
                EntryPayload::Membership(membership) => {
                    mu.state.membership = StoredMembership::new(Some(log_id.clone()), membership);
                    CommandResponse::empty()
                }
            };
            if let Err(err @ KvError::Storage(_)) = &response.result {
                return Err(StorageError::write_state_machine(err));
            }
            mu.state.applied = Some(log_id);
            responses.push(response);
        }
        if !mu.destroyed {
            core.persist_state(mu)
                .map_err(|e| StorageError::write_state_machine(&e))?;
            core.collect_if_removed(mu);
        }
        Ok(responses)
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Cursor<Vec<u8>>> {
        Ok(Cursor::new(Vec::new()))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RangeTypeConfig>,
        snapshot: Cursor<Vec<u8>>,
    ) -> Result<()> {
        let payload: SnapshotData = codec::decode(snapshot.get_ref())
            .map_err(|e| StorageError::read_snapshot(None, &e))?;
        let core = &self.core;
        let engine = core.env.engine.as_ref();
        let mut guard = core.mu.lock();
        let mu = &mut *guard;
        if mu.destroyed {
            warn!(range_id = %core.range_id, "dropping snapshot for destroyed replica");
            return Ok(());
        }
        let write = |e: &ranger_storage::StorageError| StorageError::write_snapshot(None, e);
        if mu.state.desc.is_initialized() {
            clear_range_versioned_data(engine, &mu.state.desc).map_err(|e| write(&e))?;
        }
        clear_range_versioned_data(engine, &payload.desc).map_err(|e| write(&e))?;
        let keys = payload.data.len();
        for (key, versions) in payload.data {
            engine.set_versions(&key, versions).map_err(|e| write(&e))?;
        }
        mu.state.desc = payload.desc;
        mu.state.lease = payload.lease;
        mu.state.applied = meta.last_log_id.clone();
        mu.state.membership = meta.last_membership.clone();
        mu.stats = payload.stats;
        core.persist_state(mu)
            .map_err(|e| StorageError::write_state_machine(&e))?;
        info!(
            range_id = %core.range_id,
            snapshot = %meta.snapshot_id,
            keys,
            desc = %mu.state.desc,
            "applied snapshot"
        );
        core.collect_if_removed(mu);
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<RangeTypeConfig>>> {
        self.snapshot().map(Some)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }
}

impl RaftSnapshotBuilder<RangeTypeConfig> for RangeStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<RangeTypeConfig>> {
        let snapshot = self.snapshot()?;
        debug!(
            range_id = %self.core.range_id,
            snapshot = %snapshot.meta.snapshot_id,
            bytes = snapshot.snapshot.get_ref().len(),
            "built snapshot"
        );
        Ok(snapshot)
    }
}
