//! A store's copy of one range.
//!
//! Applied state sits behind one mutex that is only held for synchronous
//! work: applying committed entries, installing snapshots and evaluating
//! reads. Elections, replication and voter changes belong to the replica's
//! own openraft group, which drives [`RangeStateMachine`].

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use openraft::{Raft, RaftMetrics, StoredMembership};
use parking_lot::Mutex;
use ranger_hlc::Timestamp;
use ranger_kvpb::keys;
use ranger_kvpb::{
    BatchRequest, BatchResponse, ChangeReplicasType, GetResponse, KvError, KvResult, Lease,
    RangeDescriptor, RangeId, ReplicaDescriptor, ReplicaId, Request, Response,
    TruncateLogResponse,
};
use ranger_storage::mvcc::{
    clear_range_versioned_data, mvcc_get, mvcc_get_range_stats, mvcc_set_range_stats,
};
use ranger_storage::{Engine, MvccStats, codec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::raft::log_store::RangeLogStore;
use crate::raft::network::RangeNetworkFactory;
use crate::raft::state_machine::RangeStateMachine;
use crate::raft::{RaftCommand, RaftStatus, RangeLogId, RangeTypeConfig, ServerState, raft_config};
use crate::store::StoreEnv;
use crate::transport::{RaftMessageResponse, RaftPayload};
use crate::{StoreError, StoreResult};

/// Applied state of a replica, persisted after every applied batch of
/// entries and every installed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Current descriptor.
    pub desc: RangeDescriptor,
    /// Current lease, if one was ever granted.
    pub lease: Option<Lease>,
    /// Last applied log id.
    pub applied: Option<RangeLogId>,
    /// Raft membership as of `applied`.
    pub membership: StoredMembership<RangeTypeConfig>,
}

impl ReplicaState {
    fn new(desc: RangeDescriptor) -> Self {
        Self {
            desc,
            lease: None,
            applied: None,
            membership: StoredMembership::default(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ReplicaMu {
    pub(crate) state: ReplicaState,
    pub(crate) stats: MvccStats,
    pub(crate) destroyed: bool,
}

/// The part of a replica shared with its state machine.
#[derive(Debug)]
pub(crate) struct ReplicaCore {
    pub(crate) range_id: RangeId,
    pub(crate) replica_id: ReplicaId,
    pub(crate) env: Arc<StoreEnv>,
    pub(crate) mu: Mutex<ReplicaMu>,
}

/// One replica of a range.
pub struct Replica {
    core: Arc<ReplicaCore>,
    raft: Raft<RangeTypeConfig>,
    membership_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("range_id", &self.core.range_id)
            .field("replica_id", &self.core.replica_id)
            .finish_non_exhaustive()
    }
}

fn raft_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Raft(err.to_string())
}

/// Persist the initial state of a bootstrapped range.
pub(crate) fn write_initial_state(
    engine: &dyn Engine,
    desc: &RangeDescriptor,
    stats: &MvccStats,
) -> StoreResult<()> {
    let state = ReplicaState::new(desc.clone());
    engine.put_raw(&keys::replica_state_key(desc.range_id), codec::encode(&state)?)?;
    mvcc_set_range_stats(engine, desc.range_id, stats)?;
    Ok(())
}

impl Replica {
    /// Load a replica whose state was persisted on this store.
    pub(crate) async fn load(env: Arc<StoreEnv>, range_id: RangeId) -> StoreResult<Self> {
        let engine = env.engine.as_ref();
        let raw = engine
            .get_raw(&keys::replica_state_key(range_id))?
            .ok_or(StoreError::RangeNotFound(range_id))?;
        let state: ReplicaState = codec::decode(&raw)?;
        let replica_id = state
            .desc
            .find_replica(env.ident.store_id)
            .map(|r| r.replica_id)
            .ok_or(StoreError::RangeNotFound(range_id))?;
        let stats = mvcc_get_range_stats(engine, range_id)?;
        debug!(
            %range_id,
            %replica_id,
            applied = ?state.applied.as_ref().map(|id| id.index),
            "loading replica"
        );
        Self::open(env, range_id, replica_id, state, stats).await
    }

    /// A replica waiting for its first snapshot. Raft state left behind by
    /// an earlier replica of the range is discarded; the tombstone stays.
    pub(crate) async fn new_uninitialized(
        env: Arc<StoreEnv>,
        range_id: RangeId,
        replica_id: ReplicaId,
    ) -> StoreResult<Self> {
        let engine = env.engine.as_ref();
        engine.clear_raw_range(
            &keys::raft_log_prefix(range_id),
            &keys::raft_log_key(range_id, u64::MAX),
        )?;
        for key in [
            keys::raft_hard_state_key(range_id),
            keys::raft_truncated_state_key(range_id),
            keys::raft_committed_key(range_id),
            keys::replica_state_key(range_id),
        ] {
            engine.clear_raw_range(&key, &key.next())?;
        }
        debug!(%range_id, %replica_id, "creating uninitialized replica");
        let state = ReplicaState::new(RangeDescriptor::uninitialized(range_id));
        Self::open(env, range_id, replica_id, state, MvccStats::default()).await
    }

    async fn open(
        env: Arc<StoreEnv>,
        range_id: RangeId,
        replica_id: ReplicaId,
        state: ReplicaState,
        stats: MvccStats,
    ) -> StoreResult<Self> {
        let me = ReplicaDescriptor {
            node_id: env.ident.node_id,
            store_id: env.ident.store_id,
            replica_id,
        };
        let log_store = RangeLogStore::new(range_id, env.engine.clone());
        let fresh = log_store.is_empty().map_err(raft_error)?;
        let sole_member = state.desc.replicas.len() == 1
            && state.desc.replica_by_id(replica_id).is_some();
        let config = raft_config(&env.settings, range_id)
            .validate()
            .map_err(raft_error)?;
        let core = Arc::new(ReplicaCore {
            range_id,
            replica_id,
            env: env.clone(),
            mu: Mutex::new(ReplicaMu {
                state,
                stats,
                destroyed: false,
            }),
        });
        let network = RangeNetworkFactory::new(env, range_id, me);
        let state_machine = RangeStateMachine::new(core.clone());
        let raft = Raft::new(replica_id, Arc::new(config), network, log_store, state_machine)
            .await
            .map_err(raft_error)?;
        if fresh && sole_member {
            raft.initialize(BTreeMap::from([(replica_id, me)]))
                .await
                .map_err(raft_error)?;
            info!(%range_id, %replica_id, "initialized raft group");
        }
        Ok(Self {
            core,
            raft,
            membership_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Range id.
    #[must_use]
    pub fn range_id(&self) -> RangeId {
        self.core.range_id
    }

    /// This replica's id within the range.
    #[must_use]
    pub fn replica_id(&self) -> ReplicaId {
        self.core.replica_id
    }

    /// Current descriptor.
    #[must_use]
    pub fn desc(&self) -> RangeDescriptor {
        self.core.mu.lock().state.desc.clone()
    }

    /// Whether a snapshot or bootstrap has supplied the key span.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.core.mu.lock().state.desc.is_initialized()
    }

    /// Whether the replica's descriptor no longer lists it.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        let mu = self.core.mu.lock();
        let desc = &mu.state.desc;
        desc.is_initialized() && desc.replica_by_id(self.core.replica_id).is_none()
    }

    /// Current lease, valid or not.
    #[must_use]
    pub fn lease(&self) -> Option<Lease> {
        self.core.mu.lock().state.lease
    }

    /// In-memory aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> MvccStats {
        self.core.mu.lock().stats
    }

    fn metrics(&self) -> RaftMetrics<RangeTypeConfig> {
        self.raft.metrics().borrow().clone()
    }

    /// Raft introspection.
    #[must_use]
    pub fn raft_status(&self) -> RaftStatus {
        let metrics = self.metrics();
        RaftStatus {
            id: self.core.replica_id,
            term: metrics.current_term,
            state: metrics.state,
            lead: metrics.current_leader,
            applied: metrics.last_applied.as_ref().map(|id| id.index),
            truncated: metrics.purged.as_ref().map(|id| id.index),
            voters: metrics.membership_config.membership().voter_ids().collect(),
        }
    }

    /// This replica's entry in its descriptor.
    ///
    /// # Errors
    ///
    /// Fails with [`KvError::RangeNotFound`] if the descriptor does not list
    /// this replica.
    pub fn get_replica_descriptor(&self) -> KvResult<ReplicaDescriptor> {
        self.core
            .mu
            .lock()
            .state
            .desc
            .replica_by_id(self.core.replica_id)
            .copied()
            .ok_or(KvError::RangeNotFound(self.core.range_id))
    }

    fn own_descriptor(&self) -> ReplicaDescriptor {
        ReplicaDescriptor {
            node_id: self.core.env.ident.node_id,
            store_id: self.core.env.ident.store_id,
            replica_id: self.core.replica_id,
        }
    }

    fn not_lease_holder(&self, lease_holder: Option<ReplicaDescriptor>) -> KvError {
        KvError::NotLeaseHolder {
            range_id: self.core.range_id,
            replica: Some(self.own_descriptor()),
            lease_holder,
        }
    }

    fn leadership(&self) -> bool {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics.state == ServerState::Leader && metrics.current_leader == Some(self.core.replica_id)
    }

    fn stopping(&self) -> KvError {
        KvError::NodeUnavailable(format!("store {} is stopping", self.core.env.ident.store_id))
    }

    /// Run `fut` until it finishes, the proposal timeout passes or the store
    /// starts quiescing.
    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = T>) -> KvResult<T> {
        let quiesce = self.core.env.quiesce.clone();
        let timeout = self.core.env.settings.proposal_timeout;
        tokio::select! {
            () = quiesce.cancelled() => Err(self.stopping()),
            result = tokio::time::timeout(timeout, fut) => {
                result.map_err(|_| {
                    KvError::ProposalDropped(format!("timed out waiting for {what}"))
                })
            }
        }
    }

    /// Wait until the replica's raft metrics satisfy `ready`.
    async fn wait_for_metrics(
        &self,
        what: &str,
        ready: impl Fn(&RaftMetrics<RangeTypeConfig>) -> bool,
    ) -> KvResult<()> {
        let mut rx = self.raft.metrics();
        self.bounded(what, async move {
            loop {
                if ready(&rx.borrow()) {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(KvError::RangeNotFound(self.core.range_id));
                }
            }
        })
        .await?
    }

    /// Evaluate a batch. Reads are served from the local engine; writes are
    /// proposed and resolved once applied.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotLeaseHolder`] when another replica must serve
    /// the batch, [`KvError::RangeKeyMismatch`] when the key is outside the
    /// span, and any evaluation error.
    #[instrument(level = "trace", skip_all, fields(range_id = %self.core.range_id))]
    pub async fn send(&self, mut ba: BatchRequest) -> KvResult<BatchResponse> {
        let key = keys::addr(&ba.key()?);
        let clock = &self.core.env.clock;
        if ba.header.timestamp.is_zero() {
            ba.header.timestamp = clock.now();
        } else {
            clock.update(ba.header.timestamp);
        }
        {
            let mu = self.core.mu.lock();
            if mu.destroyed {
                return Err(KvError::RangeNotFound(self.core.range_id));
            }
            if !mu.state.desc.contains_key(&key) {
                return Err(KvError::RangeKeyMismatch {
                    key,
                    range_id: self.core.range_id,
                });
            }
        }
        let truncations = ba
            .requests
            .iter()
            .filter(|r| matches!(r, Request::TruncateLog(_)))
            .count();
        if truncations > 0 && ba.requests.len() > 1 {
            return Err(KvError::Internal(
                "TruncateLog must be the only request of its batch".to_string(),
            ));
        }
        let proposer = self.redirect_or_acquire_lease().await?;
        let timestamp = ba.header.timestamp;
        let txn = ba.txn.take();
        let responses = if let [Request::TruncateLog(truncate)] = ba.requests.as_slice() {
            let truncated_index = self.truncate_log(truncate.index).await?;
            vec![Response::TruncateLog(TruncateLogResponse { truncated_index })]
        } else if ba.is_read_only() {
            self.evaluate_reads(&ba.requests, timestamp)?
        } else {
            let membership_change = ba
                .requests
                .iter()
                .any(|r| matches!(r, Request::ChangeReplicas(_)));
            let responses = self
                .propose(RaftCommand::Write {
                    proposer,
                    timestamp,
                    requests: ba.requests,
                })
                .await?;
            if membership_change {
                if let Err(err) = self.sync_membership().await {
                    warn!(
                        range_id = %self.core.range_id,
                        error = %err,
                        "raft membership lags descriptor"
                    );
                }
            }
            responses
        };
        Ok(BatchResponse {
            responses,
            timestamp,
            txn,
        })
    }

    /// Return this replica's descriptor if it holds a valid lease, acquiring
    /// one through raft when it leads without one.
    async fn redirect_or_acquire_lease(&self) -> KvResult<ReplicaDescriptor> {
        let me = self.own_descriptor();
        if self.metrics().current_leader.is_none() {
            self.wait_for_metrics("a leader", |m| m.current_leader.is_some()).await?;
        }
        let now = self.core.env.clock.now();
        let current = self.lease().filter(|l| l.covers(now));
        if !self.leadership() {
            let holder = match current {
                Some(l) if l.replica.replica_id == me.replica_id => None,
                Some(l) => Some(l.replica),
                None => self
                    .metrics()
                    .current_leader
                    .and_then(|lead| self.desc().replica_by_id(lead).copied()),
            };
            return Err(self.not_lease_holder(holder));
        }
        let lease = match current {
            Some(l) if l.replica.replica_id == me.replica_id => return Ok(me),
            Some(l) => return Err(self.not_lease_holder(Some(l.replica))),
            None => Lease {
                replica: me,
                start: now,
                expiration: now.add_duration(self.core.env.settings.range_lease_active_duration),
            },
        };
        debug!(
            range_id = %self.core.range_id,
            replica = %me,
            expiration = %lease.expiration,
            "requesting lease"
        );
        match self.propose(RaftCommand::RequestLease { lease }).await {
            Ok(_) => Ok(me),
            Err(KvError::ConditionFailed(_)) => {
                Err(self.not_lease_holder(self.lease().map(|l| l.replica)))
            }
            Err(err) => Err(err),
        }
    }

    fn evaluate_reads(
        &self,
        requests: &[Request],
        timestamp: Timestamp,
    ) -> KvResult<Vec<Response>> {
        let engine = self.core.env.engine.as_ref();
        let _applied = self.core.mu.lock();
        requests
            .iter()
            .map(|request| match request {
                Request::Get(get) => Ok(Response::Get(GetResponse {
                    value: mvcc_get(engine, &get.key, timestamp)?,
                })),
                other => Err(KvError::Internal(format!("{} is not a read", other.method()))),
            })
            .collect()
    }

    async fn propose(&self, command: RaftCommand) -> KvResult<Vec<Response>> {
        match self.bounded("the proposal to apply", self.raft.client_write(command)).await? {
            Ok(resp) => resp.data.result,
            Err(err) => {
                if let Some(forward) = err.forward_to_leader() {
                    let holder = forward
                        .leader_id
                        .and_then(|lead| self.desc().replica_by_id(lead).copied());
                    return Err(self.not_lease_holder(holder));
                }
                Err(KvError::ProposalDropped(err.to_string()))
            }
        }
    }

    /// Build and commit a descriptor adding or removing `target`, using
    /// `expected` as the compare-and-swap base. Returns the new descriptor.
    ///
    /// # Errors
    ///
    /// Fails with [`KvError::ConditionFailed`] if `expected` is stale or the
    /// change is a no-op, and with any routing error.
    #[instrument(level = "debug", skip(self, expected), fields(range_id = %self.core.range_id))]
    pub async fn change_replicas(
        &self,
        kind: ChangeReplicasType,
        target: ReplicaDescriptor,
        expected: &RangeDescriptor,
    ) -> KvResult<RangeDescriptor> {
        let range_id = self.core.range_id;
        let mut updated = expected.clone();
        match kind {
            ChangeReplicasType::AddReplica => {
                if expected.find_replica(target.store_id).is_some() {
                    return Err(KvError::ConditionFailed(format!(
                        "store {} already holds a replica of {range_id}",
                        target.store_id
                    )));
                }
                updated.replicas.push(ReplicaDescriptor {
                    replica_id: expected.next_replica_id,
                    ..target
                });
                updated.next_replica_id = expected.next_replica_id.next();
            }
            ChangeReplicasType::RemoveReplica => {
                updated.replicas.retain(|r| r.store_id != target.store_id);
                if updated.replicas.len() == expected.replicas.len() {
                    return Err(KvError::ConditionFailed(format!(
                        "store {} holds no replica of {range_id}",
                        target.store_id
                    )));
                }
            }
        }
        info!(%range_id, ?kind, %target, "changing replicas");
        self.core.env.db.change_replicas(expected.clone(), updated).await
    }

    /// Discard this replica's raft log up to `index`, capped at the last
    /// applied entry, after snapshotting the applied state. Returns the
    /// index the log now starts after.
    pub(crate) async fn truncate_log(&self, index: u64) -> KvResult<u64> {
        let applied = self.metrics().last_applied.as_ref().map(|id| id.index);
        let Some(applied) = applied else {
            return Ok(0);
        };
        let target = index.min(applied);
        let covered = |id: Option<&RangeLogId>| id.is_some_and(|id| id.index >= target);
        if covered(self.metrics().purged.as_ref()) {
            return Ok(target);
        }
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| KvError::Internal(e.to_string()))?;
        self.wait_for_metrics("a snapshot", |m| covered(m.snapshot.as_ref()))
            .await?;
        self.raft
            .trigger()
            .purge_log(target)
            .await
            .map_err(|e| KvError::Internal(e.to_string()))?;
        self.wait_for_metrics("log truncation", |m| covered(m.purged.as_ref()))
            .await?;
        debug!(range_id = %self.core.range_id, index = target, "truncated raft log");
        Ok(target)
    }

    /// Bring the raft voters in line with the descriptor. Only the leader
    /// acts. Joining replicas are added as learners first, after the log is
    /// truncated so that they start from a snapshot.
    pub(crate) async fn sync_membership(&self) -> KvResult<()> {
        let _serialized = self.membership_lock.lock().await;
        if !self.leadership() {
            return Ok(());
        }
        let desc = self.desc();
        if !desc.is_initialized() {
            return Ok(());
        }
        let wanted: BTreeSet<ReplicaId> = desc.replicas.iter().map(|r| r.replica_id).collect();
        let (voters, known): (BTreeSet<ReplicaId>, BTreeSet<ReplicaId>) = {
            let metrics = self.metrics();
            let membership = metrics.membership_config.membership();
            (
                membership.voter_ids().collect(),
                membership.nodes().map(|(id, _)| *id).collect(),
            )
        };
        if voters == wanted {
            return Ok(());
        }
        let range_id = self.core.range_id;
        let joining: Vec<ReplicaDescriptor> = desc
            .replicas
            .iter()
            .filter(|r| !known.contains(&r.replica_id))
            .copied()
            .collect();
        if !joining.is_empty() {
            self.truncate_log(u64::MAX).await?;
        }
        for replica in joining {
            info!(%range_id, %replica, "adding raft learner");
            self.bounded("a learner", self.raft.add_learner(replica.replica_id, replica, true))
                .await?
                .map_err(|e| KvError::ProposalDropped(e.to_string()))?;
        }
        info!(%range_id, ?voters, ?wanted, "changing raft voters");
        self.bounded("a voter change", self.raft.change_membership(wanted, false))
            .await?
            .map_err(|e| KvError::ProposalDropped(e.to_string()))?;
        Ok(())
    }

    /// Whether `from` was a member of the range before being removed.
    pub(crate) fn sender_too_old(&self, from: &ReplicaDescriptor) -> bool {
        let mu = self.core.mu.lock();
        let desc = &mu.state.desc;
        desc.is_initialized()
            && desc.replica_by_id(from.replica_id).is_none()
            && from.replica_id < desc.next_replica_id
    }

    /// Feed an incoming raft call to the group.
    pub(crate) async fn handle_raft_rpc(&self, payload: RaftPayload) -> RaftMessageResponse {
        if self.core.mu.lock().destroyed {
            return RaftMessageResponse::Error(format!(
                "replica of {} destroyed",
                self.core.range_id
            ));
        }
        trace!(range_id = %self.core.range_id, kind = payload.kind(), "raft rpc");
        match payload {
            RaftPayload::Vote(req) => match self.raft.vote(req).await {
                Ok(resp) => RaftMessageResponse::Vote(resp),
                Err(err) => RaftMessageResponse::Error(err.to_string()),
            },
            RaftPayload::AppendEntries(req) => match self.raft.append_entries(req).await {
                Ok(resp) => RaftMessageResponse::AppendEntries(resp),
                Err(err) => RaftMessageResponse::Error(err.to_string()),
            },
            RaftPayload::InstallSnapshot(req) => match self.raft.install_snapshot(req).await {
                Ok(resp) => RaftMessageResponse::InstallSnapshot(resp),
                Err(err) => RaftMessageResponse::Error(err.to_string()),
            },
        }
    }

    /// Stop the raft group. Idempotent.
    pub(crate) async fn shutdown(&self) {
        if let Err(err) = self.raft.shutdown().await {
            debug!(range_id = %self.core.range_id, error = %err, "raft group already stopped");
        }
    }

    /// Stop the raft group and delete the replica's data, leaving a
    /// tombstone that rejects replica ids below `next_replica_id`.
    pub(crate) async fn destroy(&self, next_replica_id: ReplicaId) -> StoreResult<()> {
        {
            let mut mu = self.core.mu.lock();
            if mu.destroyed {
                return Ok(());
            }
            mu.destroyed = true;
        }
        self.shutdown().await;
        let range_id = self.core.range_id;
        let engine = self.core.env.engine.as_ref();
        let desc = self.desc();
        if desc.is_initialized() {
            clear_range_versioned_data(engine, &desc)?;
        }
        engine.clear_raw_range(
            &keys::range_id_prefix(range_id),
            &keys::range_id_prefix(RangeId::new(range_id.value() + 1)),
        )?;
        engine.put_raw(&keys::raft_tombstone_key(range_id), codec::encode(&next_replica_id)?)?;
        info!(%range_id, replica_id = %self.core.replica_id, %next_replica_id, "destroyed replica");
        Ok(())
    }
}
