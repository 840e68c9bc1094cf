use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use ranger_gossip::{KEY_SYSTEM_CONFIG, make_store_key};
use ranger_hlc::Clock;
use ranger_kv::Db;
use ranger_kvpb::keys;
use ranger_kvpb::{
    BatchRequest, BatchResponse, Key, KvError, KvResult, NodeDescriptor, NodeId, RangeDescriptor,
    RangeId, ReplicaDescriptor, ReplicaId, StoreCapacity, StoreDescriptor, StoreId, StoreIdent,
    Value,
};
use ranger_storage::mvcc::{mvcc_put, mvcc_put_message};
use ranger_storage::{Engine, MvccStats, codec};
use ranger_util::Stopper;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::raft::{RaftStatus, ServerState};
use crate::replica::{self, Replica};
use crate::transport::{RaftMessageHandler, RaftMessageRequest, RaftMessageResponse, RaftTransport};
use crate::{StoreConfig, StoreError, StoreResult, StoreSettings};

/// Id of the range every cluster is bootstrapped with.
pub const FIRST_RANGE_ID: RangeId = RangeId::new(1);

/// Store-wide dependencies shared by its replicas, fixed at start.
#[derive(Debug)]
pub(crate) struct StoreEnv {
    pub(crate) ident: StoreIdent,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) clock: Arc<Clock>,
    pub(crate) transport: Arc<RaftTransport>,
    pub(crate) db: Arc<Db>,
    pub(crate) settings: StoreSettings,
    pub(crate) quiesce: CancellationToken,
    gc: flume::Sender<(RangeId, ReplicaId)>,
}

impl StoreEnv {
    /// Ask the store to collect replica `replica_id` of `range_id`.
    pub(crate) fn enqueue_gc(&self, range_id: RangeId, replica_id: ReplicaId) {
        if self.gc.send((range_id, replica_id)).is_err() {
            debug!(%range_id, %replica_id, "replica gc queue closed");
        }
    }
}

/// A single store: an engine plus the replicas living on it.
pub struct Store {
    cfg: StoreConfig,
    engine: Arc<dyn Engine>,
    node_desc: NodeDescriptor,
    ident: OnceLock<StoreIdent>,
    env: OnceLock<Arc<StoreEnv>>,
    replicas: DashMap<RangeId, Arc<Replica>>,
    create_lock: tokio::sync::Mutex<()>,
    initialized: watch::Sender<bool>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("ident", &self.ident())
            .field("replicas", &self.replicas.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a store over `engine`, picking up its identity if it was
    /// bootstrapped earlier. Nothing runs until [`Store::start`].
    #[must_use]
    pub fn new(cfg: StoreConfig, engine: Arc<dyn Engine>, node_desc: NodeDescriptor) -> Arc<Self> {
        let (initialized, _) = watch::channel(false);
        let ident = OnceLock::new();
        match engine.get_raw(&keys::store_ident_key()) {
            Ok(Some(raw)) => match codec::decode::<StoreIdent>(&raw) {
                Ok(existing) => {
                    let _ = ident.set(existing);
                }
                Err(err) => warn!(error = %err, "ignoring undecodable store identity"),
            },
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to read store identity"),
        }
        Arc::new(Self {
            cfg,
            engine,
            node_desc,
            ident,
            env: OnceLock::new(),
            replicas: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
            initialized,
        })
    }

    /// Identity, or zero ids before bootstrap.
    #[must_use]
    pub fn ident(&self) -> StoreIdent {
        self.ident.get().copied().unwrap_or_default()
    }

    /// Store id.
    #[must_use]
    pub fn store_id(&self) -> StoreId {
        self.ident().store_id
    }

    /// Node id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.ident().node_id
    }

    /// Underlying engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Shared clock.
    #[must_use]
    pub const fn clock(&self) -> &Arc<Clock> {
        &self.cfg.clock
    }

    /// Settings the store was built with.
    #[must_use]
    pub const fn settings(&self) -> &StoreSettings {
        &self.cfg.settings
    }

    /// Persist `ident` on an empty engine.
    ///
    /// # Errors
    ///
    /// Fails if the engine already carries an identity.
    pub fn bootstrap(&self, ident: StoreIdent) -> StoreResult<()> {
        if let Some(raw) = self.engine.get_raw(&keys::store_ident_key())? {
            let existing: StoreIdent = codec::decode(&raw)?;
            return Err(StoreError::AlreadyBootstrapped(existing));
        }
        self.engine.put_raw(&keys::store_ident_key(), codec::encode(&ident)?)?;
        let _ = self.ident.set(ident);
        info!(node_id = %ident.node_id, store_id = %ident.store_id, "bootstrapped store");
        Ok(())
    }

    /// Write the first range, spanning the whole key space with this store
    /// as its only member, seeded with `initial_values`.
    ///
    /// # Errors
    ///
    /// Fails before [`Store::bootstrap`] or on engine failure.
    pub fn bootstrap_range(&self, initial_values: &[(Key, Value)]) -> StoreResult<()> {
        let ident = *self.ident.get().ok_or(StoreError::NotBootstrapped)?;
        let now = self.cfg.clock.now();
        let desc = RangeDescriptor {
            range_id: FIRST_RANGE_ID,
            start_key: Key::min(),
            end_key: Key::max(),
            replicas: vec![ReplicaDescriptor {
                node_id: ident.node_id,
                store_id: ident.store_id,
                replica_id: ReplicaId::new(1),
            }],
            next_replica_id: ReplicaId::new(2),
        };
        let engine = self.engine.as_ref();
        let mut ms = MvccStats::default();
        mvcc_put_message(
            engine,
            Some(&mut ms),
            &keys::range_descriptor_key(&desc.start_key),
            now,
            &desc,
        )?;
        for (key, value) in initial_values {
            mvcc_put(engine, Some(&mut ms), key, now, value)?;
        }
        replica::write_initial_state(engine, &desc, &ms)?;
        info!(desc = %desc, values = initial_values.len(), "bootstrapped first range");
        Ok(())
    }

    fn env(&self) -> StoreResult<Arc<StoreEnv>> {
        self.env.get().cloned().ok_or(StoreError::NotStarted)
    }

    /// Load persisted replicas and start raft, replica collection and
    /// gossip on `stopper`.
    ///
    /// # Errors
    ///
    /// Fails if the engine was never bootstrapped, the store was already
    /// started, or the stopper is quiescing.
    pub async fn start(self: &Arc<Self>, stopper: &Stopper) -> StoreResult<()> {
        let raw = self
            .engine
            .get_raw(&keys::store_ident_key())?
            .ok_or(StoreError::NotBootstrapped)?;
        let ident: StoreIdent = codec::decode(&raw)?;
        let _ = self.ident.set(ident);

        let (gc_tx, gc_rx) = flume::unbounded();
        let env = Arc::new(StoreEnv {
            ident,
            engine: self.engine.clone(),
            clock: self.cfg.clock.clone(),
            transport: self.cfg.transport.clone(),
            db: self.cfg.db.clone(),
            settings: self.cfg.settings.clone(),
            quiesce: stopper.should_quiesce(),
            gc: gc_tx,
        });
        self.env
            .set(env.clone())
            .map_err(|_| StoreError::AlreadyStarted)?;

        let local = self
            .engine
            .scan_raw(&keys::local_range_id_min(), &keys::local_range_id_max())?;
        for (key, _) in local {
            let Some(range_id) = keys::decode_replica_state_key(&key) else {
                continue;
            };
            match Replica::load(env.clone(), range_id).await {
                Ok(replica) => {
                    self.replicas.insert(range_id, Arc::new(replica));
                }
                Err(StoreError::RangeNotFound(_)) => {
                    warn!(
                        %range_id,
                        store_id = %ident.store_id,
                        "skipping replica no longer in its range"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        self.cfg.transport.listen(ident.store_id, self.clone());
        let transport = self.cfg.transport.clone();
        stopper.add_closer(move || transport.stop(ident.store_id));

        let store = self.clone();
        stopper.run_worker("raft-shutdown", move |quiesce| async move {
            quiesce.cancelled().await;
            for replica in store.replica_list() {
                replica.shutdown().await;
            }
            debug!(store_id = %store.store_id(), "raft groups stopped");
        })?;

        let store = self.clone();
        stopper.run_worker("replica-gc", move |quiesce| async move {
            loop {
                tokio::select! {
                    () = quiesce.cancelled() => break,
                    received = gc_rx.recv_async() => {
                        let Ok((range_id, replica_id)) = received else { break };
                        store.collect_replica(range_id, replica_id).await;
                    }
                }
            }
        })?;

        let store = self.clone();
        stopper.run_worker("replica-scanner", move |quiesce| async move {
            let mut interval = tokio::time::interval(store.cfg.settings.replica_scan_interval);
            loop {
                tokio::select! {
                    () = quiesce.cancelled() => break,
                    _ = interval.tick() => store.scan_replicas().await,
                }
            }
        })?;

        let store = self.clone();
        stopper.run_worker("store-gossip", move |quiesce| async move {
            let mut interval = tokio::time::interval(store.cfg.settings.gossip_interval);
            let mut gossiped: Option<RangeDescriptor> = None;
            loop {
                tokio::select! {
                    () = quiesce.cancelled() => break,
                    _ = interval.tick() => store.maybe_gossip_system_config(&mut gossiped),
                }
            }
        })?;

        self.gossip_store()?;
        self.initialized.send_replace(true);
        info!(
            node_id = %ident.node_id,
            store_id = %ident.store_id,
            replicas = self.replicas.len(),
            "store started"
        );
        Ok(())
    }

    /// Wait until [`Store::start`] finished loading replicas.
    pub async fn wait_for_init(&self) {
        let mut rx = self.initialized.subscribe();
        let _ = rx.wait_for(|initialized| *initialized).await;
    }

    fn replica_list(&self) -> Vec<Arc<Replica>> {
        self.replicas.iter().map(|r| r.value().clone()).collect()
    }

    /// Reconcile voters on the replicas this store leads and queue the ones
    /// their descriptor dropped.
    async fn scan_replicas(&self) {
        for replica in self.replica_list() {
            if let Err(err) = replica.sync_membership().await {
                debug!(range_id = %replica.range_id(), error = %err, "voter reconciliation failed");
            }
            if replica.is_removed() {
                if let Ok(env) = self.env() {
                    env.enqueue_gc(replica.range_id(), replica.replica_id());
                }
            }
        }
    }

    async fn collect_replica(&self, range_id: RangeId, replica_id: ReplicaId) {
        let replica = self.replicas.get(&range_id).map(|r| r.value().clone());
        let Some(replica) = replica else {
            return;
        };
        if replica.replica_id() != replica_id {
            return;
        }
        // The leader hands its voter change to the group before going away.
        if let Err(err) = replica.sync_membership().await {
            debug!(%range_id, error = %err, "voter change before removal failed");
        }
        if let Err(err) = self.remove_replica(&replica, replica_id.next()).await {
            error!(%range_id, error = %err, "failed to remove replica");
        }
    }

    fn tombstone(&self, range_id: RangeId) -> StoreResult<ReplicaId> {
        match self.engine.get_raw(&keys::raft_tombstone_key(range_id))? {
            Some(raw) => Ok(codec::decode(&raw)?),
            None => Ok(ReplicaId::default()),
        }
    }

    async fn get_or_create_replica(
        &self,
        range_id: RangeId,
        replica_id: ReplicaId,
    ) -> StoreResult<Option<Arc<Replica>>> {
        let existing = self.replicas.get(&range_id).map(|r| r.value().clone());
        if let Some(existing) = &existing {
            if existing.replica_id() == replica_id {
                return Ok(Some(existing.clone()));
            }
        }
        let _creating = self.create_lock.lock().await;
        let existing = self.replicas.get(&range_id).map(|r| r.value().clone());
        if let Some(existing) = existing {
            let current = existing.replica_id();
            if current == replica_id {
                return Ok(Some(existing));
            }
            if current > replica_id {
                return Ok(None);
            }
            info!(%range_id, stale = %current, %replica_id, "replacing stale replica");
            self.remove_replica(&existing, replica_id).await?;
            if self.replicas.contains_key(&range_id) {
                return Ok(None);
            }
        }
        if replica_id < self.tombstone(range_id)? {
            return Ok(None);
        }
        let replica = Replica::new_uninitialized(self.env()?, range_id, replica_id).await?;
        let replica = Arc::new(replica);
        self.replicas.insert(range_id, replica.clone());
        Ok(Some(replica))
    }

    /// Destroy `replica` and forget it, unless replica GC is disabled.
    ///
    /// # Errors
    ///
    /// Propagates engine failures.
    pub(crate) async fn remove_replica(
        &self,
        replica: &Arc<Replica>,
        next_replica_id: ReplicaId,
    ) -> StoreResult<()> {
        if self.cfg.settings.testing_knobs.disable_replica_gc {
            debug!(range_id = %replica.range_id(), "replica gc disabled");
            return Ok(());
        }
        replica.destroy(next_replica_id).await?;
        self.replicas
            .remove_if(&replica.range_id(), |_, current| Arc::ptr_eq(current, replica));
        Ok(())
    }

    /// The initialized replica whose span contains `key`.
    #[must_use]
    pub fn lookup_replica(&self, key: &Key) -> Option<Arc<Replica>> {
        let key = keys::addr(key);
        self.replicas
            .iter()
            .find(|r| r.value().desc().contains_key(&key))
            .map(|r| r.value().clone())
    }

    /// The replica of `range_id`.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::RangeNotFound`] if this store hosts none.
    pub fn get_replica(&self, range_id: RangeId) -> StoreResult<Arc<Replica>> {
        self.replicas
            .get(&range_id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::RangeNotFound(range_id))
    }

    /// Number of replicas hosted.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Raft status of the local replica of `range_id`.
    #[must_use]
    pub fn raft_status(&self, range_id: RangeId) -> Option<RaftStatus> {
        self.replicas.get(&range_id).map(|r| r.value().raft_status())
    }

    /// How far the clock must advance for every lease granted so far to
    /// have expired, in nanoseconds.
    #[must_use]
    pub fn lease_expiration(&self) -> i64 {
        let horizon = self.cfg.settings.range_lease_active_duration + self.cfg.clock.max_offset();
        i64::try_from(horizon.as_nanos().saturating_mul(2)).unwrap_or(i64::MAX)
    }

    /// This store as gossiped to the cluster.
    #[must_use]
    pub fn descriptor(&self) -> StoreDescriptor {
        let now = self.cfg.clock.now();
        let store_id = self.store_id();
        let replicas = self.replica_list();
        let lease_count = replicas
            .iter()
            .filter_map(|r| r.lease())
            .filter(|l| l.owned_by(store_id) && l.covers(now))
            .count();
        StoreDescriptor {
            store_id,
            node: self.node_desc.clone(),
            capacity: StoreCapacity {
                range_count: u32::try_from(replicas.len()).unwrap_or(u32::MAX),
                lease_count: u32::try_from(lease_count).unwrap_or(u32::MAX),
            },
        }
    }

    /// Publish this store's descriptor.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor cannot be encoded.
    pub fn gossip_store(&self) -> StoreResult<()> {
        let desc = self.descriptor();
        self.cfg.gossip.add_info_message(&make_store_key(desc.store_id), &desc)?;
        Ok(())
    }

    fn maybe_gossip_system_config(&self, gossiped: &mut Option<RangeDescriptor>) {
        let Some(replica) = self.lookup_replica(&Key::min()) else {
            return;
        };
        if replica.raft_status().state != ServerState::Leader {
            return;
        }
        let desc = replica.desc();
        if gossiped.as_ref() == Some(&desc) {
            return;
        }
        match self.cfg.gossip.add_info_message(KEY_SYSTEM_CONFIG, &desc) {
            Ok(()) => {
                debug!(store_id = %self.store_id(), "gossiped system config");
                *gossiped = Some(desc);
            }
            Err(err) => warn!(error = %err, "failed to gossip system config"),
        }
    }

    /// Serve a batch. A batch without a range id is routed by its key.
    ///
    /// # Errors
    ///
    /// Fails if no local replica matches, or with the replica's error.
    pub async fn send(&self, ba: BatchRequest) -> KvResult<BatchResponse> {
        let replica = if ba.header.range_id.is_zero() {
            let key = ba.key()?;
            self.lookup_replica(&key)
                .ok_or_else(|| KvError::RangeKeyMismatch {
                    key,
                    range_id: ba.header.range_id,
                })?
        } else {
            self.get_replica(ba.header.range_id)?
        };
        replica.send(ba).await
    }
}

#[async_trait]
impl RaftMessageHandler for Store {
    async fn handle_raft_message(&self, req: RaftMessageRequest) -> RaftMessageResponse {
        let range_id = req.range_id;
        let (from, to) = (req.from_replica, req.to_replica);
        let replica = match self.get_or_create_replica(range_id, to.replica_id).await {
            Ok(Some(replica)) => replica,
            Ok(None) => {
                return RaftMessageResponse::Error(format!(
                    "replica {} of {range_id} is gone from store {}",
                    to.replica_id, to.store_id
                ));
            }
            Err(err) => {
                warn!(%range_id, error = %err, "cannot host replica for raft message");
                return RaftMessageResponse::Error(err.to_string());
            }
        };
        if replica.sender_too_old(&from) {
            debug!(%range_id, %from, "telling removed replica to collect itself");
            return RaftMessageResponse::ReplicaTooOld;
        }
        replica.handle_raft_rpc(req.payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_gossip::Gossip;
    use ranger_hlc::ManualClock;
    use ranger_network::SimNetwork;
    use ranger_storage_memory::InMemEngine;
    use std::time::Duration;

    fn config(network: &SimNetwork, stopper: &Stopper) -> StoreConfig {
        let clock = Arc::new(Clock::new(Arc::new(ManualClock::new(1)), Duration::ZERO));
        let server = network.server();
        let resolver: crate::NodeAddressResolver = Arc::new(|_| None);
        let transport = RaftTransport::new(resolver, &server, network.clone(), stopper).unwrap();
        let gossip = Gossip::new(NodeId::new(1), network.clone(), &server, Vec::new(), stopper);
        let stores = Arc::new(crate::Stores::new(clock.clone()));
        StoreConfig {
            clock,
            transport,
            gossip,
            db: Arc::new(Db::new(stores)),
            settings: StoreSettings::default(),
        }
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn undecodable_identity_is_ignored_with_a_warning() {
        let network = SimNetwork::new();
        let stopper = Stopper::new();
        let engine: Arc<dyn Engine> = Arc::new(InMemEngine::new());
        engine
            .put_raw(&keys::store_ident_key(), bytes::Bytes::from_static(b"\xff\xff"))
            .unwrap();
        let store = Store::new(config(&network, &stopper), engine, NodeDescriptor::default());
        assert_eq!(store.ident(), StoreIdent::default());
        assert!(logs_contain("ignoring undecodable store identity"));
        stopper.stop().await;
    }
}
