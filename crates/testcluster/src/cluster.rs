use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use parking_lot::RwLock;
use ranger_gossip::{Gossip, KEY_SYSTEM_CONFIG};
use ranger_hlc::{Clock, ManualClock};
use ranger_kv::{Db, DistSender, DistSenderConfig, RangeDescriptorDb};
use ranger_kvpb::keys;
use ranger_kvpb::{NodeDescriptor, NodeId, StoreId, StoreIdent};
use ranger_network::{Addr, Listener, SimNetwork};
use ranger_storage::Engine;
use ranger_storage_memory::InMemEngine;
use ranger_store::{
    NodeAddressResolver, NodeLiveness, RaftTransport, Store, StoreConfig, StorePool, Stores,
};
use ranger_util::{Stopper, succeeds_soon};
use tracing::{debug, error, info, instrument, warn};

use crate::descriptor::ClusterRangeDescriptorDb;
use crate::transport::SimTransport;
use crate::{ClusterConfig, HarnessError, HarnessResult};

/// An engine together with the controller that closes it at teardown.
struct EngineSlot {
    engine: Arc<dyn Engine>,
    stopper: Stopper,
}

/// Per-node state that outlives stop and restart.
pub(crate) struct NodeSlot {
    pub(crate) ident: StoreIdent,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) gossip: Gossip,
    pub(crate) transport: Arc<RaftTransport>,
    pub(crate) liveness: Arc<NodeLiveness>,
    pub(crate) sender: Arc<Stores>,
    pub(crate) listener: Listener,
    pub(crate) running: Option<RunningNode>,
}

/// Per-node state rebuilt on every restart; absent while stopped.
#[derive(Clone)]
pub(crate) struct RunningNode {
    pub(crate) store: Arc<Store>,
    pub(crate) stopper: Stopper,
    pub(crate) db: Arc<Db>,
    pub(crate) store_pool: Arc<StorePool>,
}

#[derive(Default)]
pub(crate) struct Registry {
    engines: Vec<EngineSlot>,
    pub(crate) slots: Vec<NodeSlot>,
}

pub(crate) struct ClusterInner {
    pub(crate) config: ClusterConfig,
    pub(crate) manual_clock: Arc<ManualClock>,
    pub(crate) clock: Arc<Clock>,
    network: SimNetwork,
    transport_stopper: Stopper,
    /// Never held across an await.
    pub(crate) registry: RwLock<Registry>,
    addresses: Arc<DashMap<NodeId, Addr>>,
    failed: AtomicBool,
}

impl ClusterInner {
    /// Mark the run failed and hand `err` back for propagation.
    pub(crate) fn fail(&self, err: HarnessError) -> HarnessError {
        self.failed.store(true, Ordering::SeqCst);
        error!(error = %err, "cluster harness failure");
        err
    }

    /// Clock of slot `index`.
    pub(crate) fn clock_for(&self, index: usize) -> Arc<Clock> {
        self.config
            .clocks
            .get(index)
            .and_then(Option::as_ref)
            .unwrap_or(&self.clock)
            .clone()
    }

    pub(crate) fn running(&self, index: usize) -> Option<RunningNode> {
        self.registry
            .read()
            .slots
            .get(index)
            .and_then(|slot| slot.running.clone())
    }

    /// Stores of every running node, by slot index.
    pub(crate) fn live_stores(&self) -> Vec<(usize, Arc<Store>)> {
        self.registry
            .read()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.running.as_ref().map(|r| (index, r.store.clone()))
            })
            .collect()
    }

    /// Advance the shared clock far enough that every lease granted so far
    /// has expired.
    pub(crate) fn expire_leases(&self) {
        let store = self
            .registry
            .read()
            .slots
            .iter()
            .find_map(|slot| slot.running.as_ref().map(|r| r.store.clone()));
        let Some(store) = store else {
            warn!("no running store to expire leases against");
            return;
        };
        let nanos = store.lease_expiration();
        let now = self.manual_clock.increment(nanos);
        debug!(by_nanos = nanos, now, "expired leases");
    }
}

/// Slot index of `node_id`.
pub(crate) fn node_index(node_id: NodeId) -> Option<usize> {
    usize::try_from(node_id.value()).ok()?.checked_sub(1)
}

fn ident_for(index: usize) -> StoreIdent {
    let id = u32::try_from(index + 1).unwrap_or(u32::MAX);
    StoreIdent {
        node_id: NodeId::new(id),
        store_id: StoreId::new(id),
    }
}

/// A simulated multi-node cluster.
///
/// Cheap to clone; clones share the same nodes.
#[derive(Clone)]
pub struct ClusterContext {
    pub(crate) inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("nodes", &self.num_nodes())
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}

impl ClusterContext {
    /// An empty cluster. Nodes are added with [`ClusterContext::add_node`].
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        Self::with_engines(config, Vec::new())
    }

    /// An empty cluster whose first slots reuse `engines`. An engine that
    /// already carries a store identity is not bootstrapped again, and
    /// stays open at teardown since the caller owns it.
    #[must_use]
    pub fn with_engines(config: ClusterConfig, engines: Vec<Arc<dyn Engine>>) -> Self {
        let manual_clock = Arc::new(ManualClock::new(config.manual_clock_start));
        let clock = Arc::new(Clock::new(manual_clock.clone(), config.max_offset));
        let registry = Registry {
            engines: engines
                .into_iter()
                .map(|engine| EngineSlot {
                    engine,
                    stopper: Stopper::new(),
                })
                .collect(),
            slots: Vec::new(),
        };
        Self {
            inner: Arc::new(ClusterInner {
                config,
                manual_clock,
                clock,
                network: SimNetwork::new(),
                transport_stopper: Stopper::new(),
                registry: RwLock::new(registry),
                addresses: Arc::new(DashMap::new()),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Build a cluster of `num_nodes` nodes and wait until every node has
    /// received the system config through gossip.
    ///
    /// # Errors
    ///
    /// Fails if any node cannot be added or gossip does not converge.
    pub async fn start(config: ClusterConfig, num_nodes: usize) -> HarnessResult<Self> {
        let cluster = Self::new(config);
        cluster.start_nodes(num_nodes).await?;
        Ok(cluster)
    }

    /// Add `num_nodes` nodes, then wait for the system config to reach all
    /// of them.
    ///
    /// # Errors
    ///
    /// Fails if any node cannot be added or gossip does not converge.
    pub async fn start_nodes(&self, num_nodes: usize) -> HarnessResult<()> {
        for _ in 0..num_nodes {
            self.add_node().await?;
        }
        self.wait_for_system_config().await
    }

    async fn wait_for_system_config(&self) -> HarnessResult<()> {
        let timeout = self.inner.config.succeeds_soon_timeout;
        succeeds_soon(timeout, || {
            let missing = self
                .gossips()
                .iter()
                .find(|g| g.get_info(KEY_SYSTEM_CONFIG).is_none())
                .map(Gossip::node_id);
            std::future::ready(match missing {
                Some(node_id) => Err(format!(
                    "node {node_id} has not received the system config"
                )),
                None => Ok(()),
            })
        })
        .await
        .map_err(|err| self.inner.fail(err.into()))
    }

    /// Add the next node and return its slot index. The first node added
    /// bootstraps the first range.
    ///
    /// # Errors
    ///
    /// Any failure is fatal: bootstrap errors, a duplicate node address, or
    /// a store that fails to start.
    #[instrument(level = "debug", skip(self))]
    pub async fn add_node(&self) -> HarnessResult<usize> {
        self.add_node_inner().await.map_err(|err| self.inner.fail(err))
    }

    async fn add_node_inner(&self) -> HarnessResult<usize> {
        let inner = &self.inner;
        let index = inner.registry.read().slots.len();
        let ident = ident_for(index);

        let (engine, need_bootstrap) = {
            let mut registry = inner.registry.write();
            if let Some(slot) = registry.engines.get(index) {
                let bootstrapped = slot.engine.get_raw(&keys::store_ident_key())?.is_some();
                (slot.engine.clone(), !bootstrapped)
            } else {
                let engine: Arc<dyn Engine> = Arc::new(InMemEngine::new());
                let stopper = Stopper::new();
                let closing = engine.clone();
                stopper.add_closer(move || closing.close());
                registry.engines.push(EngineSlot {
                    engine: engine.clone(),
                    stopper,
                });
                (engine, true)
            }
        };

        let server = inner.network.server();
        let addresses = inner.addresses.clone();
        let resolver: NodeAddressResolver = Arc::new(move |node_id: NodeId| -> Option<Addr> {
            addresses.get(&node_id).map(|a| a.clone())
        });
        let transport = RaftTransport::new(
            resolver,
            &server,
            inner.network.clone(),
            &inner.transport_stopper,
        )?;

        // Every node only knows node 1, which bounds how long gossip takes
        // to connect the cluster.
        let resolvers: Vec<Addr> = inner
            .addresses
            .get(&NodeId::new(1))
            .map(|addr| vec![addr.clone()])
            .unwrap_or_default();
        let gossip = Gossip::new(
            ident.node_id,
            inner.network.clone(),
            &server,
            resolvers,
            &inner.transport_stopper,
        );

        let listener = inner.network.listen(&server)?;
        let addr = listener.addr().clone();
        let node_desc = NodeDescriptor {
            node_id: ident.node_id,
            address: addr.to_string(),
        };

        let stopper = Stopper::new();
        let clock = inner.clock_for(index);
        let settings = &inner.config.store_settings;
        let liveness = Arc::new(NodeLiveness::new(
            clock.clone(),
            gossip.clone(),
            settings.liveness_duration,
            settings.liveness_heartbeat_interval,
        ));
        let store_pool = Arc::new(StorePool::new(gossip.clone(), liveness.clone()));
        let db = self.make_db(&clock, &stopper);
        let sender = Arc::new(Stores::new(clock.clone()));
        let store = Store::new(
            self.store_config(clock, &transport, &gossip, db.clone()),
            engine.clone(),
            node_desc.clone(),
        );

        if need_bootstrap {
            store
                .bootstrap(ident)
                .map_err(|source| HarnessError::Bootstrap { index, source })?;
            if index == 0 {
                store
                    .bootstrap_range(&[])
                    .map_err(|source| HarnessError::Bootstrap { index, source })?;
            }
        }

        match inner.addresses.entry(ident.node_id) {
            Entry::Occupied(_) => {
                return Err(HarnessError::DuplicateNodeAddress(ident.node_id));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(addr.clone());
            }
        }

        // Registered before start so range lookups issued while the store
        // starts can already reach it.
        sender.add_store(store.clone());
        inner.registry.write().slots.push(NodeSlot {
            ident,
            engine,
            gossip: gossip.clone(),
            transport,
            liveness: liveness.clone(),
            sender,
            listener,
            running: Some(RunningNode {
                store: store.clone(),
                stopper: stopper.clone(),
                db,
                store_pool,
            }),
        });

        inner.network.dial(&addr)?;
        gossip.start(addr.clone())?;
        store.start(&stopper).await?;
        gossip.set_node_descriptor(&node_desc)?;
        store.wait_for_init().await;
        liveness.start_heartbeat(&stopper)?;
        info!(node_index = index, node_id = %ident.node_id, %addr, "added node");
        Ok(index)
    }

    fn make_db(&self, clock: &Arc<Clock>, stopper: &Stopper) -> Arc<Db> {
        let weak = Arc::downgrade(&self.inner);
        let range_db: Arc<dyn RangeDescriptorDb> =
            Arc::new(ClusterRangeDescriptorDb::new(weak.clone()));
        let mut config =
            DistSenderConfig::new(clock.clone(), range_db, SimTransport::factory(weak));
        config.closer = Some(stopper.should_quiesce());
        Arc::new(Db::new(Arc::new(DistSender::new(config))))
    }

    fn store_config(
        &self,
        clock: Arc<Clock>,
        transport: &Arc<RaftTransport>,
        gossip: &Gossip,
        db: Arc<Db>,
    ) -> StoreConfig {
        StoreConfig {
            clock,
            transport: transport.clone(),
            gossip: gossip.clone(),
            db,
            settings: self.inner.config.store_settings.clone(),
        }
    }

    /// Stop node `index`, draining all of its background work, then remove
    /// its store from its routing handle. Its engine, gossip and transport
    /// endpoint survive for a later [`ClusterContext::restart_node`].
    ///
    /// # Errors
    ///
    /// Fails if the slot does not exist or is already stopped.
    #[instrument(level = "debug", skip(self))]
    pub async fn stop_node(&self, index: usize) -> HarnessResult<()> {
        // Snapshot only. An in-flight request may hold a read lock while it
        // waits on raft, so the stopper must drain outside the lock.
        let stopper = {
            let registry = self.inner.registry.read();
            let slot = registry
                .slots
                .get(index)
                .ok_or(HarnessError::NoSuchNode(index))?;
            slot.running
                .as_ref()
                .map(|r| r.stopper.clone())
                .ok_or(HarnessError::NodeNotRunning(index))?
        };
        stopper.stop().await;
        let mut registry = self.inner.registry.write();
        if let Some(slot) = registry.slots.get_mut(index) {
            if let Some(running) = slot.running.take() {
                slot.sender.remove_store(running.store.store_id());
            }
        }
        info!(node_index = index, "stopped node");
        Ok(())
    }

    /// Start a fresh store for slot `index` over its existing engine.
    ///
    /// # Errors
    ///
    /// Fails if the slot does not exist, is running, or its store fails to
    /// start.
    #[instrument(level = "debug", skip(self))]
    pub async fn restart_node(&self, index: usize) -> HarnessResult<()> {
        self.restart_node_inner(index).await.map_err(|err| self.inner.fail(err))
    }

    async fn restart_node_inner(&self, index: usize) -> HarnessResult<()> {
        let (engine, ident, gossip, transport, liveness, sender, addr) = {
            let registry = self.inner.registry.read();
            let slot = registry
                .slots
                .get(index)
                .ok_or(HarnessError::NoSuchNode(index))?;
            if slot.running.is_some() {
                return Err(HarnessError::NodeAlreadyRunning(index));
            }
            (
                slot.engine.clone(),
                slot.ident,
                slot.gossip.clone(),
                slot.transport.clone(),
                slot.liveness.clone(),
                slot.sender.clone(),
                slot.listener.addr().clone(),
            )
        };

        let stopper = Stopper::new();
        let clock = self.inner.clock_for(index);
        let store_pool = Arc::new(StorePool::new(gossip.clone(), liveness.clone()));
        let db = self.make_db(&clock, &stopper);
        let node_desc = NodeDescriptor {
            node_id: ident.node_id,
            address: addr.to_string(),
        };
        let config = self.store_config(clock, &transport, &gossip, db.clone());
        let store = Store::new(config, engine, node_desc);
        if let Err(err) = store.start(&stopper).await {
            stopper.stop().await;
            return Err(err.into());
        }
        sender.add_store(store.clone());
        liveness.start_heartbeat(&stopper)?;

        let mut registry = self.inner.registry.write();
        let slot = registry
            .slots
            .get_mut(index)
            .ok_or(HarnessError::NoSuchNode(index))?;
        slot.running = Some(RunningNode {
            store,
            stopper,
            db,
            store_pool,
        });
        info!(node_index = index, "restarted node");
        Ok(())
    }

    /// Stop every running node, then restart every node.
    ///
    /// # Errors
    ///
    /// Fails if any node fails to restart.
    pub async fn restart(&self) -> HarnessResult<()> {
        let num_nodes = self.num_nodes();
        for index in 0..num_nodes {
            if self.inner.running(index).is_some() {
                self.stop_node(index).await?;
            }
        }
        for index in 0..num_nodes {
            self.restart_node(index).await?;
        }
        Ok(())
    }

    /// Tear the whole cluster down: quiesce every running node in parallel,
    /// stop them, stop the shared network layer, then close the engines.
    ///
    /// # Panics
    ///
    /// Panics if teardown exceeds the configured shutdown timeout on a run
    /// that has not otherwise failed.
    pub async fn stop(&self) {
        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.shutdown()).await.is_ok() {
            return;
        }
        // Deliberately asymmetric: a hung teardown after an earlier failure
        // is only reported, so that failure stays the one surfaced, while a
        // hung teardown on a passing run aborts it.
        if self.is_failed() || std::thread::panicking() {
            error!(?timeout, "timed out stopping a cluster that had already failed");
            return;
        }
        panic!("timed out after {timeout:?} stopping cluster");
    }

    async fn shutdown(&self) {
        let stoppers: Vec<Stopper> = self
            .inner
            .registry
            .read()
            .slots
            .iter()
            .filter_map(|slot| slot.running.as_ref().map(|r| r.stopper.clone()))
            .collect();
        join_all(stoppers.iter().map(Stopper::quiesce)).await;
        join_all(stoppers.iter().map(Stopper::stop)).await;
        {
            let mut registry = self.inner.registry.write();
            for slot in &mut registry.slots {
                if let Some(running) = slot.running.take() {
                    slot.sender.remove_store(running.store.store_id());
                }
            }
        }
        self.inner.transport_stopper.stop().await;
        self.inner.network.stop();
        let engine_stoppers: Vec<Stopper> = self
            .inner
            .registry
            .read()
            .engines
            .iter()
            .map(|slot| slot.stopper.clone())
            .collect();
        join_all(engine_stoppers.iter().map(Stopper::stop)).await;
        info!(nodes = self.num_nodes(), "cluster stopped");
    }

    /// Force every lease in the cluster to expire by advancing the shared
    /// clock past the lease horizon of a running store.
    pub fn expire_leases(&self) {
        self.inner.expire_leases();
    }

    /// Whether a fatal harness condition was hit.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Number of slots, running or not.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.inner.registry.read().slots.len()
    }

    /// The shared hybrid clock.
    #[must_use]
    pub fn clock(&self) -> Arc<Clock> {
        self.inner.clock.clone()
    }

    /// Clock node `index` runs on: its entry in [`ClusterConfig::clocks`],
    /// or the shared clock.
    #[must_use]
    pub fn clock_of(&self, index: usize) -> Arc<Clock> {
        self.inner.clock_for(index)
    }

    /// The manual clock backing [`ClusterContext::clock`].
    #[must_use]
    pub fn manual_clock(&self) -> Arc<ManualClock> {
        self.inner.manual_clock.clone()
    }

    /// Store of node `index`, if running.
    #[must_use]
    pub fn store(&self, index: usize) -> Option<Arc<Store>> {
        self.inner.running(index).map(|r| r.store)
    }

    /// Client of node `index`, if running.
    #[must_use]
    pub fn db(&self, index: usize) -> Option<Arc<Db>> {
        self.inner.running(index).map(|r| r.db)
    }

    /// Store pool of node `index`, if running.
    #[must_use]
    pub fn store_pool(&self, index: usize) -> Option<Arc<StorePool>> {
        self.inner.running(index).map(|r| r.store_pool)
    }

    /// Engine of node `index`, whether or not it is running.
    #[must_use]
    pub fn engine(&self, index: usize) -> Option<Arc<dyn Engine>> {
        self.inner.registry.read().slots.get(index).map(|s| s.engine.clone())
    }

    /// Gossip handle of node `index`.
    #[must_use]
    pub fn gossip(&self, index: usize) -> Option<Gossip> {
        self.inner.registry.read().slots.get(index).map(|s| s.gossip.clone())
    }

    /// Routing handle of node `index`.
    #[must_use]
    pub fn sender(&self, index: usize) -> Option<Arc<Stores>> {
        self.inner.registry.read().slots.get(index).map(|s| s.sender.clone())
    }

    /// Identity of node `index`.
    #[must_use]
    pub fn ident(&self, index: usize) -> Option<StoreIdent> {
        self.inner.registry.read().slots.get(index).map(|s| s.ident)
    }

    /// Registered address of node `index`.
    #[must_use]
    pub fn addr(&self, index: usize) -> Option<Addr> {
        self.inner.registry.read().slots.get(index).map(|s| s.listener.addr().clone())
    }

    pub(crate) fn running_node(&self, index: usize) -> HarnessResult<RunningNode> {
        if index >= self.num_nodes() {
            return Err(HarnessError::NoSuchNode(index));
        }
        self.inner.running(index).ok_or(HarnessError::NodeNotRunning(index))
    }

    /// Gossip handles of every slot.
    pub(crate) fn gossips(&self) -> Vec<Gossip> {
        self.inner.registry.read().slots.iter().map(|s| s.gossip.clone()).collect()
    }

    pub(crate) fn fail_with<E: Into<HarnessError>>(&self, err: E) -> HarnessError {
        self.inner.fail(err.into())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn quick_teardown() -> ClusterConfig {
        ClusterConfig {
            shutdown_timeout: Duration::from_millis(200),
            ..ClusterConfig::default()
        }
    }

    /// Park a task on node `index` that never returns, even once quiesced.
    fn wedge(cluster: &ClusterContext, index: usize) {
        let running = cluster.inner.running(index).unwrap();
        running
            .stopper
            .run_async_task("wedged", std::future::pending::<()>())
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[should_panic(expected = "stopping cluster")]
    async fn hung_teardown_of_a_passing_run_panics() {
        let cluster = ClusterContext::start(quick_teardown(), 1).await.unwrap();
        wedge(&cluster, 0);
        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[tracing_test::traced_test]
    async fn hung_teardown_of_a_failed_run_is_only_logged() {
        let cluster = ClusterContext::start(quick_teardown(), 1).await.unwrap();
        let _ = cluster.fail_with(HarnessError::NoSuchNode(9));
        assert!(cluster.is_failed());
        wedge(&cluster, 0);
        cluster.stop().await;
        assert!(logs_contain("timed out stopping a cluster that had already failed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn taken_node_address_fails_the_run() {
        let cluster = ClusterContext::new(ClusterConfig::default());
        let squatter = cluster.inner.network.server();
        let addr = cluster.inner.network.listen(&squatter).unwrap().addr().clone();
        cluster.inner.addresses.insert(NodeId::new(1), addr);

        let err = cluster.add_node().await.unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateNodeAddress(id) if id == NodeId::new(1)));
        assert!(cluster.is_failed());
        assert_eq!(cluster.num_nodes(), 0);
        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slots_fall_back_to_the_shared_clock() {
        let manual = Arc::new(ManualClock::new(1_000_000));
        let own = Arc::new(Clock::new(manual, Duration::from_millis(50)));
        let config = ClusterConfig {
            clocks: vec![Some(own.clone()), None],
            ..ClusterConfig::default()
        };
        let cluster = ClusterContext::new(config);
        assert!(Arc::ptr_eq(&cluster.clock_of(0), &own));
        assert!(Arc::ptr_eq(&cluster.clock_of(1), &cluster.clock()));
        assert!(Arc::ptr_eq(&cluster.clock_of(2), &cluster.clock()));
        cluster.stop().await;
    }
}
