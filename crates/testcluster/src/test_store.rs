use std::sync::Arc;

use ranger_gossip::Gossip;
use ranger_hlc::{Clock, ManualClock};
use ranger_kv::{Db, DistSender, DistSenderConfig, RangeDescriptorDb, sender_transport_factory};
use ranger_kvpb::{
    Key, KvError, KvResult, NodeDescriptor, NodeId, RangeDescriptor, StoreId, StoreIdent,
};
use ranger_network::{Addr, SimNetwork};
use ranger_storage::Engine;
use ranger_storage_memory::InMemEngine;
use ranger_store::{
    FIRST_RANGE_ID, NodeAddressResolver, NodeLiveness, RaftTransport, Store, StoreConfig, Stores,
};
use ranger_util::Stopper;
use tracing::info;

use crate::{ClusterConfig, HarnessError, HarnessResult};

/// A single bootstrapped store with a client routed straight into it.
pub struct TestStore {
    /// The store.
    pub store: Arc<Store>,
    /// Client whose requests reach the store without the simulated
    /// transport.
    pub db: Arc<Db>,
    /// Routing handle holding the store.
    pub stores: Arc<Stores>,
    /// The store's engine.
    pub engine: Arc<dyn Engine>,
    /// Manual clock backing `clock`.
    pub manual_clock: Arc<ManualClock>,
    /// Shared hybrid clock.
    pub clock: Arc<Clock>,
    stopper: Stopper,
    transport_stopper: Stopper,
    network: SimNetwork,
}

impl std::fmt::Debug for TestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStore")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl TestStore {
    /// The store's lifecycle controller.
    #[must_use]
    pub const fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    /// Stop the store, then its network.
    pub async fn stop(&self) {
        self.stopper.stop().await;
        self.transport_stopper.stop().await;
        self.network.stop();
        self.engine.close();
    }
}

/// Looks up the first range in a single node's stores.
struct StoresRangeDescriptorDb {
    stores: Arc<Stores>,
}

impl RangeDescriptorDb for StoresRangeDescriptorDb {
    fn first_range(&self) -> KvResult<RangeDescriptor> {
        let mut found = None;
        self.stores.visit_stores(|store| {
            if found.is_none() {
                found = store.lookup_replica(&Key::min()).map(|r| r.desc());
            }
            Ok::<(), KvError>(())
        })?;
        found.ok_or(KvError::RangeNotFound(FIRST_RANGE_ID))
    }
}

/// Bootstrap and start a single store holding the whole key space.
///
/// # Errors
///
/// Fails if the store cannot be bootstrapped or started.
pub async fn create_test_store(config: &ClusterConfig) -> HarnessResult<TestStore> {
    let ident = StoreIdent {
        node_id: NodeId::new(1),
        store_id: StoreId::new(1),
    };
    let manual_clock = Arc::new(ManualClock::new(config.manual_clock_start));
    let clock = Arc::new(Clock::new(manual_clock.clone(), config.max_offset));
    let network = SimNetwork::new();
    let server = network.server();
    let listener = network.listen(&server)?;
    let addr = listener.addr().clone();
    let transport_stopper = Stopper::new();

    let own = addr.clone();
    let resolver: NodeAddressResolver =
        Arc::new(move |_: NodeId| -> Option<Addr> { Some(own.clone()) });
    let transport = RaftTransport::new(resolver, &server, network.clone(), &transport_stopper)?;
    let gossip = Gossip::new(
        ident.node_id,
        network.clone(),
        &server,
        vec![addr.clone()],
        &transport_stopper,
    );
    gossip.start(addr.clone())?;

    let stores = Arc::new(Stores::new(clock.clone()));
    let range_db: Arc<dyn RangeDescriptorDb> = Arc::new(StoresRangeDescriptorDb {
        stores: stores.clone(),
    });
    let stopper = Stopper::new();
    let mut sender_config = DistSenderConfig::new(
        clock.clone(),
        range_db,
        sender_transport_factory(stores.clone()),
    );
    sender_config.closer = Some(stopper.should_quiesce());
    let db = Arc::new(Db::new(Arc::new(DistSender::new(sender_config))));

    let engine: Arc<dyn Engine> = Arc::new(InMemEngine::new());
    let settings = config.store_settings.clone();
    let liveness = Arc::new(NodeLiveness::new(
        clock.clone(),
        gossip.clone(),
        settings.liveness_duration,
        settings.liveness_heartbeat_interval,
    ));
    let store = Store::new(
        StoreConfig {
            clock: clock.clone(),
            transport,
            gossip: gossip.clone(),
            db: db.clone(),
            settings,
        },
        engine.clone(),
        NodeDescriptor {
            node_id: ident.node_id,
            address: addr.to_string(),
        },
    );
    store
        .bootstrap(ident)
        .and_then(|()| store.bootstrap_range(&[]))
        .map_err(|source| HarnessError::Bootstrap { index: 0, source })?;
    stores.add_store(store.clone());
    store.start(&stopper).await?;
    store.wait_for_init().await;
    liveness.start_heartbeat(&stopper)?;
    info!(%addr, "test store started");

    Ok(TestStore {
        store,
        db,
        stores,
        engine,
        manual_clock,
        clock,
        stopper,
        transport_stopper,
        network,
    })
}
