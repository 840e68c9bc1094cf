use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ranger_hlc::Clock;
use ranger_kv::Sender;
use ranger_kvpb::{BatchRequest, BatchResponse, KvError, KvResult, StoreId};
use tracing::trace;

use crate::Store;

/// A node's set of stores, routing batches by the store id in their header.
pub struct Stores {
    clock: Arc<Clock>,
    stores: DashMap<StoreId, Arc<Store>>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<StoreId> = self.stores.iter().map(|s| *s.key()).collect();
        ids.sort();
        f.debug_struct("Stores").field("stores", &ids).finish()
    }
}

impl Stores {
    /// An empty set.
    #[must_use]
    pub fn new(clock: Arc<Clock>) -> Self {
        Self {
            clock,
            stores: DashMap::new(),
        }
    }

    /// Add or replace a store.
    pub fn add_store(&self, store: Arc<Store>) {
        self.stores.insert(store.store_id(), store);
    }

    /// Remove the store with `store_id`.
    pub fn remove_store(&self, store_id: StoreId) -> Option<Arc<Store>> {
        self.stores.remove(&store_id).map(|(_, store)| store)
    }

    /// The store with `store_id`.
    ///
    /// # Errors
    ///
    /// Fails with [`KvError::StoreNotFound`] if absent.
    pub fn get_store(&self, store_id: StoreId) -> KvResult<Arc<Store>> {
        self.stores
            .get(&store_id)
            .map(|s| s.value().clone())
            .ok_or(KvError::StoreNotFound(store_id))
    }

    /// Whether `store_id` is present.
    #[must_use]
    pub fn has_store(&self, store_id: StoreId) -> bool {
        self.stores.contains_key(&store_id)
    }

    /// Number of stores.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Call `visitor` on each store in store id order, stopping at the first
    /// error.
    ///
    /// # Errors
    ///
    /// Returns the visitor's first error.
    pub fn visit_stores<E, F>(&self, mut visitor: F) -> Result<(), E>
    where
        F: FnMut(&Arc<Store>) -> Result<(), E>,
    {
        let mut stores: Vec<Arc<Store>> = self.stores.iter().map(|s| s.value().clone()).collect();
        stores.sort_by_key(|s| s.store_id());
        for store in &stores {
            visitor(store)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sender for Stores {
    async fn send(&self, mut batch: BatchRequest) -> KvResult<BatchResponse> {
        let store_id = batch.header.replica.store_id;
        let store = if store_id.is_zero() && self.stores.len() == 1 {
            self.stores
                .iter()
                .next()
                .map(|s| s.value().clone())
                .ok_or(KvError::StoreNotFound(store_id))?
        } else {
            self.get_store(store_id)?
        };
        if batch.header.timestamp.is_zero() {
            batch.header.timestamp = self.clock.now();
        } else {
            self.clock.update(batch.header.timestamp);
        }
        trace!(%store_id, requests = batch.requests.len(), "dispatching to store");
        store.send(batch).await
    }
}
