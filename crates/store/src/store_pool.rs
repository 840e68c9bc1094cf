use std::sync::Arc;

use ranger_gossip::{Gossip, KEY_STORE_PREFIX};
use ranger_kvpb::{StoreDescriptor, StoreId};
use tracing::debug;

use crate::NodeLiveness;

/// Gossip-backed view of every store in the cluster.
#[derive(Debug, Clone)]
pub struct StorePool {
    gossip: Gossip,
    liveness: Arc<NodeLiveness>,
}

impl StorePool {
    /// Pool reading store descriptors from `gossip`.
    #[must_use]
    pub const fn new(gossip: Gossip, liveness: Arc<NodeLiveness>) -> Self {
        Self { gossip, liveness }
    }

    /// Every gossiped store descriptor ordered by store id, and how many of
    /// them live on a node with a current liveness record.
    #[must_use]
    pub fn get_store_list(&self) -> (Vec<StoreDescriptor>, usize) {
        let mut stores: Vec<StoreDescriptor> = self
            .gossip
            .infos_with_prefix(KEY_STORE_PREFIX)
            .into_iter()
            .filter_map(|(key, info)| match ciborium::from_reader(info.value.as_ref()) {
                Ok(desc) => Some(desc),
                Err(err) => {
                    debug!(key, error = %err, "skipping undecodable store descriptor");
                    None
                }
            })
            .collect();
        stores.sort_by_key(|s: &StoreDescriptor| s.store_id);
        let alive = stores
            .iter()
            .filter(|s| self.liveness.is_live(s.node.node_id))
            .count();
        (stores, alive)
    }

    /// Gossiped descriptor of `store_id`.
    #[must_use]
    pub fn get_store_descriptor(&self, store_id: StoreId) -> Option<StoreDescriptor> {
        self.gossip
            .get_info_message(&ranger_gossip::make_store_key(store_id))
            .ok()
    }
}
