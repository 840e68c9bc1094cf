use std::cmp::Ordering;
use std::convert::Infallible;
use std::sync::{Arc, Weak};

use ranger_kv::RangeDescriptorDb;
use ranger_kvpb::{Key, KvError, KvResult, RangeDescriptor};
use ranger_store::Stores;
use tracing::trace;

use crate::cluster::ClusterInner;
use crate::{ClusterContext, HarnessError, HarnessResult};

/// Order two snapshots of the same range from older to newer.
///
/// A larger `next_replica_id` is always newer. With equal ids the snapshot
/// with fewer replicas is newer, since a removal does not bump the counter.
#[must_use]
pub fn cmp_by_age(a: &RangeDescriptor, b: &RangeDescriptor) -> Ordering {
    a.next_replica_id
        .cmp(&b.next_replica_id)
        .then_with(|| b.replicas.len().cmp(&a.replicas.len()))
}

/// Sort snapshots oldest first.
pub fn sort_by_age(descs: &mut [RangeDescriptor]) {
    descs.sort_by(cmp_by_age);
}

impl ClusterInner {
    /// The newest snapshot of the first range held by any store.
    pub(crate) fn first_range(&self) -> HarnessResult<RangeDescriptor> {
        let senders: Vec<Arc<Stores>> = self
            .registry
            .read()
            .slots
            .iter()
            .map(|s| s.sender.clone())
            .collect();
        let mut descs = Vec::new();
        for sender in &senders {
            let visited = sender.visit_stores(|store| -> Result<(), Infallible> {
                if let Some(replica) = store.lookup_replica(&Key::min()) {
                    descs.push(replica.desc());
                }
                Ok(())
            });
            if let Err(never) = visited {
                match never {}
            }
        }
        trace!(snapshots = descs.len(), "collected first range snapshots");
        descs
            .into_iter()
            .max_by(cmp_by_age)
            .ok_or_else(|| self.fail(HarnessError::FirstRangeMissing))
    }
}

impl ClusterContext {
    /// The newest snapshot of the first range held by any store.
    ///
    /// # Errors
    ///
    /// Fails with [`HarnessError::FirstRangeMissing`] if no store holds one.
    pub fn first_range(&self) -> HarnessResult<RangeDescriptor> {
        self.inner.first_range()
    }
}

/// Range lookups answered from the cluster's own stores.
pub(crate) struct ClusterRangeDescriptorDb {
    cluster: Weak<ClusterInner>,
}

impl ClusterRangeDescriptorDb {
    pub(crate) const fn new(cluster: Weak<ClusterInner>) -> Self {
        Self { cluster }
    }
}

impl RangeDescriptorDb for ClusterRangeDescriptorDb {
    fn first_range(&self) -> KvResult<RangeDescriptor> {
        let cluster = self
            .cluster
            .upgrade()
            .ok_or_else(|| KvError::NodeUnavailable("cluster is gone".to_string()))?;
        cluster.first_range().map_err(|err| KvError::Internal(err.to_string()))
    }
}
