use std::sync::Arc;

use ranger_kvpb::keys;
use ranger_kvpb::{ChangeReplicasType, Key, RangeDescriptor, RangeId, ReplicaDescriptor, ReplicaId};
use ranger_store::Replica;
use ranger_util::succeeds_soon;
use tracing::{info, instrument};

use crate::{ClusterContext, HarnessError, HarnessResult};

impl ClusterContext {
    /// Add a replica of `range_id` on each node in `dests`, in order, then
    /// wait until every destination's own replica reports the replica id it
    /// was assigned and a span covering the range's start key.
    ///
    /// # Errors
    ///
    /// Fails on any descriptor read or membership change error, or if a
    /// destination does not catch up in time. Nothing is retried.
    #[instrument(level = "debug", skip(self))]
    pub async fn replicate_range(&self, range_id: RangeId, dests: &[usize]) -> HarnessResult<()> {
        self.replicate_range_inner(range_id, dests)
            .await
            .map_err(|err| self.fail_with(err))
    }

    async fn replicate_range_inner(&self, range_id: RangeId, dests: &[usize]) -> HarnessResult<()> {
        let start_key = self.find_start_key(range_id)?;
        let mut expected = Vec::with_capacity(dests.len());
        for &dest in dests {
            // Read through the cluster rather than from a local copy, so the
            // changes made for earlier destinations are visible.
            let desc = self.read_descriptor(dest, range_id, &start_key).await?;
            let replica = self.find_member_replica(&desc)?;
            replica
                .change_replicas(ChangeReplicasType::AddReplica, self.replica_target(dest)?, &desc)
                .await?;
            info!(
                %range_id,
                node_index = dest,
                replica_id = %desc.next_replica_id,
                "added replica"
            );
            expected.push((dest, desc.next_replica_id));
        }

        let timeout = self.inner.config.succeeds_soon_timeout;
        succeeds_soon(timeout, || {
            std::future::ready(self.check_replicas_caught_up(range_id, &start_key, &expected))
        })
        .await?;
        Ok(())
    }

    fn check_replicas_caught_up(
        &self,
        range_id: RangeId,
        start_key: &Key,
        expected: &[(usize, ReplicaId)],
    ) -> Result<(), String> {
        for &(dest, replica_id) in expected {
            let store = self.store(dest).ok_or_else(|| format!("node {dest} is not running"))?;
            let replica = store
                .get_replica(range_id)
                .map_err(|err| format!("node {dest}: {err}"))?;
            if replica.replica_id() != replica_id {
                return Err(format!(
                    "node {dest}: replica id {} of range {range_id}, expected {replica_id}",
                    replica.replica_id()
                ));
            }
            if !replica.desc().contains_key(start_key) {
                return Err(format!("node {dest}: range {range_id} does not cover {start_key} yet"));
            }
        }
        Ok(())
    }

    /// Remove the replica of `range_id` on node `dest`. The base descriptor
    /// is always read through node 0.
    ///
    /// # Errors
    ///
    /// Fails on any descriptor read or membership change error.
    #[instrument(level = "debug", skip(self))]
    pub async fn unreplicate_range(&self, range_id: RangeId, dest: usize) -> HarnessResult<()> {
        self.unreplicate_range_inner(range_id, dest)
            .await
            .map_err(|err| self.fail_with(err))
    }

    async fn unreplicate_range_inner(&self, range_id: RangeId, dest: usize) -> HarnessResult<()> {
        let start_key = self.find_start_key(range_id)?;
        let desc = self.read_descriptor(0, range_id, &start_key).await?;
        let replica = self.find_member_replica(&desc)?;
        replica
            .change_replicas(ChangeReplicasType::RemoveReplica, self.replica_target(dest)?, &desc)
            .await?;
        info!(%range_id, node_index = dest, "removed replica");
        Ok(())
    }

    async fn read_descriptor(
        &self,
        via: usize,
        range_id: RangeId,
        start_key: &Key,
    ) -> HarnessResult<RangeDescriptor> {
        let db = self.running_node(via)?.db;
        db.get_message::<RangeDescriptor>(keys::range_descriptor_key(start_key))
            .await?
            .ok_or(HarnessError::DescriptorMissing(range_id))
    }

    /// Start key of `range_id` as known to any running store.
    fn find_start_key(&self, range_id: RangeId) -> HarnessResult<Key> {
        self.inner
            .live_stores()
            .into_iter()
            .find_map(|(_, store)| store.get_replica(range_id).ok())
            .map(|replica| replica.desc().start_key)
            .ok_or(HarnessError::NoLiveMember(range_id))
    }

    /// A replica of the range on any running store that `desc` lists as a
    /// member.
    fn find_member_replica(&self, desc: &RangeDescriptor) -> HarnessResult<Arc<Replica>> {
        self.inner
            .live_stores()
            .into_iter()
            .filter(|(_, store)| desc.find_replica(store.store_id()).is_some())
            .find_map(|(_, store)| store.get_replica(desc.range_id).ok())
            .ok_or(HarnessError::NoLiveMember(desc.range_id))
    }

    fn replica_target(&self, index: usize) -> HarnessResult<ReplicaDescriptor> {
        let ident = self.ident(index).ok_or(HarnessError::NoSuchNode(index))?;
        Ok(ReplicaDescriptor {
            node_id: ident.node_id,
            store_id: ident.store_id,
            replica_id: ReplicaId::default(),
        })
    }
}
