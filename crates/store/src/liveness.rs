use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ranger_gossip::{Gossip, make_node_liveness_key};
use ranger_hlc::{Clock, Timestamp};
use ranger_kvpb::NodeId;
use ranger_util::Stopper;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::StoreResult;

/// A node's claim to be alive until `expiration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    /// Node the record belongs to.
    pub node_id: NodeId,
    /// Incremented each time the node starts heartbeating.
    pub epoch: u64,
    /// First instant the record no longer vouches for the node.
    pub expiration: Timestamp,
}

impl Liveness {
    /// Whether the record is current at `now`.
    #[must_use]
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expiration
    }
}

/// Publishes this node's liveness through gossip and answers liveness
/// queries about any node.
#[derive(Debug)]
pub struct NodeLiveness {
    clock: Arc<Clock>,
    gossip: Gossip,
    liveness_duration: Duration,
    heartbeat_interval: Duration,
    epoch: AtomicU64,
}

impl NodeLiveness {
    /// Create a liveness tracker for the node `gossip` belongs to.
    #[must_use]
    pub const fn new(
        clock: Arc<Clock>,
        gossip: Gossip,
        liveness_duration: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            clock,
            gossip,
            liveness_duration,
            heartbeat_interval,
            epoch: AtomicU64::new(0),
        }
    }

    /// Heartbeat immediately, then on every interval until `stopper`
    /// quiesces. Each call starts a new epoch.
    ///
    /// # Errors
    ///
    /// Fails if the stopper is quiescing.
    pub fn start_heartbeat(self: &Arc<Self>, stopper: &Stopper) -> StoreResult<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.heartbeat(epoch);
        let liveness = self.clone();
        stopper.run_worker("liveness-heartbeat", move |quiesce| async move {
            let mut interval = tokio::time::interval(liveness.heartbeat_interval);
            loop {
                tokio::select! {
                    () = quiesce.cancelled() => break,
                    _ = interval.tick() => liveness.heartbeat(epoch),
                }
            }
            debug!(node_id = %liveness.gossip.node_id(), epoch, "liveness heartbeat stopped");
        })?;
        Ok(())
    }

    fn heartbeat(&self, epoch: u64) {
        let record = Liveness {
            node_id: self.gossip.node_id(),
            epoch,
            expiration: self.clock.now().add_duration(self.liveness_duration),
        };
        if let Err(err) = self
            .gossip
            .add_info_message(&make_node_liveness_key(record.node_id), &record)
        {
            warn!(node_id = %record.node_id, error = %err, "failed to gossip liveness");
        }
    }

    /// Last liveness record gossiped for `node_id`.
    ///
    /// # Errors
    ///
    /// Fails if no record has been received.
    pub fn get_liveness(&self, node_id: NodeId) -> StoreResult<Liveness> {
        Ok(self.gossip.get_info_message(&make_node_liveness_key(node_id))?)
    }

    /// Whether `node_id` has a current liveness record.
    #[must_use]
    pub fn is_live(&self, node_id: NodeId) -> bool {
        let now = self.clock.now();
        self.get_liveness(node_id).is_ok_and(|l| l.is_live(now))
    }
}
