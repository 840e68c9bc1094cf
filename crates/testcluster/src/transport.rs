use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use ranger_kv::{BatchCall, ReplicaSlice, SendOptions, Sender, Transport, TransportFactory};
use ranger_kvpb::{BatchRequest, KvError, KvResult, ReplicaDescriptor};
use ranger_store::Stores;
use ranger_util::Stopper;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cluster::{ClusterInner, node_index};

/// Replica transport that dispatches each attempt directly into the
/// destination node's stores.
///
/// An attempt against a stopped node fails immediately as unavailable. A
/// live attempt runs on the destination's own stopper, so stopping that
/// node while the attempt is in flight cancels it instead of leaving the
/// caller waiting.
pub(crate) struct SimTransport {
    cluster: Weak<ClusterInner>,
    replicas: VecDeque<ReplicaDescriptor>,
    batch: BatchRequest,
    cancel: CancellationToken,
}

impl SimTransport {
    pub(crate) fn factory(cluster: Weak<ClusterInner>) -> TransportFactory {
        Arc::new(
            move |_opts: SendOptions,
                  replicas: ReplicaSlice,
                  batch: BatchRequest|
                  -> KvResult<Box<dyn Transport>> {
                Ok(Box::new(Self {
                    cluster: cluster.clone(),
                    replicas: replicas.into(),
                    batch,
                    cancel: CancellationToken::new(),
                }))
            },
        )
    }
}

impl ClusterInner {
    /// Stopper and routing handle of node `index`, snapshotted under one
    /// read lock. `None` while the node is stopped.
    fn dispatch_target(&self, index: usize) -> Option<(Stopper, Arc<Stores>)> {
        let registry = self.registry.read();
        let slot = registry.slots.get(index)?;
        let running = slot.running.as_ref()?;
        Some((running.stopper.clone(), slot.sender.clone()))
    }

    /// Expire every lease when a not-lease-holder error points at nobody
    /// or at a node that is stopped, so the next attempt can acquire one.
    fn expire_leases_on_stale_holder(&self, err: &KvError) {
        let KvError::NotLeaseHolder { lease_holder, .. } = err else {
            return;
        };
        let stale = match lease_holder {
            Some(holder) => {
                node_index(holder.node_id).is_none_or(|index| self.running(index).is_none())
            }
            None => true,
        };
        if stale {
            debug!(lease_holder = ?lease_holder, "lease holder unavailable; expiring leases");
            self.expire_leases();
        }
    }
}

impl Transport for SimTransport {
    fn is_exhausted(&self) -> bool {
        self.replicas.is_empty()
    }

    fn send_next(&mut self, done: flume::Sender<BatchCall>) {
        let Some(replica) = self.replicas.pop_front() else {
            let _ = done.send(BatchCall::Unavailable("no replicas remaining".to_string()));
            return;
        };
        let Some(cluster) = self.cluster.upgrade() else {
            let _ = done.send(BatchCall::Unavailable("cluster is gone".to_string()));
            return;
        };
        let Some(index) = node_index(replica.node_id) else {
            let _ = done.send(BatchCall::Unavailable(format!(
                "invalid node id {}",
                replica.node_id
            )));
            return;
        };
        let Some((stopper, sender)) = cluster.dispatch_target(index) else {
            trace!(node_index = index, %replica, "destination stopped");
            let _ = done.send(BatchCall::Unavailable(format!("node {index} is stopped")));
            return;
        };

        // Owned copy, so the transaction never aliases the caller's batch.
        let mut batch = self.batch.clone();
        batch.header.replica = replica;
        let cancel = self.cancel.clone();
        let quiesce = stopper.should_quiesce();
        let weak = self.cluster.clone();
        let reply = done.clone();
        let spawned = stopper.run_async_task("sim-transport-send", async move {
            let call = tokio::select! {
                () = cancel.cancelled() => BatchCall::Unavailable("transport closed".to_string()),
                () = quiesce.cancelled() => {
                    BatchCall::Unavailable(format!("node {index} is stopping"))
                }
                result = sender.send(batch) => match result {
                    Ok(response) => BatchCall::Response(response),
                    Err(err) => {
                        if let Some(cluster) = weak.upgrade() {
                            cluster.expire_leases_on_stale_holder(&err);
                        }
                        BatchCall::Error(err)
                    }
                },
            };
            let _ = reply.send(call);
        });
        if spawned.is_err() {
            let _ = done.send(BatchCall::Unavailable(format!("node {index} is stopping")));
        }
    }

    fn move_to_front(&mut self, _replica: &ReplicaDescriptor) {}

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ranger_kvpb::{IncrementRequest, Key, NodeId, ReplicaId, Request, StoreId};
    use ranger_store::FIRST_RANGE_ID;

    use super::*;
    use crate::{ClusterConfig, ClusterContext};

    fn increment(key: &str) -> BatchRequest {
        BatchRequest::single(Request::Increment(IncrementRequest {
            key: Key::from(key),
            increment: 1,
        }))
    }

    /// Start one attempt of `batch` against `to`.
    fn dispatch(
        cluster: &ClusterContext,
        to: ReplicaDescriptor,
        batch: BatchRequest,
    ) -> (Box<dyn Transport>, flume::Receiver<BatchCall>) {
        let factory = SimTransport::factory(Arc::downgrade(&cluster.inner));
        let mut transport = factory(SendOptions::default(), vec![to], batch).unwrap();
        let (done, calls) = flume::unbounded();
        transport.send_next(done);
        (transport, calls)
    }

    fn replica_on(cluster: &ClusterContext, index: usize) -> ReplicaDescriptor {
        let store = cluster.store(index).unwrap();
        store.get_replica(FIRST_RANGE_ID).unwrap().get_replica_descriptor().unwrap()
    }

    async fn replicated() -> ClusterContext {
        let cluster = ClusterContext::start(ClusterConfig::default(), 3).await.unwrap();
        cluster.replicate_range(FIRST_RANGE_ID, &[1, 2]).await.unwrap();
        cluster
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stopped_node_fails_fast_as_unavailable() {
        let cluster = ClusterContext::start(ClusterConfig::default(), 2).await.unwrap();
        cluster.stop_node(1).await.unwrap();
        let to = ReplicaDescriptor {
            node_id: NodeId::new(2),
            store_id: StoreId::new(2),
            replica_id: ReplicaId::new(2),
        };
        let (transport, calls) = dispatch(&cluster, to, increment("a"));
        let call = calls.try_recv().unwrap();
        assert!(matches!(call, BatchCall::Unavailable(msg) if msg.contains("stopped")));
        assert!(transport.is_exhausted());
        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_cancels_an_attempt_in_flight() {
        let cluster = replicated().await;
        cluster.db(0).unwrap().increment("a", 1).await.unwrap();
        let to = replica_on(&cluster, 0);
        let lease = cluster.store(0).unwrap().get_replica(FIRST_RANGE_ID).unwrap().lease();
        assert!(lease.is_some_and(|l| l.replica == to));

        // Without a quorum the write can never commit.
        cluster.stop_node(1).await.unwrap();
        cluster.stop_node(2).await.unwrap();
        let (mut transport, calls) = dispatch(&cluster, to, increment("a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.is_empty());

        transport.close();
        let call = tokio::time::timeout(Duration::from_secs(5), calls.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(call, BatchCall::Unavailable(msg) if msg == "transport closed"));
        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[tracing_test::traced_test]
    async fn writes_past_a_stopped_lease_holder_expire_its_lease() {
        let cluster = replicated().await;
        let db = cluster.db(0).unwrap();
        db.increment("a", 1).await.unwrap();
        cluster.wait_for_values(&Key::from("a"), &[1, 1, 1]).await.unwrap();

        let stale = cluster.store(0).unwrap().get_replica(FIRST_RANGE_ID).unwrap().lease();
        let holder = stale
            .and_then(|l| crate::cluster::node_index(l.replica.node_id))
            .unwrap();
        cluster.stop_node(holder).await.unwrap();

        let before = cluster.manual_clock().unix_nanos();
        let live = (0..3).find(|&index| index != holder).unwrap();
        assert_eq!(cluster.db(live).unwrap().increment("a", 1).await.unwrap(), 2);
        let advanced = cluster.manual_clock().unix_nanos() - before;
        let horizon = cluster.store(live).unwrap().lease_expiration();
        assert!(advanced >= horizon, "clock moved {advanced}ns, lease horizon {horizon}ns");
        assert!(logs_contain("lease holder unavailable; expiring leases"));
        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transactions_travel_with_the_batch() {
        let cluster = ClusterContext::start(ClusterConfig::default(), 1).await.unwrap();
        let txn = ranger_kvpb::Transaction::new("txn", cluster.clock().now());
        let mut batch = increment("t");
        batch.txn = Some(txn.clone());

        let (_transport, calls) = dispatch(&cluster, replica_on(&cluster, 0), batch.clone());
        let call = calls.recv_async().await.unwrap();
        let BatchCall::Response(response) = call else {
            panic!("expected a response");
        };
        assert_eq!(response.txn.as_ref(), Some(&txn));

        let routed = cluster.db(0).unwrap().send(batch).await.unwrap();
        assert_eq!(routed.txn, Some(txn));
        cluster.stop().await;
    }
}
