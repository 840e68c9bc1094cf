use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ranger_hlc::Clock;
use ranger_kvpb::keys;
use ranger_kvpb::{
    BatchRequest, BatchResponse, KvError, KvResult, RangeDescriptor, RangeId, ReplicaDescriptor,
};
use ranger_util::{Retry, RetryOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::{BatchCall, RangeDescriptorDb, SendOptions, Sender, TransportFactory};

/// Collaborators and tuning for a [`DistSender`].
#[derive(Clone)]
pub struct DistSenderConfig {
    /// Clock used to timestamp batches that arrive without one.
    pub clock: Arc<Clock>,
    /// Range lookup strategy.
    pub range_descriptor_db: Arc<dyn RangeDescriptorDb>,
    /// Transport strategy.
    pub transport_factory: TransportFactory,
    /// Backoff between routing attempts.
    pub rpc_retry_options: RetryOptions,
    /// Cancels retries when the owning node shuts down.
    pub closer: Option<CancellationToken>,
    /// Bound on a single replica attempt.
    pub send_timeout: Option<Duration>,
}

impl DistSenderConfig {
    /// Config with default retry options.
    pub fn new(
        clock: Arc<Clock>,
        range_descriptor_db: Arc<dyn RangeDescriptorDb>,
        transport_factory: TransportFactory,
    ) -> Self {
        Self {
            clock,
            range_descriptor_db,
            transport_factory,
            rpc_retry_options: RetryOptions {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(500),
                multiplier: 2.0,
                randomization_factor: 0.15,
                max_retries: 120,
            },
            closer: None,
            send_timeout: None,
        }
    }
}

/// Routes batches to the replicas of the range owning their key.
pub struct DistSender {
    config: DistSenderConfig,
    lease_holders: DashMap<RangeId, ReplicaDescriptor>,
}

impl std::fmt::Debug for DistSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistSender")
            .field("cached_lease_holders", &self.lease_holders.len())
            .finish_non_exhaustive()
    }
}

impl DistSender {
    /// Create a router.
    #[must_use]
    pub fn new(config: DistSenderConfig) -> Self {
        Self {
            config,
            lease_holders: DashMap::new(),
        }
    }

    /// Last lease holder seen for `range_id`.
    #[must_use]
    pub fn cached_lease_holder(&self, range_id: RangeId) -> Option<ReplicaDescriptor> {
        self.lease_holders.get(&range_id).map(|r| *r)
    }

    async fn send_to_replicas(
        &self,
        desc: &RangeDescriptor,
        mut batch: BatchRequest,
    ) -> KvResult<BatchResponse> {
        let mut replicas = desc.replicas.clone();
        if let Some(holder) = self.cached_lease_holder(desc.range_id) {
            if let Some(pos) = replicas.iter().position(|r| *r == holder) {
                let holder = replicas.remove(pos);
                replicas.insert(0, holder);
            }
        }
        batch.header.range_id = desc.range_id;
        let opts = SendOptions {
            timeout: self.config.send_timeout,
        };
        let mut transport = (self.config.transport_factory)(opts, replicas, batch)?;
        let (done_tx, done_rx) = flume::unbounded();
        let mut last_err = KvError::SendError(format!("range {} has no replicas", desc.range_id));

        while !transport.is_exhausted() {
            transport.send_next(done_tx.clone());
            let call = done_rx
                .recv_async()
                .await
                .map_err(|_| KvError::SendError("transport dropped its result".to_string()))?;
            match call {
                BatchCall::Response(response) => {
                    transport.close();
                    return Ok(response);
                }
                BatchCall::Unavailable(reason) => {
                    trace!(range_id = %desc.range_id, %reason, "replica unavailable");
                    last_err = KvError::SendError(reason);
                }
                BatchCall::Error(err) => {
                    if let KvError::NotLeaseHolder {
                        lease_holder: Some(holder),
                        ..
                    } = &err
                    {
                        self.lease_holders.insert(desc.range_id, *holder);
                        transport.move_to_front(holder);
                    } else if matches!(err, KvError::NotLeaseHolder { .. }) {
                        self.lease_holders.remove(&desc.range_id);
                    }
                    if !err.is_retriable() {
                        transport.close();
                        return Err(err);
                    }
                    trace!(range_id = %desc.range_id, error = %err, "trying next replica");
                    last_err = err;
                }
            }
        }
        transport.close();
        Err(last_err)
    }
}

#[async_trait]
impl Sender for DistSender {
    #[instrument(level = "debug", skip_all)]
    async fn send(&self, mut batch: BatchRequest) -> KvResult<BatchResponse> {
        if batch.header.timestamp.is_zero() {
            batch.header.timestamp = self.config.clock.now();
        }
        let key = keys::addr(&batch.key()?);
        let mut retry = Retry::start(self.config.rpc_retry_options.clone());
        if let Some(closer) = &self.config.closer {
            retry = retry.with_closer(closer.clone());
        }
        let mut last_err = None;
        while retry.next().await {
            let desc = match self.config.range_descriptor_db.range_lookup(&key) {
                Ok(desc) => desc,
                Err(err) if err.is_retriable() => {
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            match self.send_to_replicas(&desc, batch.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retriable() => {
                    debug!(
                        range_id = %desc.range_id,
                        error = %err,
                        attempt = retry.current_attempt(),
                        "retrying batch"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        if self.config.closer.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(KvError::NodeUnavailable("node is shutting down".to_string()));
        }
        Err(last_err.unwrap_or_else(|| KvError::SendError("retries exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReplicaSlice, Transport, sender_transport_factory};
    use parking_lot::Mutex;
    use ranger_hlc::ManualClock;
    use ranger_kvpb::{
        GetRequest, GetResponse, Key, NodeId, ReplicaId, Request, Response, StoreId,
    };

    fn replica(id: u32) -> ReplicaDescriptor {
        ReplicaDescriptor {
            node_id: NodeId::new(id),
            store_id: StoreId::new(id),
            replica_id: ReplicaId::new(id),
        }
    }

    struct FixedDb(RangeDescriptor);

    impl RangeDescriptorDb for FixedDb {
        fn first_range(&self) -> KvResult<RangeDescriptor> {
            Ok(self.0.clone())
        }
    }

    /// Serves only on store 3; everyone else points at it.
    struct Redirecting {
        seen: Mutex<Vec<StoreId>>,
    }

    #[async_trait]
    impl Sender for Redirecting {
        async fn send(&self, batch: BatchRequest) -> KvResult<BatchResponse> {
            self.seen.lock().push(batch.header.replica.store_id);
            if batch.header.replica.store_id == StoreId::new(3) {
                Ok(BatchResponse {
                    responses: vec![Response::Get(GetResponse { value: None })],
                    timestamp: batch.header.timestamp,
                    txn: batch.txn,
                })
            } else {
                Err(KvError::NotLeaseHolder {
                    range_id: batch.header.range_id,
                    replica: Some(batch.header.replica),
                    lease_holder: Some(replica(3)),
                })
            }
        }
    }

    fn desc() -> RangeDescriptor {
        RangeDescriptor {
            range_id: RangeId::new(1),
            start_key: Key::min(),
            end_key: Key::max(),
            replicas: vec![replica(1), replica(2), replica(3)],
            next_replica_id: ReplicaId::new(4),
        }
    }

    fn clock() -> Arc<Clock> {
        Arc::new(Clock::new(Arc::new(ManualClock::new(123)), Duration::ZERO))
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn follows_lease_holder_redirects_and_caches_them() {
        let sender = Arc::new(Redirecting {
            seen: Mutex::new(Vec::new()),
        });
        let dist = DistSender::new(DistSenderConfig::new(
            clock(),
            Arc::new(FixedDb(desc())),
            sender_transport_factory(sender.clone()),
        ));
        let batch = BatchRequest::single(Request::Get(GetRequest { key: Key::from("a") }));
        let response = dist.send(batch.clone()).await.unwrap();
        assert!(!response.timestamp.is_zero());
        assert_eq!(*sender.seen.lock(), vec![StoreId::new(1), StoreId::new(3)]);
        assert_eq!(dist.cached_lease_holder(RangeId::new(1)), Some(replica(3)));

        sender.seen.lock().clear();
        dist.send(batch).await.unwrap();
        assert_eq!(*sender.seen.lock(), vec![StoreId::new(3)]);
    }

    struct Failing;

    #[async_trait]
    impl Sender for Failing {
        async fn send(&self, _batch: BatchRequest) -> KvResult<BatchResponse> {
            Err(KvError::ConditionFailed("nope".to_string()))
        }
    }

    #[tokio::test]
    async fn non_retriable_errors_surface_immediately() {
        let dist = DistSender::new(DistSenderConfig::new(
            clock(),
            Arc::new(FixedDb(desc())),
            sender_transport_factory(Arc::new(Failing)),
        ));
        let batch = BatchRequest::single(Request::Get(GetRequest { key: Key::from("a") }));
        let err = dist.send(batch).await.unwrap_err();
        assert_eq!(err, KvError::ConditionFailed("nope".to_string()));
    }

    /// A transport that never reaches anyone.
    struct Dead(usize);

    impl Transport for Dead {
        fn is_exhausted(&self) -> bool {
            self.0 == 0
        }
        fn send_next(&mut self, done: flume::Sender<BatchCall>) {
            self.0 -= 1;
            let _ = done.send(BatchCall::Unavailable("down".to_string()));
        }
        fn move_to_front(&mut self, _replica: &ReplicaDescriptor) {}
        fn close(&mut self) {}
    }

    #[tokio::test]
    async fn closer_stops_retrying() {
        let closer = CancellationToken::new();
        let mut config = DistSenderConfig::new(
            clock(),
            Arc::new(FixedDb(desc())),
            Arc::new(
                |_: SendOptions,
                 replicas: ReplicaSlice,
                 _: BatchRequest|
                 -> KvResult<Box<dyn Transport>> {
                    Ok(Box::new(Dead(replicas.len())) as Box<dyn Transport>)
                },
            ),
        );
        config.closer = Some(closer.clone());
        let dist = Arc::new(DistSender::new(config));
        let task = {
            let dist = dist.clone();
            tokio::spawn(async move {
                dist.send(BatchRequest::single(Request::Get(GetRequest { key: Key::from("a") })))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, KvError::NodeUnavailable(_)));
    }
}
