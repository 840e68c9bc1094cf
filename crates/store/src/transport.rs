//! Raft RPC delivery between stores over the simulated network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use ranger_kvpb::{NodeId, RangeId, ReplicaDescriptor, StoreId};
use ranger_network::{Addr, NetworkError, Server, SimNetwork};
use ranger_util::Stopper;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::StoreResult;
use crate::raft::RangeTypeConfig;

/// Service name raft RPCs are delivered under.
pub const RAFT_SERVICE: &str = "raft";

/// A raft protocol call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftPayload {
    /// Request a vote.
    Vote(VoteRequest<RangeTypeConfig>),
    /// Replicate entries or heartbeat.
    AppendEntries(AppendEntriesRequest<RangeTypeConfig>),
    /// Stream a snapshot chunk.
    InstallSnapshot(InstallSnapshotRequest<RangeTypeConfig>),
}

impl RaftPayload {
    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Vote(_) => "vote",
            Self::AppendEntries(_) => "append-entries",
            Self::InstallSnapshot(_) => "install-snapshot",
        }
    }
}

/// A call from one replica of a range to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftMessageRequest {
    /// Range both replicas belong to.
    pub range_id: RangeId,
    /// Sender.
    pub from_replica: ReplicaDescriptor,
    /// Recipient.
    pub to_replica: ReplicaDescriptor,
    /// Call.
    pub payload: RaftPayload,
}

/// Answer to a [`RaftMessageRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessageResponse {
    /// Answer to [`RaftPayload::Vote`].
    Vote(VoteResponse<RangeTypeConfig>),
    /// Answer to [`RaftPayload::AppendEntries`].
    AppendEntries(AppendEntriesResponse<RangeTypeConfig>),
    /// Answer to [`RaftPayload::InstallSnapshot`].
    InstallSnapshot(InstallSnapshotResponse<RangeTypeConfig>),
    /// The sender was removed from the range and should be collected.
    ReplicaTooOld,
    /// The recipient could not serve the call.
    Error(String),
}

/// Errors delivering a raft RPC.
#[derive(Debug, Error)]
pub enum RaftTransportError {
    /// The recipient's node has no known address.
    #[error("no address for node {0}")]
    NoAddress(NodeId),

    /// The network refused or lost the call.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The recipient reported that the sender was removed from the range.
    #[error("sender was removed from the range")]
    ReplicaTooOld,

    /// The recipient failed to serve the call.
    #[error("remote error: {0}")]
    Remote(String),

    /// The answer does not match the call.
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

/// Serves raft RPCs addressed to one store.
#[async_trait]
pub trait RaftMessageHandler: Send + Sync {
    /// Handle `req` and produce the answer sent back to its sender.
    async fn handle_raft_message(&self, req: RaftMessageRequest) -> RaftMessageResponse;
}

/// Maps a node id to the address it currently listens on.
pub type NodeAddressResolver = Arc<dyn Fn(NodeId) -> Option<Addr> + Send + Sync>;

type Handlers = Arc<DashMap<StoreId, Arc<dyn RaftMessageHandler>>>;

fn encode<T: Serialize>(value: &T) -> Result<Bytes, RaftTransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| RaftTransportError::Codec(e.to_string()))?;
    Ok(Bytes::from(buf))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, RaftTransportError> {
    ciborium::from_reader(raw).map_err(|e| RaftTransportError::Codec(e.to_string()))
}

/// A node's raft endpoint. Stores register a handler with
/// [`RaftTransport::listen`]; calls for stores without one are answered
/// with [`RaftMessageResponse::Error`].
pub struct RaftTransport {
    network: SimNetwork,
    resolver: NodeAddressResolver,
    handlers: Handlers,
}

impl std::fmt::Debug for RaftTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftTransport")
            .field("stores", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl RaftTransport {
    /// Register the raft service on `server` and start serving incoming
    /// calls on `stopper`.
    ///
    /// # Errors
    ///
    /// Fails if `stopper` is quiescing.
    pub fn new(
        resolver: NodeAddressResolver,
        server: &Server,
        network: SimNetwork,
        stopper: &Stopper,
    ) -> StoreResult<Arc<Self>> {
        let mailbox = server.register(RAFT_SERVICE);
        let handlers: Handlers = Arc::new(DashMap::new());
        let routes = handlers.clone();
        let tasks = stopper.clone();
        stopper.run_worker("raft-transport", move |quiesce| async move {
            loop {
                tokio::select! {
                    () = quiesce.cancelled() => break,
                    received = mailbox.recv_async() => {
                        let Ok(envelope) = received else { break };
                        let req: RaftMessageRequest = match decode(&envelope.payload) {
                            Ok(req) => req,
                            Err(err) => {
                                warn!(error = %err, "dropping undecodable raft message");
                                continue;
                            }
                        };
                        let store_id = req.to_replica.store_id;
                        let handler = routes.get(&store_id).map(|h| h.value().clone());
                        let quiesce = quiesce.clone();
                        let spawned = tasks.run_async_task("raft-rpc", async move {
                            let resp = match handler {
                                Some(handler) => tokio::select! {
                                    () = quiesce.cancelled() => return,
                                    resp = handler.handle_raft_message(req) => resp,
                                },
                                None => {
                                    trace!(%store_id, "no handler for raft message");
                                    let msg = format!("store {store_id} not found");
                                    RaftMessageResponse::Error(msg)
                                }
                            };
                            match encode(&resp) {
                                Ok(raw) => {
                                    if !envelope.respond(raw) {
                                        trace!(%store_id, "raft caller went away");
                                    }
                                }
                                Err(err) => warn!(error = %err, "failed to encode raft reply"),
                            }
                        });
                        if spawned.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("raft transport exiting");
        })?;
        Ok(Arc::new(Self {
            network,
            resolver,
            handlers,
        }))
    }

    /// Serve calls addressed to `store_id` with `handler`.
    pub fn listen(&self, store_id: StoreId, handler: Arc<dyn RaftMessageHandler>) {
        self.handlers.insert(store_id, handler);
    }

    /// Stop serving calls addressed to `store_id`.
    pub fn stop(&self, store_id: StoreId) {
        self.handlers.remove(&store_id);
    }

    /// Send `req` to the node hosting its recipient and wait up to `timeout`
    /// for the answer.
    ///
    /// # Errors
    ///
    /// Fails if the node has no address, the network refuses or loses the
    /// call, or either message cannot be encoded.
    pub async fn request(
        &self,
        req: &RaftMessageRequest,
        timeout: Duration,
    ) -> Result<RaftMessageResponse, RaftTransportError> {
        let node_id = req.to_replica.node_id;
        let addr = (self.resolver)(node_id).ok_or(RaftTransportError::NoAddress(node_id))?;
        let raw = encode(req)?;
        let reply = self
            .network
            .request(&addr, RAFT_SERVICE, raw, timeout)
            .await
            .inspect_err(|err| {
                trace!(%node_id, kind = req.payload.kind(), error = %err, "raft call failed");
            })?;
        decode(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::Vote;

    struct Echo;

    #[async_trait]
    impl RaftMessageHandler for Echo {
        async fn handle_raft_message(&self, req: RaftMessageRequest) -> RaftMessageResponse {
            match req.payload {
                RaftPayload::Vote(vote) => RaftMessageResponse::Vote(VoteResponse {
                    vote: vote.vote,
                    vote_granted: true,
                    last_log_id: None,
                }),
                other => RaftMessageResponse::Error(format!("unsupported {}", other.kind())),
            }
        }
    }

    fn replica(node: u32) -> ReplicaDescriptor {
        ReplicaDescriptor {
            node_id: NodeId::new(node),
            store_id: StoreId::new(node),
            replica_id: ranger_kvpb::ReplicaId::new(node),
        }
    }

    fn vote_request(to: ReplicaDescriptor) -> RaftMessageRequest {
        RaftMessageRequest {
            range_id: RangeId::new(1),
            from_replica: replica(1),
            to_replica: to,
            payload: RaftPayload::Vote(VoteRequest {
                vote: Vote::new(2, ranger_kvpb::ReplicaId::new(1)),
                last_log_id: None,
            }),
        }
    }

    fn transport(network: &SimNetwork, stopper: &Stopper) -> Arc<RaftTransport> {
        let server = network.server();
        let addr = network.listen(&server).unwrap().addr().clone();
        let resolver: NodeAddressResolver = Arc::new(move |_| Some(addr.clone()));
        RaftTransport::new(resolver, &server, network.clone(), stopper).unwrap()
    }

    #[tokio::test]
    async fn calls_reach_the_registered_store() {
        let network = SimNetwork::new();
        let stopper = Stopper::new();
        let transport = transport(&network, &stopper);
        transport.listen(StoreId::new(2), Arc::new(Echo));

        let reply = transport
            .request(&vote_request(replica(2)), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(reply, RaftMessageResponse::Vote(v) if v.vote_granted));

        let missing = transport
            .request(&vote_request(replica(3)), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(missing, RaftMessageResponse::Error(msg) if msg.contains("s3")));

        transport.stop(StoreId::new(2));
        let stopped = transport
            .request(&vote_request(replica(2)), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(stopped, RaftMessageResponse::Error(_)));
        stopper.stop().await;
    }

    #[tokio::test]
    async fn unresolvable_nodes_fail_fast() {
        let network = SimNetwork::new();
        let stopper = Stopper::new();
        let server = network.server();
        let resolver: NodeAddressResolver = Arc::new(|_| None);
        let transport = RaftTransport::new(resolver, &server, network, &stopper).unwrap();
        let err = transport
            .request(&vote_request(replica(2)), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftTransportError::NoAddress(node) if node == NodeId::new(2)));
        stopper.stop().await;
    }
}
