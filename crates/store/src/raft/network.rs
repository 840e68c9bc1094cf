//! Raft RPCs of one replica, carried by the node's [`RaftTransport`].
//!
//! [`RaftTransport`]: crate::transport::RaftTransport

use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use ranger_kvpb::{RangeId, ReplicaDescriptor, ReplicaId};
use tracing::{debug, trace};

use super::RangeTypeConfig;
use crate::store::StoreEnv;
use crate::transport::{RaftMessageRequest, RaftMessageResponse, RaftPayload, RaftTransportError};

type RpcResult<T, E = openraft::error::Infallible> =
    Result<T, RPCError<RangeTypeConfig, RaftError<RangeTypeConfig, E>>>;

fn network_error<E: std::error::Error>(err: &RaftTransportError) -> RPCError<RangeTypeConfig, E> {
    RPCError::Network(NetworkError::new(err))
}

/// Builds a [`RangeNetwork`] per peer of a replica.
#[derive(Debug, Clone)]
pub(crate) struct RangeNetworkFactory {
    env: Arc<StoreEnv>,
    range_id: RangeId,
    from: ReplicaDescriptor,
}

impl RangeNetworkFactory {
    pub(crate) const fn new(
        env: Arc<StoreEnv>,
        range_id: RangeId,
        from: ReplicaDescriptor,
    ) -> Self {
        Self {
            env,
            range_id,
            from,
        }
    }
}

impl RaftNetworkFactory<RangeTypeConfig> for RangeNetworkFactory {
    type Network = RangeNetwork;

    async fn new_client(&mut self, target: ReplicaId, node: &ReplicaDescriptor) -> Self::Network {
        trace!(range_id = %self.range_id, %target, to = %node, "new raft client");
        RangeNetwork {
            env: self.env.clone(),
            range_id: self.range_id,
            from: self.from,
            to: *node,
        }
    }
}

/// Connection from one replica to a peer of the same range.
#[derive(Debug, Clone)]
pub(crate) struct RangeNetwork {
    env: Arc<StoreEnv>,
    range_id: RangeId,
    from: ReplicaDescriptor,
    to: ReplicaDescriptor,
}

impl RangeNetwork {
    async fn call(
        &self,
        payload: RaftPayload,
        timeout: Duration,
    ) -> Result<RaftMessageResponse, RaftTransportError> {
        let req = RaftMessageRequest {
            range_id: self.range_id,
            from_replica: self.from,
            to_replica: self.to,
            payload,
        };
        match self.env.transport.request(&req, timeout).await? {
            RaftMessageResponse::ReplicaTooOld => {
                debug!(
                    range_id = %self.range_id,
                    replica = %self.from,
                    peer = %self.to,
                    "peer reports this replica was removed"
                );
                self.env.enqueue_gc(self.range_id, self.from.replica_id);
                Err(RaftTransportError::ReplicaTooOld)
            }
            RaftMessageResponse::Error(msg) => Err(RaftTransportError::Remote(msg)),
            resp => Ok(resp),
        }
    }
}

impl RaftNetwork<RangeTypeConfig> for RangeNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<RangeTypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<RangeTypeConfig>> {
        match self.call(RaftPayload::AppendEntries(rpc), option.hard_ttl()).await {
            Ok(RaftMessageResponse::AppendEntries(resp)) => Ok(resp),
            Ok(_) => Err(network_error(&RaftTransportError::UnexpectedReply("append-entries"))),
            Err(err) => Err(network_error(&err)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<RangeTypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<RangeTypeConfig>, InstallSnapshotError> {
        match self.call(RaftPayload::InstallSnapshot(rpc), option.hard_ttl()).await {
            Ok(RaftMessageResponse::InstallSnapshot(resp)) => Ok(resp),
            Ok(_) => Err(network_error(&RaftTransportError::UnexpectedReply("install-snapshot"))),
            Err(err) => Err(network_error(&err)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<RangeTypeConfig>,
        option: RPCOption,
    ) -> RpcResult<VoteResponse<RangeTypeConfig>> {
        match self.call(RaftPayload::Vote(rpc), option.hard_ttl()).await {
            Ok(RaftMessageResponse::Vote(resp)) => Ok(resp),
            Ok(_) => Err(network_error(&RaftTransportError::UnexpectedReply("vote"))),
            Err(err) => Err(network_error(&err)),
        }
    }
}
