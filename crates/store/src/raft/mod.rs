//! Raft integration for range replicas.
//!
//! Every replica runs its own [`openraft::Raft`] group, keyed by replica id.
//! The log and vote live under the range's range-id local keys
//! ([`log_store`]), committed commands are applied to the MVCC data by
//! [`state_machine`], and RPCs travel over the node's raft transport
//! ([`network`]).

use std::io::Cursor;

use openraft::{Config, LogId, SnapshotPolicy};
use ranger_hlc::Timestamp;
use ranger_kvpb::{KvResult, Lease, RangeId, ReplicaDescriptor, ReplicaId, Request, Response};
use serde::{Deserialize, Serialize};

use crate::StoreSettings;

pub(crate) mod log_store;
pub(crate) mod network;
pub(crate) mod state_machine;

pub use openraft::ServerState;

openraft::declare_raft_types!(
    /// Raft types of a range.
    pub RangeTypeConfig:
        D = RaftCommand,
        R = CommandResponse,
        NodeId = ReplicaId,
        Node = ReplicaDescriptor,
        Entry = openraft::Entry<RangeTypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// A command replicated through a range's raft log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftCommand {
    /// Apply `requests` in order at `timestamp`, provided `proposer` still
    /// holds the lease when the command applies.
    Write {
        /// Lease holder that proposed the batch.
        proposer: ReplicaDescriptor,
        /// Timestamp of every write in the batch.
        timestamp: Timestamp,
        /// Requests, applied all or nothing.
        requests: Vec<Request>,
    },
    /// Install `lease` unless another replica's lease still covers its
    /// start.
    RequestLease {
        /// Lease requested.
        lease: Lease,
    },
}

/// Outcome of applying one log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Responses of a write, or why it was rejected.
    pub result: KvResult<Vec<Response>>,
}

impl CommandResponse {
    pub(crate) const fn empty() -> Self {
        Self { result: Ok(Vec::new()) }
    }
}

/// Log id of a range's raft log.
pub type RangeLogId = LogId<RangeTypeConfig>;

/// Raft introspection of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    /// Replica id.
    pub id: ReplicaId,
    /// Current term.
    pub term: u64,
    /// Role.
    pub state: ServerState,
    /// Known leader.
    pub lead: Option<ReplicaId>,
    /// Last applied index.
    pub applied: Option<u64>,
    /// Index up to which the log was discarded.
    pub truncated: Option<u64>,
    /// Voting members.
    pub voters: Vec<ReplicaId>,
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Raft timing for a replica of `range_id`, derived from `settings`.
///
/// Snapshots are only built on demand, before a replica is added and when
/// the log is truncated. The log is only purged by an explicit truncation.
pub(crate) fn raft_config(settings: &StoreSettings, range_id: RangeId) -> Config {
    let tick = settings.raft_tick_interval;
    let election = tick * settings.raft_election_timeout_ticks;
    Config {
        cluster_name: format!("range-{range_id}"),
        heartbeat_interval: millis(tick * settings.raft_heartbeat_interval_ticks),
        election_timeout_min: millis(election),
        election_timeout_max: millis(election * 2),
        snapshot_policy: SnapshotPolicy::Never,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_follows_the_tick_settings() {
        let settings = StoreSettings::default();
        let config = raft_config(&settings, RangeId::new(3));
        assert_eq!(config.cluster_name, "range-r3");
        assert_eq!(config.heartbeat_interval, 30);
        assert_eq!(config.election_timeout_min, 150);
        assert_eq!(config.election_timeout_max, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn command_responses_carry_errors() {
        let rejected = CommandResponse {
            result: Err(ranger_kvpb::KvError::ConditionFailed("stale".to_string())),
        };
        let raw = ranger_storage::codec::encode(&rejected).unwrap();
        let decoded: CommandResponse = ranger_storage::codec::decode(&raw).unwrap();
        assert_eq!(decoded, rejected);
        assert_eq!(CommandResponse::empty().result, Ok(Vec::new()));
    }
}
