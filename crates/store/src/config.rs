use std::sync::Arc;
use std::time::Duration;

use ranger_gossip::Gossip;
use ranger_hlc::Clock;
use ranger_kv::Db;

use crate::transport::RaftTransport;

/// Hooks that alter store behaviour in tests.
#[derive(Debug, Clone, Default)]
pub struct StoreTestingKnobs {
    /// Keep replicas that were removed from their range instead of
    /// destroying them.
    pub disable_replica_gc: bool,
}

/// Timing and tuning of a store.
///
/// Lease and liveness durations are measured on the hybrid clock, which in
/// tests only moves when the manual clock is advanced. The intervals drive
/// background loops in real time.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Length of a raft tick, the unit of the election and heartbeat
    /// timeouts.
    pub raft_tick_interval: Duration,
    /// Base election timeout in ticks.
    pub raft_election_timeout_ticks: u32,
    /// Heartbeat interval in ticks.
    pub raft_heartbeat_interval_ticks: u32,
    /// Lifetime of a range lease.
    pub range_lease_active_duration: Duration,
    /// Lifetime of a node liveness record.
    pub liveness_duration: Duration,
    /// Interval between liveness heartbeats.
    pub liveness_heartbeat_interval: Duration,
    /// Interval between system config gossip checks.
    pub gossip_interval: Duration,
    /// Interval between passes reconciling raft voters with descriptors.
    pub replica_scan_interval: Duration,
    /// Bound on waiting for a proposal to apply.
    pub proposal_timeout: Duration,
    /// Test hooks.
    pub testing_knobs: StoreTestingKnobs,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            raft_tick_interval: Duration::from_millis(10),
            raft_election_timeout_ticks: 15,
            raft_heartbeat_interval_ticks: 3,
            range_lease_active_duration: Duration::from_secs(9),
            liveness_duration: Duration::from_secs(9),
            liveness_heartbeat_interval: Duration::from_millis(100),
            gossip_interval: Duration::from_millis(50),
            replica_scan_interval: Duration::from_millis(100),
            proposal_timeout: Duration::from_secs(10),
            testing_knobs: StoreTestingKnobs::default(),
        }
    }
}

/// Collaborators a store is built from.
#[derive(Clone)]
pub struct StoreConfig {
    /// Shared hybrid clock.
    pub clock: Arc<Clock>,
    /// Raft message transport of the hosting node.
    pub transport: Arc<RaftTransport>,
    /// Gossip handle of the hosting node.
    pub gossip: Gossip,
    /// Client used for membership changes.
    pub db: Arc<Db>,
    /// Tuning.
    pub settings: StoreSettings,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
