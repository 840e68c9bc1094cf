use std::sync::Arc;
use std::time::Duration;

use ranger_hlc::Clock;
use ranger_store::StoreSettings;
use ranger_util::DEFAULT_SUCCEEDS_SOON_DURATION;

/// Tuning for a [`crate::ClusterContext`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Initial reading of the shared manual clock, in nanoseconds.
    pub manual_clock_start: i64,
    /// Maximum clock offset the hybrid clock tolerates.
    pub max_offset: Duration,
    /// Ceiling on a full teardown.
    pub shutdown_timeout: Duration,
    /// Bound on every convergence wait.
    pub succeeds_soon_timeout: Duration,
    /// Settings every store is built with.
    pub store_settings: StoreSettings,
    /// Per-slot clocks: slot `i` runs on `clocks[i]` when it is set and on
    /// the shared clock otherwise. Lease expiry only advances the shared
    /// clock.
    pub clocks: Vec<Option<Arc<Clock>>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            manual_clock_start: 123,
            max_offset: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(30),
            succeeds_soon_timeout: DEFAULT_SUCCEEDS_SOON_DURATION,
            store_settings: StoreSettings::default(),
            clocks: Vec::new(),
        }
    }
}
