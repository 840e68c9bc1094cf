//! Hybrid logical clock driven by a manually advanced physical source.
//!
//! Every node in a simulated cluster shares one [`ManualClock`]. Nothing in the
//! simulation reads wall-clock time: leases, liveness records and MVCC
//! timestamps all derive from the shared source, and tests move time forward
//! explicitly with [`ManualClock::increment`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod manual;
mod timestamp;

pub use manual::ManualClock;
pub use timestamp::Timestamp;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// A hybrid logical clock layered over a [`ManualClock`].
///
/// Readings are strictly increasing: when the physical source has not moved,
/// the logical component is bumped instead.
#[derive(Debug)]
pub struct Clock {
    physical: Arc<ManualClock>,
    max_offset: Duration,
    state: Mutex<Timestamp>,
}

impl Clock {
    /// Create a clock reading from `physical` with the given tolerated offset.
    #[must_use]
    pub fn new(physical: Arc<ManualClock>, max_offset: Duration) -> Self {
        Self {
            physical,
            max_offset,
            state: Mutex::new(Timestamp::ZERO),
        }
    }

    /// Current hybrid timestamp.
    pub fn now(&self) -> Timestamp {
        let physical = self.physical.unix_nanos();
        let mut state = self.state.lock();
        if state.wall_time >= physical {
            state.logical += 1;
        } else {
            state.wall_time = physical;
            state.logical = 0;
        }
        *state
    }

    /// Ratchet the clock forward so it is never behind `remote`.
    pub fn update(&self, remote: Timestamp) -> Timestamp {
        let physical = self.physical.unix_nanos();
        let mut state = self.state.lock();
        if physical > state.wall_time && physical > remote.wall_time {
            state.wall_time = physical;
            state.logical = 0;
        } else if remote > *state {
            *state = remote;
        }
        *state
    }

    /// Physical reading in nanoseconds, without touching the logical state.
    pub fn physical_now(&self) -> i64 {
        self.physical.unix_nanos()
    }

    /// Maximum tolerated offset between nodes.
    #[must_use]
    pub const fn max_offset(&self) -> Duration {
        self.max_offset
    }

    /// The physical source this clock reads from.
    #[must_use]
    pub const fn physical(&self) -> &Arc<ManualClock> {
        &self.physical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> (Arc<ManualClock>, Clock) {
        let manual = Arc::new(ManualClock::new(123));
        let clock = Clock::new(manual.clone(), Duration::from_millis(50));
        (manual, clock)
    }

    #[test]
    fn now_is_strictly_increasing_without_physical_movement() {
        let (_, clock) = clock();
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
        assert_eq!(a.wall_time, 123);
        assert_eq!(b.logical, a.logical + 1);
    }

    #[test]
    fn physical_advance_resets_logical() {
        let (manual, clock) = clock();
        clock.now();
        clock.now();
        manual.increment(10);
        let ts = clock.now();
        assert_eq!(ts, Timestamp::new(133, 0));
    }

    #[test]
    fn update_ratchets_to_remote() {
        let (_, clock) = clock();
        let remote = Timestamp::new(1_000, 4);
        assert_eq!(clock.update(remote), remote);
        assert!(clock.now() > remote);
    }

    #[test]
    fn stale_remote_is_ignored() {
        let (manual, clock) = clock();
        manual.increment(1_000);
        let before = clock.now();
        clock.update(Timestamp::new(5, 0));
        assert!(clock.now() > before);
    }
}
