use std::sync::atomic::{AtomicI64, Ordering};

use tracing::trace;

/// A physical time source that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    /// Create a manual clock reading `nanos`.
    #[must_use]
    pub const fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    /// Current reading in nanoseconds.
    pub fn unix_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }

    /// Advance the clock by `nanos`. Negative increments are ignored: the
    /// clock never moves backwards.
    pub fn increment(&self, nanos: i64) -> i64 {
        if nanos < 0 {
            return self.unix_nanos();
        }
        let now = self.nanos.fetch_add(nanos, Ordering::SeqCst) + nanos;
        trace!(increment = nanos, now, "advanced manual clock");
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate() {
        let clock = ManualClock::new(123);
        clock.increment(7);
        assert_eq!(clock.increment(10), 140);
        assert_eq!(clock.unix_nanos(), 140);
    }

    #[test]
    fn negative_increment_does_not_rewind() {
        let clock = ManualClock::new(500);
        clock.increment(-100);
        assert_eq!(clock.unix_nanos(), 500);
    }
}
