use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A hybrid logical timestamp. Ordered by wall time, then logical counter.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Physical component in nanoseconds.
    pub wall_time: i64,
    /// Logical counter disambiguating readings at the same wall time.
    pub logical: i32,
}

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Self = Self::new(0, 0);

    /// Build a timestamp from its components.
    #[must_use]
    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Self { wall_time, logical }
    }

    /// Whether this is the zero timestamp.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.wall_time == 0 && self.logical == 0
    }

    /// The smallest timestamp strictly greater than this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self::new(self.wall_time, self.logical + 1)
    }

    /// This timestamp shifted forward by `duration`, logical part reset.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn add_duration(&self, duration: Duration) -> Self {
        Self::new(self.wall_time + duration.as_nanos() as i64, 0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.wall_time, self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn next_is_strictly_greater(wall in 0i64..1_000_000, logical in 0i32..1_000) {
            let ts = Timestamp::new(wall, logical);
            prop_assert!(ts.next() > ts);
        }
    }

    #[test]
    fn wall_time_dominates_ordering() {
        assert!(Timestamp::new(2, 0) > Timestamp::new(1, 99));
    }
}
