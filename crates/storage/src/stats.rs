use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};

/// Aggregate size and count statistics for a range.
///
/// User keys contribute to the `key_*`, `val_*` and `live_*` fields; local
/// keys only contribute to `sys_*`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    /// Bytes of keys and values visible at the latest version.
    pub live_bytes: i64,
    /// Bytes of keys, including one timestamp per version.
    pub key_bytes: i64,
    /// Bytes of values across all versions.
    pub val_bytes: i64,
    /// Keys whose newest version is not a deletion.
    pub live_count: i64,
    /// Distinct keys.
    pub key_count: i64,
    /// Versions.
    pub val_count: i64,
    /// Bytes of local system keys and values.
    pub sys_bytes: i64,
    /// Local system keys.
    pub sys_count: i64,
}

impl MvccStats {
    /// Whether every field is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for MvccStats {
    fn add_assign(&mut self, other: Self) {
        self.live_bytes += other.live_bytes;
        self.key_bytes += other.key_bytes;
        self.val_bytes += other.val_bytes;
        self.live_count += other.live_count;
        self.key_count += other.key_count;
        self.val_count += other.val_count;
        self.sys_bytes += other.sys_bytes;
        self.sys_count += other.sys_count;
    }
}

impl SubAssign for MvccStats {
    fn sub_assign(&mut self, other: Self) {
        self.live_bytes -= other.live_bytes;
        self.key_bytes -= other.key_bytes;
        self.val_bytes -= other.val_bytes;
        self.live_count -= other.live_count;
        self.key_count -= other.key_count;
        self.val_count -= other.val_count;
        self.sys_bytes -= other.sys_bytes;
        self.sys_count -= other.sys_count;
    }
}
