//! Identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name($inner);

        impl $name {
            /// Wrap a raw identifier.
            #[must_use]
            pub const fn new(id: $inner) -> Self {
                Self(id)
            }

            /// The raw identifier.
            #[must_use]
            pub const fn value(&self) -> $inner {
                self.0
            }

            /// Whether this is the unset (zero) identifier.
            #[must_use]
            pub const fn is_zero(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Node identifier, assigned sequentially from 1.
    NodeId, u32, "n"
);
define_id!(
    /// Store identifier, unique across the cluster.
    StoreId, u32, "s"
);
define_id!(
    /// Range identifier.
    RangeId, u64, "r"
);
define_id!(
    /// Replica identifier, unique within a range and never reused.
    ReplicaId, u32, ""
);

impl ReplicaId {
    /// The following replica id.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}
