//! Range, replica, node and store descriptors, and range leases.

use std::fmt;

use ranger_hlc::Timestamp;
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, RangeId, ReplicaId, StoreId};
use crate::keys::Key;

/// One replica of a range: where it lives and its id within the range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    /// Node hosting the replica.
    pub node_id: NodeId,
    /// Store hosting the replica.
    pub store_id: StoreId,
    /// Replica id; zero while a change is being prepared.
    pub replica_id: ReplicaId,
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}):{}", self.node_id, self.store_id, self.replica_id)
    }
}

/// A contiguous key span `[start_key, end_key)` and its members.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    /// Range id.
    pub range_id: RangeId,
    /// Inclusive start of the span.
    pub start_key: Key,
    /// Exclusive end of the span; empty for an uninitialized replica.
    pub end_key: Key,
    /// Member replicas.
    pub replicas: Vec<ReplicaDescriptor>,
    /// Id handed to the next added replica.
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    /// Placeholder for a replica that has not received its first snapshot.
    #[must_use]
    pub fn uninitialized(range_id: RangeId) -> Self {
        Self {
            range_id,
            ..Self::default()
        }
    }

    /// Whether the span is known.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.end_key.is_empty()
    }

    /// Whether `key` falls inside the span.
    #[must_use]
    pub fn contains_key(&self, key: &Key) -> bool {
        self.is_initialized() && *key >= self.start_key && *key < self.end_key
    }

    /// The member living on `store_id`, if any.
    #[must_use]
    pub fn find_replica(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }

    /// The member with `replica_id`, if any.
    #[must_use]
    pub fn replica_by_id(&self, replica_id: ReplicaId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }
}

impl fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[{}, {}) [", self.range_id, self.start_key, self.end_key)?;
        for (i, replica) in self.replicas.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{replica}")?;
        }
        write!(f, "] next={}", self.next_replica_id)
    }
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReplicasType {
    /// Add a replica.
    AddReplica,
    /// Remove a replica.
    RemoveReplica,
}

/// A node and the address it listens on.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node id.
    pub node_id: NodeId,
    /// Simulated network address.
    pub address: String,
}

/// Identity persisted on a bootstrapped engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreIdent {
    /// Owning node.
    pub node_id: NodeId,
    /// Store id.
    pub store_id: StoreId,
}

/// Load figures gossiped alongside a store descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapacity {
    /// Replicas hosted.
    pub range_count: u32,
    /// Leases held.
    pub lease_count: u32,
}

/// A store as advertised through gossip.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    /// Store id.
    pub store_id: StoreId,
    /// Hosting node.
    pub node: NodeDescriptor,
    /// Current load.
    pub capacity: StoreCapacity,
}

/// Time-bounded authority to serve a range, granted to one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Holder.
    pub replica: ReplicaDescriptor,
    /// First instant covered.
    pub start: Timestamp,
    /// First instant no longer covered.
    pub expiration: Timestamp,
}

impl Lease {
    /// Whether the lease is in effect at `ts`.
    #[must_use]
    pub fn covers(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.expiration
    }

    /// Whether the lease belongs to the replica on `store_id`.
    #[must_use]
    pub fn owned_by(&self, store_id: StoreId) -> bool {
        self.replica.store_id == store_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> RangeDescriptor {
        RangeDescriptor {
            range_id: RangeId::new(1),
            start_key: Key::from("b"),
            end_key: Key::from("d"),
            replicas: vec![ReplicaDescriptor {
                node_id: NodeId::new(1),
                store_id: StoreId::new(1),
                replica_id: ReplicaId::new(1),
            }],
            next_replica_id: ReplicaId::new(2),
        }
    }

    #[test]
    fn contains_key_is_half_open() {
        let desc = desc();
        assert!(desc.contains_key(&Key::from("b")));
        assert!(desc.contains_key(&Key::from("c")));
        assert!(!desc.contains_key(&Key::from("d")));
        assert!(!desc.contains_key(&Key::from("a")));
    }

    #[test]
    fn uninitialized_contains_nothing() {
        let desc = RangeDescriptor::uninitialized(RangeId::new(3));
        assert!(!desc.is_initialized());
        assert!(!desc.contains_key(&Key::min()));
    }

    #[test]
    fn lease_covers_until_expiration() {
        let lease = Lease {
            replica: desc().replicas[0],
            start: Timestamp::new(10, 0),
            expiration: Timestamp::new(20, 0),
        };
        assert!(lease.covers(Timestamp::new(10, 0)));
        assert!(lease.covers(Timestamp::new(19, 5)));
        assert!(!lease.covers(Timestamp::new(20, 0)));
        assert!(lease.owned_by(StoreId::new(1)));
    }
}
