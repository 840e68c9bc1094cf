//! Batch request and response protocol.

use ranger_hlc::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptors::{RangeDescriptor, ReplicaDescriptor};
use crate::error::{KvError, KvResult};
use crate::ids::RangeId;
use crate::keys::{self, Key};
use crate::value::Value;

/// Routing and timestamp information for a batch.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Range the batch is addressed to; filled in by the router.
    pub range_id: RangeId,
    /// Replica the batch is addressed to; filled in by the transport.
    pub replica: ReplicaDescriptor,
    /// Read/write timestamp; assigned by the router when zero.
    pub timestamp: Timestamp,
}

/// Transaction metadata carried with a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id.
    pub id: Uuid,
    /// Debug name.
    pub name: String,
    /// Provisional commit timestamp.
    pub timestamp: Timestamp,
    /// Restart epoch.
    pub epoch: u32,
}

impl Transaction {
    /// Start a new transaction at `timestamp`.
    #[must_use]
    pub fn new(name: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            timestamp,
            epoch: 0,
        }
    }
}

/// Read the latest value of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    /// Key read.
    pub key: Key,
}

/// Write a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    /// Key written.
    pub key: Key,
    /// Value written.
    pub value: Value,
}

/// Add to an integer value, treating a missing key as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementRequest {
    /// Key incremented.
    pub key: Key,
    /// Amount added.
    pub increment: i64,
}

/// Delete a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Key deleted.
    pub key: Key,
}

/// Replace a range descriptor, provided it still equals `expected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReplicasRequest {
    /// Descriptor the change was computed against.
    pub expected: RangeDescriptor,
    /// Descriptor after the change.
    pub updated: RangeDescriptor,
}

/// Discard the raft log of the range containing `key` up to `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateLogRequest {
    /// Any key of the range.
    pub key: Key,
    /// Last log index that may be discarded.
    pub index: u64,
}

/// A single request within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// See [`GetRequest`].
    Get(GetRequest),
    /// See [`PutRequest`].
    Put(PutRequest),
    /// See [`IncrementRequest`].
    Increment(IncrementRequest),
    /// See [`DeleteRequest`].
    Delete(DeleteRequest),
    /// See [`ChangeReplicasRequest`].
    ChangeReplicas(ChangeReplicasRequest),
    /// See [`TruncateLogRequest`].
    TruncateLog(TruncateLogRequest),
}

impl Request {
    /// Key the request is addressed by.
    #[must_use]
    pub fn key(&self) -> Key {
        match self {
            Self::Get(r) => r.key.clone(),
            Self::Put(r) => r.key.clone(),
            Self::Increment(r) => r.key.clone(),
            Self::Delete(r) => r.key.clone(),
            Self::ChangeReplicas(r) => keys::range_descriptor_key(&r.expected.start_key),
            Self::TruncateLog(r) => r.key.clone(),
        }
    }

    /// Whether the request mutates state.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::Get(_))
    }

    /// Short method name for logging.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Get(_) => "Get",
            Self::Put(_) => "Put",
            Self::Increment(_) => "Increment",
            Self::Delete(_) => "Delete",
            Self::ChangeReplicas(_) => "ChangeReplicas",
            Self::TruncateLog(_) => "TruncateLog",
        }
    }
}

/// An ordered set of requests addressed to a single range.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Routing header.
    pub header: Header,
    /// Optional transaction.
    pub txn: Option<Transaction>,
    /// Requests, evaluated in order.
    pub requests: Vec<Request>,
}

impl BatchRequest {
    /// A batch holding a single request.
    #[must_use]
    pub fn single(request: Request) -> Self {
        Self {
            requests: vec![request],
            ..Self::default()
        }
    }

    /// Append a request.
    pub fn add(&mut self, request: Request) -> &mut Self {
        self.requests.push(request);
        self
    }

    /// Key of the first request, used to route the batch.
    ///
    /// # Errors
    ///
    /// Fails for an empty batch.
    pub fn key(&self) -> KvResult<Key> {
        self.requests
            .first()
            .map(Request::key)
            .ok_or_else(|| KvError::Internal("empty batch".to_string()))
    }

    /// Whether every request is a read.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.requests.iter().all(|r| !r.is_write())
    }
}

/// Result of a [`GetRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    /// Value found, if any.
    pub value: Option<Value>,
}

/// Result of an [`IncrementRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementResponse {
    /// Value after the increment.
    pub new_value: i64,
}

/// Result of a [`TruncateLogRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateLogResponse {
    /// Index the log now starts after.
    pub truncated_index: u64,
}

/// Result of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// See [`GetResponse`].
    Get(GetResponse),
    /// A put was applied.
    Put,
    /// See [`IncrementResponse`].
    Increment(IncrementResponse),
    /// A delete was applied.
    Delete,
    /// The descriptor now in effect.
    ChangeReplicas(RangeDescriptor),
    /// See [`TruncateLogResponse`].
    TruncateLog(TruncateLogResponse),
}

/// Results of a batch, one per request.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Responses in request order.
    pub responses: Vec<Response>,
    /// Timestamp the batch was served at.
    pub timestamp: Timestamp,
    /// Transaction the batch ran in, echoed back to the client.
    pub txn: Option<Transaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_replicas_routes_by_descriptor_key() {
        let desc = RangeDescriptor {
            start_key: Key::from("k"),
            ..RangeDescriptor::default()
        };
        let request = Request::ChangeReplicas(ChangeReplicasRequest {
            expected: desc.clone(),
            updated: desc,
        });
        assert_eq!(keys::addr(&request.key()), Key::from("k"));
        assert!(request.is_write());
    }

    #[test]
    fn truncate_log_is_a_write_routed_by_its_key() {
        let request = Request::TruncateLog(TruncateLogRequest {
            key: Key::from("m"),
            index: 12,
        });
        assert_eq!(request.key(), Key::from("m"));
        assert!(request.is_write());
        assert_eq!(request.method(), "TruncateLog");
    }

    #[test]
    fn empty_batch_has_no_key() {
        assert!(BatchRequest::default().key().is_err());
    }

    #[test]
    fn read_only_detection() {
        let mut batch = BatchRequest::single(Request::Get(GetRequest { key: Key::from("a") }));
        assert!(batch.is_read_only());
        batch.add(Request::Delete(DeleteRequest { key: Key::from("a") }));
        assert!(!batch.is_read_only());
    }
}
