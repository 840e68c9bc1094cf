use std::sync::Arc;

use ranger_kvpb::{
    BatchRequest, BatchResponse, ChangeReplicasRequest, DeleteRequest, GetRequest,
    IncrementRequest, Key, KvError, KvResult, PutRequest, RangeDescriptor, Request, Response,
    TruncateLogRequest, Value,
};
use serde::de::DeserializeOwned;

use crate::Sender;

/// Typed client issuing single-request batches through a [`Sender`].
#[derive(Clone)]
pub struct Db {
    sender: Arc<dyn Sender>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Client over `sender`.
    #[must_use]
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }

    /// Send a prepared batch as is.
    ///
    /// # Errors
    ///
    /// Propagates routing and evaluation errors.
    pub async fn send(&self, batch: BatchRequest) -> KvResult<BatchResponse> {
        self.sender.send(batch).await
    }

    async fn run(&self, request: Request) -> KvResult<Response> {
        let method = request.method();
        let mut response = self.sender.send(BatchRequest::single(request)).await?;
        response
            .responses
            .pop()
            .ok_or_else(|| KvError::Internal(format!("{method} returned no response")))
    }

    /// Latest value of `key`.
    ///
    /// # Errors
    ///
    /// Propagates routing and evaluation errors.
    pub async fn get(&self, key: impl Into<Key>) -> KvResult<Option<Value>> {
        match self.run(Request::Get(GetRequest { key: key.into() })).await? {
            Response::Get(get) => Ok(get.value),
            other => Err(unexpected("Get", &other)),
        }
    }

    /// Latest value of `key`, decoded as a message.
    ///
    /// # Errors
    ///
    /// Propagates routing and evaluation errors, and decoding failures.
    pub async fn get_message<T: DeserializeOwned>(
        &self,
        key: impl Into<Key>,
    ) -> KvResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(value.get_message()?)),
            None => Ok(None),
        }
    }

    /// Write `value` at `key`.
    ///
    /// # Errors
    ///
    /// Propagates routing and evaluation errors.
    pub async fn put(&self, key: impl Into<Key>, value: Value) -> KvResult<()> {
        match self
            .run(Request::Put(PutRequest {
                key: key.into(),
                value,
            }))
            .await?
        {
            Response::Put => Ok(()),
            other => Err(unexpected("Put", &other)),
        }
    }

    /// Add `increment` to the integer at `key`, returning the new value.
    ///
    /// # Errors
    ///
    /// Propagates routing and evaluation errors.
    pub async fn increment(&self, key: impl Into<Key>, increment: i64) -> KvResult<i64> {
        match self
            .run(Request::Increment(IncrementRequest {
                key: key.into(),
                increment,
            }))
            .await?
        {
            Response::Increment(inc) => Ok(inc.new_value),
            other => Err(unexpected("Increment", &other)),
        }
    }

    /// Delete `key`.
    ///
    /// # Errors
    ///
    /// Propagates routing and evaluation errors.
    pub async fn delete(&self, key: impl Into<Key>) -> KvResult<()> {
        match self.run(Request::Delete(DeleteRequest { key: key.into() })).await? {
            Response::Delete => Ok(()),
            other => Err(unexpected("Delete", &other)),
        }
    }

    /// Replace the range descriptor `expected` with `updated`.
    ///
    /// # Errors
    ///
    /// Fails with [`KvError::ConditionFailed`] if the descriptor changed
    /// since `expected` was read.
    pub async fn change_replicas(
        &self,
        expected: RangeDescriptor,
        updated: RangeDescriptor,
    ) -> KvResult<RangeDescriptor> {
        match self
            .run(Request::ChangeReplicas(ChangeReplicasRequest { expected, updated }))
            .await?
        {
            Response::ChangeReplicas(desc) => Ok(desc),
            other => Err(unexpected("ChangeReplicas", &other)),
        }
    }

    /// Discard the raft log of the lease holder of the range containing
    /// `key` up to `index`. Returns the index the log now starts after.
    ///
    /// # Errors
    ///
    /// Propagates routing errors and raft failures.
    pub async fn truncate_log(&self, key: impl Into<Key>, index: u64) -> KvResult<u64> {
        match self
            .run(Request::TruncateLog(TruncateLogRequest {
                key: key.into(),
                index,
            }))
            .await?
        {
            Response::TruncateLog(truncated) => Ok(truncated.truncated_index),
            other => Err(unexpected("TruncateLog", &other)),
        }
    }
}

fn unexpected(method: &str, response: &Response) -> KvError {
    KvError::Internal(format!("unexpected response to {method}: {response:?}"))
}
