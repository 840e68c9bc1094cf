use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ranger_kvpb::{BatchRequest, BatchResponse, KvError, KvResult, ReplicaDescriptor};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Sender;

/// Outcome of one [`Transport::send_next`] attempt.
#[derive(Debug, Clone)]
pub enum BatchCall {
    /// The replica served the batch.
    Response(BatchResponse),
    /// The replica answered with an error.
    Error(KvError),
    /// The replica could not be reached.
    Unavailable(String),
}

/// Per-send options handed to a [`TransportFactory`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Upper bound on a single attempt, if any.
    pub timeout: Option<Duration>,
}

/// Candidate replicas in the order they should be tried.
pub type ReplicaSlice = Vec<ReplicaDescriptor>;

/// Delivers one batch to a sequence of candidate replicas.
pub trait Transport: Send {
    /// Whether every candidate was tried.
    fn is_exhausted(&self) -> bool;

    /// Try the next candidate, reporting exactly one [`BatchCall`] on `done`.
    fn send_next(&mut self, done: flume::Sender<BatchCall>);

    /// Prefer `replica` for the next attempt.
    fn move_to_front(&mut self, replica: &ReplicaDescriptor);

    /// Cancel in-flight work.
    fn close(&mut self);
}

/// Builds a [`Transport`] for one batch.
pub type TransportFactory = Arc<
    dyn Fn(SendOptions, ReplicaSlice, BatchRequest) -> KvResult<Box<dyn Transport>> + Send + Sync,
>;

/// A factory whose transports hand every batch to `sender` locally,
/// addressed to each candidate in turn.
#[must_use]
pub fn sender_transport_factory(sender: Arc<dyn Sender>) -> TransportFactory {
    Arc::new(
        move |_opts: SendOptions,
              replicas: ReplicaSlice,
              batch: BatchRequest|
              -> KvResult<Box<dyn Transport>> {
            Ok(Box::new(SenderTransport {
                sender: sender.clone(),
                replicas: replicas.into(),
                batch,
                cancel: CancellationToken::new(),
            }))
        },
    )
}

struct SenderTransport {
    sender: Arc<dyn Sender>,
    replicas: VecDeque<ReplicaDescriptor>,
    batch: BatchRequest,
    cancel: CancellationToken,
}

impl Transport for SenderTransport {
    fn is_exhausted(&self) -> bool {
        self.replicas.is_empty()
    }

    fn send_next(&mut self, done: flume::Sender<BatchCall>) {
        let Some(replica) = self.replicas.pop_front() else {
            let _ = done.send(BatchCall::Unavailable("no replicas remaining".to_string()));
            return;
        };
        let mut batch = self.batch.clone();
        batch.header.replica = replica;
        let sender = self.sender.clone();
        let cancel = self.cancel.clone();
        trace!(%replica, "sending to local sender");
        tokio::spawn(async move {
            let call = tokio::select! {
                result = sender.send(batch) => match result {
                    Ok(response) => BatchCall::Response(response),
                    Err(err) => BatchCall::Error(err),
                },
                () = cancel.cancelled() => BatchCall::Unavailable("transport closed".to_string()),
            };
            let _ = done.send(call);
        });
    }

    fn move_to_front(&mut self, replica: &ReplicaDescriptor) {
        if let Some(pos) = self.replicas.iter().position(|r| r == replica) {
            if let Some(found) = self.replicas.remove(pos) {
                self.replicas.push_front(found);
            }
        }
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}
