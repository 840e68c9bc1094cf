//! In-process simulated network.
//!
//! A [`SimNetwork`] routes opaque payloads between [`Server`]s living in the
//! same process. Services register a mailbox on a server before it is bound
//! to an address with [`SimNetwork::listen`]; senders address a
//! `(address, service)` pair. Delivery is immediate and unordered across
//! services but FIFO per mailbox. [`SimNetwork::request`] additionally waits
//! for the recipient to [`Envelope::respond`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::{NetworkError, NetworkResult};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, trace};

/// A simulated network address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(String);

impl Addr {
    /// Wrap an address string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivered payload.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Service the payload was addressed to.
    pub service: &'static str,
    /// Payload bytes.
    pub payload: Bytes,
    reply: Option<flume::Sender<Bytes>>,
}

impl Envelope {
    /// Whether the sender is waiting for a reply.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer a request. Returns false for one-way payloads and when the
    /// requester already gave up.
    pub fn respond(self, payload: Bytes) -> bool {
        self.reply.is_some_and(|reply| reply.send(payload).is_ok())
    }
}

/// A set of named service mailboxes, bound to an address by
/// [`SimNetwork::listen`].
#[derive(Clone, Debug, Default)]
pub struct Server {
    services: Arc<DashMap<&'static str, flume::Sender<Envelope>>>,
}

impl Server {
    /// Register `service` and return its mailbox. Registering again replaces
    /// the previous mailbox.
    #[must_use]
    pub fn register(&self, service: &'static str) -> flume::Receiver<Envelope> {
        let (tx, rx) = flume::unbounded();
        self.services.insert(service, tx);
        trace!(service, "registered service");
        rx
    }

    fn deliver(
        &self,
        addr: &Addr,
        service: &'static str,
        payload: Bytes,
        reply: Option<flume::Sender<Bytes>>,
    ) -> NetworkResult<()> {
        let tx = self
            .services
            .get(service)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NetworkError::ServiceNotRegistered {
                addr: addr.clone(),
                service,
            })?;
        tx.send(Envelope {
            service,
            payload,
            reply,
        })
        .map_err(|_| NetworkError::ServiceClosed {
                addr: addr.clone(),
                service,
            })
    }
}

/// A server bound to an address.
#[derive(Clone, Debug)]
pub struct Listener {
    addr: Addr,
    network: SimNetwork,
}

impl Listener {
    /// Bound address.
    #[must_use]
    pub const fn addr(&self) -> &Addr {
        &self.addr
    }

    /// Unbind the address. Later sends to it fail as unreachable.
    pub fn close(&self) {
        self.network.inner.listeners.remove(&self.addr);
        debug!(addr = %self.addr, "listener closed");
    }
}

#[derive(Debug, Default)]
struct Inner {
    listeners: DashMap<Addr, Server>,
    next_port: AtomicU64,
    stopped: AtomicBool,
}

/// The shared network layer.
#[derive(Clone, Debug, Default)]
pub struct SimNetwork {
    inner: Arc<Inner>,
}

impl SimNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, unbound server.
    #[must_use]
    pub fn server(&self) -> Server {
        Server::default()
    }

    /// Bind `server` to a newly allocated address.
    ///
    /// # Errors
    ///
    /// Fails once the network is stopped.
    pub fn listen(&self, server: &Server) -> NetworkResult<Listener> {
        if self.is_stopped() {
            return Err(NetworkError::Stopped);
        }
        let port = self.inner.next_port.fetch_add(1, Ordering::SeqCst) + 1;
        let addr = Addr::new(format!("sim:{port}"));
        if self.inner.listeners.contains_key(&addr) {
            return Err(NetworkError::AddressInUse(addr));
        }
        self.inner.listeners.insert(addr.clone(), server.clone());
        info!(%addr, "listening");
        Ok(Listener {
            addr,
            network: self.clone(),
        })
    }

    /// Check that `addr` is reachable, establishing the simulated connection.
    ///
    /// # Errors
    ///
    /// Fails if nothing listens at `addr`.
    pub fn dial(&self, addr: &Addr) -> NetworkResult<()> {
        if self.is_stopped() {
            return Err(NetworkError::Stopped);
        }
        if self.inner.listeners.contains_key(addr) {
            trace!(%addr, "dialed");
            Ok(())
        } else {
            Err(NetworkError::Unreachable(addr.clone()))
        }
    }

    /// Deliver `payload` to `service` at `addr`.
    ///
    /// # Errors
    ///
    /// Fails if the network is stopped, nothing listens at `addr`, or the
    /// service is missing or closed.
    pub fn send(&self, addr: &Addr, service: &'static str, payload: Bytes) -> NetworkResult<()> {
        self.server_at(addr)?.deliver(addr, service, payload, None)
    }

    /// Deliver `payload` to `service` at `addr` and wait up to `timeout` for
    /// the recipient's reply.
    ///
    /// # Errors
    ///
    /// Fails like [`SimNetwork::send`], and when the recipient drops the
    /// request or does not answer in time.
    pub async fn request(
        &self,
        addr: &Addr,
        service: &'static str,
        payload: Bytes,
        timeout: Duration,
    ) -> NetworkResult<Bytes> {
        let (tx, rx) = flume::bounded(1);
        self.server_at(addr)?.deliver(addr, service, payload, Some(tx))?;
        match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetworkError::NoResponse {
                addr: addr.clone(),
                service,
            }),
            Err(_) => {
                trace!(%addr, service, ?timeout, "request timed out");
                Err(NetworkError::Timeout {
                    addr: addr.clone(),
                    service,
                })
            }
        }
    }

    fn server_at(&self, addr: &Addr) -> NetworkResult<Server> {
        if self.is_stopped() {
            return Err(NetworkError::Stopped);
        }
        self.inner
            .listeners
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NetworkError::Unreachable(addr.clone()))
    }

    /// Stop the network: unbind every listener and refuse further traffic.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.listeners.clear();
            info!("network stopped");
        }
    }

    /// Whether [`SimNetwork::stop`] was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn payloads_reach_registered_service() {
        let network = SimNetwork::new();
        let server = network.server();
        let rx = server.register("echo");
        let listener = network.listen(&server).unwrap();

        network.dial(listener.addr()).unwrap();
        network
            .send(listener.addr(), "echo", Bytes::from_static(b"ping"))
            .unwrap();
        let envelope = rx.recv_async().await.unwrap();
        assert_eq!(envelope.service, "echo");
        assert_eq!(envelope.payload, Bytes::from_static(b"ping"));
    }

    #[test]
    fn addresses_are_unique() {
        let network = SimNetwork::new();
        let a = network.listen(&network.server()).unwrap();
        let b = network.listen(&network.server()).unwrap();
        assert_ne!(a.addr(), b.addr());
    }

    #[test]
    fn unknown_service_is_rejected() {
        let network = SimNetwork::new();
        let listener = network.listen(&network.server()).unwrap();
        let err = network.send(listener.addr(), "raft", Bytes::new()).unwrap_err();
        assert!(matches!(err, NetworkError::ServiceNotRegistered { service: "raft", .. }));
    }

    #[test]
    fn stop_makes_everything_unreachable() {
        let network = SimNetwork::new();
        let server = network.server();
        let _rx = server.register("gossip");
        let listener = network.listen(&server).unwrap();
        network.stop();
        assert_eq!(network.dial(listener.addr()), Err(NetworkError::Stopped));
        assert!(network.listen(&network.server()).is_err());
    }

    #[tokio::test]
    async fn requests_wait_for_the_reply() {
        let network = SimNetwork::new();
        let server = network.server();
        let rx = server.register("echo");
        let listener = network.listen(&server).unwrap();
        tokio::spawn(async move {
            let envelope = rx.recv_async().await.unwrap();
            assert!(envelope.expects_reply());
            let payload = envelope.payload.clone();
            assert!(envelope.respond(payload));
        });

        let reply = network
            .request(
                listener.addr(),
                "echo",
                Bytes::from_static(b"ping"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn unanswered_requests_fail() {
        let network = SimNetwork::new();
        let server = network.server();
        let rx = server.register("sink");
        let listener = network.listen(&server).unwrap();

        let err = network
            .request(listener.addr(), "sink", Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout { service: "sink", .. }));

        // Drops the expired request and the next one unanswered.
        let dropped = tokio::spawn(async move {
            for _ in 0..2 {
                drop(rx.recv_async().await.unwrap());
            }
        });
        let err = network
            .request(listener.addr(), "sink", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        dropped.await.unwrap();
        assert!(matches!(err, NetworkError::NoResponse { service: "sink", .. }));
    }

    #[test]
    fn one_way_payloads_take_no_reply() {
        let network = SimNetwork::new();
        let server = network.server();
        let rx = server.register("echo");
        let listener = network.listen(&server).unwrap();
        network.send(listener.addr(), "echo", Bytes::new()).unwrap();
        let envelope = rx.try_recv().unwrap();
        assert!(!envelope.expects_reply());
        assert!(!envelope.respond(Bytes::new()));
    }

    #[test]
    fn closed_listener_is_unreachable() {
        let network = SimNetwork::new();
        let listener = network.listen(&network.server()).unwrap();
        listener.close();
        assert!(matches!(network.dial(listener.addr()), Err(NetworkError::Unreachable(_))));
    }
}
