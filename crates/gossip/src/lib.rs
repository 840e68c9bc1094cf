//! Membership discovery by flooding.
//!
//! Each [`Gossip`] holds a map of infos keyed by string. An info carries the
//! stamp its originator assigned; a receiver keeps it only if the stamp is
//! newer than what it already has, then forwards it to every other peer.
//! New nodes join by contacting their resolvers, which reply with their full
//! state.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::{GossipError, GossipResult};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use ranger_kvpb::{NodeDescriptor, NodeId, StoreId};
use ranger_network::{Addr, Envelope, Server, SimNetwork};
use ranger_util::Stopper;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Service name gossip registers on a node's server.
pub const SERVICE: &str = "gossip";

/// Key under which the system config is gossiped once the first range has a
/// leader.
pub const KEY_SYSTEM_CONFIG: &str = "system-db";

/// Prefix of store descriptor keys.
pub const KEY_STORE_PREFIX: &str = "store:";

/// Prefix of node liveness keys.
pub const KEY_LIVENESS_PREFIX: &str = "liveness:";

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Key of a node descriptor.
#[must_use]
pub fn make_node_id_key(node_id: NodeId) -> String {
    format!("node:{}", node_id.value())
}

/// Key of a store descriptor.
#[must_use]
pub fn make_store_key(store_id: StoreId) -> String {
    format!("{KEY_STORE_PREFIX}{}", store_id.value())
}

/// Key of a node liveness record.
#[must_use]
pub fn make_node_liveness_key(node_id: NodeId) -> String {
    format!("{KEY_LIVENESS_PREFIX}{}", node_id.value())
}

/// A gossiped value and its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    /// Encoded value.
    pub value: Bytes,
    /// Stamp assigned by the originator; larger is newer.
    pub orig_stamp: i64,
    /// Originating node.
    pub node_id: NodeId,
}

/// Snapshot of every info a node holds.
#[derive(Debug, Clone, Default)]
pub struct InfoStatus {
    /// Infos by key.
    pub infos: HashMap<String, Info>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Message {
    Connect {
        node_id: NodeId,
        addr: String,
        infos: HashMap<String, Info>,
    },
    Welcome {
        node_id: NodeId,
        addr: String,
        infos: HashMap<String, Info>,
    },
    Delta {
        node_id: NodeId,
        infos: HashMap<String, Info>,
    },
}

#[derive(Debug, Default)]
struct State {
    addr: Option<Addr>,
    infos: HashMap<String, Info>,
    peers: BTreeMap<NodeId, Addr>,
}

#[derive(Debug)]
struct Inner {
    node_id: NodeId,
    network: SimNetwork,
    resolvers: Vec<Addr>,
    stopper: Stopper,
    mailbox: Mutex<Option<flume::Receiver<Envelope>>>,
    state: Mutex<State>,
    connected: watch::Sender<bool>,
    stamp: AtomicI64,
}

/// A node's membership-discovery handle.
#[derive(Clone, Debug)]
pub struct Gossip {
    inner: Arc<Inner>,
}

impl Gossip {
    /// Create a gossip handle for `node_id`, registering its service on
    /// `server`. `resolvers` are the peers contacted on start; background
    /// work runs on `stopper`.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        network: SimNetwork,
        server: &Server,
        resolvers: Vec<Addr>,
        stopper: &Stopper,
    ) -> Self {
        let mailbox = server.register(SERVICE);
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                node_id,
                network,
                resolvers,
                stopper: stopper.clone(),
                mailbox: Mutex::new(Some(mailbox)),
                state: Mutex::new(State::default()),
                connected,
                stamp: AtomicI64::new(0),
            }),
        }
    }

    /// Node this handle belongs to.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Begin serving at `addr` and contact the resolvers. A node whose only
    /// resolver is itself counts as connected immediately.
    ///
    /// # Errors
    ///
    /// Fails if already started or the stopper is quiescing.
    pub fn start(&self, addr: Addr) -> GossipResult<()> {
        let mailbox = self.inner.mailbox.lock().take().ok_or(GossipError::AlreadyStarted)?;
        self.inner.state.lock().addr = Some(addr.clone());
        if self.inner.resolvers.iter().all(|r| *r == addr) {
            self.mark_connected();
        }
        let gossip = self.clone();
        self.inner.stopper.run_worker("gossip", move |quiesce| async move {
            let mut retry = tokio::time::interval(CONNECT_RETRY_INTERVAL);
            loop {
                tokio::select! {
                    () = quiesce.cancelled() => break,
                    received = mailbox.recv_async() => match received {
                        Ok(envelope) => gossip.handle(&envelope),
                        Err(_) => break,
                    },
                    _ = retry.tick() => {
                        if !gossip.is_connected() {
                            gossip.contact_resolvers();
                        }
                    }
                }
            }
            debug!(node_id = %gossip.inner.node_id, "gossip worker exiting");
        })?;
        info!(
            node_id = %self.inner.node_id,
            %addr,
            resolvers = self.inner.resolvers.len(),
            "gossip started"
        );
        Ok(())
    }

    /// Whether at least one peer exchange completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Wait until [`Gossip::is_connected`].
    pub async fn connected(&self) {
        let mut rx = self.inner.connected.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    /// Publish `value` under `key` and flood it to peers.
    pub fn add_info(&self, key: &str, value: Bytes) {
        let info = {
            let mut state = self.inner.state.lock();
            let floor = state.infos.get(key).map_or(0, |i| i.orig_stamp);
            let next = self.inner.stamp.fetch_add(1, Ordering::SeqCst) + 1;
            let orig_stamp = next.max(floor + 1);
            self.inner.stamp.fetch_max(orig_stamp, Ordering::SeqCst);
            let info = Info {
                value,
                orig_stamp,
                node_id: self.inner.node_id,
            };
            state.infos.insert(key.to_string(), info.clone());
            info
        };
        trace!(key, stamp = info.orig_stamp, "added info");
        let delta = HashMap::from([(key.to_string(), info)]);
        self.broadcast(&delta, None);
    }

    /// Publish a serialized message under `key`.
    ///
    /// # Errors
    ///
    /// Fails if the message cannot be encoded.
    pub fn add_info_message<T: Serialize>(&self, key: &str, message: &T) -> GossipResult<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(message, &mut buf).map_err(|e| GossipError::Encode(e.to_string()))?;
        self.add_info(key, Bytes::from(buf));
        Ok(())
    }

    /// Raw value under `key`.
    #[must_use]
    pub fn get_info(&self, key: &str) -> Option<Bytes> {
        self.inner.state.lock().infos.get(key).map(|i| i.value.clone())
    }

    /// Decoded message under `key`.
    ///
    /// # Errors
    ///
    /// Fails if no info exists or it does not decode as `T`.
    pub fn get_info_message<T: DeserializeOwned>(&self, key: &str) -> GossipResult<T> {
        let value = self
            .get_info(key)
            .ok_or_else(|| GossipError::NotFound(key.to_string()))?;
        ciborium::from_reader(value.as_ref()).map_err(|e| GossipError::Decode(e.to_string()))
    }

    /// Infos whose key starts with `prefix`.
    #[must_use]
    pub fn infos_with_prefix(&self, prefix: &str) -> Vec<(String, Info)> {
        self.inner
            .state
            .lock()
            .infos
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, i)| (k.clone(), i.clone()))
            .collect()
    }

    /// Publish this node's descriptor.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor cannot be encoded.
    pub fn set_node_descriptor(&self, desc: &NodeDescriptor) -> GossipResult<()> {
        self.add_info_message(&make_node_id_key(desc.node_id), desc)
    }

    /// Descriptor of `node_id`, as far as gossip knows.
    ///
    /// # Errors
    ///
    /// Fails if the node has not been gossiped yet.
    pub fn get_node_descriptor(&self, node_id: NodeId) -> GossipResult<NodeDescriptor> {
        self.get_info_message(&make_node_id_key(node_id))
    }

    /// Snapshot of all infos.
    #[must_use]
    pub fn get_info_status(&self) -> InfoStatus {
        InfoStatus {
            infos: self.inner.state.lock().infos.clone(),
        }
    }

    fn mark_connected(&self) {
        if !self.inner.connected.send_replace(true) {
            debug!(node_id = %self.inner.node_id, "gossip connected");
        }
    }

    fn local_addr(&self) -> Option<Addr> {
        self.inner.state.lock().addr.clone()
    }

    fn contact_resolvers(&self) {
        let Some(addr) = self.local_addr() else {
            return;
        };
        let infos = self.inner.state.lock().infos.clone();
        let message = Message::Connect {
            node_id: self.inner.node_id,
            addr: addr.to_string(),
            infos,
        };
        for resolver in self.inner.resolvers.iter().filter(|r| **r != addr) {
            if let Err(err) = self.send(resolver, &message) {
                debug!(%resolver, error = %err, "failed to contact resolver");
            }
        }
    }

    fn send(&self, to: &Addr, message: &Message) -> GossipResult<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(message, &mut buf).map_err(|e| GossipError::Encode(e.to_string()))?;
        self.inner.network.send(to, SERVICE, Bytes::from(buf))?;
        Ok(())
    }

    fn broadcast(&self, infos: &HashMap<String, Info>, except: Option<NodeId>) {
        if infos.is_empty() {
            return;
        }
        let peers: Vec<(NodeId, Addr)> = self
            .inner
            .state
            .lock()
            .peers
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(id, addr)| (*id, addr.clone()))
            .collect();
        if peers.is_empty() {
            return;
        }
        let message = Message::Delta {
            node_id: self.inner.node_id,
            infos: infos.clone(),
        };
        for (peer, addr) in peers {
            if let Err(err) = self.send(&addr, &message) {
                debug!(%peer, error = %err, "failed to forward infos");
            }
        }
    }

    /// Keep the infos that are newer than ours and return them.
    fn merge(&self, infos: HashMap<String, Info>) -> HashMap<String, Info> {
        let mut state = self.inner.state.lock();
        let mut fresh = HashMap::new();
        for (key, info) in infos {
            let newer = state
                .infos
                .get(&key)
                .is_none_or(|existing| info.orig_stamp > existing.orig_stamp);
            if newer {
                state.infos.insert(key.clone(), info.clone());
                fresh.insert(key, info);
            }
        }
        fresh
    }

    fn add_peer(&self, node_id: NodeId, addr: String) {
        if node_id == self.inner.node_id {
            return;
        }
        self.inner.state.lock().peers.insert(node_id, Addr::new(addr));
    }

    fn handle(&self, envelope: &Envelope) {
        let message: Message = match ciborium::from_reader(envelope.payload.as_ref()) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable gossip message");
                return;
            }
        };
        match message {
            Message::Connect { node_id, addr, infos } => {
                self.add_peer(node_id, addr.clone());
                let fresh = self.merge(infos);
                let reply = {
                    let state = self.inner.state.lock();
                    Message::Welcome {
                        node_id: self.inner.node_id,
                        addr: state.addr.as_ref().map(ToString::to_string).unwrap_or_default(),
                        infos: state.infos.clone(),
                    }
                };
                if let Err(err) = self.send(&Addr::new(addr), &reply) {
                    debug!(peer = %node_id, error = %err, "failed to welcome peer");
                }
                self.mark_connected();
                self.broadcast(&fresh, Some(node_id));
            }
            Message::Welcome { node_id, addr, infos } => {
                self.add_peer(node_id, addr);
                let fresh = self.merge(infos);
                self.mark_connected();
                self.broadcast(&fresh, Some(node_id));
            }
            Message::Delta { node_id, infos } => {
                let fresh = self.merge(infos);
                self.broadcast(&fresh, Some(node_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        gossip: Gossip,
        addr: Addr,
    }

    fn spawn_node(
        network: &SimNetwork,
        stopper: &Stopper,
        id: u32,
        resolver: Option<&Addr>,
    ) -> Node {
        let server = network.server();
        let gossip = Gossip::new(
            NodeId::new(id),
            network.clone(),
            &server,
            resolver.into_iter().cloned().collect(),
            stopper,
        );
        let listener = network.listen(&server).unwrap();
        let addr = listener.addr().clone();
        gossip.start(addr.clone()).unwrap();
        Node { gossip, addr }
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        ranger_util::succeeds_soon(Duration::from_secs(5), || {
            let ok = check();
            async move { if ok { Ok(()) } else { Err("not yet") } }
        })
        .await
        .unwrap();
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn infos_flood_through_the_seed() {
        let network = SimNetwork::new();
        let stopper = Stopper::new();
        let seed = spawn_node(&network, &stopper, 1, None);
        let seed_addr = seed.addr.clone();
        let b = spawn_node(&network, &stopper, 2, Some(&seed_addr));
        let c = spawn_node(&network, &stopper, 3, Some(&seed_addr));

        b.gossip.connected().await;
        c.gossip.connected().await;

        b.gossip.add_info("k", Bytes::from_static(b"from-b"));
        eventually(|| c.gossip.get_info("k").as_deref() == Some(&b"from-b"[..])).await;
        eventually(|| seed.gossip.get_info("k").is_some()).await;

        stopper.stop().await;
    }

    #[tokio::test]
    async fn newer_stamp_wins_across_originators() {
        let network = SimNetwork::new();
        let stopper = Stopper::new();
        let a = spawn_node(&network, &stopper, 1, None);
        let b = spawn_node(&network, &stopper, 2, Some(&a.addr));
        b.gossip.connected().await;

        a.gossip.add_info(KEY_SYSTEM_CONFIG, Bytes::from_static(b"v1"));
        eventually(|| b.gossip.get_info(KEY_SYSTEM_CONFIG).is_some()).await;
        b.gossip.add_info(KEY_SYSTEM_CONFIG, Bytes::from_static(b"v2"));
        eventually(|| a.gossip.get_info(KEY_SYSTEM_CONFIG).as_deref() == Some(&b"v2"[..])).await;

        let status = a.gossip.get_info_status();
        assert_eq!(status.infos[KEY_SYSTEM_CONFIG].node_id, NodeId::new(2));
        stopper.stop().await;
    }

    #[tokio::test]
    async fn node_descriptors_round_trip() {
        let network = SimNetwork::new();
        let stopper = Stopper::new();
        let a = spawn_node(&network, &stopper, 1, None);
        assert!(a.gossip.is_connected());
        let desc = NodeDescriptor {
            node_id: NodeId::new(1),
            address: a.addr.to_string(),
        };
        a.gossip.set_node_descriptor(&desc).unwrap();
        assert_eq!(a.gossip.get_node_descriptor(NodeId::new(1)).unwrap(), desc);
        assert!(matches!(
            a.gossip.get_node_descriptor(NodeId::new(9)),
            Err(GossipError::NotFound(_))
        ));
        stopper.stop().await;
    }

    #[test]
    fn well_known_keys() {
        assert_eq!(make_store_key(StoreId::new(3)), "store:3");
        assert_eq!(make_node_id_key(NodeId::new(2)), "node:2");
        assert!(make_node_liveness_key(NodeId::new(1)).starts_with(KEY_LIVENESS_PREFIX));
    }
}
