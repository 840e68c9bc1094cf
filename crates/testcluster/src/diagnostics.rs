use std::collections::HashMap;

use ranger_gossip::{Gossip, make_store_key};
use ranger_hlc::Timestamp;
use ranger_kvpb::{Key, KvError, RangeId, ReplicaId, StoreId};
use ranger_storage::mvcc::{compute_stats_for_range, mvcc_get, mvcc_get_range_stats};
use ranger_storage::{Engine, MvccStats};
use ranger_store::ServerState;
use ranger_util::succeeds_soon;
use tracing::{debug, instrument, warn};

use crate::{ClusterContext, HarnessError, HarnessResult};

/// The raft leader of a range as reported by its own store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftLeader {
    /// Slot of the leading node.
    pub node_index: usize,
    /// Store hosting the leader.
    pub store_id: StoreId,
    /// Leader's replica id.
    pub replica_id: ReplicaId,
    /// Term the leader leads. No live store reports a higher one.
    pub term: u64,
}

impl ClusterContext {
    /// Poll the raft status of every running store until one of them leads
    /// `range_id` at the highest term any of them reports.
    ///
    /// # Errors
    ///
    /// Fails if no such leader emerges in time.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_raft_leader(&self, range_id: RangeId) -> HarnessResult<RaftLeader> {
        let timeout = self.inner.config.succeeds_soon_timeout;
        succeeds_soon(timeout, || std::future::ready(self.current_raft_leader(range_id)))
            .await
            .map_err(|err| self.fail_with(err))
    }

    fn current_raft_leader(&self, range_id: RangeId) -> Result<RaftLeader, String> {
        let mut term = 0;
        let mut leader = None;
        for (node_index, store) in self.inner.live_stores() {
            let Some(status) = store.raft_status(range_id) else {
                continue;
            };
            if status.term > term {
                // A leader from an older term no longer counts.
                term = status.term;
                leader = None;
            }
            if status.term == term && status.state == ServerState::Leader {
                leader = Some(RaftLeader {
                    node_index,
                    store_id: store.store_id(),
                    replica_id: status.id,
                    term,
                });
            }
        }
        leader.ok_or_else(|| format!("range {range_id} has no leader at term {term}"))
    }

    /// The integer stored at `key` as of now in every engine, stopped nodes
    /// included, by slot index. Unreadable or missing values read as zero.
    #[must_use]
    pub fn read_int_from_engines(&self, key: &Key) -> Vec<i64> {
        let engines: Vec<_> = self
            .inner
            .registry
            .read()
            .slots
            .iter()
            .map(|slot| slot.engine.clone())
            .collect();
        let now = self.inner.clock.now();
        engines
            .iter()
            .enumerate()
            .map(|(index, engine)| match read_int(engine.as_ref(), key, now) {
                Ok(value) => value,
                Err(err) => {
                    warn!(node_index = index, %key, error = %err, "failed to read value");
                    0
                }
            })
            .collect()
    }

    /// Wait until [`ClusterContext::read_int_from_engines`] returns
    /// `expected`.
    ///
    /// # Errors
    ///
    /// Fails if the engines do not converge in time.
    pub async fn wait_for_values(&self, key: &Key, expected: &[i64]) -> HarnessResult<()> {
        let timeout = self.inner.config.succeeds_soon_timeout;
        succeeds_soon(timeout, || {
            let actual = self.read_int_from_engines(key);
            std::future::ready(if actual == expected {
                Ok(())
            } else {
                Err(format!("{key}: expected {expected:?}, found {actual:?}"))
            })
        })
        .await
        .map_err(|err| self.fail_with(err))
    }

    /// Re-gossip every running store's descriptor and wait until every node
    /// has received all of them.
    ///
    /// # Errors
    ///
    /// Fails if gossip does not connect or converge in time.
    pub async fn gossip_stores(&self) -> HarnessResult<()> {
        self.gossip_stores_inner().await.map_err(|err| self.fail_with(err))
    }

    async fn gossip_stores_inner(&self) -> HarnessResult<()> {
        let timeout = self.inner.config.succeeds_soon_timeout;
        let gossips = self.gossips();
        succeeds_soon(timeout, || {
            std::future::ready(match gossips.iter().find(|g| !g.is_connected()) {
                Some(gossip) => Err(format!(
                    "gossip of node {} is not connected",
                    gossip.node_id()
                )),
                None => Ok(()),
            })
        })
        .await?;

        let mut stamps: HashMap<String, i64> = HashMap::new();
        for (index, store) in self.inner.live_stores() {
            store.gossip_store()?;
            let key = make_store_key(store.store_id());
            let Some(gossip) = gossips.get(index) else {
                continue;
            };
            let stamp = gossip.get_info_status().infos.get(&key).map_or(0, |info| info.orig_stamp);
            stamps.insert(key, stamp);
        }
        succeeds_soon(timeout, || std::future::ready(check_stamps(&gossips, &stamps))).await?;
        debug!(stores = stamps.len(), "store descriptors gossiped");
        Ok(())
    }

    /// Gossip every store, then wait until every running node's store pool
    /// reports all running stores alive.
    ///
    /// # Errors
    ///
    /// Fails if gossip or liveness do not converge in time.
    pub async fn init_gossip_network(&self) -> HarnessResult<()> {
        self.gossip_stores().await?;
        let timeout = self.inner.config.succeeds_soon_timeout;
        succeeds_soon(timeout, || {
            let live = self.inner.live_stores().len();
            let result = (0..self.num_nodes())
                .filter_map(|index| self.store_pool(index).map(|pool| (index, pool)))
                .try_for_each(|(index, pool)| {
                    let (_, alive) = pool.get_store_list();
                    if alive == live {
                        Ok(())
                    } else {
                        Err(format!("node {index} sees {alive} of {live} stores alive"))
                    }
                });
            std::future::ready(result)
        })
        .await
        .map_err(|err| self.fail_with(err))?;
        Ok(())
    }

    /// Check the persisted statistics of `range_id` on node `index` against
    /// `expected`, ignoring the system counters, then check that a full
    /// recomputation matches what is persisted.
    ///
    /// # Errors
    ///
    /// Fails with [`HarnessError::StatsMismatch`] on any difference.
    pub fn verify_range_stats(
        &self,
        index: usize,
        range_id: RangeId,
        expected: &MvccStats,
    ) -> HarnessResult<()> {
        self.verify_range_stats_inner(index, range_id, expected)
            .map_err(|err| self.fail_with(err))?;
        self.verify_recomputed_stats(index, range_id)
    }

    fn verify_range_stats_inner(
        &self,
        index: usize,
        range_id: RangeId,
        expected: &MvccStats,
    ) -> HarnessResult<()> {
        let engine = self.engine(index).ok_or(HarnessError::NoSuchNode(index))?;
        let mut actual = mvcc_get_range_stats(engine.as_ref(), range_id)?;
        actual.sys_bytes = 0;
        actual.sys_count = 0;
        let mut expected = *expected;
        expected.sys_bytes = 0;
        expected.sys_count = 0;
        if actual != expected {
            return Err(HarnessError::StatsMismatch {
                index,
                range_id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Check that recomputing the statistics of `range_id` on node `index`
    /// from scratch reproduces the persisted aggregate exactly.
    ///
    /// # Errors
    ///
    /// Fails with [`HarnessError::StatsMismatch`] on any difference, or if
    /// the node is not running.
    pub fn verify_recomputed_stats(&self, index: usize, range_id: RangeId) -> HarnessResult<()> {
        self.verify_recomputed_stats_inner(index, range_id)
            .map_err(|err| self.fail_with(err))
    }

    fn verify_recomputed_stats_inner(&self, index: usize, range_id: RangeId) -> HarnessResult<()> {
        let store = self.running_node(index)?.store;
        let desc = store.get_replica(range_id)?.desc();
        let engine = store.engine();
        let persisted = mvcc_get_range_stats(engine.as_ref(), range_id)?;
        let recomputed = compute_stats_for_range(engine.as_ref(), &desc)?;
        if persisted != recomputed {
            return Err(HarnessError::StatsMismatch {
                index,
                range_id,
                expected: persisted,
                actual: recomputed,
            });
        }
        Ok(())
    }
}

fn read_int(engine: &dyn Engine, key: &Key, now: Timestamp) -> HarnessResult<i64> {
    match mvcc_get(engine, key, now)? {
        Some(value) => Ok(value.get_int().map_err(KvError::from)?),
        None => Ok(0),
    }
}

fn check_stamps(gossips: &[Gossip], stamps: &HashMap<String, i64>) -> Result<(), String> {
    for gossip in gossips {
        let status = gossip.get_info_status();
        for (key, stamp) in stamps {
            let seen = status.infos.get(key).map(|info| info.orig_stamp);
            if seen.is_none_or(|seen| seen < *stamp) {
                return Err(format!(
                    "node {} has {key} at stamp {seen:?}, want at least {stamp}",
                    gossip.node_id()
                ));
            }
        }
    }
    Ok(())
}
