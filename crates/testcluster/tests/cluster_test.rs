use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use ranger_hlc::{Clock, ManualClock};
use ranger_kvpb::{BatchRequest, Key, PutRequest, RangeId, ReplicaId, Request, Value};
use ranger_storage::MvccStats;
use ranger_storage::mvcc::mvcc_get_range_stats;
use ranger_store::FIRST_RANGE_ID;
use ranger_testcluster::{ClusterConfig, ClusterContext, HarnessError};
use ranger_util::{DEFAULT_SUCCEEDS_SOON_DURATION, succeeds_soon};

async fn start(num_nodes: usize) -> ClusterContext {
    ClusterContext::start(ClusterConfig::default(), num_nodes).await.unwrap()
}

/// A three node cluster with the first range replicated everywhere.
async fn start_replicated() -> ClusterContext {
    let cluster = start(3).await;
    cluster.replicate_range(FIRST_RANGE_ID, &[1, 2]).await.unwrap();
    cluster
}

fn lease_holder_index(cluster: &ClusterContext) -> Option<usize> {
    let now = cluster.clock().now();
    (0..cluster.num_nodes()).find(|&index| {
        cluster.store(index).is_some_and(|store| {
            store
                .get_replica(FIRST_RANGE_ID)
                .ok()
                .and_then(|replica| replica.lease())
                .is_some_and(|lease| lease.owned_by(store.store_id()) && lease.covers(now))
        })
    })
}

/// Wait until every engine persists the same stats for the first range.
async fn wait_for_uniform_stats(cluster: &ClusterContext) -> MvccStats {
    succeeds_soon(DEFAULT_SUCCEEDS_SOON_DURATION, || {
        let stats: Vec<MvccStats> = (0..cluster.num_nodes())
            .map(|index| {
                let engine = cluster.engine(index).unwrap();
                mvcc_get_range_stats(engine.as_ref(), FIRST_RANGE_ID).unwrap()
            })
            .collect();
        std::future::ready(if stats.iter().all(|s| *s == stats[0]) {
            Ok(stats[0])
        } else {
            Err(format!("stats differ: {stats:?}"))
        })
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn single_node_serves_requests() {
    let cluster = start(1).await;
    let db = cluster.db(0).unwrap();
    assert_eq!(db.increment("a", 5).await.unwrap(), 5);
    assert_eq!(cluster.read_int_from_engines(&Key::from("a")), vec![5]);
    assert!(!cluster.is_failed());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_get_sequential_identities() {
    let cluster = start(3).await;
    for index in 0..3 {
        let ident = cluster.ident(index).unwrap();
        let expected = u32::try_from(index + 1).unwrap();
        assert_eq!(ident.node_id.value(), expected);
        assert_eq!(ident.store_id.value(), expected);
        assert_eq!(cluster.store(index).unwrap().store_id(), ident.store_id);
    }
    assert!(cluster.ident(3).is_none());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn replicate_range_copies_data() {
    let cluster = start(3).await;
    let key = Key::from("a");
    cluster.db(0).unwrap().increment("a", 5).await.unwrap();
    cluster.replicate_range(FIRST_RANGE_ID, &[1, 2]).await.unwrap();
    cluster.wait_for_values(&key, &[5, 5, 5]).await.unwrap();

    for index in 1..3 {
        let replica = cluster.store(index).unwrap().get_replica(FIRST_RANGE_ID).unwrap();
        assert_eq!(replica.replica_id(), ReplicaId::new(u32::try_from(index + 1).unwrap()));
        assert!(replica.desc().contains_key(&Key::min()));
    }

    cluster.db(1).unwrap().increment("a", 11).await.unwrap();
    cluster.wait_for_values(&key, &[16, 16, 16]).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_range_is_the_newest_snapshot() {
    let cluster = start(3).await;
    let before = cluster.first_range().unwrap();
    assert_eq!(before.replicas.len(), 1);

    cluster.replicate_range(FIRST_RANGE_ID, &[1]).await.unwrap();
    let after = cluster.first_range().unwrap();
    assert_eq!(after.replicas.len(), 2);
    assert_eq!(after.next_replica_id, ReplicaId::new(3));
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn removed_replica_can_be_added_back() {
    let cluster = start_replicated().await;
    let holder = lease_holder_index(&cluster);
    let victim = if holder == Some(2) { 1 } else { 2 };

    cluster.unreplicate_range(FIRST_RANGE_ID, victim).await.unwrap();
    let desc = cluster.first_range().unwrap();
    assert_eq!(desc.replicas.len(), 2);
    let victim_store = cluster.ident(victim).unwrap().store_id;
    assert!(desc.find_replica(victim_store).is_none());

    cluster.replicate_range(FIRST_RANGE_ID, &[victim]).await.unwrap();
    let replica = cluster.store(victim).unwrap().get_replica(FIRST_RANGE_ID).unwrap();
    assert_eq!(replica.replica_id(), ReplicaId::new(4));

    cluster.db(0).unwrap().increment("b", 3).await.unwrap();
    cluster.wait_for_values(&Key::from("b"), &[3, 3, 3]).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn writes_succeed_after_lease_holder_stops() {
    let cluster = start_replicated().await;
    let key = Key::from("a");
    cluster.db(0).unwrap().increment("a", 1).await.unwrap();
    cluster.wait_for_values(&key, &[1, 1, 1]).await.unwrap();

    let holder = lease_holder_index(&cluster).unwrap();
    cluster.stop_node(holder).await.unwrap();
    cluster.expire_leases();

    let live = (0..3).find(|&index| index != holder).unwrap();
    assert_eq!(cluster.db(live).unwrap().increment("a", 1).await.unwrap(), 2);

    let mut expected = vec![2, 2, 2];
    expected[holder] = 1;
    cluster.wait_for_values(&key, &expected).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expire_leases_advances_past_the_lease_horizon() {
    let cluster = start(1).await;
    let store = cluster.store(0).unwrap();
    let before = cluster.manual_clock().unix_nanos();
    cluster.expire_leases();
    assert_eq!(cluster.manual_clock().unix_nanos() - before, store.lease_expiration());

    // The next request re-acquires the lease at the new time.
    cluster.db(0).unwrap().increment("c", 1).await.unwrap();
    let lease = store.get_replica(FIRST_RANGE_ID).unwrap().lease().unwrap();
    assert!(lease.covers(cluster.clock().now()));
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_match_recomputation_on_one_node() {
    let cluster = start(1).await;
    cluster.verify_range_stats(0, FIRST_RANGE_ID, &MvccStats::default()).unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_match_recomputation_on_three_nodes() {
    let cluster = start_replicated().await;
    wait_for_uniform_stats(&cluster).await;
    for index in 0..3 {
        cluster.verify_range_stats(index, FIRST_RANGE_ID, &MvccStats::default()).unwrap();
    }
    assert!(!cluster.is_failed());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_mismatch_fails_the_run() {
    let cluster = start(1).await;
    let bogus = MvccStats {
        live_count: 42,
        ..MvccStats::default()
    };
    let err = cluster.verify_range_stats(0, FIRST_RANGE_ID, &bogus).unwrap_err();
    assert!(matches!(err, HarnessError::StatsMismatch { index: 0, .. }));
    assert!(cluster.is_failed());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn raft_leader_changes_after_leader_stops() {
    let cluster = start_replicated().await;
    let leader = cluster.get_raft_leader(FIRST_RANGE_ID).await.unwrap();
    let max_term = (0..3)
        .filter_map(|index| cluster.store(index)?.raft_status(FIRST_RANGE_ID))
        .map(|status| status.term)
        .max()
        .unwrap();
    assert_eq!(leader.term, max_term);

    cluster.stop_node(leader.node_index).await.unwrap();
    let next = cluster.get_raft_leader(FIRST_RANGE_ID).await.unwrap();
    assert_ne!(next.node_index, leader.node_index);
    assert!(next.term > leader.term);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn restarted_node_keeps_committed_values() {
    let cluster = start_replicated().await;
    let key = Key::from("a");
    cluster.db(0).unwrap().increment("a", 7).await.unwrap();
    cluster.wait_for_values(&key, &[7, 7, 7]).await.unwrap();

    cluster.stop_node(1).await.unwrap();
    assert!(cluster.store(1).is_none());
    assert!(cluster.db(1).is_none());
    assert_eq!(cluster.read_int_from_engines(&key), vec![7, 7, 7]);

    cluster.restart_node(1).await.unwrap();
    cluster.db(1).unwrap().increment("a", 1).await.unwrap();
    cluster.wait_for_values(&key, &[8, 8, 8]).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_and_restart_node_errors() {
    let cluster = start(1).await;
    assert!(matches!(cluster.restart_node(0).await, Err(HarnessError::NodeAlreadyRunning(0))));
    assert!(matches!(cluster.stop_node(5).await, Err(HarnessError::NoSuchNode(5))));
    cluster.stop_node(0).await.unwrap();
    assert!(matches!(cluster.stop_node(0).await, Err(HarnessError::NodeNotRunning(0))));
    cluster.restart_node(0).await.unwrap();
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_restart_preserves_data() {
    let cluster = start(1).await;
    cluster.db(0).unwrap().increment("a", 3).await.unwrap();
    cluster.restart().await.unwrap();
    assert_eq!(cluster.db(0).unwrap().increment("a", 1).await.unwrap(), 4);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gossip_network_sees_every_store() {
    let cluster = start(3).await;
    cluster.init_gossip_network().await.unwrap();
    for index in 0..3 {
        let pool = cluster.store_pool(index).unwrap();
        let (stores, alive) = pool.get_store_list();
        assert_eq!(stores.len(), 3);
        assert_eq!(alive, 3);
    }
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engines_carry_state_into_a_new_cluster() {
    let first = start(1).await;
    first.db(0).unwrap().increment("a", 9).await.unwrap();
    first.stop_node(0).await.unwrap();
    let engine = first.engine(0).unwrap();

    // Later than anything the first cluster wrote.
    let config = ClusterConfig {
        manual_clock_start: first.manual_clock().unix_nanos() + 1_000,
        ..ClusterConfig::default()
    };
    let second = ClusterContext::with_engines(config, vec![Arc::clone(&engine)]);
    second.start_nodes(1).await.unwrap();
    assert_eq!(second.read_int_from_engines(&Key::from("a")), vec![9]);
    assert_eq!(second.db(0).unwrap().increment("a", 1).await.unwrap(), 10);
    second.stop().await;
    assert!(!engine.is_closed());
    first.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_range_has_no_live_member() {
    let cluster = start(1).await;
    let err = cluster.replicate_range(RangeId::new(77), &[0]).await.unwrap_err();
    assert!(matches!(err, HarnessError::NoLiveMember(_)));
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_range_is_missing_once_its_only_store_stops() {
    let cluster = start(1).await;
    cluster.stop_node(0).await.unwrap();
    let err = cluster.first_range().unwrap_err();
    assert!(matches!(err, HarnessError::FirstRangeMissing));
    assert!(cluster.is_failed());
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skewed_node_ratchets_the_clock_of_its_peers() {
    let defaults = ClusterConfig::default();
    let skew = i64::try_from(Duration::from_millis(20).as_nanos()).unwrap();
    let ahead = Arc::new(Clock::new(
        Arc::new(ManualClock::new(defaults.manual_clock_start + skew)),
        defaults.max_offset,
    ));
    let config = ClusterConfig {
        clocks: vec![None, Some(ahead.clone())],
        ..defaults
    };
    let cluster = ClusterContext::start(config, 2).await.unwrap();
    assert!(Arc::ptr_eq(&cluster.clock_of(1), &ahead));

    let written = cluster
        .db(1)
        .unwrap()
        .send(BatchRequest::single(Request::Put(PutRequest {
            key: Key::from("s"),
            value: Value::from_int(3),
        })))
        .await
        .unwrap();
    assert!(written.timestamp.wall_time >= cluster.clock().physical_now() + skew);

    // The lease holder on node 0 ran the write, so its clock moved past it
    // and a read issued there observes the value.
    assert!(cluster.clock_of(0).now() > written.timestamp);
    let value = cluster.db(0).unwrap().get("s").await.unwrap().unwrap();
    assert_eq!(value.get_int().unwrap(), 3);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn replica_added_after_truncation_catches_up_from_a_snapshot() {
    let cluster = start(2).await;
    let db = cluster.db(0).unwrap();
    for _ in 0..3 {
        db.increment("a", 2).await.unwrap();
    }
    let truncated = db.truncate_log("a", u64::MAX).await.unwrap();
    let status = cluster.store(0).unwrap().raft_status(FIRST_RANGE_ID).unwrap();
    assert!(status.truncated >= Some(truncated));

    cluster.replicate_range(FIRST_RANGE_ID, &[1]).await.unwrap();
    cluster.wait_for_values(&Key::from("a"), &[6, 6]).await.unwrap();
    assert!(logs_contain("applied snapshot"));
    db.increment("a", 1).await.unwrap();
    cluster.wait_for_values(&Key::from("a"), &[7, 7]).await.unwrap();
    cluster.stop().await;
}
