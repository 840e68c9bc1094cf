use pretty_assertions::assert_eq;
use ranger_hlc::Timestamp;
use ranger_kvpb::keys::{self, KEY_MAX};
use ranger_kvpb::{Key, RangeDescriptor, RangeId, ReplicaId, Value};
use ranger_storage::mvcc::{self, MVCC_VERSION_TIMESTAMP_SIZE};
use ranger_storage::{Engine, MvccStats};
use ranger_storage_memory::InMemEngine;

fn ts(wall: i64) -> Timestamp {
    Timestamp::new(wall, 0)
}

fn full_range() -> RangeDescriptor {
    RangeDescriptor {
        range_id: RangeId::new(1),
        start_key: Key::min(),
        end_key: Key::from(KEY_MAX),
        replicas: Vec::new(),
        next_replica_id: ReplicaId::new(1),
    }
}

#[test]
fn reads_see_versions_at_or_below_timestamp() {
    let engine = InMemEngine::new();
    let key = Key::from("a");
    mvcc::mvcc_put(&engine, None, &key, ts(10), &Value::from_int(1)).unwrap();
    mvcc::mvcc_put(&engine, None, &key, ts(20), &Value::from_int(2)).unwrap();

    assert_eq!(mvcc::mvcc_get(&engine, &key, ts(5)).unwrap(), None);
    assert_eq!(mvcc::mvcc_get(&engine, &key, ts(15)).unwrap(), Some(Value::from_int(1)));
    assert_eq!(mvcc::mvcc_get(&engine, &key, ts(25)).unwrap(), Some(Value::from_int(2)));
}

#[test]
fn delete_hides_value_but_keeps_history() {
    let engine = InMemEngine::new();
    let key = Key::from("a");
    mvcc::mvcc_put(&engine, None, &key, ts(10), &Value::from_bytes(b"x")).unwrap();
    mvcc::mvcc_delete(&engine, None, &key, ts(20)).unwrap();
    assert_eq!(mvcc::mvcc_get(&engine, &key, ts(30)).unwrap(), None);
    assert!(mvcc::mvcc_get(&engine, &key, ts(15)).unwrap().is_some());
    assert_eq!(engine.get_versions(&key).unwrap().len(), 2);
}

#[test]
fn stale_write_is_bumped_above_newest_version() {
    let engine = InMemEngine::new();
    let key = Key::from("a");
    mvcc::mvcc_put(&engine, None, &key, ts(20), &Value::from_int(1)).unwrap();
    mvcc::mvcc_put(&engine, None, &key, ts(10), &Value::from_int(2)).unwrap();
    let versions = engine.get_versions(&key).unwrap();
    assert_eq!(versions[0].timestamp, Timestamp::new(20, 1));
    assert_eq!(
        mvcc::mvcc_get(&engine, &key, Timestamp::new(20, 1)).unwrap(),
        Some(Value::from_int(2))
    );
}

#[test]
fn increment_starts_from_zero() {
    let engine = InMemEngine::new();
    let key = Key::from("counter");
    assert_eq!(mvcc::mvcc_increment(&engine, None, &key, ts(1), 5).unwrap(), 5);
    assert_eq!(mvcc::mvcc_increment(&engine, None, &key, ts(2), -2).unwrap(), 3);
}

#[test]
fn increment_rejects_non_integer() {
    let engine = InMemEngine::new();
    let key = Key::from("blob");
    mvcc::mvcc_put(&engine, None, &key, ts(1), &Value::from_bytes(b"zz")).unwrap();
    assert!(mvcc::mvcc_increment(&engine, None, &key, ts(2), 1).is_err());
}

#[test]
fn incremental_stats_match_recomputation() {
    let engine = InMemEngine::new();
    let desc = full_range();
    let mut ms = MvccStats::default();

    let desc_key = keys::range_descriptor_key(&desc.start_key);
    mvcc::mvcc_put_message(&engine, Some(&mut ms), &desc_key, ts(1), &desc).unwrap();
    let a = Key::from("a");
    mvcc::mvcc_put(&engine, Some(&mut ms), &a, ts(2), &Value::from_bytes(b"hello")).unwrap();
    mvcc::mvcc_put(&engine, Some(&mut ms), &a, ts(3), &Value::from_bytes(b"hi")).unwrap();
    mvcc::mvcc_increment(&engine, Some(&mut ms), &Key::from("b"), ts(4), 9).unwrap();
    mvcc::mvcc_delete(&engine, Some(&mut ms), &Key::from("b"), ts(5)).unwrap();

    let recomputed = mvcc::compute_stats_for_range(&engine, &desc).unwrap();
    assert_eq!(ms, recomputed);

    assert_eq!(ms.key_count, 2);
    assert_eq!(ms.val_count, 4);
    assert_eq!(ms.live_count, 1);
    assert_eq!(ms.sys_count, 1);
    let live_a = 1 + MVCC_VERSION_TIMESTAMP_SIZE + Value::from_bytes(b"hi").len() as i64;
    assert_eq!(ms.live_bytes, live_a);
}

#[test]
fn range_stats_round_trip_through_engine() {
    let engine = InMemEngine::new();
    let rid = RangeId::new(4);
    assert_eq!(mvcc::mvcc_get_range_stats(&engine, rid).unwrap(), MvccStats::default());
    let ms = MvccStats {
        live_bytes: 10,
        live_count: 1,
        ..MvccStats::default()
    };
    mvcc::mvcc_set_range_stats(&engine, rid, &ms).unwrap();
    assert_eq!(mvcc::mvcc_get_range_stats(&engine, rid).unwrap(), ms);
}

#[test]
fn raw_state_is_excluded_from_range_data() {
    let engine = InMemEngine::new();
    let desc = full_range();
    engine
        .put_raw(&keys::replica_state_key(desc.range_id), bytes::Bytes::from_static(b"state"))
        .unwrap();
    mvcc::mvcc_put(&engine, None, &Key::from("user"), ts(1), &Value::from_int(3)).unwrap();

    let data = mvcc::range_versioned_data(&engine, &desc).unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].0, Key::from("user"));

    mvcc::clear_range_versioned_data(&engine, &desc).unwrap();
    assert!(mvcc::range_versioned_data(&engine, &desc).unwrap().is_empty());
    assert!(engine.get_raw(&keys::replica_state_key(desc.range_id)).unwrap().is_some());
}
