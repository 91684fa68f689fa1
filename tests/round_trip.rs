use std::collections::BTreeMap;

use seqstore::codec::JsonMap;
use seqstore::event_log::{EventLog, TagFilter};
use seqstore::state_keeper::StateKeeper;
use serde_json::json;
use tempfile::tempdir;

fn kv(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn state_keeper_reopen_preserves_replay_and_current_state() {
    let dir = tempdir().expect("tempdir");

    {
        let mut store = StateKeeper::open(dir.path(), 5).expect("open store");
        for k in 0..=20u64 {
            store
                .write("ns", kv(&[("k", json!(k))]))
                .expect("write");
        }
    }

    let store = StateKeeper::open(dir.path(), 5).expect("reopen store");
    assert_eq!(store.seq(), 21);
    assert_eq!(
        store.get_key("ns", "k", None).expect("get current"),
        Some(json!(20))
    );

    let mut replay = store.replay("ns", 1, Some("k")).expect("replay from 1");
    let mut last_value = None;
    let mut count = 0u64;
    while let Some(item) = replay.next().expect("replay step") {
        if let seqstore::state_keeper::StateReplayValue::Key(v) = item.value {
            last_value = v;
        }
        count += 1;
    }
    assert_eq!(count, 21);
    assert_eq!(last_value, Some(json!(20)));
}

#[test]
fn multi_write_lands_every_partition_at_the_same_sequence() {
    let dir = tempdir().expect("tempdir");
    let mut store = StateKeeper::open(dir.path(), 10).expect("open store");

    let mut updates = BTreeMap::new();
    updates.insert("accounts".to_string(), kv(&[("balance", json!(100))]));
    updates.insert("orders".to_string(), kv(&[("count", json!(1))]));
    let seq = store.multi_write(updates).expect("multi_write");

    assert_eq!(seq, 1);
    let mut partitions = store.partitions().expect("partitions");
    partitions.sort();
    assert_eq!(partitions, vec!["accounts".to_string(), "orders".to_string()]);

    let mut replay = store.replay_all(1, None, None).expect("replay_all");
    let frame = replay.next().expect("first frame").expect("present");
    assert_eq!(frame.seq, 1);
    assert!(replay.next().expect("no more frames").is_none());
}

#[test]
fn event_log_multi_reopen_preserves_tag_tails_and_replay_order() {
    let dir = tempdir().expect("tempdir");

    {
        let mut log = EventLog::open_multi(dir.path(), 5).expect("open log");
        for i in 1..=12u64 {
            let tag = if i % 2 == 1 { "orders" } else { "accounts" };
            log.put(&format!("payload-{i}"), Some(tag)).expect("put");
        }
    }

    let log = EventLog::open_multi(dir.path(), 5).expect("reopen log");
    assert_eq!(log.seq(), 12);
    assert_eq!(
        log.get(Some(&["orders".to_string()]), None).expect("latest orders"),
        Some("payload-11".to_string())
    );

    let mut replay = log
        .replay(1, Some(TagFilter::List(vec!["orders".to_string()])))
        .expect("filtered replay");
    let mut seen = vec![];
    while let Some(record) = replay.next().expect("replay step") {
        assert_eq!(record.tag, "orders");
        seen.push(record.seq);
    }
    assert_eq!(seen, vec![1, 3, 5, 7, 9, 11]);
}
