//! Supply message builder tests: size admission, ordering, and marker
//! semantics.

use bytes::Bytes;
use supplyline::constants::MESSAGE_HEADER_BYTES;
use supplyline::supply::SupplyMessage;
use supplyline::types::{DeploymentInfo, EntryInfo, LoaderId, TopologyVersion};

fn entry(key: &'static [u8], version: u64) -> EntryInfo {
    EntryInfo {
        key: Bytes::from_static(key),
        value: Bytes::from_static(b"value"),
        version,
        ttl_millis: 0,
        expire_time_millis: 0,
        is_new: false,
    }
}

fn message() -> SupplyMessage {
    SupplyMessage::new(0, 1, 10, TopologyVersion::new(1, 0))
}

#[test]
fn test_new_message_carries_header_size() {
    let msg = message();
    assert_eq!(msg.message_size(), MESSAGE_HEADER_BYTES);
    assert!(msg.is_empty());
}

#[test]
fn test_new_message_echoes_demand_fields() {
    let msg = message();
    assert_eq!(msg.worker_slot(), 0);
    assert_eq!(msg.update_sequence(), 1);
    assert_eq!(msg.cache_id(), 10);
    assert_eq!(msg.topology_version(), TopologyVersion::new(1, 0));
}

#[test]
fn test_size_grows_with_entries() {
    let mut msg = message();
    let e = entry(b"key-1", 1);
    let expected = MESSAGE_HEADER_BYTES + e.estimated_size();
    msg.add_entry(7, e);
    assert_eq!(msg.message_size(), expected);
}

#[test]
fn test_size_is_monotonic() {
    let mut msg = message();
    let mut previous = msg.message_size();
    for i in 0..10 {
        msg.add_entry(7, entry(b"some-key", i));
        assert!(msg.message_size() > previous);
        previous = msg.message_size();
    }
}

#[test]
fn test_entries_keep_insertion_order_per_partition() {
    let mut msg = message();
    msg.add_entry(7, entry(b"a", 1));
    msg.add_entry(8, entry(b"x", 1));
    msg.add_entry(7, entry(b"b", 2));
    msg.add_entry(7, entry(b"c", 3));

    let versions: Vec<u64> = msg.entries_for(7).map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(msg.entries_for(8).count(), 1);
}

#[test]
fn test_missed_and_last_idempotent() {
    let mut msg = message();
    msg.missed(7);
    msg.missed(7);
    msg.last(8);
    msg.last(8);
    assert_eq!(msg.missed_partitions().len(), 1);
    assert_eq!(msg.last_partitions().len(), 1);
    assert!(!msg.is_empty());
}

#[test]
fn test_deployment_first_wins() {
    let mut msg = message();
    let first = DeploymentInfo {
        loader: LoaderId(1),
        user_version: "v1".into(),
    };
    let second = DeploymentInfo {
        loader: LoaderId(2),
        user_version: "v2".into(),
    };
    assert!(msg.set_deployment_info(first.clone()));
    assert!(!msg.set_deployment_info(second));
    assert_eq!(msg.deployment(), Some(&first));
    assert!(msg.has_deployment());
}

#[test]
fn test_overflow_entries_share_layout() {
    let mut msg = message();
    msg.add_overflow_entry(9, entry(b"of", 5));
    assert_eq!(msg.entries().len(), 1);
    assert_eq!(msg.entries_for(9).next().map(|e| e.version), Some(5));
}
