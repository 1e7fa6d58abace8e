mod support;

use common::time::NANOS_PER_HOUR;
use common::FieldValue;
use meridian_core::LocalBroker;
use tempfile::TempDir;

use crate::support::*;

#[test]
fn replicas_apply_the_same_log_identically() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let one = open_node(tmp.path().join("node1"), &broker, 1);
    let two = open_node(tmp.path().join("node2"), &broker, 2);

    one.create_data_node("http://localhost:8088").unwrap();
    create_database_with_policy(&one, "db", "rp", NANOS_PER_HOUR, 1);
    one.create_user("ada", "secret", true).unwrap();

    // The raw write may route to a shard owned by the data node that
    // never came online, so only the broadcast part of the log is
    // guaranteed to reach both replicas. Don't sync on the write index.
    let index = one
        .write_series(
            "db",
            "rp",
            &[point("cpu", &[("host", "a")], Y2K, FieldValue::Float(1.0))],
        )
        .unwrap();
    assert!(index > 0);

    wait_until(|| {
        two.shard_groups("db").map(|g| g.len() == 1).unwrap_or(false)
            && two
                .measurement("db", "cpu")
                .map(|m| m.is_some())
                .unwrap_or(false)
            && two.users().map(|u| u.len() == 1).unwrap_or(false)
    });

    assert_eq!(one.databases().unwrap(), two.databases().unwrap());
    assert_eq!(
        one.retention_policies("db").unwrap().len(),
        two.retention_policies("db").unwrap().len()
    );

    let m1 = one.measurement("db", "cpu").unwrap().unwrap();
    let m2 = two.measurement("db", "cpu").unwrap().unwrap();
    assert_eq!(m1.fields, m2.fields);
    assert_eq!(m1.series_ids(), m2.series_ids());

    let groups1 = one.shard_groups("db").unwrap();
    let groups2 = two.shard_groups("db").unwrap();
    assert_eq!(groups1.len(), groups2.len());
    for (a, b) in groups1.iter().zip(groups2.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.start_time, b.start_time);
        assert_eq!(a.end_time, b.end_time);
        let ids_a: Vec<_> = a.shards.iter().map(|s| (s.id, s.data_node_ids.clone())).collect();
        let ids_b: Vec<_> = b.shards.iter().map(|s| (s.id, s.data_node_ids.clone())).collect();
        assert_eq!(ids_a, ids_b);
    }

    assert_eq!(
        one.users().unwrap().iter().map(|u| &u.name).collect::<Vec<_>>(),
        two.users().unwrap().iter().map(|u| &u.name).collect::<Vec<_>>()
    );
}

fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("replica never caught up with the log");
}

#[test]
fn replication_placement_spans_distinct_nodes() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    node.create_data_node("http://localhost:8088").unwrap();
    node.create_data_node("http://localhost:8089").unwrap();
    assert_eq!(node.data_nodes().unwrap().len(), 3);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 2);
    node.create_shard_group_if_not_exists("db", "rp", Y2K).unwrap();

    let groups = node.shard_groups("db").unwrap();
    assert_eq!(groups.len(), 1);
    // Three nodes, replication factor two: one shard with two owners.
    assert_eq!(groups[0].shards.len(), 1);
    let owners = &groups[0].shards[0].data_node_ids;
    assert_eq!(owners.len(), 2);
    assert_ne!(owners[0], owners[1]);
}

#[test]
fn node_reloads_catalog_and_shards_from_disk() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("node1");
    {
        let broker = LocalBroker::new();
        let node = open_node(&path, &broker, 1);
        create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 1);
        write_and_sync(&node, "db", "rp", &[
            point("cpu", &[("host", "a")], Y2K, FieldValue::Float(7.5)),
        ]);
        node.close().unwrap();
    }

    // Reopen from the same directory with a fresh broker.
    let broker = LocalBroker::new();
    let node = std::sync::Arc::new(meridian_core::Node::new());
    node.open(&path).unwrap();
    assert_eq!(node.id(), 1);
    assert_eq!(node.databases().unwrap(), vec!["db".to_string()]);

    let values = node
        .read_series("db", "rp", "cpu", &tags(&[("host", "a")]), Y2K)
        .unwrap()
        .expect("reloaded shard should serve the point");
    assert_eq!(values["value"], FieldValue::Float(7.5));
    drop(broker);
}

#[test]
fn duplicate_data_node_url_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    // The initial node registered this URL during initialize().
    let err = node.create_data_node("http://localhost:8087").unwrap_err();
    assert!(matches!(err, meridian_core::Error::DataNodeExists));
    assert!(node
        .data_node_by_url("http://localhost:8087")
        .unwrap()
        .is_some());
}
