mod support;

use common::time::{now_unix_nano, truncate, NANOS_PER_HOUR, NANOS_PER_MINUTE};
use common::FieldValue;
use meridian_core::{CqConfig, LocalBroker, MessagingClient, Node};
use std::sync::Arc;
use tempfile::TempDir;

use crate::support::*;

#[test]
fn retention_drops_expired_groups_and_their_files() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_MINUTE, 1);

    // A group whose end time is two minutes in the past is past the
    // one-minute retention horizon.
    let old_ts = now_unix_nano() - 3 * NANOS_PER_MINUTE;
    write_and_sync(&node, "db", "rp", &[
        point("cpu", &[], old_ts, FieldValue::Float(1.0)),
    ]);

    let groups = node.shard_groups("db").unwrap();
    assert_eq!(groups.len(), 1);
    let shard_id = groups[0].shards[0].id;
    let shard_file = tmp.path().join("node1").join("shards").join(shard_id.to_string());
    assert!(shard_file.exists());

    node.enforce_retention_policies();

    assert!(node.shard_groups("db").unwrap().is_empty());
    assert!(!shard_file.exists());
}

#[test]
fn retention_keeps_groups_within_horizon() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 1);
    write_and_sync(&node, "db", "rp", &[
        point("cpu", &[], now_unix_nano(), FieldValue::Float(1.0)),
    ]);

    node.enforce_retention_policies();
    assert_eq!(node.shard_groups("db").unwrap().len(), 1);
}

#[test]
fn deleting_a_missing_shard_group_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_MINUTE, 1);
    write_and_sync(&node, "db", "rp", &[
        point("cpu", &[], Y2K, FieldValue::Float(1.0)),
    ]);
    let group_id = node.shard_groups("db").unwrap()[0].id;

    node.delete_shard_group("db", "rp", group_id).unwrap();
    // A second replica may broadcast the same deletion.
    node.delete_shard_group("db", "rp", group_id).unwrap();
    assert!(node.shard_groups("db").unwrap().is_empty());
}

fn open_cq_node(path: std::path::PathBuf, broker: &Arc<LocalBroker>) -> Arc<Node> {
    let node = Arc::new(Node::with_cq_config(CqConfig {
        recompute_previous_n: 1,
        recompute_no_older_than: 10 * NANOS_PER_MINUTE,
        compute_runs_per_interval: 10,
        // Always due in tests.
        compute_no_more_than: 0,
    }));
    node.open(path).unwrap();
    let client = broker.client(1);
    client.create_replica(1, "http://localhost:8087").unwrap();
    node.set_client(Arc::new(client)).unwrap();
    node.initialize("http://localhost:8087").unwrap();
    node.set_authentication_enabled(false);
    node
}

#[test]
fn continuous_query_writes_aggregates_back() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_cq_node(tmp.path().join("node1"), &broker);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 1);

    // Samples in the current one-minute window.
    let window = truncate(now_unix_nano(), NANOS_PER_MINUTE);
    write_and_sync(&node, "db", "rp", &[
        point("cpu", &[], window + 1_000, FieldValue::Float(2.0)),
        point("cpu", &[], window + 2_000, FieldValue::Float(4.0)),
    ]);

    node.create_continuous_query(
        "CREATE CONTINUOUS QUERY cq1 ON db BEGIN \
         SELECT mean(value) INTO cpu_mean FROM cpu GROUP BY time(1m) END",
    )
    .unwrap();
    assert_eq!(node.continuous_queries("db").unwrap().len(), 1);

    node.run_continuous_queries().unwrap();

    // The write-back publishes through the broker; poll until applied.
    let tags = common::point::Tags::new();
    let mut found = None;
    for _ in 0..2_000 {
        if let Some(values) = node
            .read_series("db", "rp", "cpu_mean", &tags, window)
            .unwrap()
        {
            found = Some(values);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    let values = found.expect("continuous query should write its aggregate back");
    assert_eq!(values["mean"], FieldValue::Float(3.0));
}

#[test]
fn duplicate_continuous_query_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let broker = LocalBroker::new();
    let node = open_node(tmp.path().join("node1"), &broker, 1);

    create_database_with_policy(&node, "db", "rp", NANOS_PER_HOUR, 1);

    let query = "CREATE CONTINUOUS QUERY cq1 ON db BEGIN \
                 SELECT count(value) INTO counts FROM cpu GROUP BY time(5m) END";
    node.create_continuous_query(query).unwrap();
    let err = node.create_continuous_query(query).unwrap_err();
    assert!(matches!(err, meridian_core::Error::ContinuousQueryExists));
}
