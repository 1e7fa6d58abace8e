use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use common::point::{Point, Tags};
use common::time::UnixNano;
use common::FieldValue;
use meridian_core::{LocalBroker, MessagingClient, Node};

/// 2000-01-01T00:00:00Z in Unix nanoseconds.
pub const Y2K: UnixNano = 946_684_800_000_000_000;

/// Opens a node under `path`, wires it to `broker` as `replica_id`, and
/// initializes the cluster when this is the first replica.
pub fn open_node<P: AsRef<Path>>(
    path: P,
    broker: &Arc<LocalBroker>,
    replica_id: u64,
) -> Arc<Node> {
    let node = Arc::new(Node::new());
    node.open(path).unwrap();

    let url = format!("http://localhost:{}", 8086 + replica_id);
    let client = broker.client(replica_id);
    client.create_replica(replica_id, &url).unwrap();
    node.set_client(Arc::new(client)).unwrap();

    if replica_id == 1 {
        node.initialize(&url).unwrap();
    }
    node.set_authentication_enabled(false);
    node
}

pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn point(name: &str, tag_pairs: &[(&str, &str)], ts: UnixNano, value: FieldValue) -> Point {
    let mut values = HashMap::new();
    values.insert("value".to_string(), value);
    Point {
        name: name.to_string(),
        tags: tags(tag_pairs),
        timestamp: ts,
        values,
    }
}

/// Creates a database with a default retention policy.
pub fn create_database_with_policy(node: &Node, db: &str, rp: &str, duration: i64, replica_n: u32) {
    node.create_database(db).unwrap();
    node.create_retention_policy(db, rp, duration, replica_n).unwrap();
    node.set_default_retention_policy(db, rp).unwrap();
}

/// Writes points and waits for the local apply to catch up.
pub fn write_and_sync(node: &Node, db: &str, rp: &str, points: &[Point]) -> u64 {
    let index = node.write_series(db, rp, points).unwrap();
    assert!(index > 0);
    node.sync(index).unwrap();
    index
}
