//! Builds the coordinator from configuration: cluster join, broker
//! wiring, and the periodic workers.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::{LocalBroker, MessagingClient, Node};
use serde::Deserialize;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};

pub type NodeHandle = Arc<Node>;

#[derive(Debug, Deserialize)]
struct DataNodeReply {
    id: u64,
    url: String,
}

/// Opens the node, joining an existing cluster first when configured,
/// and attaches the broker client and periodic workers.
pub fn build_node(config: &DaemonConfig) -> Result<NodeHandle> {
    let node = Arc::new(Node::new());

    let meta_path = config.data_dir.join("meta");
    let joined_id = if !config.join.is_empty() && !meta_path.exists() {
        tracing::info!(event = "node.join", remote = %config.join, "joining cluster");
        Some(join_cluster(config)?)
    } else {
        None
    };

    node.open(&config.data_dir)?;
    if let Some(id) = joined_id {
        node.set_node_id(id)?;
    }

    // The broker is an external collaborator; a standalone node runs
    // against the in-process implementation. The first node in a
    // cluster is replica 1.
    let broker = LocalBroker::new();
    let replica_id = node.id().max(1);
    let client = broker.client(replica_id);
    client.create_replica(replica_id, &config.url)?;
    node.set_client(Arc::new(client))?;

    if node.id() == 0 {
        tracing::info!(event = "node.initialize", url = %config.url, "initializing new cluster");
        node.initialize(&config.url)?;
    }

    node.set_authentication_enabled(config.authentication_enabled);

    if config.retention_check_interval_secs > 0 {
        node.start_retention_enforcement(Duration::from_secs(
            config.retention_check_interval_secs,
        ))?;
    }
    if config.continuous_query_interval_secs > 0 {
        node.start_continuous_queries(Duration::from_secs(
            config.continuous_query_interval_secs,
        ))?;
    }

    Ok(node)
}

/// Registers this node with an existing cluster member and copies its
/// metastore, returning the id the cluster assigned.
fn join_cluster(config: &DaemonConfig) -> Result<u64> {
    let remote = config.join.trim_end_matches('/');
    let client = reqwest::blocking::Client::new();

    let response = client
        .post(format!("{remote}/data_nodes"))
        .json(&serde_json::json!({ "url": config.url }))
        .send()?;
    if response.status() != reqwest::StatusCode::CREATED {
        return Err(DaemonError::Join(format!(
            "data node registration returned {}",
            response.status()
        )));
    }
    let reply: DataNodeReply = response.json()?;
    if reply.id == 0 {
        return Err(DaemonError::Join("invalid node id returned".into()));
    }
    // The cluster keys data nodes by URL; a mismatch means it registered
    // something other than what this node advertises.
    if reply.url != config.url {
        return Err(DaemonError::Join(format!(
            "cluster registered url {} but this node advertises {}",
            reply.url, config.url
        )));
    }

    let response = client.get(format!("{remote}/metastore")).send()?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(DaemonError::Join(format!(
            "metastore copy returned {}",
            response.status()
        )));
    }
    let expected = response.content_length();
    let bytes = response.bytes()?;
    if let Some(expected) = expected {
        if bytes.len() as u64 != expected {
            return Err(DaemonError::Join(format!(
                "short metastore copy: {} of {expected} bytes",
                bytes.len()
            )));
        }
    }

    fs::create_dir_all(&config.data_dir)?;
    fs::write(config.data_dir.join("meta"), &bytes)?;
    Ok(reply.id)
}
