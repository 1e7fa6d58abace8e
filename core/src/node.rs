//! The node coordinator.
//!
//! A `Node` owns the in-memory catalog, the metastore, and the open
//! shard stores. Every mutation is routed through the broker: the
//! caller encodes a command, publishes it, and blocks in `sync` until
//! the apply processor has consumed the message and recorded its
//! outcome. Reads take the shared lock; the apply processor is the
//! single writer.

use std::collections::HashMap;
use std::fs::DirBuilder;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use common::point::{Point, Tags};
use common::time::UnixNano;
use common::FieldValue;
use serde::Serialize;

use crate::broker::{Message, MessageType, MessagingClient, BROADCAST_TOPIC_ID};
use crate::catalog::{
    ContinuousQuery, DataNode, DatabaseInfo, Measurement, Privilege, RetentionPolicy, ShardGroup,
    User,
};
use crate::codec::{marshal_point_header, FieldCodec};
use crate::command::*;
use crate::error::{Error, Result};
use crate::meta::Metastore;
use crate::query::{
    MeasurementName, Row, SelectField, SelectPlan, SeriesSource, SelectStatement, Statement,
};
use crate::shard::ShardStore;

/// Worker thread stopped by dropping its channel sender.
pub(crate) struct Worker {
    pub(crate) stop: Sender<()>,
    pub(crate) handle: JoinHandle<()>,
}

struct Processor {
    done: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub(crate) struct NodeState {
    pub(crate) id: u64,
    pub(crate) path: Option<PathBuf>,
    pub(crate) index: u64,
    pub(crate) errors: HashMap<u64, Error>,
    pub(crate) client: Option<Arc<dyn MessagingClient>>,
    pub(crate) meta: Option<Arc<Metastore>>,
    pub(crate) data_nodes: HashMap<u64, DataNode>,
    pub(crate) databases: HashMap<String, DatabaseInfo>,
    pub(crate) users: HashMap<String, User>,
    pub(crate) shards: HashMap<u64, Arc<ShardStore>>,
    pub(crate) shards_by_series_id: HashMap<u32, Vec<u64>>,
    pub(crate) authentication_enabled: bool,
    processor: Option<Processor>,
    pub(crate) retention: Option<Worker>,
    pub(crate) cq_worker: Option<Worker>,
}

impl NodeState {
    pub(crate) fn opened(&self) -> bool {
        self.path.is_some()
    }
}

/// Continuous-query scheduling configuration.
#[derive(Debug, Clone)]
pub struct CqConfig {
    /// How many earlier windows each run recomputes.
    pub recompute_previous_n: usize,
    /// Never recompute windows older than this, in nanoseconds.
    pub recompute_no_older_than: i64,
    /// Target runs per GROUP BY interval.
    pub compute_runs_per_interval: i64,
    /// Lower bound between runs, in nanoseconds.
    pub compute_no_more_than: i64,
}

impl Default for CqConfig {
    fn default() -> CqConfig {
        CqConfig {
            recompute_previous_n: 2,
            recompute_no_older_than: 10 * common::time::NANOS_PER_MINUTE,
            compute_runs_per_interval: 10,
            compute_no_more_than: 2 * common::time::NANOS_PER_MINUTE,
        }
    }
}

pub struct Node {
    pub(crate) state: RwLock<NodeState>,
    pub(crate) cq_config: CqConfig,
    pub(crate) cq_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for Node {
    fn default() -> Node {
        Node::new()
    }
}

/// Outcome of one statement in a query.
#[derive(Debug, Serialize)]
pub struct StatementResult {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatementResult {
    fn ok(rows: Vec<Row>) -> StatementResult {
        StatementResult { rows, error: None }
    }

    fn from_result(result: Result<Vec<Row>>) -> StatementResult {
        match result {
            Ok(rows) => StatementResult::ok(rows),
            Err(err) => StatementResult {
                rows: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }
}

/// Results for every statement of a query, in statement order.
#[derive(Debug, Serialize)]
pub struct QueryResults {
    pub results: Vec<StatementResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResults {
    pub fn with_error(err: &Error) -> QueryResults {
        QueryResults {
            results: Vec::new(),
            error: Some(err.to_string()),
        }
    }

    /// First error carried by the results, if any.
    pub fn error(&self) -> Option<&str> {
        if let Some(err) = &self.error {
            return Some(err);
        }
        self.results.iter().find_map(|r| r.error.as_deref())
    }
}

impl Node {
    pub fn new() -> Node {
        Node {
            state: RwLock::new(NodeState {
                id: 0,
                path: None,
                index: 0,
                errors: HashMap::new(),
                client: None,
                meta: None,
                data_nodes: HashMap::new(),
                databases: HashMap::new(),
                users: HashMap::new(),
                shards: HashMap::new(),
                shards_by_series_id: HashMap::new(),
                // Disabling authentication must be an explicit decision.
                authentication_enabled: true,
                processor: None,
                retention: None,
                cq_worker: None,
            }),
            cq_config: CqConfig::default(),
            cq_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cq_config(cq_config: CqConfig) -> Node {
        Node {
            cq_config,
            ..Node::new()
        }
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, NodeState>> {
        self.state.read().map_err(|_| Error::LockPoisoned("node read"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, NodeState>> {
        self.state
            .write()
            .map_err(|_| Error::LockPoisoned("node write"))
    }

    // ----- lifecycle ---------------------------------------------------

    /// Initializes the node from a data directory, creating it and the
    /// metastore as needed, then loading the catalog and opening the
    /// stores of every owned shard.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::PathRequired);
        }

        let mut state = self.write()?;
        if state.opened() {
            return Err(Error::NodeOpen);
        }

        let mut builder = DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(path)?;
        builder.create(path.join("shards"))?;

        let meta = Arc::new(Metastore::open(path.join("meta"))?);
        state.path = Some(path.to_path_buf());
        state.meta = Some(Arc::clone(&meta));

        load_state(&mut state, &meta)?;
        Ok(())
    }

    /// Stops the apply processor and the periodic workers, then releases
    /// the shard stores and the metastore.
    pub fn close(&self) -> Result<()> {
        let (processor, retention, cq_worker, shards) = {
            let mut state = self.write()?;
            if !state.opened() {
                return Err(Error::NodeClosed);
            }
            state.path = None;
            state.client = None;
            state.meta = None;
            let shards = std::mem::take(&mut state.shards);
            state.shards_by_series_id.clear();
            (
                state.processor.take(),
                state.retention.take(),
                state.cq_worker.take(),
                shards,
            )
        };

        if let Some(p) = processor {
            p.done.store(true, Ordering::SeqCst);
            let _ = p.handle.join();
        }
        for worker in [retention, cq_worker].into_iter().flatten() {
            drop(worker.stop);
            let _ = worker.handle.join();
        }
        drop(shards);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.read().map(|s| s.id).unwrap_or(0)
    }

    pub fn index(&self) -> u64 {
        self.read().map(|s| s.index).unwrap_or(0)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.read().ok().and_then(|s| s.path.clone())
    }

    pub fn set_authentication_enabled(&self, enabled: bool) {
        if let Ok(mut state) = self.write() {
            state.authentication_enabled = enabled;
        }
    }

    pub fn authentication_enabled(&self) -> bool {
        self.read().map(|s| s.authentication_enabled).unwrap_or(true)
    }

    pub(crate) fn shard_path(state: &NodeState, id: u64) -> Option<PathBuf> {
        state
            .path
            .as_ref()
            .map(|p| p.join("shards").join(id.to_string()))
    }

    /// Attaches a broker client and starts the apply processor. Replaces
    /// any previous client.
    pub fn set_client(self: &Arc<Self>, client: Arc<dyn MessagingClient>) -> Result<()> {
        let messages = client.messages()?;

        let old = {
            let mut state = self.write()?;
            if !state.opened() {
                return Err(Error::NodeClosed);
            }

            // Re-establish shard topic subscriptions for owned shards.
            let id = state.id;
            for shard_id in state.shards.keys() {
                if let Err(err) = client.subscribe(id, *shard_id) {
                    log::warn!("unable to subscribe: replica={id} topic={shard_id} err={err}");
                }
            }

            state.client = Some(Arc::clone(&client));
            let done = Arc::new(AtomicBool::new(false));
            let handle = spawn_processor(Arc::clone(self), messages, Arc::clone(&done));
            state.processor.replace(Processor { done, handle })
        };

        if let Some(p) = old {
            p.done.store(true, Ordering::SeqCst);
            let _ = p.handle.join();
        }
        Ok(())
    }

    pub fn client(&self) -> Option<Arc<dyn MessagingClient>> {
        self.read().ok().and_then(|s| s.client.clone())
    }

    // ----- log synchronization -----------------------------------------

    /// Blocks until the applied mark reaches `index`, then consumes and
    /// returns the outcome recorded for that index. Repeated calls for
    /// the same index return success after the first read.
    pub fn sync(&self, index: u64) -> Result<()> {
        loop {
            {
                let mut state = self.write()?;
                if state.index >= index {
                    return match state.errors.remove(&index) {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Encodes a command, publishes it to the broadcast topic, and waits
    /// for this node to apply it.
    pub(crate) fn broadcast<C: Serialize>(
        &self,
        message_type: MessageType,
        command: &C,
    ) -> Result<u64> {
        let data = serde_json::to_vec(command)?;
        let client = self
            .read()?
            .client
            .clone()
            .ok_or_else(|| Error::Broker("no client".to_string()))?;
        let index = client.publish(message_type, BROADCAST_TOPIC_ID, data)?;
        self.sync(index)?;
        Ok(index)
    }

    // ----- cluster membership ------------------------------------------

    /// Creates the first data node and pins this node's id to 1. The
    /// broker relies on the first node in a cluster having id 1.
    pub fn initialize(self: &Arc<Self>, url: &str) -> Result<()> {
        self.create_data_node(url)?;
        let node = self
            .data_node_by_url(url)?
            .ok_or(Error::DataNodeNotFound)?;
        if node.id != 1 {
            return Err(Error::Broker(format!(
                "invalid initial node id: {}",
                node.id
            )));
        }
        self.set_node_id(node.id)
    }

    /// Persists and adopts a node id, used at initialization and after a
    /// cluster join.
    pub fn set_node_id(&self, id: u64) -> Result<()> {
        let mut state = self.write()?;
        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.set_id(id);
            Ok(())
        })?;
        state.id = id;
        Ok(())
    }

    pub fn data_node(&self, id: u64) -> Result<Option<DataNode>> {
        Ok(self.read()?.data_nodes.get(&id).cloned())
    }

    pub fn data_node_by_url(&self, url: &str) -> Result<Option<DataNode>> {
        Ok(self
            .read()?
            .data_nodes
            .values()
            .find(|n| n.url == url)
            .cloned())
    }

    /// All data nodes, ascending by id.
    pub fn data_nodes(&self) -> Result<Vec<DataNode>> {
        let mut nodes: Vec<DataNode> = self.read()?.data_nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    pub fn create_data_node(&self, url: &str) -> Result<()> {
        let c = CreateDataNodeCommand {
            url: url.to_string(),
        };
        self.broadcast(MessageType::CreateDataNode, &c)?;
        Ok(())
    }

    pub fn delete_data_node(&self, id: u64) -> Result<()> {
        let c = DeleteDataNodeCommand { id };
        self.broadcast(MessageType::DeleteDataNode, &c)?;
        Ok(())
    }

    /// Streams the metastore file to a writer, returning its length.
    pub fn copy_metastore<W: Write>(&self, w: &mut W) -> Result<u64> {
        let meta = self.read()?.meta.clone().ok_or(Error::NodeClosed)?;
        meta.copy_to(w)
    }

    // ----- databases ---------------------------------------------------

    pub fn database_exists(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.databases.contains_key(name))
    }

    /// Sorted database names.
    pub fn databases(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.read()?.databases.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn create_database(&self, name: &str) -> Result<()> {
        let c = CreateDatabaseCommand {
            name: name.to_string(),
        };
        self.broadcast(MessageType::CreateDatabase, &c)?;
        Ok(())
    }

    pub fn delete_database(&self, name: &str) -> Result<()> {
        let c = DeleteDatabaseCommand {
            name: name.to_string(),
        };
        self.broadcast(MessageType::DeleteDatabase, &c)?;
        Ok(())
    }

    // ----- retention policies ------------------------------------------

    pub fn retention_policy(&self, database: &str, name: &str) -> Result<Option<RetentionPolicy>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        Ok(db.policies.get(name).cloned())
    }

    pub fn default_retention_policy(&self, database: &str) -> Result<Option<RetentionPolicy>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        Ok(db.policies.get(&db.default_retention_policy).cloned())
    }

    pub fn retention_policies(&self, database: &str) -> Result<Vec<RetentionPolicy>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        let mut policies: Vec<RetentionPolicy> = db.policies.values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(policies)
    }

    pub fn create_retention_policy(
        &self,
        database: &str,
        name: &str,
        duration: i64,
        replica_n: u32,
    ) -> Result<()> {
        let c = CreateRetentionPolicyCommand {
            database: database.to_string(),
            name: name.to_string(),
            duration,
            replica_n,
        };
        self.broadcast(MessageType::CreateRetentionPolicy, &c)?;
        Ok(())
    }

    pub fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<()> {
        let c = UpdateRetentionPolicyCommand {
            database: database.to_string(),
            name: name.to_string(),
            policy: update,
        };
        self.broadcast(MessageType::UpdateRetentionPolicy, &c)?;
        Ok(())
    }

    pub fn delete_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        let c = DeleteRetentionPolicyCommand {
            database: database.to_string(),
            name: name.to_string(),
        };
        self.broadcast(MessageType::DeleteRetentionPolicy, &c)?;
        Ok(())
    }

    pub fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        let c = SetDefaultRetentionPolicyCommand {
            database: database.to_string(),
            name: name.to_string(),
        };
        self.broadcast(MessageType::SetDefaultRetentionPolicy, &c)?;
        Ok(())
    }

    // ----- users and privileges ----------------------------------------

    pub fn user(&self, name: &str) -> Result<Option<User>> {
        Ok(self.read()?.users.get(name).cloned())
    }

    /// All users, ascending by name.
    pub fn users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.read()?.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }

    pub fn user_count(&self) -> Result<usize> {
        Ok(self.read()?.users.len())
    }

    pub fn admin_user_exists(&self) -> Result<bool> {
        Ok(self.read()?.users.values().any(|u| u.admin))
    }

    /// Verifies credentials. With authentication disabled an unknown
    /// user is allowed through as `None`.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let state = self.read()?;
        match state.users.get(username) {
            None if !state.authentication_enabled => Ok(None),
            None => Err(Error::InvalidCredentials),
            Some(user) => {
                user.authenticate(password)?;
                Ok(Some(user.clone()))
            }
        }
    }

    pub fn create_user(&self, username: &str, password: &str, admin: bool) -> Result<()> {
        let c = CreateUserCommand {
            username: username.to_string(),
            password: password.to_string(),
            admin,
        };
        self.broadcast(MessageType::CreateUser, &c)?;
        Ok(())
    }

    pub fn update_user(&self, username: &str, password: &str) -> Result<()> {
        let c = UpdateUserCommand {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.broadcast(MessageType::UpdateUser, &c)?;
        Ok(())
    }

    pub fn delete_user(&self, username: &str) -> Result<()> {
        let c = DeleteUserCommand {
            username: username.to_string(),
        };
        self.broadcast(MessageType::DeleteUser, &c)?;
        Ok(())
    }

    /// Grants or revokes a privilege. An empty database toggles the
    /// admin flag when the privilege is all-or-none.
    pub fn set_privilege(&self, privilege: Privilege, username: &str, database: &str) -> Result<()> {
        let c = SetPrivilegeCommand {
            privilege,
            username: username.to_string(),
            database: database.to_string(),
        };
        self.broadcast(MessageType::SetPrivilege, &c)?;
        Ok(())
    }

    /// Checks that `user` may execute every statement. `database` is the
    /// fallback for statements that do not name one.
    pub fn authorize(
        &self,
        user: Option<&User>,
        statements: &[Statement],
        database: &str,
    ) -> Result<()> {
        let Some(user) = user else {
            return Err(Error::Authorize {
                user: String::new(),
                statement: String::new(),
                reason: "no user provided".to_string(),
            });
        };
        if user.admin {
            return Ok(());
        }
        for statement in statements {
            for (db, privilege) in statement.required_privileges() {
                let name = db.unwrap_or_else(|| database.to_string());
                if name.is_empty() {
                    return Err(Error::Authorize {
                        user: user.name.clone(),
                        statement: statement.kind().to_string(),
                        reason: "requires cluster admin".to_string(),
                    });
                }
                if !user.authorize(privilege, &name) {
                    return Err(Error::Authorize {
                        user: user.name.clone(),
                        statement: statement.kind().to_string(),
                        reason: format!("requires {privilege:?} privilege on {name}"),
                    });
                }
            }
        }
        Ok(())
    }

    // ----- shard groups ------------------------------------------------

    pub fn shard(&self, id: u64) -> Result<Option<Arc<ShardStore>>> {
        Ok(self.read()?.shards.get(&id).cloned())
    }

    /// Every shard group of a database, across its policies.
    pub fn shard_groups(&self, database: &str) -> Result<Vec<ShardGroup>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        let mut groups = Vec::new();
        for rp in db.policies.values() {
            groups.extend(rp.shard_groups.iter().cloned());
        }
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    pub fn shard_group_by_timestamp(
        &self,
        database: &str,
        policy: &str,
        timestamp: UnixNano,
    ) -> Result<Option<ShardGroup>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        Ok(db.shard_group_by_timestamp(policy, timestamp)?.cloned())
    }

    pub fn create_shard_group_if_not_exists(
        &self,
        database: &str,
        policy: &str,
        timestamp: UnixNano,
    ) -> Result<()> {
        let c = CreateShardGroupIfNotExistsCommand {
            database: database.to_string(),
            policy: policy.to_string(),
            timestamp,
        };
        self.broadcast(MessageType::CreateShardGroupIfNotExists, &c)?;
        Ok(())
    }

    pub fn delete_shard_group(&self, database: &str, policy: &str, id: u64) -> Result<()> {
        let c = DeleteShardGroupCommand {
            database: database.to_string(),
            policy: policy.to_string(),
            id,
        };
        self.broadcast(MessageType::DeleteShardGroup, &c)?;
        Ok(())
    }

    // ----- continuous queries ------------------------------------------

    pub fn create_continuous_query(&self, query: &str) -> Result<()> {
        // Parse locally first so obviously bad queries fail before they
        // reach the log.
        ContinuousQuery::new(query)?;
        let c = CreateContinuousQueryCommand {
            query: query.to_string(),
        };
        self.broadcast(MessageType::CreateContinuousQuery, &c)?;
        Ok(())
    }

    pub fn continuous_queries(&self, database: &str) -> Result<Vec<ContinuousQuery>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        Ok(db.continuous_queries.clone())
    }

    // ----- write path --------------------------------------------------

    /// Writes a batch of points, creating any missing measurements,
    /// series, fields and shard groups cluster-wide first. Returns the
    /// highest broker index the data was published at; `sync` on that
    /// index guarantees locally-owned shards have applied the write.
    pub fn write_series(&self, database: &str, retention_policy: &str, points: &[Point]) -> Result<u64> {
        let retention_policy = if retention_policy.is_empty() {
            self.default_retention_policy(database)?
                .ok_or(Error::DefaultRetentionPolicyNotFound)?
                .name
        } else {
            retention_policy.to_string()
        };

        self.create_measurements_if_not_exists(database, points)?;
        self.create_shard_groups_if_not_exists(database, &retention_policy, points)?;

        // Encode every point into its destination shard's batch.
        let mut shard_data: HashMap<u64, Vec<u8>> = HashMap::new();
        {
            let state = self.read()?;
            let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
            for point in points {
                let (measurement, series) = db.measurement_and_series(&point.name, &point.tags);
                let measurement = measurement.ok_or(Error::MeasurementNotFound)?;
                let series = series.ok_or(Error::SeriesNotFound)?;

                let group = db
                    .shard_group_by_timestamp(&retention_policy, point.timestamp)?
                    .ok_or(Error::ShardNotFound)?;
                let shard = group
                    .shard_by_series_id(series.id)
                    .ok_or(Error::ShardNotFound)?;

                let codec = FieldCodec::new(measurement);
                let encoded = codec.encode_fields(&point.values)?;
                let batch = shard_data.entry(shard.id).or_default();
                batch.extend_from_slice(&marshal_point_header(
                    series.id,
                    encoded.len() as u32,
                    point.timestamp,
                ));
                batch.extend_from_slice(&encoded);
            }
        }

        let client = self
            .read()?
            .client
            .clone()
            .ok_or_else(|| Error::Broker("no client".to_string()))?;
        let mut max_index = 0;
        for (shard_id, data) in shard_data {
            let index = client.publish(MessageType::WriteRawSeries, shard_id, data)?;
            max_index = max_index.max(index);
        }
        Ok(max_index)
    }

    /// Builds and broadcasts one batched create-measurements command for
    /// everything in `points` the catalog does not know yet. A type
    /// conflict against the catalog or within the batch fails the write.
    fn create_measurements_if_not_exists(&self, database: &str, points: &[Point]) -> Result<()> {
        let mut command = CreateMeasurementsIfNotExistsCommand::new(database);
        {
            let state = self.read()?;
            let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
            for point in points {
                let (measurement, series) = db.measurement_and_series(&point.name, &point.tags);

                if measurement.is_none() {
                    command.add_measurement_if_not_exists(&point.name);
                }
                if series.is_none() {
                    command.add_measurement_if_not_exists(&point.name);
                    command.add_series_if_not_exists(&point.name, &point.tags)?;
                }

                for (name, value) in &point.values {
                    let inferred = value.field_type();
                    if let Some(m) = measurement {
                        if let Some(field) = m.field_by_name(name) {
                            if field.field_type != inferred {
                                return Err(Error::FieldTypeConflict {
                                    field: name.clone(),
                                    existing: field.field_type,
                                    given: inferred,
                                });
                            }
                            continue;
                        }
                    }
                    command.add_measurement_if_not_exists(&point.name);
                    command.add_field_if_not_exists(&point.name, name, inferred)?;
                }
            }
        }

        if !command.is_empty() {
            self.broadcast(MessageType::CreateMeasurementsIfNotExists, &command)?;
        }
        Ok(())
    }

    /// Ensures a shard group exists for every distinct point window.
    fn create_shard_groups_if_not_exists(
        &self,
        database: &str,
        retention_policy: &str,
        points: &[Point],
    ) -> Result<()> {
        for point in points {
            let existing = {
                let state = self.read()?;
                let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
                db.shard_group_by_timestamp(retention_policy, point.timestamp)?
                    .is_some()
            };
            if existing {
                continue;
            }
            self.create_shard_group_if_not_exists(database, retention_policy, point.timestamp)?;
        }
        Ok(())
    }

    /// Reads a single point back by series and timestamp. Debug/test
    /// surface; the query path serves real reads.
    pub fn read_series(
        &self,
        database: &str,
        retention_policy: &str,
        name: &str,
        tags: &Tags,
        timestamp: UnixNano,
    ) -> Result<Option<HashMap<String, FieldValue>>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;

        let (measurement, series) = db.measurement_and_series(name, tags);
        let measurement = measurement.ok_or(Error::MeasurementNotFound)?;
        let series = series.ok_or(Error::SeriesNotFound)?;

        let policy_name = if retention_policy.is_empty() {
            db.default_retention_policy.clone()
        } else {
            retention_policy.to_string()
        };
        if !db.policies.contains_key(&policy_name) {
            return Err(Error::RetentionPolicyNotFound);
        }

        let Some(group) = db.shard_group_by_timestamp(&policy_name, timestamp)? else {
            return Ok(None);
        };
        let shard = group
            .shard_by_series_id(series.id)
            .ok_or(Error::ShardNotFound)?;
        let store = state.shards.get(&shard.id).ok_or(Error::ShardNotFound)?;

        let Some(data) = store.read_series(series.id, timestamp)? else {
            return Ok(None);
        };
        let codec = FieldCodec::new(measurement);
        Ok(Some(codec.decode_fields_by_name(&data)?))
    }

    // ----- query dispatch ----------------------------------------------

    /// Executes a parsed query. Authorization runs first; execution
    /// stops at the first failing statement, and any statements after it
    /// report "not executed".
    pub fn execute_query(
        &self,
        statements: Vec<Statement>,
        database: &str,
        user: Option<&User>,
    ) -> QueryResults {
        if self.read().map(|s| s.authentication_enabled).unwrap_or(true) {
            if let Err(err) = self.authorize(user, &statements, database) {
                return QueryResults::with_error(&err);
            }
        }

        let total = statements.len();
        let mut results = Vec::with_capacity(total);
        for mut statement in statements {
            if let Err(err) = self.normalize_statement(&mut statement, database) {
                results.push(StatementResult::from_result(Err(err)));
                break;
            }
            let result = self.execute_statement(&statement, database);
            let failed = result.error.is_some();
            results.push(result);
            if failed {
                break;
            }
        }
        while results.len() < total {
            results.push(StatementResult::from_result(Err(Error::NotExecuted)));
        }
        QueryResults {
            results,
            error: None,
        }
    }

    fn execute_statement(&self, statement: &Statement, database: &str) -> StatementResult {
        match statement {
            Statement::Select(select) => StatementResult::from_result(self.execute_select(select)),
            Statement::CreateDatabase { name } => {
                StatementResult::from_result(self.create_database(name).map(|_| Vec::new()))
            }
            Statement::DropDatabase { name } => {
                StatementResult::from_result(self.delete_database(name).map(|_| Vec::new()))
            }
            Statement::ShowDatabases => StatementResult::from_result(self.show_databases()),
            Statement::CreateRetentionPolicy {
                database,
                name,
                duration,
                replica_n,
                default,
            } => StatementResult::from_result(
                self.create_retention_policy(database, name, *duration, *replica_n)
                    .and_then(|_| {
                        if *default {
                            self.set_default_retention_policy(database, name)
                        } else {
                            Ok(())
                        }
                    })
                    .map(|_| Vec::new()),
            ),
            Statement::AlterRetentionPolicy {
                database,
                name,
                duration,
                replica_n,
                default,
            } => StatementResult::from_result(
                self.update_retention_policy(
                    database,
                    name,
                    RetentionPolicyUpdate {
                        name: None,
                        duration: *duration,
                        replica_n: *replica_n,
                    },
                )
                .and_then(|_| {
                    if *default {
                        self.set_default_retention_policy(database, name)
                    } else {
                        Ok(())
                    }
                })
                .map(|_| Vec::new()),
            ),
            Statement::DropRetentionPolicy { database, name } => StatementResult::from_result(
                self.delete_retention_policy(database, name).map(|_| Vec::new()),
            ),
            Statement::ShowRetentionPolicies { database } => {
                StatementResult::from_result(self.show_retention_policies(database))
            }
            Statement::CreateUser {
                name,
                password,
                admin,
            } => StatementResult::from_result(
                self.create_user(name, password, *admin).map(|_| Vec::new()),
            ),
            Statement::DropUser { name } => {
                StatementResult::from_result(self.delete_user(name).map(|_| Vec::new()))
            }
            Statement::ShowUsers => StatementResult::from_result(self.show_users()),
            Statement::Grant {
                privilege,
                database: db,
                user,
            } => StatementResult::from_result(
                self.set_privilege(*privilege, user, db.as_deref().unwrap_or(""))
                    .map(|_| Vec::new()),
            ),
            Statement::Revoke { database: db, user, .. } => StatementResult::from_result(
                // Revoking always resets to no privileges.
                self.set_privilege(Privilege::None, user, db.as_deref().unwrap_or(""))
                    .map(|_| Vec::new()),
            ),
            Statement::ShowMeasurements => {
                StatementResult::from_result(self.show_measurements(database))
            }
            Statement::ShowSeries { source } => {
                StatementResult::from_result(self.show_series(database, source.as_ref()))
            }
            Statement::ShowTagKeys { source } => {
                StatementResult::from_result(self.show_tag_keys(database, source.as_ref()))
            }
            Statement::ShowTagValues { source, key } => {
                StatementResult::from_result(self.show_tag_values(database, source.as_ref(), key))
            }
            Statement::ShowFieldKeys { source } => {
                StatementResult::from_result(self.show_field_keys(database, source.as_ref()))
            }
            Statement::ShowContinuousQueries => {
                StatementResult::from_result(self.show_continuous_queries())
            }
            Statement::CreateContinuousQuery(cq) => StatementResult::from_result(
                self.create_continuous_query(&cq.text).map(|_| Vec::new()),
            ),
        }
    }

    fn execute_select(&self, select: &SelectStatement) -> Result<Vec<Row>> {
        // Plan under the read lock, execute off-lock.
        let plan = self.plan_select(select)?;
        plan.execute()
    }

    /// Resolves a SELECT into an executable plan: measurement and codec
    /// snapshot plus one source per owned shard and matching series.
    pub fn plan_select(&self, select: &SelectStatement) -> Result<SelectPlan> {
        let state = self.read()?;
        let database = select.source.database.as_deref().unwrap_or("");
        let policy = select.source.policy.as_deref().unwrap_or("");
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        let rp = db.policies.get(policy).ok_or(Error::RetentionPolicyNotFound)?;
        let measurement = db
            .measurements
            .get(&select.source.name)
            .ok_or(Error::MeasurementNotFound)?;

        let mut statement = select.clone();
        expand_wildcard(&mut statement, measurement)?;

        let series_ids = measurement.series_ids_by_tags(&statement.tag_filter);
        let start = statement.time_start.unwrap_or(i64::MIN + 1);
        let end = statement.time_end.unwrap_or(i64::MAX);

        let mut sources = Vec::new();
        for group in &rp.shard_groups {
            if group.end_time <= start || group.start_time >= end {
                continue;
            }
            for series_id in &series_ids {
                let Some(shard) = group.shard_by_series_id(*series_id) else {
                    continue;
                };
                // Local execution reads only shards this node owns.
                let Some(store) = state.shards.get(&shard.id) else {
                    continue;
                };
                let Some(series) = measurement.series_by_id.get(series_id) else {
                    continue;
                };
                sources.push(SeriesSource {
                    series_id: *series_id,
                    tags: series.tags.clone(),
                    store: Arc::clone(store),
                });
            }
        }

        Ok(SelectPlan {
            measurement: measurement.name.clone(),
            codec: FieldCodec::new(measurement),
            statement,
            sources,
        })
    }

    // ----- statement normalization -------------------------------------

    /// Fills the default database and retention policy into every
    /// measurement reference of the statement and validates that both
    /// exist.
    pub fn normalize_statement(&self, statement: &mut Statement, default_db: &str) -> Result<()> {
        let state = self.read()?;
        match statement {
            Statement::Select(select) => {
                normalize_measurement(&state, &mut select.source, default_db)?;
            }
            Statement::ShowSeries { source: Some(m) }
            | Statement::ShowTagKeys { source: Some(m) }
            | Statement::ShowTagValues { source: Some(m), .. }
            | Statement::ShowFieldKeys { source: Some(m) } => {
                normalize_measurement(&state, m, default_db)?;
            }
            _ => {}
        }
        Ok(())
    }

    // ----- SHOW read path ----------------------------------------------

    fn show_databases(&self) -> Result<Vec<Row>> {
        Ok(vec![Row {
            name: String::new(),
            tags: Tags::new(),
            columns: vec!["name".to_string()],
            values: self
                .databases()?
                .into_iter()
                .map(|name| vec![Some(FieldValue::String(name))])
                .collect(),
        }])
    }

    fn show_users(&self) -> Result<Vec<Row>> {
        Ok(vec![Row {
            name: String::new(),
            tags: Tags::new(),
            columns: vec!["user".to_string(), "admin".to_string()],
            values: self
                .users()?
                .into_iter()
                .map(|u| {
                    vec![
                        Some(FieldValue::String(u.name)),
                        Some(FieldValue::Boolean(u.admin)),
                    ]
                })
                .collect(),
        }])
    }

    fn show_retention_policies(&self, database: &str) -> Result<Vec<Row>> {
        Ok(vec![Row {
            name: String::new(),
            tags: Tags::new(),
            columns: vec![
                "name".to_string(),
                "duration".to_string(),
                "replicaN".to_string(),
            ],
            values: self
                .retention_policies(database)?
                .into_iter()
                .map(|rp| {
                    vec![
                        Some(FieldValue::String(rp.name)),
                        Some(FieldValue::Integer(rp.duration)),
                        Some(FieldValue::Integer(rp.replica_n as i64)),
                    ]
                })
                .collect(),
        }])
    }

    fn show_measurements(&self, database: &str) -> Result<Vec<Row>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        Ok(vec![Row {
            name: "measurements".to_string(),
            tags: Tags::new(),
            columns: vec!["name".to_string()],
            values: db
                .measurement_names()
                .into_iter()
                .map(|name| vec![Some(FieldValue::String(name))])
                .collect(),
        }])
    }

    /// Measurements named by the statement source, or every measurement
    /// of the database.
    fn measurements_from_source(
        state: &NodeState,
        database: &str,
        source: Option<&MeasurementName>,
    ) -> Result<Vec<Measurement>> {
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        match source {
            Some(m) => {
                let measurement = db
                    .measurements
                    .get(&m.name)
                    .ok_or(Error::MeasurementNotFound)?;
                Ok(vec![measurement.clone()])
            }
            None => {
                let mut all: Vec<Measurement> = db.measurements.values().cloned().collect();
                all.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(all)
            }
        }
    }

    fn show_series(&self, database: &str, source: Option<&MeasurementName>) -> Result<Vec<Row>> {
        let state = self.read()?;
        let database = source
            .and_then(|m| m.database.as_deref())
            .unwrap_or(database);
        let measurements = Self::measurements_from_source(&state, database, source)?;
        let mut rows = Vec::new();
        for m in measurements {
            let columns = m.tag_keys();
            let mut values = Vec::new();
            for id in m.series_ids() {
                if let Some(series) = m.series_by_id.get(&id) {
                    values.push(
                        columns
                            .iter()
                            .map(|key| {
                                Some(FieldValue::String(
                                    series.tags.get(key).cloned().unwrap_or_default(),
                                ))
                            })
                            .collect(),
                    );
                }
            }
            rows.push(Row {
                name: m.name.clone(),
                tags: Tags::new(),
                columns,
                values,
            });
        }
        Ok(rows)
    }

    fn show_tag_keys(&self, database: &str, source: Option<&MeasurementName>) -> Result<Vec<Row>> {
        let state = self.read()?;
        let database = source
            .and_then(|m| m.database.as_deref())
            .unwrap_or(database);
        let measurements = Self::measurements_from_source(&state, database, source)?;
        Ok(measurements
            .into_iter()
            .map(|m| Row {
                name: m.name.clone(),
                tags: Tags::new(),
                columns: vec!["tagKey".to_string()],
                values: m
                    .tag_keys()
                    .into_iter()
                    .map(|key| vec![Some(FieldValue::String(key))])
                    .collect(),
            })
            .collect())
    }

    fn show_tag_values(
        &self,
        database: &str,
        source: Option<&MeasurementName>,
        key: &str,
    ) -> Result<Vec<Row>> {
        let state = self.read()?;
        let database = source
            .and_then(|m| m.database.as_deref())
            .unwrap_or(database);
        let measurements = Self::measurements_from_source(&state, database, source)?;
        Ok(measurements
            .into_iter()
            .map(|m| {
                let ids = m.series_ids();
                Row {
                    name: m.name.clone(),
                    tags: Tags::new(),
                    columns: vec!["tagValue".to_string()],
                    values: m
                        .tag_values(key, &ids)
                        .into_iter()
                        .map(|value| vec![Some(FieldValue::String(value))])
                        .collect(),
                }
            })
            .collect())
    }

    fn show_field_keys(&self, database: &str, source: Option<&MeasurementName>) -> Result<Vec<Row>> {
        let state = self.read()?;
        let database = source
            .and_then(|m| m.database.as_deref())
            .unwrap_or(database);
        let measurements = Self::measurements_from_source(&state, database, source)?;
        Ok(measurements
            .into_iter()
            .map(|m| Row {
                name: m.name.clone(),
                tags: Tags::new(),
                columns: vec!["fieldKey".to_string()],
                values: m
                    .field_names()
                    .into_iter()
                    .map(|name| vec![Some(FieldValue::String(name))])
                    .collect(),
            })
            .collect())
    }

    fn show_continuous_queries(&self) -> Result<Vec<Row>> {
        let state = self.read()?;
        let mut names: Vec<&String> = state.databases.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| {
                let db = &state.databases[name];
                Row {
                    name: name.clone(),
                    tags: Tags::new(),
                    columns: vec!["name".to_string(), "query".to_string()],
                    values: db
                        .continuous_queries
                        .iter()
                        .map(|cq| {
                            vec![
                                Some(FieldValue::String(cq.name().to_string())),
                                Some(FieldValue::String(cq.query.clone())),
                            ]
                        })
                        .collect(),
                }
            })
            .collect())
    }

    // ----- introspection used by tests and the daemon ------------------

    pub fn measurement_names(&self, database: &str) -> Result<Vec<String>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        Ok(db.measurement_names())
    }

    pub fn measurement(&self, database: &str, name: &str) -> Result<Option<Measurement>> {
        let state = self.read()?;
        let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;
        Ok(db.measurements.get(name).cloned())
    }
}

/// Expands `SELECT *` into the measurement's fields, in field-id order.
fn expand_wildcard(statement: &mut SelectStatement, measurement: &Measurement) -> Result<()> {
    if !statement
        .fields
        .iter()
        .any(|f| matches!(f, SelectField::Wildcard))
    {
        return Ok(());
    }
    if statement.fields.len() != 1 {
        return Err(Error::Query(
            "wildcard cannot be combined with other fields".to_string(),
        ));
    }
    statement.fields = measurement
        .fields
        .iter()
        .map(|f| SelectField::Field {
            function: None,
            name: f.name.clone(),
            alias: None,
        })
        .collect();
    Ok(())
}

/// Fills defaults into a measurement reference and verifies the
/// database and policy exist.
pub(crate) fn normalize_measurement(
    state: &NodeState,
    m: &mut MeasurementName,
    default_db: &str,
) -> Result<()> {
    if m.database.as_deref().unwrap_or("").is_empty() {
        m.database = Some(default_db.to_string());
    }
    let database = m.database.as_deref().unwrap_or("");
    let db = state.databases.get(database).ok_or(Error::DatabaseNotFound)?;

    if m.policy.as_deref().unwrap_or("").is_empty() {
        if db.default_retention_policy.is_empty() {
            return Err(Error::DefaultRetentionPolicyNotFound);
        }
        m.policy = Some(db.default_retention_policy.clone());
    }
    let policy = m.policy.as_deref().unwrap_or("");
    if !db.policies.contains_key(policy) {
        return Err(Error::RetentionPolicyNotFound);
    }
    Ok(())
}

/// Loads catalog state from the metastore and opens the stores of every
/// shard owned by this node.
fn load_state(state: &mut NodeState, meta: &Metastore) -> Result<()> {
    meta.view(|v| {
        state.id = v.id();

        state.data_nodes = v.data_nodes().into_iter().map(|n| (n.id, n)).collect();

        state.databases = v
            .databases()
            .into_iter()
            .map(|mut db| {
                log::info!("loading metadata index for {}", db.name);
                db.rebuild_index();
                (db.name.clone(), db)
            })
            .collect();

        state.users = v.users().into_iter().map(|u| (u.name.clone(), u)).collect();
        Ok(())
    })?;

    // Open stores for owned shards of existing groups.
    let id = state.id;
    let mut stores = HashMap::new();
    for db in state.databases.values() {
        for rp in db.policies.values() {
            for group in &rp.shard_groups {
                for shard in &group.shards {
                    if !shard.has_data_node_id(id) {
                        continue;
                    }
                    let path = Node::shard_path(state, shard.id).ok_or(Error::NodeClosed)?;
                    let store = ShardStore::open(&path).map_err(|err| {
                        Error::Query(format!("cannot open shard store: id={} err={err}", shard.id))
                    })?;
                    stores.insert(shard.id, Arc::new(store));
                }
            }
        }
    }
    state.shards = stores;
    state.shards_by_series_id.clear();
    Ok(())
}

fn spawn_processor(
    node: Arc<Node>,
    messages: Receiver<Message>,
    done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            match messages.recv_timeout(Duration::from_millis(100)) {
                Ok(message) => node.apply_message(&message),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}
