//! The apply engine: deterministic mutation of local state driven by
//! consuming broker messages.
//!
//! Applying is serial per node. Each handler validates the decoded
//! command under the coordinator's write lock, persists through the
//! metastore with clone-update-swap (so a failed update leaves both the
//! file and the in-memory catalog untouched), and returns an error iff
//! the command is rejected. The processor records `(index, error?)`
//! afterwards and advances the applied mark; handlers never panic on
//! malformed input.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use common::time::truncate;

use crate::broker::{Message, MessageType};
use crate::catalog::{hash_password, ContinuousQuery, DataNode, DatabaseInfo, Privilege, Series, ShardGroup};
use crate::codec::{unmarshal_point_header, POINT_HEADER_SIZE};
use crate::command::*;
use crate::error::{Error, Result};
use crate::node::{normalize_measurement, Node};
use crate::shard::{Shard, ShardStore};

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

impl Node {
    /// Applies one broker message and records its outcome under the
    /// message index.
    pub(crate) fn apply_message(&self, m: &Message) {
        // A node that has been closed ignores the tail of the stream.
        match self.read() {
            Ok(state) if state.opened() => {}
            _ => return,
        }

        let result = match m.message_type {
            MessageType::WriteRawSeries => self.apply_write_raw_series(m),
            MessageType::CreateDataNode => self.apply_create_data_node(&m.data),
            MessageType::DeleteDataNode => self.apply_delete_data_node(&m.data),
            MessageType::CreateDatabase => self.apply_create_database(&m.data),
            MessageType::DeleteDatabase => self.apply_delete_database(&m.data),
            MessageType::CreateUser => self.apply_create_user(&m.data),
            MessageType::UpdateUser => self.apply_update_user(&m.data),
            MessageType::DeleteUser => self.apply_delete_user(&m.data),
            MessageType::SetPrivilege => self.apply_set_privilege(&m.data),
            MessageType::CreateRetentionPolicy => self.apply_create_retention_policy(&m.data),
            MessageType::UpdateRetentionPolicy => self.apply_update_retention_policy(&m.data),
            MessageType::DeleteRetentionPolicy => self.apply_delete_retention_policy(&m.data),
            MessageType::SetDefaultRetentionPolicy => {
                self.apply_set_default_retention_policy(&m.data)
            }
            MessageType::CreateShardGroupIfNotExists => {
                self.apply_create_shard_group_if_not_exists(m.index, &m.data)
            }
            MessageType::DeleteShardGroup => self.apply_delete_shard_group(&m.data),
            MessageType::CreateMeasurementsIfNotExists => {
                self.apply_create_measurements_if_not_exists(&m.data)
            }
            MessageType::CreateContinuousQuery => self.apply_create_continuous_query(&m.data),
        };

        match self.write() {
            Ok(mut state) => {
                state.index = m.index;
                if let Err(err) = result {
                    log::warn!("apply error: index={} type={:?}: {err}", m.index, m.message_type);
                    state.errors.insert(m.index, err);
                }
            }
            Err(err) => log::error!("cannot record applied index {}: {err}", m.index),
        }
    }

    fn apply_create_data_node(&self, data: &[u8]) -> Result<()> {
        let c: CreateDataNodeCommand = decode(data)?;
        let mut state = self.write()?;

        if c.url.is_empty() {
            return Err(Error::DataNodeUrlRequired);
        }
        if state.data_nodes.values().any(|n| n.url == c.url) {
            return Err(Error::DataNodeExists);
        }

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        let node = meta.update(|tx| {
            let node = DataNode {
                id: tx.next_data_node_id(),
                url: c.url.clone(),
            };
            tx.save_data_node(&node);
            Ok(node)
        })?;

        state.data_nodes.insert(node.id, node);
        Ok(())
    }

    fn apply_delete_data_node(&self, data: &[u8]) -> Result<()> {
        let c: DeleteDataNodeCommand = decode(data)?;
        let mut state = self.write()?;

        if !state.data_nodes.contains_key(&c.id) {
            return Err(Error::DataNodeNotFound);
        }
        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.delete_data_node(c.id);
            Ok(())
        })?;

        state.data_nodes.remove(&c.id);
        Ok(())
    }

    fn apply_create_database(&self, data: &[u8]) -> Result<()> {
        let c: CreateDatabaseCommand = decode(data)?;
        let mut state = self.write()?;

        if state.databases.contains_key(&c.name) {
            return Err(Error::DatabaseExists);
        }
        let db = DatabaseInfo::new(&c.name);
        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db);
            Ok(())
        })?;

        state.databases.insert(c.name, db);
        Ok(())
    }

    fn apply_delete_database(&self, data: &[u8]) -> Result<()> {
        let c: DeleteDatabaseCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.name) else {
            return Err(Error::DatabaseNotFound);
        };

        // Release stores of shards owned through this database. Files
        // stay on disk until retention or an operator removes them.
        let shard_ids: Vec<u64> = db
            .policies
            .values()
            .flat_map(|rp| rp.shard_groups.iter())
            .flat_map(|g| g.shards.iter())
            .map(|s| s.id)
            .collect();

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.delete_database(&c.name);
            Ok(())
        })?;

        for id in shard_ids {
            state.shards.remove(&id);
        }
        state.databases.remove(&c.name);
        Ok(())
    }

    fn apply_create_user(&self, data: &[u8]) -> Result<()> {
        let c: CreateUserCommand = decode(data)?;
        let mut state = self.write()?;

        if c.username.is_empty() {
            return Err(Error::UsernameRequired);
        }
        if state.users.contains_key(&c.username) {
            return Err(Error::UserExists);
        }

        // Hashing happens inside apply so the plaintext field of the
        // command is the deterministic input.
        let user = crate::catalog::User {
            name: c.username.clone(),
            hash: hash_password(&c.password)?,
            privileges: Default::default(),
            admin: c.admin,
        };

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_user(&user);
            Ok(())
        })?;

        state.users.insert(c.username, user);
        Ok(())
    }

    fn apply_update_user(&self, data: &[u8]) -> Result<()> {
        let c: UpdateUserCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(user) = state.users.get(&c.username) else {
            return Err(Error::UserNotFound);
        };
        let mut user = user.clone();
        if !c.password.is_empty() {
            user.hash = hash_password(&c.password)?;
        }

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_user(&user);
            Ok(())
        })?;

        state.users.insert(c.username, user);
        Ok(())
    }

    fn apply_delete_user(&self, data: &[u8]) -> Result<()> {
        let c: DeleteUserCommand = decode(data)?;
        let mut state = self.write()?;

        if c.username.is_empty() {
            return Err(Error::UsernameRequired);
        }
        if !state.users.contains_key(&c.username) {
            return Err(Error::UserNotFound);
        }

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.delete_user(&c.username);
            Ok(())
        })?;

        state.users.remove(&c.username);
        Ok(())
    }

    fn apply_set_privilege(&self, data: &[u8]) -> Result<()> {
        let c: SetPrivilegeCommand = decode(data)?;
        let mut state = self.write()?;

        if c.username.is_empty() {
            return Err(Error::UsernameRequired);
        }
        let Some(user) = state.users.get(&c.username) else {
            return Err(Error::UserNotFound);
        };
        let mut user = user.clone();

        if c.database.is_empty()
            && (c.privilege == Privilege::All || c.privilege == Privilege::None)
        {
            // An empty database toggles cluster admin.
            user.admin = c.privilege == Privilege::All;
        } else if !c.database.is_empty() {
            user.privileges.insert(c.database.clone(), c.privilege);
        } else {
            return Err(Error::InvalidGrantRevoke);
        }

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_user(&user);
            Ok(())
        })?;

        state.users.insert(c.username, user);
        Ok(())
    }

    fn apply_create_retention_policy(&self, data: &[u8]) -> Result<()> {
        let c: CreateRetentionPolicyCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.database) else {
            return Err(Error::DatabaseNotFound);
        };
        if c.name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        }
        if c.duration <= 0 {
            return Err(Error::RetentionPolicyDurationInvalid);
        }
        if db.policies.contains_key(&c.name) {
            return Err(Error::RetentionPolicyExists);
        }

        let mut db = db.clone();
        db.policies.insert(
            c.name.clone(),
            crate::catalog::RetentionPolicy {
                name: c.name.clone(),
                duration: c.duration,
                replica_n: c.replica_n.max(1),
                shard_groups: Vec::new(),
            },
        );

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db);
            Ok(())
        })?;

        state.databases.insert(c.database, db);
        Ok(())
    }

    fn apply_update_retention_policy(&self, data: &[u8]) -> Result<()> {
        let c: UpdateRetentionPolicyCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.database) else {
            return Err(Error::DatabaseNotFound);
        };
        if c.name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        }
        if !db.policies.contains_key(&c.name) {
            return Err(Error::RetentionPolicyNotFound);
        }
        if matches!(c.policy.duration, Some(d) if d <= 0) {
            return Err(Error::RetentionPolicyDurationInvalid);
        }

        let mut db = db.clone();
        let mut policy = db.policies.remove(&c.name).ok_or(Error::RetentionPolicyNotFound)?;
        if let Some(name) = &c.policy.name {
            // Renaming rekeys the policy map; the default pointer
            // follows the rename.
            if db.default_retention_policy == policy.name {
                db.default_retention_policy = name.clone();
            }
            policy.name = name.clone();
        }
        if let Some(duration) = c.policy.duration {
            policy.duration = duration;
        }
        if let Some(replica_n) = c.policy.replica_n {
            policy.replica_n = replica_n.max(1);
        }
        db.policies.insert(policy.name.clone(), policy);

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db);
            Ok(())
        })?;

        state.databases.insert(c.database, db);
        Ok(())
    }

    fn apply_delete_retention_policy(&self, data: &[u8]) -> Result<()> {
        let c: DeleteRetentionPolicyCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.database) else {
            return Err(Error::DatabaseNotFound);
        };
        if c.name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        }
        if !db.policies.contains_key(&c.name) {
            return Err(Error::RetentionPolicyNotFound);
        }

        let mut db = db.clone();
        db.policies.remove(&c.name);

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db);
            Ok(())
        })?;

        state.databases.insert(c.database, db);
        Ok(())
    }

    fn apply_set_default_retention_policy(&self, data: &[u8]) -> Result<()> {
        let c: SetDefaultRetentionPolicyCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.database) else {
            return Err(Error::DatabaseNotFound);
        };
        if !db.policies.contains_key(&c.name) {
            return Err(Error::RetentionPolicyNotFound);
        }

        let mut db = db.clone();
        db.default_retention_policy = c.name;

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db);
            Ok(())
        })?;

        state.databases.insert(c.database, db);
        Ok(())
    }

    /// Creates the shard group covering the command's timestamp, unless
    /// one already exists. Placement is deterministic: nodes sorted by
    /// id, round-robin seeded by the replicated message index.
    fn apply_create_shard_group_if_not_exists(&self, index: u64, data: &[u8]) -> Result<()> {
        let c: CreateShardGroupIfNotExistsCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.database) else {
            return Err(Error::DatabaseNotFound);
        };
        let Some(rp) = db.policies.get(&c.policy) else {
            return Err(Error::RetentionPolicyNotFound);
        };
        if rp.shard_group_by_timestamp(c.timestamp).is_some() {
            return Ok(());
        }

        let mut nodes: Vec<DataNode> = state.data_nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        if nodes.is_empty() {
            return Err(Error::DataNodeNotFound);
        }

        let replica_n = (rp.replica_n.max(1) as usize).min(nodes.len());
        let shard_n = nodes.len() / replica_n;

        let mut group = ShardGroup {
            id: 0,
            start_time: truncate(c.timestamp, rp.duration),
            end_time: truncate(c.timestamp, rp.duration) + rp.duration,
            shards: Vec::with_capacity(shard_n),
        };

        let mut db_clone = db.clone();
        let node_id = state.id;
        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        let mut opened: Vec<(u64, Arc<ShardStore>)> = Vec::new();

        meta.update(|tx| {
            group.id = tx.next_shard_group_id();
            for _ in 0..shard_n {
                group.shards.push(Shard::new(tx.next_shard_id(), Vec::new()));
            }

            // Start from a repeatable place in the node list so replicas
            // compute identical placement.
            let mut node_index = (index % nodes.len() as u64) as usize;
            for shard in &mut group.shards {
                for _ in 0..replica_n {
                    shard.data_node_ids.push(nodes[node_index % nodes.len()].id);
                    node_index += 1;
                }
            }

            // Open stores for locally owned shards before persisting, so
            // an open failure aborts the command with nothing committed.
            for shard in &group.shards {
                if !shard.has_data_node_id(node_id) {
                    continue;
                }
                let path = Node::shard_path(&state, shard.id).ok_or(Error::NodeClosed)?;
                opened.push((shard.id, Arc::new(ShardStore::open(path)?)));
            }

            let rp = db_clone
                .policies
                .get_mut(&c.policy)
                .ok_or(Error::RetentionPolicyNotFound)?;
            rp.shard_groups.push(group.clone());
            tx.save_database(&db_clone);
            Ok(())
        })?;

        state.databases.insert(db_clone.name.clone(), db_clone);
        for (id, store) in opened {
            state.shards.insert(id, store);
        }

        // Subscribe to the topics of newly owned shards.
        if let Some(client) = state.client.clone() {
            for shard in &group.shards {
                if !shard.has_data_node_id(node_id) {
                    continue;
                }
                if let Err(err) = client.subscribe(node_id, shard.id) {
                    log::warn!(
                        "unable to subscribe: replica={node_id} topic={} err={err}",
                        shard.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Removes a shard group; owned shard files are closed and deleted.
    /// A group that is already gone is a success, since every replica
    /// broadcasts the same deletions.
    fn apply_delete_shard_group(&self, data: &[u8]) -> Result<()> {
        let c: DeleteShardGroupCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.database) else {
            return Err(Error::DatabaseNotFound);
        };
        let Some(rp) = db.policies.get(&c.policy) else {
            return Err(Error::RetentionPolicyNotFound);
        };
        let Some(group) = rp.shard_group_by_id(c.id).cloned() else {
            return Ok(());
        };
        let mut db_clone = db.clone();

        let node_id = state.id;
        for shard in &group.shards {
            if !shard.has_data_node_id(node_id) {
                continue;
            }
            let path = match state.shards.remove(&shard.id) {
                Some(store) => store.path().to_path_buf(),
                None => match Node::shard_path(&state, shard.id) {
                    Some(path) => path,
                    None => continue,
                },
            };
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    // Keep going; the shard may have been deleted before
                    // a previous acknowledgement was recorded.
                    log::warn!(
                        "error deleting shard {}: group={} policy={}: {err}",
                        path.display(),
                        group.id,
                        c.policy
                    );
                }
            }
        }

        if let Some(rp) = db_clone.policies.get_mut(&c.policy) {
            rp.remove_shard_group_by_id(c.id);
        }

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db_clone);
            Ok(())
        })?;

        state.databases.insert(db_clone.name.clone(), db_clone);
        Ok(())
    }

    /// Idempotently creates measurements, series and fields. Per-field
    /// conflicts are logged and skipped so the rest of the batch lands.
    /// Iteration is sorted throughout, keeping series-id assignment
    /// deterministic across replicas.
    fn apply_create_measurements_if_not_exists(&self, data: &[u8]) -> Result<()> {
        let c: CreateMeasurementsIfNotExistsCommand = decode(data)?;
        let mut state = self.write()?;

        let Some(db) = state.databases.get(&c.database) else {
            return Err(Error::DatabaseNotFound);
        };
        let mut db_clone = db.clone();

        let mut names: Vec<&String> = c.measurements.keys().collect();
        names.sort();

        let mut next_series_id = db_clone.next_series_id;
        for name in names {
            let sub = &c.measurements[name];
            let measurement = db_clone
                .measurements
                .entry(name.clone())
                .or_insert_with(|| crate::catalog::Measurement::new(name));

            let mut tag_set_keys: Vec<&String> = sub.tags.keys().collect();
            tag_set_keys.sort();
            for key in tag_set_keys {
                let tags = &sub.tags[key];
                if measurement.series_by_tags(tags).is_some() {
                    continue;
                }
                let series = Series {
                    id: next_series_id,
                    tags: tags.clone(),
                };
                next_series_id += 1;
                measurement.add_series(series);
            }

            let mut field_names: Vec<&String> = sub.fields.keys().collect();
            field_names.sort();
            for field in field_names {
                match measurement.create_field_if_not_exists(field, sub.fields[field]) {
                    Ok(()) => {}
                    Err(Error::FieldOverflow) => {
                        log::warn!("no more fields allowed: {}::{field}", measurement.name);
                    }
                    Err(Error::FieldTypeConflict { .. }) => {
                        log::warn!("field type conflict: {}::{field}", measurement.name);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        db_clone.next_series_id = next_series_id;

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db_clone);
            Ok(())
        })?;

        state.databases.insert(db_clone.name.clone(), db_clone);
        Ok(())
    }

    /// Writes a raw-series batch into the shard addressed by the message
    /// topic, consuming records until the buffer is exhausted.
    fn apply_write_raw_series(&self, m: &Message) -> Result<()> {
        let mut state = self.write()?;
        let store = state
            .shards
            .get(&m.topic_id)
            .cloned()
            .ok_or(Error::ShardNotFound)?;

        let mut buf = &m.data[..];
        while !buf.is_empty() {
            if buf.len() < POINT_HEADER_SIZE {
                return Err(Error::InvalidPointRecord);
            }
            let (series_id, payload_len, timestamp) = unmarshal_point_header(buf)?;
            let total = POINT_HEADER_SIZE + payload_len as usize;
            if buf.len() < total {
                return Err(Error::InvalidPointRecord);
            }

            let shards = state.shards_by_series_id.entry(series_id).or_default();
            if !shards.contains(&m.topic_id) {
                shards.push(m.topic_id);
            }

            store.write_series(series_id, timestamp, &buf[POINT_HEADER_SIZE..total], true)?;
            buf = &buf[total..];
        }
        Ok(())
    }

    fn apply_create_continuous_query(&self, data: &[u8]) -> Result<()> {
        let c: CreateContinuousQueryCommand = decode(data)?;
        let mut cq = ContinuousQuery::new(&c.query)?;

        let mut state = self.write()?;

        // Resolve the source measurement against the query's database.
        let database = cq
            .statement
            .as_ref()
            .map(|s| s.database.clone())
            .unwrap_or_default();
        if let Some(statement) = cq.statement.as_mut() {
            normalize_measurement(&state, &mut statement.select.source, &database)?;
        }

        if !state.databases.contains_key(&cq.into_db) {
            return Err(Error::DatabaseNotFound);
        }
        let Some(db) = state.databases.get(&database) else {
            return Err(Error::DatabaseNotFound);
        };
        if db.continuous_query_by_name(cq.name()).is_some() {
            return Err(Error::ContinuousQueryExists);
        }

        let mut db_clone = db.clone();
        db_clone.continuous_queries.push(cq);

        let meta = state.meta.clone().ok_or(Error::NodeClosed)?;
        meta.update(|tx| {
            tx.save_database(&db_clone);
            Ok(())
        })?;

        state.databases.insert(database, db_clone);
        Ok(())
    }
}
