//! The in-memory metadata catalog: data nodes, databases, retention
//! policies, shard groups, measurements, series, users and continuous
//! queries.
//!
//! Catalog entities are constructed only inside apply handlers, mutated
//! only under the coordinator's exclusive lock, and persisted through
//! the metastore. Derived indexes are rebuilt on load.

pub mod measurement;
pub mod user;

use std::collections::HashMap;

use common::time::UnixNano;
use serde::{Deserialize, Serialize};

pub use measurement::{Field, Measurement, Series};
pub use user::{hash_password, Privilege, User};

use crate::error::{Error, Result};
use crate::query::{parse_statement, CreateContinuousQueryStatement, Statement};
use crate::shard::Shard;

/// Name given to a database's first retention policy when none is
/// specified.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "default";

/// A member of the cluster. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub id: u64,
    pub url: String,
}

/// A set of shards covering one contiguous time window of a retention
/// policy. `[start_time, end_time)` windows of the same policy are
/// disjoint and aligned to the policy duration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardGroup {
    pub id: u64,
    pub start_time: UnixNano,
    pub end_time: UnixNano,
    pub shards: Vec<Shard>,
}

impl ShardGroup {
    pub fn contains(&self, timestamp: UnixNano) -> bool {
        self.start_time <= timestamp && timestamp < self.end_time
    }

    /// Stable shard routing within the group for a series.
    pub fn shard_by_series_id(&self, series_id: u32) -> Option<&Shard> {
        if self.shards.is_empty() {
            return None;
        }
        self.shards.get(series_id as usize % self.shards.len())
    }
}

/// A named rule governing how long samples are kept and how many copies
/// of each shard exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub name: String,
    /// Length of each shard-group window and of the retention horizon,
    /// in nanoseconds.
    pub duration: i64,
    #[serde(rename = "replicaN")]
    pub replica_n: u32,
    #[serde(default)]
    pub shard_groups: Vec<ShardGroup>,
}

impl RetentionPolicy {
    pub fn new(name: &str) -> RetentionPolicy {
        RetentionPolicy {
            name: name.to_string(),
            duration: 0,
            replica_n: 1,
            shard_groups: Vec::new(),
        }
    }

    pub fn shard_group_by_timestamp(&self, timestamp: UnixNano) -> Option<&ShardGroup> {
        self.shard_groups.iter().find(|g| g.contains(timestamp))
    }

    pub fn shard_group_by_id(&self, id: u64) -> Option<&ShardGroup> {
        self.shard_groups.iter().find(|g| g.id == id)
    }

    pub fn remove_shard_group_by_id(&mut self, id: u64) {
        self.shard_groups.retain(|g| g.id != id);
    }
}

/// A persisted aggregated SELECT that runs on a schedule and writes its
/// results back as points. The parsed statement and last-run time are
/// runtime state, re-derived from the query text on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousQuery {
    pub query: String,
    #[serde(skip)]
    pub statement: Option<CreateContinuousQueryStatement>,
    #[serde(skip)]
    pub into_db: String,
    #[serde(skip)]
    pub into_rp: String,
    #[serde(skip)]
    pub into_measurement: String,
    #[serde(skip)]
    pub last_run: UnixNano,
}

impl ContinuousQuery {
    /// Parses the query text and resolves the write-back target. The
    /// INTO clause may name one, two, or three identifier segments;
    /// missing segments default to the source database and its default
    /// retention policy.
    pub fn new(query: &str) -> Result<ContinuousQuery> {
        let statement = match parse_statement(query)? {
            Statement::CreateContinuousQuery(s) => s,
            _ => return Err(Error::NotContinuousQuery),
        };

        let segments = &statement.select.into;
        let mut cq = ContinuousQuery {
            query: query.to_string(),
            into_db: statement.database.clone(),
            into_rp: String::new(),
            into_measurement: String::new(),
            last_run: 0,
            statement: None,
        };
        match segments.len() {
            1 => cq.into_measurement = segments[0].clone(),
            2 => {
                cq.into_rp = segments[0].clone();
                cq.into_measurement = segments[1].clone();
            }
            3 => {
                cq.into_db = segments[0].clone();
                cq.into_rp = segments[1].clone();
                cq.into_measurement = segments[2].clone();
            }
            _ => return Err(Error::NotContinuousQuery),
        }
        cq.statement = Some(statement);
        Ok(cq)
    }

    pub fn name(&self) -> &str {
        self.statement
            .as_ref()
            .map(|s| s.name.as_str())
            .unwrap_or("")
    }
}

/// One database: its retention policies, measurements, continuous
/// queries and the per-database series-id sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    #[serde(default)]
    pub default_retention_policy: String,
    #[serde(default)]
    pub policies: HashMap<String, RetentionPolicy>,
    #[serde(default)]
    pub measurements: HashMap<String, Measurement>,
    #[serde(default)]
    pub continuous_queries: Vec<ContinuousQuery>,
    /// Next series id to assign; series ids are unique per database and
    /// monotonic.
    #[serde(default)]
    pub next_series_id: u32,
}

impl DatabaseInfo {
    pub fn new(name: &str) -> DatabaseInfo {
        DatabaseInfo {
            name: name.to_string(),
            next_series_id: 1,
            ..DatabaseInfo::default()
        }
    }

    /// Looks up a measurement and the series matching a tag set.
    pub fn measurement_and_series(
        &self,
        name: &str,
        tags: &common::point::Tags,
    ) -> (Option<&Measurement>, Option<&Series>) {
        match self.measurements.get(name) {
            Some(m) => (Some(m), m.series_by_tags(tags)),
            None => (None, None),
        }
    }

    pub fn shard_group_by_timestamp(
        &self,
        policy: &str,
        timestamp: UnixNano,
    ) -> Result<Option<&ShardGroup>> {
        let rp = self
            .policies
            .get(policy)
            .ok_or(Error::RetentionPolicyNotFound)?;
        Ok(rp.shard_group_by_timestamp(timestamp))
    }

    pub fn continuous_query_by_name(&self, name: &str) -> Option<&ContinuousQuery> {
        self.continuous_queries.iter().find(|cq| cq.name() == name)
    }

    /// Sorted measurement names.
    pub fn measurement_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.measurements.keys().cloned().collect();
        names.sort();
        names
    }

    /// Rebuilds every derived index after a load: measurement tag
    /// indexes and parsed continuous-query statements.
    pub fn rebuild_index(&mut self) {
        for m in self.measurements.values_mut() {
            m.rebuild_index();
        }
        let queries = std::mem::take(&mut self.continuous_queries);
        self.continuous_queries = queries
            .into_iter()
            .filter_map(|cq| match ContinuousQuery::new(&cq.query) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    log::warn!("dropping unparsable continuous query ({err}): {}", cq.query);
                    None
                }
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_group_window_containment() {
        let g = ShardGroup {
            id: 1,
            start_time: 0,
            end_time: 100,
            shards: Vec::new(),
        };
        assert!(g.contains(0));
        assert!(g.contains(99));
        assert!(!g.contains(100));
        assert!(!g.contains(-1));
    }

    #[test]
    fn routing_is_stable_per_series() {
        let g = ShardGroup {
            id: 1,
            start_time: 0,
            end_time: 100,
            shards: vec![
                Shard::new(10, vec![1]),
                Shard::new(11, vec![2]),
                Shard::new(12, vec![3]),
            ],
        };
        let a = g.shard_by_series_id(5).unwrap().id;
        assert_eq!(g.shard_by_series_id(5).unwrap().id, a);
        assert_eq!(g.shard_by_series_id(3).unwrap().id, 10);
        assert_eq!(g.shard_by_series_id(4).unwrap().id, 11);
    }

    #[test]
    fn policy_lookup_and_removal() {
        let mut rp = RetentionPolicy::new("rp");
        rp.duration = 100;
        rp.shard_groups.push(ShardGroup {
            id: 1,
            start_time: 0,
            end_time: 100,
            shards: Vec::new(),
        });
        rp.shard_groups.push(ShardGroup {
            id: 2,
            start_time: 100,
            end_time: 200,
            shards: Vec::new(),
        });

        assert_eq!(rp.shard_group_by_timestamp(150).unwrap().id, 2);
        assert!(rp.shard_group_by_timestamp(200).is_none());

        rp.remove_shard_group_by_id(1);
        assert!(rp.shard_group_by_id(1).is_none());
        assert!(rp.shard_group_by_id(2).is_some());
    }
}
