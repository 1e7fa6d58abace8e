//! JSON payloads for every broadcast command.
//!
//! Field names are part of the wire format shared by all nodes; durations
//! and timestamps travel as nanoseconds.

use std::collections::HashMap;

use common::point::{tag_set_key, Tags};
use common::time::UnixNano;
use common::FieldType;
use serde::{Deserialize, Serialize};

use crate::catalog::Privilege;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataNodeCommand {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDataNodeCommand {
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDatabaseCommand {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDatabaseCommand {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRetentionPolicyCommand {
    pub database: String,
    pub name: String,
    pub duration: i64,
    #[serde(rename = "replicaN")]
    pub replica_n: u32,
}

/// Fields of a retention policy that an update may change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicyUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(rename = "replicaN", skip_serializing_if = "Option::is_none")]
    pub replica_n: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRetentionPolicyCommand {
    pub database: String,
    pub name: String,
    pub policy: RetentionPolicyUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRetentionPolicyCommand {
    pub database: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDefaultRetentionPolicyCommand {
    pub database: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserCommand {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserCommand {
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteUserCommand {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPrivilegeCommand {
    pub privilege: Privilege,
    pub username: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShardGroupIfNotExistsCommand {
    pub database: String,
    pub policy: String,
    pub timestamp: UnixNano,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteShardGroupCommand {
    pub database: String,
    pub policy: String,
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContinuousQueryCommand {
    pub query: String,
}

/// One measurement inside a create-measurements-if-not-exists batch:
/// the tag sets of any new series (keyed by canonical tag-set key) and
/// any new fields with their inferred types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSubcommand {
    pub name: String,
    pub tags: HashMap<String, Tags>,
    pub fields: HashMap<String, FieldType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMeasurementsIfNotExistsCommand {
    pub database: String,
    pub measurements: HashMap<String, MeasurementSubcommand>,
}

impl CreateMeasurementsIfNotExistsCommand {
    pub fn new(database: &str) -> CreateMeasurementsIfNotExistsCommand {
        CreateMeasurementsIfNotExistsCommand {
            database: database.to_string(),
            measurements: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn add_measurement_if_not_exists(&mut self, name: &str) {
        self.measurements
            .entry(name.to_string())
            .or_insert_with(|| MeasurementSubcommand {
                name: name.to_string(),
                tags: HashMap::new(),
                fields: HashMap::new(),
            });
    }

    /// Adds the series, identified by measurement name and tag set, if it
    /// is not already carried by the batch.
    pub fn add_series_if_not_exists(&mut self, measurement: &str, tags: &Tags) -> Result<()> {
        let sub = self
            .measurements
            .get_mut(measurement)
            .ok_or(Error::MeasurementNotFound)?;
        sub.tags.entry(tag_set_key(tags)).or_insert_with(|| tags.clone());
        Ok(())
    }

    /// Adds the field if absent. A field already carried by the batch
    /// with a different type is a conflict.
    pub fn add_field_if_not_exists(
        &mut self,
        measurement: &str,
        name: &str,
        field_type: FieldType,
    ) -> Result<()> {
        let sub = self
            .measurements
            .get_mut(measurement)
            .ok_or(Error::MeasurementNotFound)?;
        if let Some(existing) = sub.fields.get(name) {
            if *existing != field_type {
                return Err(Error::FieldTypeConflict {
                    field: name.to_string(),
                    existing: *existing,
                    given: field_type,
                });
            }
            return Ok(());
        }
        sub.fields.insert(name.to_string(), field_type);
        Ok(())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_batch_dedupes_series_and_fields() {
        let mut c = CreateMeasurementsIfNotExistsCommand::new("db");
        c.add_measurement_if_not_exists("cpu");
        c.add_measurement_if_not_exists("cpu");
        assert_eq!(c.measurements.len(), 1);

        let mut tags = Tags::new();
        tags.insert("host".into(), "a".into());
        c.add_series_if_not_exists("cpu", &tags).unwrap();
        c.add_series_if_not_exists("cpu", &tags).unwrap();
        assert_eq!(c.measurements["cpu"].tags.len(), 1);

        c.add_field_if_not_exists("cpu", "value", FieldType::Integer)
            .unwrap();
        c.add_field_if_not_exists("cpu", "value", FieldType::Integer)
            .unwrap();
        let err = c
            .add_field_if_not_exists("cpu", "value", FieldType::Float)
            .unwrap_err();
        assert!(matches!(err, Error::FieldTypeConflict { .. }));
    }

    #[test]
    fn unknown_measurement_is_an_error() {
        let mut c = CreateMeasurementsIfNotExistsCommand::new("db");
        let err = c
            .add_field_if_not_exists("mem", "free", FieldType::Float)
            .unwrap_err();
        assert!(matches!(err, Error::MeasurementNotFound));
    }

    #[test]
    fn retention_policy_command_wire_names() {
        let c = CreateRetentionPolicyCommand {
            database: "db".into(),
            name: "rp".into(),
            duration: 3_600_000_000_000,
            replica_n: 2,
        };
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"replicaN\":2"));
        assert!(json.contains("\"duration\":3600000000000"));
    }
}
