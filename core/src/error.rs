use std::io;

use common::FieldType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the node coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    // Lifecycle.
    #[error("node already open")]
    NodeOpen,
    #[error("node closed")]
    NodeClosed,
    #[error("path required")]
    PathRequired,

    // Validation errors surfaced through sync().
    #[error("data node url required")]
    DataNodeUrlRequired,
    #[error("data node exists")]
    DataNodeExists,
    #[error("data node not found")]
    DataNodeNotFound,
    #[error("database exists")]
    DatabaseExists,
    #[error("database not found")]
    DatabaseNotFound,
    #[error("retention policy name required")]
    RetentionPolicyNameRequired,
    #[error("retention policy duration must be positive")]
    RetentionPolicyDurationInvalid,
    #[error("retention policy exists")]
    RetentionPolicyExists,
    #[error("retention policy not found")]
    RetentionPolicyNotFound,
    #[error("default retention policy not set")]
    DefaultRetentionPolicyNotFound,
    #[error("username required")]
    UsernameRequired,
    #[error("user exists")]
    UserExists,
    #[error("user not found")]
    UserNotFound,
    #[error("invalid grant or revoke")]
    InvalidGrantRevoke,
    #[error("measurement not found")]
    MeasurementNotFound,
    #[error("series not found")]
    SeriesNotFound,
    #[error("shard not found")]
    ShardNotFound,
    #[error("continuous query exists")]
    ContinuousQueryExists,
    #[error("not a continuous query")]
    NotContinuousQuery,
    #[error("field \"{field}\" is type {given}, already mapped as type {existing}")]
    FieldTypeConflict {
        field: String,
        existing: FieldType,
        given: FieldType,
    },
    #[error("field overflow")]
    FieldOverflow,

    // Authentication / authorization. Never published to the log.
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("{user} not authorized to execute '{statement}': {reason}")]
    Authorize {
        user: String,
        statement: String,
        reason: String,
    },
    #[error("statement not executed")]
    NotExecuted,

    // Transport and storage.
    #[error("broker: {0}")]
    Broker(String),
    #[error("invalid point record")]
    InvalidPointRecord,
    #[error("field not mapped: {0}")]
    FieldUnmapped(String),
    #[error("query parse error: {0}")]
    Parse(#[from] crate::query::ParseError),
    #[error("query: {0}")]
    Query(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("password hash: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}
