mod apply;
pub mod broker;
pub mod catalog;
pub mod codec;
pub mod command;
mod cq;
pub mod error;
pub mod meta;
pub mod node;
pub mod query;
mod retention;
pub mod shard;

pub use broker::{
    LocalBroker, LocalBrokerClient, Message, MessageType, MessagingClient, BROADCAST_TOPIC_ID,
};
pub use command::RetentionPolicyUpdate;
pub use catalog::{
    ContinuousQuery, DataNode, DatabaseInfo, Field, Measurement, Privilege, RetentionPolicy,
    Series, ShardGroup, User, DEFAULT_RETENTION_POLICY_NAME,
};
pub use error::{Error, Result};
pub use node::{CqConfig, Node, QueryResults, StatementResult};
pub use query::{parse_query, parse_statement, Row, Statement};
pub use shard::{Shard, ShardStore};
