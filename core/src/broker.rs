//! Broker client contract and the in-process implementation.
//!
//! The broker is an ordered, durable log: every published message is
//! assigned a monotonically increasing index, and every replica receives
//! the messages for its subscribed topics over a single channel in index
//! order. Broadcast commands use topic 0; raw series writes use the
//! shard id as the topic.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};

use crate::error::{Error, Result};

/// Topic id reserved for cluster-wide metadata commands.
pub const BROADCAST_TOPIC_ID: u64 = 0;

/// Wire identifiers for every command the apply engine recognizes.
/// The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CreateDataNode = 0x00,
    DeleteDataNode = 0x01,

    CreateDatabase = 0x10,
    DeleteDatabase = 0x11,

    CreateRetentionPolicy = 0x20,
    UpdateRetentionPolicy = 0x21,
    DeleteRetentionPolicy = 0x22,
    SetDefaultRetentionPolicy = 0x23,

    CreateUser = 0x30,
    UpdateUser = 0x31,
    DeleteUser = 0x32,

    CreateShardGroupIfNotExists = 0x40,
    DeleteShardGroup = 0x41,

    CreateMeasurementsIfNotExists = 0x50,

    CreateContinuousQuery = 0x60,

    WriteRawSeries = 0x70,

    SetPrivilege = 0x80,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match b {
            0x00 => CreateDataNode,
            0x01 => DeleteDataNode,
            0x10 => CreateDatabase,
            0x11 => DeleteDatabase,
            0x20 => CreateRetentionPolicy,
            0x21 => UpdateRetentionPolicy,
            0x22 => DeleteRetentionPolicy,
            0x23 => SetDefaultRetentionPolicy,
            0x30 => CreateUser,
            0x31 => UpdateUser,
            0x32 => DeleteUser,
            0x40 => CreateShardGroupIfNotExists,
            0x41 => DeleteShardGroup,
            0x50 => CreateMeasurementsIfNotExists,
            0x60 => CreateContinuousQuery,
            0x70 => WriteRawSeries,
            0x80 => SetPrivilege,
            _ => return None,
        })
    }
}

/// A message delivered from the broker to a replica.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub topic_id: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

/// Client used to publish to and consume from the broker.
///
/// `messages` hands out the single ordered delivery channel for this
/// replica; the coordinator's processor thread owns the receiving end.
pub trait MessagingClient: Send + Sync {
    fn publish(&self, message_type: MessageType, topic_id: u64, data: Vec<u8>) -> Result<u64>;
    fn create_replica(&self, replica_id: u64, connect_url: &str) -> Result<()>;
    fn delete_replica(&self, replica_id: u64) -> Result<()>;
    fn subscribe(&self, replica_id: u64, topic_id: u64) -> Result<()>;
    fn unsubscribe(&self, replica_id: u64, topic_id: u64) -> Result<()>;
    fn messages(&self) -> Result<Receiver<Message>>;
}

#[derive(Default)]
struct Replica {
    topics: HashSet<u64>,
    senders: Vec<Sender<Message>>,
}

#[derive(Default)]
struct BrokerState {
    next_index: u64,
    replicas: HashMap<u64, Replica>,
}

/// In-process broker satisfying the ordered-log contract for a single
/// process: tests and standalone single-node deployments. Messages are
/// delivered from the point of subscription onward.
#[derive(Default)]
pub struct LocalBroker {
    state: Mutex<BrokerState>,
}

impl LocalBroker {
    pub fn new() -> Arc<LocalBroker> {
        Arc::new(LocalBroker::default())
    }

    /// Returns a client handle bound to a replica id.
    pub fn client(self: &Arc<Self>, replica_id: u64) -> LocalBrokerClient {
        LocalBrokerClient {
            broker: Arc::clone(self),
            replica_id,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>> {
        self.state.lock().map_err(|_| Error::LockPoisoned("broker"))
    }
}

/// Handle for one replica on a `LocalBroker`.
pub struct LocalBrokerClient {
    broker: Arc<LocalBroker>,
    replica_id: u64,
}

impl MessagingClient for LocalBrokerClient {
    fn publish(&self, message_type: MessageType, topic_id: u64, data: Vec<u8>) -> Result<u64> {
        let mut state = self.broker.lock()?;
        state.next_index += 1;
        let index = state.next_index;
        let message = Message {
            message_type,
            topic_id,
            index,
            data,
        };

        // Fan out to every replica subscribed to the topic. Receivers
        // whose channel is gone are pruned as they are found.
        for replica in state.replicas.values_mut() {
            if !replica.topics.contains(&topic_id) {
                continue;
            }
            replica
                .senders
                .retain(|sender| sender.send(message.clone()).is_ok());
        }

        Ok(index)
    }

    fn create_replica(&self, replica_id: u64, _connect_url: &str) -> Result<()> {
        let mut state = self.broker.lock()?;
        let replica = state.replicas.entry(replica_id).or_default();
        // Every replica receives broadcast commands.
        replica.topics.insert(BROADCAST_TOPIC_ID);
        Ok(())
    }

    fn delete_replica(&self, replica_id: u64) -> Result<()> {
        let mut state = self.broker.lock()?;
        state.replicas.remove(&replica_id);
        Ok(())
    }

    fn subscribe(&self, replica_id: u64, topic_id: u64) -> Result<()> {
        let mut state = self.broker.lock()?;
        let replica = state
            .replicas
            .get_mut(&replica_id)
            .ok_or_else(|| Error::Broker(format!("unknown replica {replica_id}")))?;
        replica.topics.insert(topic_id);
        Ok(())
    }

    fn unsubscribe(&self, replica_id: u64, topic_id: u64) -> Result<()> {
        let mut state = self.broker.lock()?;
        if let Some(replica) = state.replicas.get_mut(&replica_id) {
            replica.topics.remove(&topic_id);
        }
        Ok(())
    }

    fn messages(&self) -> Result<Receiver<Message>> {
        let mut state = self.broker.lock()?;
        let replica = state
            .replicas
            .get_mut(&self.replica_id)
            .ok_or_else(|| Error::Broker(format!("unknown replica {}", self.replica_id)))?;
        let (tx, rx) = mpsc::channel();
        replica.senders.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_assigns_increasing_indexes() {
        let broker = LocalBroker::new();
        let client = broker.client(1);
        client.create_replica(1, "http://localhost:8086").unwrap();

        let a = client
            .publish(MessageType::CreateDatabase, BROADCAST_TOPIC_ID, vec![])
            .unwrap();
        let b = client
            .publish(MessageType::CreateDatabase, BROADCAST_TOPIC_ID, vec![])
            .unwrap();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn delivers_subscribed_topics_in_order() {
        let broker = LocalBroker::new();
        let client = broker.client(1);
        client.create_replica(1, "http://localhost:8086").unwrap();
        client.subscribe(1, 7).unwrap();
        let rx = client.messages().unwrap();

        client
            .publish(MessageType::CreateDatabase, BROADCAST_TOPIC_ID, vec![1])
            .unwrap();
        client
            .publish(MessageType::WriteRawSeries, 7, vec![2])
            .unwrap();
        client
            .publish(MessageType::WriteRawSeries, 9, vec![3])
            .unwrap();

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!(first.data, vec![1]);
        assert_eq!(second.data, vec![2]);
        assert!(second.index > first.index);
        // Topic 9 is not subscribed; nothing further is queued.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn every_replica_sees_broadcasts() {
        let broker = LocalBroker::new();
        let one = broker.client(1);
        let two = broker.client(2);
        one.create_replica(1, "http://a").unwrap();
        two.create_replica(2, "http://b").unwrap();
        let rx1 = one.messages().unwrap();
        let rx2 = two.messages().unwrap();

        one.publish(MessageType::CreateDatabase, BROADCAST_TOPIC_ID, vec![9])
            .unwrap();

        assert_eq!(rx1.recv().unwrap().data, vec![9]);
        assert_eq!(rx2.recv().unwrap().data, vec![9]);
    }

    #[test]
    fn message_type_round_trips() {
        for b in 0u8..=0xff {
            if let Some(t) = MessageType::from_u8(b) {
                assert_eq!(t as u8, b);
            }
        }
        assert_eq!(
            MessageType::from_u8(0x70),
            Some(MessageType::WriteRawSeries)
        );
        assert_eq!(MessageType::from_u8(0x02), None);
    }
}
