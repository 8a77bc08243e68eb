//! Embedded in-process broker
//!
//! `MemoryBroker` behaves like a small cluster: topics with partition logs,
//! SCRAM users, consumer groups with generations and a join barrier, and
//! committed offsets. Every connection made through it runs a full SCRAM
//! exchange against the stored verifiers, so the authentication path is the
//! same one a real broker exercises.
//!
//! Test hooks (`fail_next_produces`, `broadcast_group_error`, commit
//! counters) let callers observe and perturb the broker from outside.

mod assignment;
mod group;
mod log;
mod membership;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use group::GroupState;

use self::group::GroupCoordinator;
use self::log::{MemoryPartitionReader, PartitionLog};
use self::membership::MemoryMembership;
use super::{Cluster, Connector, GroupMembership, PartitionReader};
use crate::config::{BrokerConfig, GroupSettings};
use crate::kafka::auth::{ScramAlgorithm, ScramCredential, ScramServer};
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{OutboundRecord, RecordPosition, StartOffset, TopicMetadata};

/// Shared state of one embedded broker
#[derive(Default)]
pub(crate) struct BrokerState {
    topics: RwLock<HashMap<String, Vec<Arc<PartitionLog>>>>,
    users: RwLock<HashMap<(String, ScramAlgorithm), ScramCredential>>,
    groups: GroupCoordinator,
    produce_failures: AtomicUsize,
    connections: AtomicUsize,
}

impl BrokerState {
    fn log(&self, topic: &str, partition: i32) -> Result<Arc<PartitionLog>> {
        let topics = self.topics.read();
        let partitions = topics
            .get(topic)
            .ok_or_else(|| KafkaError::TopicNotFound(topic.to_string()))?;
        usize::try_from(partition)
            .ok()
            .and_then(|p| partitions.get(p))
            .cloned()
            .ok_or_else(|| KafkaError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })
    }

    fn partition_counts(&self) -> HashMap<String, i32> {
        self.topics
            .read()
            .iter()
            .map(|(name, parts)| (name.clone(), parts.len() as i32))
            .collect()
    }

    fn credential(&self, username: &str, algorithm: ScramAlgorithm) -> Option<ScramCredential> {
        self.users
            .read()
            .get(&(username.to_string(), algorithm))
            .cloned()
    }

    /// Run the SCRAM exchange for a new connection
    fn authenticate(&self, config: &BrokerConfig, algorithm: ScramAlgorithm) -> Result<()> {
        let mut client = algorithm.client();
        let mut server = ScramServer::new(algorithm);

        client.begin(&config.username, &config.password, "")?;
        let client_first = client.step("")?;
        let server_first = server.step(&client_first, |user| self.credential(user, algorithm))?;
        let client_final = client.step(&server_first)?;
        let server_final = server.step(&client_final, |_| None)?;
        client.step(&server_final)?;

        if !client.done() || !server.is_complete() {
            return Err(KafkaError::Auth("SCRAM exchange did not complete".into()));
        }
        Ok(())
    }
}

/// In-process broker; cloning shares the same cluster
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic; fails if it exists or `partitions` is not positive
    pub fn create_topic(&self, name: &str, partitions: i32) -> Result<()> {
        if partitions <= 0 {
            return Err(KafkaError::Config(format!(
                "topic {} needs at least one partition",
                name
            )));
        }
        let mut topics = self.state.topics.write();
        if topics.contains_key(name) {
            return Err(KafkaError::Config(format!("topic {} already exists", name)));
        }
        topics.insert(
            name.to_string(),
            (0..partitions).map(|_| Arc::default()).collect(),
        );
        info!(topic = name, partitions, "created topic");
        Ok(())
    }

    /// Register SCRAM-SHA-256 and SCRAM-SHA-512 credentials for a user
    pub fn add_user(&self, username: &str, password: &str) -> Result<()> {
        let mut users = self.state.users.write();
        for algorithm in [ScramAlgorithm::Sha256, ScramAlgorithm::Sha512] {
            users.insert(
                (username.to_string(), algorithm),
                ScramCredential::derive(algorithm, password)?,
            );
        }
        Ok(())
    }

    /// Make the next `count` produce calls fail with a delivery error
    pub fn fail_next_produces(&self, count: usize) {
        self.state.produce_failures.store(count, Ordering::SeqCst);
    }

    /// Append a record directly, bypassing any session
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<i64> {
        let log = self.state.log(topic, partition)?;
        Ok(log.append(
            key.map(Bytes::copy_from_slice),
            value.map(Bytes::copy_from_slice),
        ))
    }

    pub fn high_watermark(&self, topic: &str, partition: i32) -> Result<i64> {
        Ok(self.state.log(topic, partition)?.high_watermark())
    }

    /// Next offset the group will read from a partition
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state.groups.committed(group_id, topic, partition)
    }

    /// Number of marks that advanced a committed offset in the group
    pub fn commit_count(&self, group_id: &str) -> u64 {
        self.state.groups.commit_count(group_id)
    }

    pub fn generation(&self, group_id: &str) -> Option<i32> {
        self.state.groups.generation(group_id)
    }

    pub fn group_state(&self, group_id: &str) -> Option<GroupState> {
        self.state.groups.state(group_id)
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        self.state.groups.members(group_id)
    }

    /// Push a protocol error to every member of a group; returns how many
    /// members received it
    pub fn broadcast_group_error(&self, group_id: &str, message: &str) -> usize {
        self.state.groups.broadcast_error(group_id, message)
    }

    /// Sessions currently open against this broker
    pub fn open_connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.state.partition_counts())
            .field("connections", &self.open_connections())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(
        &self,
        config: &BrokerConfig,
        algorithm: ScramAlgorithm,
    ) -> Result<Arc<dyn Cluster>> {
        config.resolve_brokers()?;
        self.state.authenticate(config, algorithm)?;
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        debug!(
            client_id = %config.client_id,
            mechanism = algorithm.mechanism(),
            "memory broker accepted connection"
        );
        Ok(Arc::new(MemoryCluster {
            state: self.state.clone(),
            client_id: config.client_id.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

/// One authenticated connection to a `MemoryBroker`
pub(crate) struct MemoryCluster {
    state: Arc<BrokerState>,
    client_id: String,
    closed: CancellationToken,
}

impl MemoryCluster {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(KafkaError::Closed("session"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn metadata(&self) -> Result<Vec<TopicMetadata>> {
        self.ensure_open()?;
        let mut topics: Vec<TopicMetadata> = self
            .state
            .topics
            .read()
            .iter()
            .map(|(name, parts)| TopicMetadata {
                name: name.clone(),
                partitions: (0..parts.len() as i32).collect(),
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    async fn produce(&self, record: OutboundRecord, partition: i32) -> Result<RecordPosition> {
        self.ensure_open()?;

        let injected = self
            .state
            .produce_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(KafkaError::Delivery {
                topic: record.topic,
                partition,
                reason: "injected broker failure".into(),
            });
        }

        let log = self.state.log(&record.topic, partition)?;
        let offset = log.append(record.key, record.value);
        Ok(RecordPosition { partition, offset })
    }

    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>> {
        self.ensure_open()?;
        let log = self.state.log(topic, partition)?;
        let (low, high) = (log.low_watermark(), log.high_watermark());
        let position = match start {
            StartOffset::Earliest => low,
            StartOffset::Latest => high,
            StartOffset::At(offset) if (low..=high).contains(&offset) => offset,
            StartOffset::At(offset) => {
                return Err(KafkaError::OffsetOutOfRange {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    low,
                    high,
                })
            }
        };
        Ok(Box::new(MemoryPartitionReader::new(
            topic,
            partition,
            log,
            position,
            self.closed.child_token(),
        )))
    }

    async fn join_group(
        &self,
        group_id: &str,
        topics: &[String],
        settings: &GroupSettings,
    ) -> Result<Arc<dyn GroupMembership>> {
        self.ensure_open()?;
        settings.validate()?;
        if group_id.is_empty() {
            return Err(KafkaError::Join("group id is empty".into()));
        }
        if topics.is_empty() {
            return Err(KafkaError::Join("no topics to subscribe".into()));
        }
        {
            let known = self.state.topics.read();
            if let Some(missing) = topics.iter().find(|t| !known.contains_key(*t)) {
                return Err(KafkaError::TopicNotFound(missing.clone()));
            }
        }

        Ok(Arc::new(MemoryMembership::new(
            self.state.clone(),
            group_id,
            &self.client_id,
            topics,
            settings,
            self.closed.child_token(),
        )))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.state.connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
