//! Broker backends
//!
//! The session, producer, partition consumer and group coordinator only talk
//! to the broker through the traits in this module. Two backends exist:
//!
//! - [`librdkafka`]: a real cluster through the `rdkafka` crate
//! - [`memory`]: an in-process broker used by tests and local development
//!
//! # Group protocol
//!
//! A [`GroupMembership`] is created once per coordinator. Each call to
//! [`GroupMembership::join`] blocks until the group has settled and returns
//! a [`Generation`]: the claims this member owns plus a `revoked` token the
//! backend cancels as soon as the group starts its next rebalance. The
//! caller stops every claim handler, commits, drops the generation's
//! [`GenerationRelease`] and only then calls `join` again. A backend must not
//! hand the revoked partitions back to the broker before that release.

pub mod librdkafka;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::auth::ScramAlgorithm;
use super::error::{KafkaError, Result};
use super::messages::{OutboundRecord, Record, RecordPosition, StartOffset, TopicMetadata};
use crate::config::{BrokerConfig, GroupSettings};

pub use librdkafka::RdKafkaConnector;
pub use memory::MemoryBroker;

/// Opens authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Connect to the cluster and complete the SCRAM handshake
    async fn connect(
        &self,
        config: &BrokerConfig,
        algorithm: ScramAlgorithm,
    ) -> Result<Arc<dyn Cluster>>;
}

/// An open, authenticated connection to a cluster
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Current topic metadata
    async fn metadata(&self) -> Result<Vec<TopicMetadata>>;

    /// Publish one record to an explicit partition
    async fn produce(&self, record: OutboundRecord, partition: i32) -> Result<RecordPosition>;

    /// Open a read cursor on one partition
    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>>;

    /// Create a (not yet joined) membership in a consumer group
    async fn join_group(
        &self,
        group_id: &str,
        topics: &[String],
        settings: &GroupSettings,
    ) -> Result<Arc<dyn GroupMembership>>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

/// Sequential reader over one partition
#[async_trait]
pub trait PartitionReader: Send {
    /// Next record; `None` once the reader is closed
    async fn next(&mut self) -> Option<Result<Record>>;

    /// Offset of the next record to read
    fn position(&self) -> i64;

    async fn close(&mut self) -> Result<()>;
}

/// One member's handle on a consumer group
#[async_trait]
pub trait GroupMembership: Send + Sync {
    fn group_id(&self) -> &str;

    /// Member id assigned by the broker, once joined
    fn member_id(&self) -> Option<String>;

    /// Join (or rejoin) the group and wait for the next generation
    async fn join(&self) -> Result<Generation>;

    /// Mark a record consumed; monotonic per partition
    fn mark(&self, topic: &str, partition: i32, offset: i64);

    /// Flush marked offsets to the broker
    async fn commit(&self) -> Result<()>;

    /// Stream of mid-stream protocol errors; `None` after the first call
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<KafkaError>>;

    /// Leave the group; closes the error stream
    async fn close(&self) -> Result<()>;
}

/// One assignment epoch of a membership
#[derive(Debug)]
pub struct Generation {
    pub generation_id: i32,
    pub member_id: String,
    pub claims: Vec<Claim>,
    /// Cancelled when the group starts its next rebalance
    pub revoked: CancellationToken,
    /// Released once every claim handler has stopped and offsets are committed
    pub released: GenerationRelease,
}

impl Generation {
    pub fn partitions(&self) -> Vec<(String, i32)> {
        self.claims
            .iter()
            .map(|c| (c.topic.clone(), c.partition))
            .collect()
    }
}

/// Tells the backend a generation's handlers are gone
///
/// Cancels its token on [`release`](Self::release) or when dropped, so an
/// aborted consumer still lets the rebalance proceed.
#[derive(Debug, Default)]
pub struct GenerationRelease(CancellationToken);

impl GenerationRelease {
    /// A release handle and the token it cancels
    pub fn new() -> (Self, CancellationToken) {
        let token = CancellationToken::new();
        (Self(token.clone()), token)
    }

    pub fn release(self) {
        self.0.cancel();
    }
}

impl Drop for GenerationRelease {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Ownership of one partition within a generation
#[derive(Debug)]
pub struct Claim {
    pub topic: String,
    pub partition: i32,
    /// First offset this claim reads
    pub initial_offset: i64,
    pub records: mpsc::Receiver<Record>,
}
