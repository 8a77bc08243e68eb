//! Authenticated broker session
//!
//! A session owns one connection to the cluster. Producers, partition
//! consumers and group coordinators borrow it through an `Arc` and never
//! open connections of their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use super::auth::ScramAlgorithm;
use super::cluster::{Cluster, Connector, RdKafkaConnector};
use super::error::{KafkaError, Result};
use super::messages::TopicMetadata;
use crate::config::BrokerConfig;

pub struct ClientSession {
    config: BrokerConfig,
    algorithm: ScramAlgorithm,
    cluster: Arc<dyn Cluster>,
    closed: AtomicBool,
}

impl ClientSession {
    /// Open a session against a real cluster
    pub async fn open(config: BrokerConfig) -> Result<Arc<Self>> {
        Self::open_with(config, &RdKafkaConnector).await
    }

    /// Open a session through an explicit backend
    ///
    /// Resolves the broker list, authenticates with the configured SCRAM
    /// algorithm and fetches topic metadata. Any failure is returned as a
    /// `Connection` error; nothing is retried.
    pub async fn open_with(config: BrokerConfig, connector: &dyn Connector) -> Result<Arc<Self>> {
        let brokers = config.resolve_brokers()?;
        let algorithm = config.scram_algorithm();

        info!(
            brokers = ?brokers,
            mechanism = algorithm.mechanism(),
            backend = connector.name(),
            "opening broker session"
        );

        let cluster = connector
            .connect(&config, algorithm)
            .await
            .map_err(|e| {
                error!(error = %e, "broker handshake failed");
                e.into_connection()
            })?;

        let topics = match cluster.metadata().await {
            Ok(topics) => topics,
            Err(e) => {
                error!(error = %e, "metadata fetch failed");
                // best effort; the session is unusable either way
                let _ = cluster.close().await;
                return Err(e.into_connection());
            }
        };
        for topic in &topics {
            debug!(topic = %topic.name, partitions = topic.partition_count(), "topic metadata");
        }
        info!(topics = topics.len(), "broker session open");

        Ok(Arc::new(Self {
            config,
            algorithm,
            cluster,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn algorithm(&self) -> ScramAlgorithm {
        self.algorithm
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn cluster(&self) -> Result<&Arc<dyn Cluster>> {
        if self.is_closed() {
            return Err(KafkaError::Closed("session"));
        }
        Ok(&self.cluster)
    }

    /// Current topic metadata, sorted by name
    pub async fn topics(&self) -> Result<Vec<TopicMetadata>> {
        self.cluster()?.metadata().await
    }

    /// Partition ids of one topic
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.topics()
            .await?
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions)
            .ok_or_else(|| KafkaError::TopicNotFound(topic.to_string()))
    }

    /// Release the connection; later calls are no-ops
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("session already closed");
            return Ok(());
        }
        self.cluster.close().await?;
        info!("broker session closed");
        Ok(())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("config", &self.config)
            .field("algorithm", &self.algorithm)
            .field("closed", &self.is_closed())
            .finish()
    }
}
