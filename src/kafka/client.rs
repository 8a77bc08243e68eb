//! Client facade
//!
//! Owns one session and its producer, and optionally one partition consumer
//! and one consumer group. `close()` shuts them down in a fixed order:
//! partition consumer, producer, consumer group, session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::cluster::{Connector, RdKafkaConnector};
use super::error::{KafkaError, Result};
use super::group::ConsumerGroupCoordinator;
use super::messages::StartOffset;
use super::partition_consumer::PartitionConsumer;
use super::producer::Producer;
use super::session::ClientSession;
use super::shutdown::{Closeable, ShutdownController};
use crate::config::AppConfig;

/// Closes the session as the last step of the facade's shutdown plan
struct SessionCloser(Arc<ClientSession>);

#[async_trait::async_trait]
impl Closeable for SessionCloser {
    fn name(&self) -> &str {
        "session"
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await
    }
}

pub struct Client {
    config: AppConfig,
    session: Arc<ClientSession>,
    producer: Arc<Producer>,
    partition_consumer: Mutex<Option<Arc<PartitionConsumer>>>,
    group: Mutex<Option<Arc<ConsumerGroupCoordinator>>>,
    closing: AtomicBool,
    shutdown: ShutdownController,
}

impl Client {
    /// Connect to a real cluster
    pub async fn connect(config: AppConfig) -> Result<Self> {
        Self::connect_with(config, &RdKafkaConnector).await
    }

    /// Open the session through `connector` and start the producer
    pub async fn connect_with(config: AppConfig, connector: &dyn Connector) -> Result<Self> {
        let session = ClientSession::open_with(config.kafka.clone(), connector).await?;
        let producer = match Producer::new(&session, config.producer.clone()) {
            Ok(producer) => producer,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!(error = %close_err, "failed to close session");
                }
                return Err(e);
            }
        };

        Ok(Self {
            config,
            session,
            producer,
            partition_consumer: Mutex::new(None),
            group: Mutex::new(None),
            closing: AtomicBool::new(false),
            shutdown: ShutdownController::new(),
        })
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    /// Open the client's partition consumer
    pub async fn partition_consumer(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Arc<PartitionConsumer>> {
        if self.partition_consumer.lock().is_some() {
            return Err(KafkaError::Join("partition consumer already open".into()));
        }
        let consumer = Arc::new(PartitionConsumer::open(&self.session, topic, partition, start).await?);
        let mut slot = self.partition_consumer.lock();
        if slot.is_some() {
            return Err(KafkaError::Join("partition consumer already open".into()));
        }
        *slot = Some(consumer.clone());
        Ok(consumer)
    }

    /// Start the client's consumer group with the configured group settings
    pub async fn consumer_group<S: AsRef<str>>(
        &self,
        group_id: &str,
        topics: &[S],
    ) -> Result<Arc<ConsumerGroupCoordinator>> {
        if self.group.lock().is_some() {
            return Err(KafkaError::Join("consumer group already started".into()));
        }
        let coordinator = Arc::new(ConsumerGroupCoordinator::new(
            self.session.clone(),
            group_id,
            self.config.group.clone(),
        )?);
        *self.group.lock() = Some(coordinator.clone());
        if let Err(e) = coordinator.start(topics).await {
            self.group.lock().take();
            return Err(e);
        }
        Ok(coordinator)
    }

    /// Shut everything down in order and wait for all background work
    ///
    /// A component that fails to close is logged and skipped. Safe to call
    /// more than once.
    pub async fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            if let Some(consumer) = self.partition_consumer.lock().take() {
                self.shutdown.register(consumer);
            }
            self.shutdown.register(self.producer.clone());
            if let Some(group) = self.group.lock().take() {
                self.shutdown.register(group);
            }
            self.shutdown
                .register(Arc::new(SessionCloser(self.session.clone())));
        }
        self.shutdown.shutdown().await;
        info!("client closed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}
