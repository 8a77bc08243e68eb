//! Asynchronous producer
//!
//! `send` only enqueues; a pipeline task picks the partition, publishes and
//! handles the acknowledgment. Up to `queue_capacity` records are in flight
//! to the broker at once.
//!
//! Delivery failures are always logged and counted. With `ack_tracking`
//! enabled they are also pushed onto a stream the caller can take with
//! [`Producer::take_delivery_errors`]; `send_tracked` gives a per-record
//! confirmation regardless of that setting.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cluster::Cluster;
use super::error::{KafkaError, Result};
use super::messages::{OutboundRecord, RecordPosition};
use super::partitioner::Partitioner;
use super::session::ClientSession;
use super::shutdown::Closeable;
use crate::config::ProducerSettings;

type Reply = oneshot::Sender<Result<RecordPosition>>;

struct Envelope {
    record: OutboundRecord,
    reply: Option<Reply>,
}

/// Resolves once the broker acknowledges (or rejects) one tracked record
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<RecordPosition>>,
}

impl Future for DeliveryFuture {
    type Output = Result<RecordPosition>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(KafkaError::Closed("producer"))))
    }
}

#[derive(Debug, Default)]
struct Stats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

pub struct Producer {
    settings: ProducerSettings,
    intake: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pipeline: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
    delivery_errors: Mutex<Option<mpsc::UnboundedReceiver<KafkaError>>>,
}

impl Producer {
    /// Create a producer on an open session and start its pipeline
    pub fn new(session: &ClientSession, settings: ProducerSettings) -> Result<Arc<Self>> {
        settings.validate()?;
        Self::start(session.cluster()?.clone(), settings)
    }

    fn start(cluster: Arc<dyn Cluster>, settings: ProducerSettings) -> Result<Arc<Self>> {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Stats::default());

        let pipeline = Pipeline {
            cluster,
            partitioner: Partitioner::new(settings.partitioner),
            partition_counts: Mutex::new(HashMap::new()),
            refresh: tokio::sync::Mutex::new(()),
            delivery_timeout: settings.delivery_timeout(),
            stats: stats.clone(),
            errors: settings.ack_tracking.then_some(errors_tx),
        };
        let handle = tokio::spawn(pipeline.run(intake_rx, settings.queue_capacity));

        info!(
            partitioner = ?settings.partitioner,
            ack_tracking = settings.ack_tracking,
            "producer started"
        );

        Ok(Arc::new(Self {
            settings,
            intake: Mutex::new(Some(intake_tx)),
            pipeline: tokio::sync::Mutex::new(Some(handle)),
            stats,
            delivery_errors: Mutex::new(Some(errors_rx)),
        }))
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        let intake = self.intake.lock();
        let tx = intake.as_ref().ok_or(KafkaError::Closed("producer"))?;
        tx.send(envelope).map_err(|_| KafkaError::Closed("producer"))
    }

    /// Queue a record for delivery and return immediately
    pub fn send(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> Result<()> {
        self.enqueue(Envelope {
            record: outbound(topic, key, value),
            reply: None,
        })
    }

    /// Encode `value` as JSON and queue it
    ///
    /// An encoding failure aborts this send only.
    pub fn send_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|e| {
            warn!(topic, error = %e, "failed to encode record");
            KafkaError::from(e)
        })?;
        self.send(topic, key, &payload)
    }

    /// Queue a record and get a future for its acknowledgment
    pub fn send_tracked(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<DeliveryFuture> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Envelope {
            record: outbound(topic, key, value),
            reply: Some(tx),
        })?;
        Ok(DeliveryFuture { rx })
    }

    /// Records the broker acknowledged
    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::SeqCst)
    }

    /// Records the broker rejected or failed to acknowledge
    pub fn delivery_failures(&self) -> u64 {
        self.stats.failed.load(Ordering::SeqCst)
    }

    /// Stream of delivery failures; populated only with `ack_tracking`
    ///
    /// Returns `None` after the first call.
    pub fn take_delivery_errors(&self) -> Option<mpsc::UnboundedReceiver<KafkaError>> {
        self.delivery_errors.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.intake.lock().is_none()
    }

    /// Stop accepting records, deliver everything queued and wait for the
    /// pipeline to finish
    pub async fn close(&self) -> Result<()> {
        self.intake.lock().take();
        let Some(handle) = self.pipeline.lock().await.take() else {
            debug!("producer already closed");
            return Ok(());
        };
        handle
            .await
            .map_err(|e| KafkaError::Protocol(format!("producer pipeline failed: {}", e)))?;
        info!(
            delivered = self.delivered(),
            failed = self.delivery_failures(),
            "producer closed"
        );
        Ok(())
    }
}

#[async_trait]
impl Closeable for Producer {
    fn name(&self) -> &str {
        "producer"
    }

    async fn close(&self) -> Result<()> {
        Producer::close(self).await
    }
}

fn outbound(topic: &str, key: Option<&[u8]>, value: &[u8]) -> OutboundRecord {
    OutboundRecord::new(
        topic,
        key.map(Bytes::copy_from_slice),
        Some(Bytes::copy_from_slice(value)),
    )
}

struct Pipeline {
    cluster: Arc<dyn Cluster>,
    partitioner: Partitioner,
    partition_counts: Mutex<HashMap<String, i32>>,
    /// Serializes metadata refreshes so a burst of misses costs one round trip
    refresh: tokio::sync::Mutex<()>,
    delivery_timeout: Duration,
    stats: Arc<Stats>,
    errors: Option<mpsc::UnboundedSender<KafkaError>>,
}

impl Pipeline {
    async fn run(self, mut intake: mpsc::UnboundedReceiver<Envelope>, capacity: usize) {
        let mut in_flight = FuturesUnordered::new();
        let mut open = true;

        while open || !in_flight.is_empty() {
            tokio::select! {
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                envelope = intake.recv(), if open && in_flight.len() < capacity => match envelope {
                    Some(envelope) => in_flight.push(self.deliver(envelope)),
                    None => open = false,
                },
                else => break,
            }
        }
        debug!("producer pipeline drained");
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        if let Some(count) = self.cached_count(topic) {
            return Ok(count);
        }
        let _refresh = self.refresh.lock().await;
        if let Some(count) = self.cached_count(topic) {
            return Ok(count);
        }
        let topics = self.cluster.metadata().await?;
        let mut counts = self.partition_counts.lock();
        for t in &topics {
            counts.insert(t.name.clone(), t.partition_count());
        }
        counts
            .get(topic)
            .copied()
            .ok_or_else(|| KafkaError::TopicNotFound(topic.to_string()))
    }

    fn cached_count(&self, topic: &str) -> Option<i32> {
        self.partition_counts.lock().get(topic).copied()
    }

    async fn publish(&self, record: OutboundRecord) -> (i32, Result<RecordPosition>) {
        let count = match self.partition_count(&record.topic).await {
            Ok(count) => count,
            Err(e) => return (-1, Err(e)),
        };
        let partition = match self.partitioner.partition(record.key.as_deref(), count) {
            Ok(p) => p,
            Err(e) => return (-1, Err(e)),
        };
        let topic = record.topic.clone();
        let result =
            match tokio::time::timeout(self.delivery_timeout, self.cluster.produce(record, partition))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(KafkaError::Delivery {
                    topic,
                    partition,
                    reason: format!(
                        "no acknowledgment within {}ms",
                        self.delivery_timeout.as_millis()
                    ),
                }),
            };
        (partition, result)
    }

    async fn deliver(&self, envelope: Envelope) {
        let topic = envelope.record.topic.clone();
        let (partition, result) = self.publish(envelope.record).await;

        match &result {
            Ok(position) => {
                self.stats.delivered.fetch_add(1, Ordering::SeqCst);
                debug!(
                    topic = %topic,
                    partition = position.partition,
                    offset = position.offset,
                    "record delivered"
                );
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                error!(topic = %topic, partition, error = %e, "record delivery failed");
                if let Some(errors) = &self.errors {
                    let _ = errors.send(KafkaError::Delivery {
                        topic: topic.clone(),
                        partition,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(reply) = envelope.reply {
            let _ = reply.send(result);
        }
    }
}
