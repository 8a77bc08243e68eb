//! librdkafka backend
//!
//! Talks to a real cluster through the `rdkafka` crate. librdkafka performs
//! the SCRAM exchange itself; this module only selects the mechanism and
//! hands it the credentials.
//!
//! ## Group membership
//!
//! librdkafka runs the group protocol on its own threads and reports
//! assignment changes through the [`ConsumerContext`] rebalance callbacks,
//! which fire from inside `recv()`. A dedicated poll task therefore drives
//! the consumer and fans records out to per-claim channels:
//!
//! - revoke: the live generation's `revoked` token is cancelled, every
//!   claim sender is dropped, and the callback blocks until the coordinator
//!   releases the generation (bounded by the rebalance timeout), so no
//!   handler of this member still forwards from a partition librdkafka has
//!   handed back
//! - assign: fresh claim channels are created and a new [`Generation`] is
//!   queued for the next `join()`
//!
//! Offsets are stored per record (`enable.auto.offset.store = false`) and
//! flushed by auto-commit and by `commit()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError as RdKafkaError;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::Message;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Claim, Cluster, Connector, Generation, GenerationRelease, GroupMembership, PartitionReader,
};
use crate::config::{BrokerConfig, GroupSettings};
use crate::kafka::auth::ScramAlgorithm;
use crate::kafka::constants::DEFAULT_DELIVERY_TIMEOUT_MS;
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::{OutboundRecord, Record, RecordPosition, StartOffset, TopicMetadata};

/// Connects to a real cluster through librdkafka
#[derive(Debug, Clone, Copy, Default)]
pub struct RdKafkaConnector;

impl RdKafkaConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Base client configuration shared by the producer and every consumer
fn client_config(config: &BrokerConfig, algorithm: ScramAlgorithm) -> Result<ClientConfig> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers()?)
        .set("client.id", &config.client_id)
        .set("security.protocol", &config.security_protocol);

    if config.security_protocol.to_uppercase().starts_with("SASL") {
        client_config
            .set("sasl.mechanism", algorithm.mechanism())
            .set("sasl.username", &config.username)
            .set("sasl.password", &config.password);
    }

    client_config.set_log_level(RDKafkaLogLevel::Warning);
    Ok(client_config)
}

/// Run a blocking librdkafka call off the async runtime
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KafkaError::Connection(format!("blocking broker call failed: {}", e)))?
}

fn topics_from(metadata: &Metadata) -> Vec<TopicMetadata> {
    let mut topics: Vec<TopicMetadata> = metadata
        .topics()
        .iter()
        .filter(|t| t.error().is_none())
        .map(|t| TopicMetadata {
            name: t.name().to_string(),
            partitions: t.partitions().iter().map(|p| p.id()).collect(),
        })
        .collect();
    topics.sort_by(|a, b| a.name.cmp(&b.name));
    topics
}

fn to_record<M: Message>(message: &M) -> Record {
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
        timestamp: message.timestamp().to_millis(),
    }
}

#[async_trait]
impl Connector for RdKafkaConnector {
    fn name(&self) -> &'static str {
        "librdkafka"
    }

    async fn connect(
        &self,
        config: &BrokerConfig,
        algorithm: ScramAlgorithm,
    ) -> Result<Arc<dyn Cluster>> {
        let base = client_config(config, algorithm)?;

        let mut producer_config = base.clone();
        producer_config
            .set("message.timeout.ms", DEFAULT_DELIVERY_TIMEOUT_MS.to_string())
            .set("enable.idempotence", "false");
        let producer: FutureProducer = producer_config.create()?;
        let producer = Arc::new(producer);

        // librdkafka connects lazily; a metadata round trip forces the SASL
        // handshake so bad credentials fail here
        let probe = producer.clone();
        let timeout = config.metadata_timeout();
        blocking(move || {
            probe
                .client()
                .fetch_metadata(None, timeout)
                .map(|_| ())
                .map_err(KafkaError::from)
        })
        .await?;

        debug!(
            client_id = %config.client_id,
            mechanism = algorithm.mechanism(),
            "librdkafka session authenticated"
        );

        Ok(Arc::new(RdKafkaCluster {
            base,
            client_id: config.client_id.clone(),
            metadata_timeout: timeout,
            producer,
            closed: CancellationToken::new(),
        }))
    }
}

struct RdKafkaCluster {
    base: ClientConfig,
    client_id: String,
    metadata_timeout: Duration,
    producer: Arc<FutureProducer>,
    closed: CancellationToken,
}

impl RdKafkaCluster {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            Err(KafkaError::Closed("session"))
        } else {
            Ok(())
        }
    }

    async fn fetch_topics(&self, topic: Option<&str>) -> Result<Vec<TopicMetadata>> {
        let producer = self.producer.clone();
        let topic = topic.map(str::to_string);
        let timeout = self.metadata_timeout;
        blocking(move || {
            let metadata = producer.client().fetch_metadata(topic.as_deref(), timeout)?;
            Ok(topics_from(&metadata))
        })
        .await
    }
}

#[async_trait]
impl Cluster for RdKafkaCluster {
    async fn metadata(&self) -> Result<Vec<TopicMetadata>> {
        self.ensure_open()?;
        self.fetch_topics(None).await
    }

    async fn produce(&self, record: OutboundRecord, partition: i32) -> Result<RecordPosition> {
        self.ensure_open()?;

        let mut future_record = FutureRecord::<[u8], [u8]>::to(&record.topic).partition(partition);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(value) = record.value.as_deref() {
            future_record = future_record.payload(value);
        }

        let queue_timeout = Timeout::After(Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS));
        match self.producer.send(future_record, queue_timeout).await {
            Ok((partition, offset)) => Ok(RecordPosition { partition, offset }),
            Err((err, _)) => Err(KafkaError::Delivery {
                topic: record.topic.clone(),
                partition,
                reason: err.to_string(),
            }),
        }
    }

    async fn open_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>> {
        self.ensure_open()?;

        let mut reader_config = self.base.clone();
        reader_config
            .set("group.id", format!("{}-partition-reader", self.client_id))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        let consumer: Arc<StreamConsumer> = Arc::new(reader_config.create()?);

        let (low, high) = {
            let consumer = consumer.clone();
            let topic = topic.to_string();
            let timeout = self.metadata_timeout;
            blocking(move || {
                let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;
                let known = topics_from(&metadata)
                    .into_iter()
                    .find(|t| t.name == topic)
                    .ok_or_else(|| KafkaError::TopicNotFound(topic.clone()))?;
                if !known.partitions.contains(&partition) {
                    return Err(KafkaError::PartitionNotFound { topic, partition });
                }
                Ok(consumer.fetch_watermarks(&topic, partition, timeout)?)
            })
            .await?
        };

        let (offset, position) = match start {
            StartOffset::Earliest => (Offset::Beginning, low),
            StartOffset::Latest => (Offset::End, high),
            StartOffset::At(o) if (low..=high).contains(&o) => (Offset::Offset(o), o),
            StartOffset::At(o) => {
                return Err(KafkaError::OffsetOutOfRange {
                    topic: topic.to_string(),
                    partition,
                    offset: o,
                    low,
                    high,
                })
            }
        };

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, offset)?;
        consumer.assign(&assignment)?;

        Ok(Box::new(RdKafkaPartitionReader {
            consumer,
            position,
            closed: self.closed.child_token(),
        }))
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

        let known = self.fetch_topics(None).await?;
        if let Some(missing) = topics.iter().find(|t| !known.iter().any(|k| &k.name == *t)) {
            return Err(KafkaError::TopicNotFound(missing.clone()));
        }

        let (generations_tx, generations_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RebalanceState {
            group_id: group_id.to_string(),
            claim_buffer: settings.claim_buffer,
            drain_timeout: settings.rebalance_timeout(),
            generation: AtomicI32::new(0),
            live: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            generations: generations_tx,
            errors: Mutex::new(Some(errors_tx)),
        });

        let reset = match settings.initial_offset {
            StartOffset::Earliest => "earliest",
            _ => "latest",
        };
        let max_poll = settings.rebalance_timeout_ms.max(settings.session_timeout_ms);
        let mut group_config = self.base.clone();
        group_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", reset)
            .set("session.timeout.ms", settings.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", max_poll.to_string())
            .set(
                "partition.assignment.strategy",
                settings.assignment_strategy.to_lowercase(),
            );

        let consumer: StreamConsumer<GroupContext> = group_config
            .create_with_context(GroupContext {
                state: state.clone(),
            })
            .map_err(KafkaError::from)?;
        let subscription: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&subscription)?;
        let consumer = Arc::new(consumer);

        let closed = self.closed.child_token();
        tokio::spawn(poll_group(consumer.clone(), state.clone(), closed.clone()));

        info!(group_id, topics = ?topics, "subscribed consumer group");

        Ok(Arc::new(RdKafkaMembership {
            group_id: group_id.to_string(),
            client_id: self.client_id.clone(),
            consumer,
            state,
            generations: tokio::sync::Mutex::new(generations_rx),
            errors_rx: Mutex::new(Some(errors_rx)),
            joined: AtomicBool::new(false),
            closed,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;
        blocking(move || producer.flush(timeout).map_err(KafkaError::from)).await
    }
}

struct RdKafkaPartitionReader {
    consumer: Arc<StreamConsumer>,
    position: i64,
    closed: CancellationToken,
}

#[async_trait]
impl PartitionReader for RdKafkaPartitionReader {
    async fn next(&mut self) -> Option<Result<Record>> {
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            message = self.consumer.recv() => message.map(|m| to_record(&m)),
        };
        match result {
            Ok(record) => {
                self.position = record.offset + 1;
                Some(Ok(record))
            }
            Err(err) => Some(Err(err.into())),
        }
    }

    fn position(&self) -> i64 {
        self.position
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.cancel();
        self.consumer.unassign()?;
        Ok(())
    }
}

/// Tokens of the generation currently handed to the coordinator
struct LiveGeneration {
    revoked: CancellationToken,
    released: CancellationToken,
}

/// Assignment bookkeeping shared between the consumer context and the
/// membership handle
struct RebalanceState {
    group_id: String,
    claim_buffer: usize,
    drain_timeout: Duration,
    generation: AtomicI32,
    live: Mutex<Option<LiveGeneration>>,
    senders: Mutex<HashMap<(String, i32), mpsc::Sender<Record>>>,
    generations: mpsc::UnboundedSender<Generation>,
    errors: Mutex<Option<mpsc::UnboundedSender<KafkaError>>>,
}

impl RebalanceState {
    /// Stop feeding the live generation; returns its release token
    fn revoke(&self) -> Option<CancellationToken> {
        let live = self.live.lock().take();
        self.senders.lock().clear();
        live.map(|live| {
            live.revoked.cancel();
            live.released
        })
    }

    /// Revoke and wait until the coordinator has released the generation
    ///
    /// Runs inside librdkafka's rebalance callback; returning hands the
    /// partitions back to the group.
    fn revoke_and_drain(&self) {
        let Some(released) = self.revoke() else {
            return;
        };
        if released.is_cancelled() {
            return;
        }
        let handle = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => handle,
            _ => {
                warn!(
                    group_id = %self.group_id,
                    "cannot wait for claim handlers outside a multi-threaded runtime"
                );
                return;
            }
        };

        let limit = self.drain_timeout;
        let drained = tokio::task::block_in_place(|| {
            handle.block_on(async { tokio::time::timeout(limit, released.cancelled()).await })
        });
        match drained {
            Ok(()) => debug!(group_id = %self.group_id, "revoked generation drained"),
            Err(_) => warn!(
                group_id = %self.group_id,
                timeout_ms = limit.as_millis() as u64,
                "claim handlers still running after rebalance timeout"
            ),
        }
    }

    fn assign(&self, partitions: &TopicPartitionList) {
        self.revoke_and_drain();

        let mut claims = Vec::new();
        {
            let mut senders = self.senders.lock();
            for elem in partitions.elements() {
                let (tx, rx) = mpsc::channel(self.claim_buffer);
                let topic = elem.topic().to_string();
                senders.insert((topic.clone(), elem.partition()), tx);
                claims.push(Claim {
                    topic,
                    partition: elem.partition(),
                    initial_offset: match elem.offset() {
                        Offset::Offset(o) => o,
                        _ => -1,
                    },
                    records: rx,
                });
            }
        }

        let revoked = CancellationToken::new();
        let (release, released) = GenerationRelease::new();
        *self.live.lock() = Some(LiveGeneration {
            revoked: revoked.clone(),
            released,
        });
        let generation_id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            group_id = %self.group_id,
            generation = generation_id,
            claims = claims.len(),
            "partitions assigned"
        );

        let generation = Generation {
            generation_id,
            member_id: String::new(),
            claims,
            revoked,
            released: release,
        };
        if self.generations.send(generation).is_err() {
            debug!(group_id = %self.group_id, "membership closed, dropping assignment");
        }
    }

    fn report(&self, err: KafkaError) {
        match self.errors.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(err);
            }
            None => debug!(group_id = %self.group_id, error = %err, "error after close"),
        }
    }
}

struct GroupContext {
    state: Arc<RebalanceState>,
}

impl ClientContext for GroupContext {
    fn error(&self, error: RdKafkaError, reason: &str) {
        self.state
            .report(KafkaError::Protocol(format!("{}: {}", error, reason)));
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            debug!(
                group_id = %self.state.group_id,
                partitions = partitions.count(),
                "revoking partitions"
            );
            self.state.revoke_and_drain();
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => self.state.assign(partitions),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => self
                .state
                .report(KafkaError::Protocol(format!("rebalance failed: {}", err))),
        }
    }
}

/// Drive the group consumer and route each record to its claim
async fn poll_group(
    consumer: Arc<StreamConsumer<GroupContext>>,
    state: Arc<RebalanceState>,
    closed: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            message = consumer.recv() => match message {
                Ok(m) => to_record(&m),
                Err(err) => {
                    state.report(err.into());
                    continue;
                }
            },
        };

        let sender = state
            .senders
            .lock()
            .get(&(record.topic.clone(), record.partition))
            .cloned();
        let Some(sender) = sender else {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                "dropping record for unassigned partition"
            );
            continue;
        };

        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            sent = sender.send(record) => {
                if sent.is_err() {
                    debug!(group_id = %state.group_id, "claim closed, record will be redelivered");
                }
            }
        }
    }
    debug!(group_id = %state.group_id, "group poll task stopped");
}

struct RdKafkaMembership {
    group_id: String,
    client_id: String,
    consumer: Arc<StreamConsumer<GroupContext>>,
    state: Arc<RebalanceState>,
    generations: tokio::sync::Mutex<mpsc::UnboundedReceiver<Generation>>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<KafkaError>>>,
    joined: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl GroupMembership for RdKafkaMembership {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    /// librdkafka keeps the broker-assigned member id internal; the client id
    /// identifies this member in logs instead
    fn member_id(&self) -> Option<String> {
        self.joined
            .load(Ordering::SeqCst)
            .then(|| self.client_id.clone())
    }

    async fn join(&self) -> Result<Generation> {
        let mut generations = self.generations.lock().await;
        let mut generation = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(KafkaError::Closed("group membership")),
            next = generations.recv() => next.ok_or(KafkaError::Closed("group membership"))?,
        };
        self.joined.store(true, Ordering::SeqCst);
        generation.member_id = self.client_id.clone();
        Ok(generation)
    }

    fn mark(&self, topic: &str, partition: i32, offset: i64) {
        if let Err(err) = self.consumer.store_offset(topic, partition, offset + 1) {
            debug!(topic, partition, offset, error = %err, "failed to store offset");
        }
    }

    async fn commit(&self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Async) {
            Ok(()) => Ok(()),
            Err(err) if err.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<KafkaError>> {
        self.errors_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.state.revoke();
        self.joined.store(false, Ordering::SeqCst);
        self.state.errors.lock().take();
        self.consumer.unsubscribe();
        info!(group_id = %self.group_id, "left consumer group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_sets_scram_settings() {
        let config = BrokerConfig::new(["b1:9093", "b2"], "svc", "pw");
        let client_config = client_config(&config, ScramAlgorithm::Sha256).unwrap();
        assert_eq!(
            client_config.get("bootstrap.servers"),
            Some("b1:9093,b2:9092")
        );
        assert_eq!(client_config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(client_config.get("sasl.username"), Some("svc"));
        assert_eq!(client_config.get("security.protocol"), Some("SASL_PLAINTEXT"));
    }

    #[test]
    fn test_client_config_plaintext_skips_sasl() {
        let mut config = BrokerConfig::new(["b1"], "svc", "pw");
        config.security_protocol = "PLAINTEXT".into();
        let client_config = client_config(&config, ScramAlgorithm::Sha512).unwrap();
        assert!(client_config.get("sasl.mechanism").is_none());
        assert!(client_config.get("sasl.password").is_none());
    }

    #[test]
    fn test_client_config_rejects_empty_brokers() {
        let config = BrokerConfig::new(Vec::<String>::new(), "svc", "pw");
        assert!(client_config(&config, ScramAlgorithm::Sha512).is_err());
    }

    fn rebalance_state(
        drain_timeout: Duration,
    ) -> (RebalanceState, mpsc::UnboundedReceiver<Generation>) {
        let (generations_tx, generations_rx) = mpsc::unbounded_channel();
        let state = RebalanceState {
            group_id: "g".into(),
            claim_buffer: 4,
            drain_timeout,
            generation: AtomicI32::new(0),
            live: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            generations: generations_tx,
            errors: Mutex::new(None),
        };
        (state, generations_rx)
    }

    fn two_partitions() -> TopicPartitionList {
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition("t", 0);
        partitions.add_partition("t", 1);
        partitions
    }

    #[tokio::test]
    async fn test_rebalance_state_revokes_previous_generation() {
        let (state, mut generations_rx) = rebalance_state(Duration::from_secs(1));
        let partitions = two_partitions();
        state.assign(&partitions);

        let mut first = generations_rx.recv().await.unwrap();
        assert_eq!(first.generation_id, 1);
        assert_eq!(first.claims.len(), 2);
        assert_eq!(state.senders.lock().len(), 2);

        let released = state.revoke().unwrap();
        assert!(first.revoked.is_cancelled());
        assert!(!released.is_cancelled());
        assert!(state.senders.lock().is_empty());
        assert!(first.claims[0].records.recv().await.is_none());

        first.released.release();
        assert!(released.is_cancelled());

        state.assign(&partitions);
        let second = generations_rx.recv().await.unwrap();
        assert_eq!(second.generation_id, 2);
        assert!(!second.revoked.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_revoke_blocks_until_generation_released() {
        let (state, mut generations_rx) = rebalance_state(Duration::from_secs(5));
        let state = Arc::new(state);
        state.assign(&two_partitions());
        let generation = generations_rx.recv().await.unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        let handlers = {
            let drained = drained.clone();
            tokio::spawn(async move {
                generation.revoked.cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                drained.store(true, Ordering::SeqCst);
                generation.released.release();
            })
        };

        let revoking = state.clone();
        let observed = tokio::spawn(async move {
            revoking.revoke_and_drain();
            drained.load(Ordering::SeqCst)
        })
        .await
        .unwrap();

        assert!(observed, "revoke returned before the handlers stopped");
        handlers.await.unwrap();
        assert!(state.senders.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_context_callbacks_drain_then_reassign() {
        let (state, mut generations_rx) = rebalance_state(Duration::from_secs(5));
        let context = GroupContext {
            state: Arc::new(state),
        };
        context.post_rebalance(&Rebalance::Assign(&two_partitions()));
        let first = generations_rx.recv().await.unwrap();
        assert_eq!(first.claims.len(), 2);

        let handlers = tokio::spawn(async move {
            first.revoked.cancelled().await;
            first.released.release();
        });
        let context = tokio::spawn(async move {
            let partitions = two_partitions();
            context.pre_rebalance(&Rebalance::Revoke(&partitions));
            context.post_rebalance(&Rebalance::Revoke(&partitions));
            context.post_rebalance(&Rebalance::Assign(&partitions));
            context
        })
        .await
        .unwrap();
        handlers.await.unwrap();

        let second = generations_rx.recv().await.unwrap();
        assert_eq!(second.generation_id, 2);
        assert_eq!(context.state.senders.lock().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_revoke_gives_up_after_rebalance_timeout() {
        let (state, mut generations_rx) = rebalance_state(Duration::from_millis(50));
        let state = Arc::new(state);
        state.assign(&two_partitions());
        let _held = generations_rx.recv().await.unwrap();

        let revoking = state.clone();
        let started = tokio::time::Instant::now();
        tokio::time::timeout(
            Duration::from_secs(5),
            tokio::spawn(async move { revoking.revoke_and_drain() }),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_generation_counts_as_released() {
        let (state, mut generations_rx) = rebalance_state(Duration::from_secs(30));
        let state = Arc::new(state);
        state.assign(&two_partitions());
        drop(generations_rx.recv().await.unwrap());

        let revoking = state.clone();
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::spawn(async move { revoking.revoke_and_drain() }),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
