//! Single-partition consumer
//!
//! Reads one partition from a fixed start position with no group
//! membership and no offset commits. The sequence is lazy and cannot be
//! restarted mid-stream; open a new consumer to start over.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::cluster::PartitionReader;
use super::error::{KafkaError, Result};
use super::messages::{Record, StartOffset};
use super::session::ClientSession;
use super::shutdown::Closeable;

pub struct PartitionConsumer {
    topic: String,
    partition: i32,
    reader: Mutex<Option<Box<dyn PartitionReader>>>,
    closed: CancellationToken,
}

impl PartitionConsumer {
    /// Open a cursor on `topic[partition]` at `start`
    ///
    /// Unknown topics or partitions and out-of-range offsets are logged once
    /// and returned as `Join` errors.
    pub async fn open(
        session: &ClientSession,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Self> {
        match Self::try_open(session, topic, partition, start).await {
            Ok(reader) => {
                info!(topic, partition, start = %start, position = reader.position(), "partition consumer open");
                Ok(Self {
                    topic: topic.to_string(),
                    partition,
                    reader: Mutex::new(Some(reader)),
                    closed: CancellationToken::new(),
                })
            }
            Err(e) => {
                error!(topic, partition, start = %start, error = %e, "failed to open partition consumer");
                Err(e.into_join())
            }
        }
    }

    async fn try_open(
        session: &ClientSession,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionReader>> {
        let partitions = session.partitions(topic).await?;
        debug!(topic, partitions = ?partitions, "topic partitions");
        if !partitions.contains(&partition) {
            return Err(KafkaError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            });
        }
        session
            .cluster()?
            .open_partition(topic, partition, start)
            .await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next record in log order; waits for new records at the end of the
    /// log and returns `None` once closed
    pub async fn next(&self) -> Option<Result<Record>> {
        let mut reader = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            reader = self.reader.lock() => reader,
        };
        let reader = reader.as_mut()?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            next = reader.next() => next,
        }
    }

    /// Offset of the next record to read, `None` once closed
    pub async fn position(&self) -> Option<i64> {
        self.reader.lock().await.as_ref().map(|r| r.position())
    }

    pub async fn close(&self) -> Result<()> {
        // wakes a pending `next` so the reader lock frees up
        self.closed.cancel();
        let Some(mut reader) = self.reader.lock().await.take() else {
            debug!(topic = %self.topic, partition = self.partition, "partition consumer already closed");
            return Ok(());
        };
        reader.close().await?;
        info!(topic = %self.topic, partition = self.partition, "partition consumer closed");
        Ok(())
    }
}

#[async_trait]
impl Closeable for PartitionConsumer {
    fn name(&self) -> &str {
        "partition consumer"
    }

    async fn close(&self) -> Result<()> {
        PartitionConsumer::close(self).await
    }
}

impl std::fmt::Debug for PartitionConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionConsumer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::kafka::cluster::MemoryBroker;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (MemoryBroker, Arc<ClientSession>) {
        let broker = MemoryBroker::new();
        broker.add_user("svc", "pw").unwrap();
        broker.create_topic("t", 2).unwrap();
        for i in 0..5u8 {
            broker.append("t", 1, None, Some(&[i])).unwrap();
        }
        let config = BrokerConfig::new(["localhost"], "svc", "pw");
        let session = ClientSession::open_with(config, &broker).await.unwrap();
        (broker, session)
    }

    #[tokio::test]
    async fn test_reads_from_explicit_offset() {
        let (_broker, session) = setup().await;
        let consumer = PartitionConsumer::open(&session, "t", 1, StartOffset::At(3))
            .await
            .unwrap();
        assert_eq!(consumer.position().await, Some(3));

        let record = consumer.next().await.unwrap().unwrap();
        assert_eq!(record.offset, 3);
        assert_eq!(record.value.as_deref(), Some(&[3u8][..]));
        assert_eq!(consumer.next().await.unwrap().unwrap().offset, 4);
    }

    #[tokio::test]
    async fn test_latest_waits_for_new_records() {
        let (broker, session) = setup().await;
        let consumer = PartitionConsumer::open(&session, "t", 1, StartOffset::Latest)
            .await
            .unwrap();
        assert_eq!(consumer.position().await, Some(5));

        let pending = tokio::time::timeout(Duration::from_millis(30), consumer.next()).await;
        assert!(pending.is_err());

        broker.append("t", 1, None, Some(b"new")).unwrap();
        let record = consumer.next().await.unwrap().unwrap();
        assert_eq!(record.offset, 5);
    }

    #[tokio::test]
    async fn test_open_failures_are_join_errors() {
        let (_broker, session) = setup().await;
        for (topic, partition, start) in [
            ("missing", 0, StartOffset::Earliest),
            ("t", 7, StartOffset::Earliest),
            ("t", 1, StartOffset::At(99)),
        ] {
            let err = PartitionConsumer::open(&session, topic, partition, start)
                .await
                .unwrap_err();
            assert!(matches!(err, KafkaError::Join(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_close_ends_sequence() {
        let (_broker, session) = setup().await;
        let consumer = Arc::new(
            PartitionConsumer::open(&session, "t", 0, StartOffset::Earliest)
                .await
                .unwrap(),
        );
        consumer.close().await.unwrap();
        consumer.close().await.unwrap();
        assert!(consumer.next().await.is_none());
        assert_eq!(consumer.position().await, None);
    }
}
