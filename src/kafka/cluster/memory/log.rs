//! Append-only partition logs for the embedded broker

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::kafka::cluster::PartitionReader;
use crate::kafka::error::Result;
use crate::kafka::messages::Record;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Option<Bytes>,
    timestamp: i64,
}

/// One partition: records plus a wakeup for readers waiting at the end
#[derive(Debug, Default)]
pub(crate) struct PartitionLog {
    records: RwLock<Vec<StoredRecord>>,
    appended: Notify,
}

impl PartitionLog {
    /// Append a record, returning its offset
    pub(crate) fn append(&self, key: Option<Bytes>, value: Option<Bytes>) -> i64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let offset = {
            let mut records = self.records.write();
            records.push(StoredRecord {
                key,
                value,
                timestamp,
            });
            records.len() as i64 - 1
        };
        self.appended.notify_waiters();
        offset
    }

    /// Offset the next appended record will get
    pub(crate) fn high_watermark(&self) -> i64 {
        self.records.read().len() as i64
    }

    /// Oldest retained offset (nothing is ever truncated)
    pub(crate) fn low_watermark(&self) -> i64 {
        0
    }

    pub(crate) fn read(&self, topic: &str, partition: i32, offset: i64) -> Option<Record> {
        if offset < 0 {
            return None;
        }
        let records = self.records.read();
        records.get(offset as usize).map(|r| Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: r.key.clone(),
            value: r.value.clone(),
            timestamp: Some(r.timestamp),
        })
    }

    /// Resolve once a record exists at `offset`
    pub(crate) async fn wait_for(&self, offset: i64) {
        loop {
            // register before checking so an append in between is not missed
            let notified = self.appended.notified();
            if self.high_watermark() > offset {
                return;
            }
            notified.await;
        }
    }
}

/// Cursor over one partition log
pub(crate) struct MemoryPartitionReader {
    topic: String,
    partition: i32,
    log: std::sync::Arc<PartitionLog>,
    position: i64,
    closed: CancellationToken,
}

impl MemoryPartitionReader {
    pub(crate) fn new(
        topic: &str,
        partition: i32,
        log: std::sync::Arc<PartitionLog>,
        position: i64,
        closed: CancellationToken,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            log,
            position,
            closed,
        }
    }
}

#[async_trait]
impl PartitionReader for MemoryPartitionReader {
    async fn next(&mut self) -> Option<Result<Record>> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            if let Some(record) = self.log.read(&self.topic, self.partition, self.position) {
                self.position += 1;
                return Some(Ok(record));
            }
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                _ = self.log.wait_for(self.position) => {}
            }
        }
    }

    fn position(&self) -> i64 {
        self.position
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}
