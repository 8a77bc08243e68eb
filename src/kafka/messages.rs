//! Record types shared by the producer, the partition consumer and the
//! consumer group coordinator
//!
//! Payloads are opaque bytes. `Record` is what a backend hands out when
//! reading a partition; `DeliveredMessage` is what the coordinator puts on
//! its output channel, carrying an `AckHandle` back to the membership that
//! claimed it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::cluster::GroupMembership;
use super::constants::{OFFSET_EARLIEST, OFFSET_LATEST};
use super::error::KafkaError;

/// A record read from a partition log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Milliseconds since the Unix epoch, when the broker reports one
    pub timestamp: Option<i64>,
}

/// A record waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
        }
    }
}

/// Where the broker stored a produced record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

/// Topic name and its partition ids, as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<i32>,
}

impl TopicMetadata {
    pub fn partition_count(&self) -> i32 {
        self.partitions.len() as i32
    }
}

/// Where a partition read starts
///
/// Parses from `earliest`, `latest`, or a non-negative offset. The broker
/// sentinels `-2` and `-1` map to `Earliest` and `Latest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
    At(i64),
}

impl StartOffset {
    /// Map a raw broker offset (including the sentinels) to a start offset
    pub fn from_raw(offset: i64) -> Result<Self, KafkaError> {
        match offset {
            OFFSET_EARLIEST => Ok(StartOffset::Earliest),
            OFFSET_LATEST => Ok(StartOffset::Latest),
            o if o >= 0 => Ok(StartOffset::At(o)),
            o => Err(KafkaError::Config(format!("invalid start offset: {}", o))),
        }
    }

    /// Raw broker representation
    pub fn as_raw(&self) -> i64 {
        match self {
            StartOffset::Earliest => OFFSET_EARLIEST,
            StartOffset::Latest => OFFSET_LATEST,
            StartOffset::At(o) => *o,
        }
    }
}

impl FromStr for StartOffset {
    type Err = KafkaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "earliest" | "oldest" | "beginning" => Ok(StartOffset::Earliest),
            "latest" | "newest" | "end" => Ok(StartOffset::Latest),
            other => other
                .parse::<i64>()
                .map_err(|_| KafkaError::Config(format!("invalid start offset: {}", s)))
                .and_then(StartOffset::from_raw),
        }
    }
}

impl TryFrom<String> for StartOffset {
    type Error = KafkaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StartOffset> for String {
    fn from(value: StartOffset) -> Self {
        value.to_string()
    }
}

impl fmt::Display for StartOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOffset::Earliest => f.write_str("earliest"),
            StartOffset::Latest => f.write_str("latest"),
            StartOffset::At(o) => write!(f, "{}", o),
        }
    }
}

/// Marks a delivered record as consumed on the membership that claimed it
///
/// Marking is monotonic per partition: acknowledging an older offset after
/// a newer one has no effect.
#[derive(Clone)]
pub struct AckHandle {
    membership: Arc<dyn GroupMembership>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl AckHandle {
    pub(crate) fn new(
        membership: Arc<dyn GroupMembership>,
        topic: String,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self {
            membership,
            topic,
            partition,
            offset,
        }
    }

    /// Mark this record consumed; a later generation resumes after it
    pub fn ack(&self) {
        self.membership
            .mark(&self.topic, self.partition, self.offset);
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .finish()
    }
}

/// A record delivered on a consumer group's output channel
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    record: Record,
    ack: AckHandle,
}

impl DeliveredMessage {
    pub(crate) fn new(record: Record, membership: Arc<dyn GroupMembership>) -> Self {
        let ack = AckHandle::new(
            membership,
            record.topic.clone(),
            record.partition,
            record.offset,
        );
        Self { record, ack }
    }

    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    pub fn partition(&self) -> i32 {
        self.record.partition
    }

    pub fn offset(&self) -> i64 {
        self.record.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.record.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.record.value.as_deref()
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.record.timestamp
    }

    pub fn ack_handle(&self) -> &AckHandle {
        &self.ack
    }

    /// Mark this message consumed on the owning membership
    pub fn ack(&self) {
        self.ack.ack();
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_offset_parse() {
        assert_eq!("earliest".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert_eq!("LATEST".parse::<StartOffset>().unwrap(), StartOffset::Latest);
        assert_eq!("oldest".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert_eq!("42".parse::<StartOffset>().unwrap(), StartOffset::At(42));
        assert_eq!("-2".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert_eq!("-1".parse::<StartOffset>().unwrap(), StartOffset::Latest);
        assert!("-7".parse::<StartOffset>().is_err());
        assert!("soon".parse::<StartOffset>().is_err());
    }

    #[test]
    fn test_start_offset_raw() {
        assert_eq!(StartOffset::Earliest.as_raw(), OFFSET_EARLIEST);
        assert_eq!(StartOffset::Latest.as_raw(), OFFSET_LATEST);
        assert_eq!(StartOffset::At(9).as_raw(), 9);
        assert_eq!(StartOffset::default(), StartOffset::Latest);
    }

    #[test]
    fn test_start_offset_serde() {
        #[derive(Deserialize, Serialize)]
        struct Wrapper {
            start: StartOffset,
        }

        let w: Wrapper = toml::from_str("start = \"earliest\"").unwrap();
        assert_eq!(w.start, StartOffset::Earliest);

        let out = toml::to_string(&Wrapper {
            start: StartOffset::At(5),
        })
        .unwrap();
        assert!(out.contains("start = \"5\""));
    }

    #[test]
    fn test_topic_metadata_partition_count() {
        let md = TopicMetadata {
            name: "t".to_string(),
            partitions: vec![0, 1, 2],
        };
        assert_eq!(md.partition_count(), 3);
    }
}
