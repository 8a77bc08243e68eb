//! Client error types
//!
//! This module defines the error taxonomy shared by every component of the
//! client. Construction-time failures (`Connection`, `Join`, `Config`) are
//! returned to the caller; steady-state failures (`Delivery`, `Protocol`) are
//! logged and absorbed by the background tasks that observe them.

use thiserror::Error;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Address resolution, SASL handshake or metadata fetch failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// SCRAM exchange rejected or malformed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Group membership or partition consumer could not be created
    #[error("Join error: {0}")]
    Join(String),

    /// Structured payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker rejected or failed to acknowledge a produced record
    #[error("Delivery to {topic}[{partition}] failed: {reason}")]
    Delivery {
        topic: String,
        partition: i32,
        reason: String,
    },

    /// Mid-stream broker error during group operation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Topic does not exist
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Partition does not exist in the topic
    #[error("Partition {partition} not found in topic {topic}")]
    PartitionNotFound { topic: String, partition: i32 },

    /// Requested offset is outside the partition log
    #[error("Offset {offset} out of range for {topic}[{partition}] (valid {low}..={high})")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
        low: i64,
        high: i64,
    },

    /// Component was used after it was closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// An operation did not complete in time
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// IO error (settings files, address parsing)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by librdkafka
    #[error("Broker client error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),
}

impl KafkaError {
    /// Short, stable category name used as a structured logging field
    pub fn category(&self) -> &'static str {
        match self {
            KafkaError::Connection(_) | KafkaError::Auth(_) => "connection",
            KafkaError::Join(_)
            | KafkaError::TopicNotFound(_)
            | KafkaError::PartitionNotFound { .. }
            | KafkaError::OffsetOutOfRange { .. } => "join",
            KafkaError::Serialization(_) => "serialization",
            KafkaError::Delivery { .. } => "delivery",
            KafkaError::Protocol(_) | KafkaError::Broker(_) => "protocol",
            KafkaError::Config(_) => "config",
            KafkaError::Closed(_) => "closed",
            KafkaError::Timeout(_) => "timeout",
            KafkaError::Io(_) => "io",
        }
    }

    /// Whether this error happens while building a component, as opposed to
    /// during steady-state operation
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            KafkaError::Connection(_)
                | KafkaError::Auth(_)
                | KafkaError::Join(_)
                | KafkaError::Config(_)
                | KafkaError::TopicNotFound(_)
                | KafkaError::PartitionNotFound { .. }
                | KafkaError::OffsetOutOfRange { .. }
        )
    }

    /// Rewrap any error as a `Join` error, keeping its message
    pub(crate) fn into_join(self) -> Self {
        match self {
            KafkaError::Join(_) => self,
            other => KafkaError::Join(other.to_string()),
        }
    }

    /// Rewrap any error as a `Connection` error, keeping its message
    pub(crate) fn into_connection(self) -> Self {
        match self {
            KafkaError::Connection(_) => self,
            other => KafkaError::Connection(other.to_string()),
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, KafkaError>;
