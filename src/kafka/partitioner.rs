//! Producer-side partition selection
//!
//! The default strategy cycles through partitions on every send, so records
//! with the same key are NOT guaranteed to land on the same partition.
//! Callers that need per-key ordering select `Murmur2`, which hashes the key
//! the same way Kafka's default partitioner does (`murmur2` with
//! `KAFKA_SEED`, sign bit masked, modulo partition count).

use std::sync::atomic::{AtomicU64, Ordering};

use murmur2::{murmur2, KAFKA_SEED};
use serde::{Deserialize, Serialize};

use super::error::{KafkaError, Result};

/// How the producer picks a partition for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Cycle through partitions on every send
    #[default]
    RoundRobin,
    /// Hash the key; keyless records fall back to round-robin
    Murmur2,
}

/// Stateful partition selector shared by one producer
#[derive(Debug, Default)]
pub struct Partitioner {
    strategy: PartitionStrategy,
    counter: AtomicU64,
}

impl Partitioner {
    pub fn new(strategy: PartitionStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Choose the partition for a record with the given key
    ///
    /// Returns an index in `0..partition_count`.
    pub fn partition(&self, key: Option<&[u8]>, partition_count: i32) -> Result<i32> {
        if partition_count <= 0 {
            return Err(KafkaError::Config(format!(
                "partition count must be positive, got {}",
                partition_count
            )));
        }

        match (self.strategy, key) {
            (PartitionStrategy::Murmur2, Some(k)) => Ok(murmur2_partition(k, partition_count)),
            _ => Ok(self.next_round_robin(partition_count)),
        }
    }

    fn next_round_robin(&self, partition_count: i32) -> i32 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        (n % partition_count as u64) as i32
    }
}

/// Kafka-compatible hash partition for a key
///
/// Matches Kafka's `Utils.toPositive(Utils.murmur2(key)) % numPartitions`.
pub fn murmur2_partition(key: &[u8], partition_count: i32) -> i32 {
    debug_assert!(partition_count > 0, "partition_count must be positive");
    let hash = murmur2(key, KAFKA_SEED);
    ((hash & 0x7fffffff) as i32) % partition_count
}
