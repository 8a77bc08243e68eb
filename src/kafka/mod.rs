// Broker client module
//
// This module contains everything that talks to the broker:
// - SCRAM authentication and session setup
// - Producer pipeline and partitioner
// - Single-partition consumer
// - Consumer group coordinator with its rebalance loop
// - Shutdown orchestration shared by all of the above
//
// Architecture Overview:
// =====================
//
//   ClientSession ──┬── Producer ──────────────> broker
//                   ├── PartitionConsumer <───── broker
//                   └── ConsumerGroupCoordinator
//                          membership task ── claim handlers ──> output channel
//
// Components never talk to a broker directly. They go through the
// `cluster` traits, which have two implementations:
//
// 1. librdkafka: a real cluster over the network
// 2. memory: an in-process broker with the same group semantics, used by the
//    test suite and for local development
//
// Ownership is explicit: the session is shared through an `Arc`, each
// component owns its own background tasks, and the `Client` facade closes
// everything in a fixed order.

pub mod auth;
pub mod client;
pub mod cluster;
pub mod constants;
pub mod error;
pub mod group;
pub mod messages;
pub mod partition_consumer;
pub mod partitioner;
pub mod producer;
pub mod session;
pub mod shutdown;

// Re-export commonly used types for convenience
pub use auth::{ScramAlgorithm, ScramClient, ScramCredential, ScramServer};
pub use client::Client;
pub use cluster::{Connector, MemoryBroker, RdKafkaConnector};
pub use error::{KafkaError, Result};
pub use group::{ConsumerGroupCoordinator, CoordinatorState};
pub use messages::{
    AckHandle, DeliveredMessage, OutboundRecord, Record, RecordPosition, StartOffset,
    TopicMetadata,
};
pub use partition_consumer::PartitionConsumer;
pub use partitioner::{PartitionStrategy, Partitioner};
pub use producer::{DeliveryFuture, Producer};
pub use session::ClientSession;
pub use shutdown::{Closeable, Latch, ShutdownController};
