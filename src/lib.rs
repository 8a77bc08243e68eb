// kafka_conduit: SASL/SCRAM Kafka client
//
// A session authenticates once and is shared by a producer, a
// single-partition consumer and a consumer group coordinator. The
// coordinator fans every claimed partition into one bounded channel that
// stays the same across rebalances.
//
// Module layout:
// - config:   typed configuration sections (`AppConfig`)
// - settings: layered key/value store the configuration is loaded through
// - logging:  tracing subscriber setup
// - kafka:    the broker client itself

pub mod config; // Configuration sections and validation
pub mod kafka; // Broker client (session, producer, consumers, group)
pub mod logging; // Log level parsing and subscriber setup
pub mod settings; // Layered TOML settings store

// Test utilities (only compiled in test builds)
#[cfg(test)]
pub mod testing;

pub use config::{AppConfig, BrokerConfig, GroupSettings, LogSettings, ProducerSettings};
pub use kafka::{
    Client, ClientSession, ConsumerGroupCoordinator, DeliveredMessage, KafkaError,
    MemoryBroker, PartitionConsumer, Producer, Result, StartOffset,
};
