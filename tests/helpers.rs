// Test helpers shared by the integration tests
//
// Everything here goes through the public API: an in-process `MemoryBroker`
// with one registered user, configs pointing at it, and small polling
// helpers for asserting on background work.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use kafka_conduit::kafka::messages::DeliveredMessage;
use kafka_conduit::{AppConfig, BrokerConfig, ConsumerGroupCoordinator, GroupSettings, MemoryBroker, StartOffset};

pub const USER: &str = "it-user";
pub const PASSWORD: &str = "it-password";
pub const LIMIT: Duration = Duration::from_secs(5);

/// Broker with the test user and one topic per `(name, partitions)` entry
pub fn broker_with(topics: &[(&str, i32)]) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.add_user(USER, PASSWORD).expect("register user");
    for (name, partitions) in topics {
        broker.create_topic(name, *partitions).expect("create topic");
    }
    broker
}

pub fn broker_config(client_id: &str) -> BrokerConfig {
    BrokerConfig::new(["memory:9092"], USER, PASSWORD).with_client_id(client_id)
}

/// Group timings short enough for tests, starting from the earliest offset
pub fn group_settings() -> GroupSettings {
    GroupSettings {
        initial_offset: StartOffset::Earliest,
        rebalance_timeout_ms: 2_000,
        rebalance_retry_backoff_ms: 50,
        ready_timeout_ms: Some(5_000),
        ..Default::default()
    }
}

pub fn app_config(client_id: &str) -> AppConfig {
    AppConfig {
        kafka: broker_config(client_id),
        group: group_settings(),
        ..Default::default()
    }
}

/// Append `count` records round-robin across `partitions`
pub fn fill(broker: &MemoryBroker, topic: &str, partitions: i32, count: usize) {
    for i in 0..count {
        let value = format!("v{}", i);
        broker
            .append(topic, (i as i32) % partitions, None, Some(value.as_bytes()))
            .expect("append record");
    }
}

/// Receive `count` messages, panicking after `LIMIT`
pub async fn collect(group: &ConsumerGroupCoordinator, count: usize) -> Vec<DeliveredMessage> {
    tokio::time::timeout(LIMIT, async {
        let mut messages = Vec::with_capacity(count);
        while messages.len() < count {
            match group.recv().await {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        messages
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {} messages", count))
}

/// Poll `condition` every 10ms until it holds or `LIMIT` passes
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(LIMIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
