//! Test helper functions
//!
//! Broker fixtures and polling helpers shared by the unit tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GroupSettings;
use crate::kafka::cluster::MemoryBroker;
use crate::kafka::group::ConsumerGroupCoordinator;
use crate::kafka::messages::DeliveredMessage;
use crate::kafka::session::ClientSession;

use super::mocks::{mock_broker_config, TEST_PASSWORD, TEST_USER};

/// An in-process broker with the test user registered
pub struct TestCluster {
    pub broker: MemoryBroker,
}

impl TestCluster {
    /// Broker with one topic per `(name, partitions)` entry
    pub fn with_topics(topics: &[(&str, i32)]) -> Self {
        let broker = MemoryBroker::new();
        broker
            .add_user(TEST_USER, TEST_PASSWORD)
            .expect("register test user");
        for (name, partitions) in topics {
            broker
                .create_topic(name, *partitions)
                .expect("create test topic");
        }
        Self { broker }
    }

    /// Open a session as `client_id`
    pub async fn session(&self, client_id: &str) -> Arc<ClientSession> {
        ClientSession::open_with(mock_broker_config(client_id), &self.broker)
            .await
            .expect("open test session")
    }

    /// Create and start a coordinator on its own session
    pub async fn started_group(
        &self,
        client_id: &str,
        group_id: &str,
        topics: &[&str],
        settings: GroupSettings,
    ) -> ConsumerGroupCoordinator {
        let session = self.session(client_id).await;
        let coordinator =
            ConsumerGroupCoordinator::new(session, group_id, settings).expect("valid settings");
        coordinator.start(topics).await.expect("group ready");
        coordinator
    }

    /// Append `count` records with keys `k0`, `k1`, ... cycling over
    /// `key_space`, round-robin across partitions
    pub fn fill(&self, topic: &str, partitions: i32, count: usize, key_space: usize) {
        for i in 0..count {
            let key = format!("k{}", i % key_space.max(1));
            let value = format!("v{}", i);
            self.broker
                .append(
                    topic,
                    (i as i32) % partitions,
                    Some(key.as_bytes()),
                    Some(value.as_bytes()),
                )
                .expect("append test record");
        }
    }
}

/// Receive `count` messages or panic after `limit`
pub async fn collect_messages(
    coordinator: &ConsumerGroupCoordinator,
    count: usize,
    limit: Duration,
) -> Vec<DeliveredMessage> {
    tokio::time::timeout(limit, async {
        let mut messages = Vec::with_capacity(count);
        while messages.len() < count {
            match coordinator.recv().await {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        messages
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {} messages", count))
}

/// Poll `condition` every 10ms until it holds; returns false on timeout
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(limit, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fill_spreads_across_partitions() {
        let cluster = TestCluster::with_topics(&[("t", 2)]);
        cluster.fill("t", 2, 5, 2);
        assert_eq!(cluster.broker.high_watermark("t", 0).unwrap(), 3);
        assert_eq!(cluster.broker.high_watermark("t", 1).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(wait_until(Duration::from_millis(30), || async { true }).await);
        assert!(!wait_until(Duration::from_millis(30), || async { false }).await);
    }
}
