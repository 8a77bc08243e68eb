//! Canned configuration for tests

use crate::config::{AppConfig, BrokerConfig, GroupSettings};
use crate::kafka::messages::StartOffset;

pub const TEST_USER: &str = "test-user";
pub const TEST_PASSWORD: &str = "test-password";

/// Broker config whose credentials match `TestCluster`
pub fn mock_broker_config(client_id: &str) -> BrokerConfig {
    BrokerConfig::new(["memory:9092"], TEST_USER, TEST_PASSWORD).with_client_id(client_id)
}

/// Full config with fast group timings and `earliest` start offsets
pub fn mock_app_config(client_id: &str) -> AppConfig {
    AppConfig {
        kafka: mock_broker_config(client_id),
        group: GroupSettings {
            initial_offset: StartOffset::Earliest,
            rebalance_timeout_ms: 2_000,
            rebalance_retry_backoff_ms: 50,
            ready_timeout_ms: Some(5_000),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_configs_are_valid() {
        let config = mock_app_config("c1");
        assert_eq!(config.kafka.client_id, "c1");
        assert_eq!(config.kafka.username, TEST_USER);
        assert!(config.group.validate().is_ok());
        assert!(config.producer.validate().is_ok());
    }
}
