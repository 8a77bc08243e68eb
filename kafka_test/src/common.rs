//! Common utilities shared across E2E test modules
//!
//! Connection settings come from the environment so the suite can run
//! against any cluster with a SCRAM user:
//!
//! | variable          | default          |
//! |-------------------|------------------|
//! | `KAFKA_BROKERS`   | `localhost:9092` |
//! | `KAFKA_USERNAME`  | `admin`          |
//! | `KAFKA_PASSWORD`  | `admin-secret`   |
//! | `KAFKA_ALGORITHM` | `sha512`         |
//! | `KAFKA_SECURITY`  | `SASL_PLAINTEXT` |

use std::env;
use std::time::Duration;

use kafka_conduit::{AppConfig, BrokerConfig, ConsumerGroupCoordinator, DeliveredMessage, GroupSettings, StartOffset};
use rdkafka::config::ClientConfig;

/// Test result type alias for cleaner function signatures
pub type TestResult = Result<(), Box<dyn std::error::Error>>;

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

pub fn get_bootstrap_servers() -> String {
    env_or("KAFKA_BROKERS", "localhost:9092")
}

/// Broker config for the cluster under test
pub fn broker_config(client_id: &str) -> BrokerConfig {
    let brokers: Vec<String> = get_bootstrap_servers()
        .split(',')
        .map(|b| b.trim().to_string())
        .collect();
    let mut config = BrokerConfig::new(
        brokers,
        &env_or("KAFKA_USERNAME", "admin"),
        &env_or("KAFKA_PASSWORD", "admin-secret"),
    )
    .with_algorithm(&env_or("KAFKA_ALGORITHM", "sha512"))
    .with_client_id(client_id);
    config.security_protocol = env_or("KAFKA_SECURITY", "SASL_PLAINTEXT");
    config
}

/// Full client config with group timings suited to a real cluster
pub fn app_config(client_id: &str) -> AppConfig {
    AppConfig {
        kafka: broker_config(client_id),
        group: GroupSettings {
            initial_offset: StartOffset::Earliest,
            session_timeout_ms: 10_000,
            ready_timeout_ms: Some(GROUP_READY_TIMEOUT.as_millis() as u64),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Raw librdkafka config with the same credentials, for admin operations
pub fn admin_config() -> ClientConfig {
    let broker = broker_config("kafka-test-admin");
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", get_bootstrap_servers())
        .set("security.protocol", &broker.security_protocol);
    if broker.security_protocol.to_uppercase().starts_with("SASL") {
        config
            .set("sasl.mechanism", broker.scram_algorithm().mechanism())
            .set("sasl.username", &broker.username)
            .set("sasl.password", &broker.password);
    }
    config
}

/// Receive `count` messages from a group or fail after `limit`
pub async fn collect(
    group: &ConsumerGroupCoordinator,
    count: usize,
    limit: Duration,
) -> Result<Vec<DeliveredMessage>, Box<dyn std::error::Error>> {
    let mut messages = Vec::with_capacity(count);
    let deadline = tokio::time::Instant::now() + limit;
    while messages.len() < count {
        match tokio::time::timeout_at(deadline, group.recv()).await {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => return Err("group output channel closed".into()),
            Err(_) => {
                return Err(format!(
                    "received {} of {} messages before timeout",
                    messages.len(),
                    count
                )
                .into())
            }
        }
    }
    Ok(messages)
}

/// Default test timeout duration
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on how long a group may take to receive its first assignment
pub const GROUP_READY_TIMEOUT: Duration = Duration::from_secs(30);
