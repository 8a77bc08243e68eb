// Configuration for kafka_conduit
//
// Typed sections loaded from a TOML document through `settings::SettingsStore`.
// Every field has a default, so an empty file (or no file at all) yields a
// usable configuration apart from the broker list and credentials.
//
// ```toml
// [kafka]
// brokers = ["broker-1:9092", "broker-2:9092"]
// username = "svc"
// password = "secret"
// algorithm = "sha512"
//
// [producer]
// ack_tracking = true
//
// [group]
// channel_capacity = 10000
// initial_offset = "earliest"
//
// [log]
// level = "debug"
// ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kafka::auth::ScramAlgorithm;
use crate::kafka::constants::{
    millis, DEFAULT_ASSIGNMENT_STRATEGY, DEFAULT_BROKER_PORT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_CLAIM_BUFFER, DEFAULT_CLIENT_ID, DEFAULT_DELIVERY_TIMEOUT_MS, DEFAULT_LOG_LEVEL,
    DEFAULT_METADATA_TIMEOUT_MS, DEFAULT_PRODUCER_IN_FLIGHT, DEFAULT_REBALANCE_RETRY_BACKOFF_MS,
    DEFAULT_REBALANCE_TIMEOUT_MS, DEFAULT_SECURITY_PROTOCOL, DEFAULT_SESSION_TIMEOUT_MS,
};
use crate::kafka::error::{KafkaError, Result};
use crate::kafka::messages::StartOffset;
use crate::kafka::partitioner::PartitionStrategy;
use crate::logging::LogLevel;
use crate::settings::SettingsStore;

/// Connection settings for one broker cluster
///
/// Immutable once a session has been opened with it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bootstrap addresses, `host:port` (port defaults to 9092)
    pub brokers: Vec<String>,
    pub username: String,
    pub password: String,
    /// `sha256`, `sha512`, or unset (SHA-512)
    pub algorithm: Option<String>,
    pub client_id: String,
    pub security_protocol: String,
    pub metadata_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            username: String::new(),
            password: String::new(),
            algorithm: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            security_protocol: DEFAULT_SECURITY_PROTOCOL.to_string(),
            metadata_timeout_ms: DEFAULT_METADATA_TIMEOUT_MS,
        }
    }
}

/// Custom Debug implementation that redacts sensitive credentials
impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("client_id", &self.client_id)
            .field("security_protocol", &self.security_protocol)
            .field("metadata_timeout_ms", &self.metadata_timeout_ms)
            .finish()
    }
}

impl BrokerConfig {
    pub fn new<I, S>(brokers: I, username: &str, password: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: &str) -> Self {
        self.algorithm = Some(algorithm.to_string());
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    /// SCRAM algorithm for this config (SHA-512 when unset or unknown)
    pub fn scram_algorithm(&self) -> ScramAlgorithm {
        ScramAlgorithm::from_config(self.algorithm.as_deref())
    }

    pub fn metadata_timeout(&self) -> Duration {
        millis(self.metadata_timeout_ms)
    }

    /// Normalize the broker list to `host:port` entries
    ///
    /// Fails with `Connection` when the list is empty or an entry is not a
    /// valid address.
    pub fn resolve_brokers(&self) -> Result<Vec<String>> {
        if self.brokers.is_empty() {
            return Err(KafkaError::Connection("no broker addresses configured".into()));
        }

        self.brokers
            .iter()
            .map(|raw| normalize_address(raw))
            .collect()
    }

    /// Comma-separated bootstrap list for librdkafka
    pub fn bootstrap_servers(&self) -> Result<String> {
        Ok(self.resolve_brokers()?.join(","))
    }
}

fn normalize_address(raw: &str) -> Result<String> {
    let addr = raw.trim();
    let invalid = || KafkaError::Connection(format!("invalid broker address: '{}'", raw));

    if addr.is_empty() {
        return Err(invalid());
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(invalid());
            }
            let port: u16 = port.parse().map_err(|_| invalid())?;
            if port == 0 {
                return Err(invalid());
            }
            Ok(format!("{}:{}", host, port))
        }
        None => Ok(format!("{}:{}", addr, DEFAULT_BROKER_PORT)),
    }
}

/// Producer behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Surface delivery failures on a caller-visible stream in addition to
    /// logging them
    pub ack_tracking: bool,
    pub partitioner: PartitionStrategy,
    pub delivery_timeout_ms: u64,
    /// Records in flight to the broker at once
    pub queue_capacity: usize,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            ack_tracking: false,
            partitioner: PartitionStrategy::RoundRobin,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            queue_capacity: DEFAULT_PRODUCER_IN_FLIGHT,
        }
    }
}

impl ProducerSettings {
    pub fn delivery_timeout(&self) -> Duration {
        millis(self.delivery_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(KafkaError::Config("producer.queue_capacity must be > 0".into()));
        }
        if self.delivery_timeout_ms == 0 {
            return Err(KafkaError::Config(
                "producer.delivery_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Consumer group behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    /// Capacity of the output channel shared across rebalances
    pub channel_capacity: usize,
    /// Records buffered per claim between the broker and its handler
    pub claim_buffer: usize,
    /// Where a partition without a committed offset starts
    pub initial_offset: StartOffset,
    /// `range` or `roundrobin`
    pub assignment_strategy: String,
    pub session_timeout_ms: u64,
    pub rebalance_timeout_ms: u64,
    pub rebalance_retry_backoff_ms: u64,
    /// Bound on how long `start` waits for the first generation; unset waits
    /// indefinitely
    pub ready_timeout_ms: Option<u64>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            claim_buffer: DEFAULT_CLAIM_BUFFER,
            initial_offset: StartOffset::Latest,
            assignment_strategy: DEFAULT_ASSIGNMENT_STRATEGY.to_string(),
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            rebalance_timeout_ms: DEFAULT_REBALANCE_TIMEOUT_MS,
            rebalance_retry_backoff_ms: DEFAULT_REBALANCE_RETRY_BACKOFF_MS,
            ready_timeout_ms: None,
        }
    }
}

impl GroupSettings {
    pub fn session_timeout(&self) -> Duration {
        millis(self.session_timeout_ms)
    }

    pub fn rebalance_timeout(&self) -> Duration {
        millis(self.rebalance_timeout_ms)
    }

    pub fn rebalance_retry_backoff(&self) -> Duration {
        millis(self.rebalance_retry_backoff_ms)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(KafkaError::Config("group.channel_capacity must be > 0".into()));
        }
        if self.claim_buffer == 0 {
            return Err(KafkaError::Config("group.claim_buffer must be > 0".into()));
        }
        if let StartOffset::At(o) = self.initial_offset {
            return Err(KafkaError::Config(format!(
                "group.initial_offset must be earliest or latest, got {}",
                o
            )));
        }
        match self.assignment_strategy.to_lowercase().as_str() {
            "range" | "roundrobin" => Ok(()),
            other => Err(KafkaError::Config(format!(
                "unknown group.assignment_strategy '{}'",
                other
            ))),
        }
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl LogSettings {
    /// Parsed level; unknown names fall back to info
    pub fn level(&self) -> LogLevel {
        self.level.parse().unwrap_or_default()
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub kafka: BrokerConfig,
    pub producer: ProducerSettings,
    pub group: GroupSettings,
    pub log: LogSettings,
}

impl AppConfig {
    /// Decode the configuration from a settings store
    pub fn from_store(store: &SettingsStore) -> Result<Self> {
        let config: AppConfig = store.unmarshal()?;
        config.producer.validate()?;
        config.group.validate()?;
        Ok(config)
    }

    /// Read a TOML file (if given) on top of the built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut store = SettingsStore::new();
        if let Some(path) = path {
            store.read_file(path)?;
        }
        Self::from_store(&store)
    }
}
