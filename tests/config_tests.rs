// Configuration loading tests
//
// Exercise `AppConfig::load` and the settings store against real files in
// a temporary directory.

use std::fs;

use kafka_conduit::kafka::PartitionStrategy;
use kafka_conduit::logging::LogLevel;
use kafka_conduit::settings::{ensure_file, SettingsStore};
use kafka_conduit::{AppConfig, KafkaError, StartOffset};

const FULL_CONFIG: &str = r#"
[kafka]
brokers = ["kafka-1:9093", "kafka-2"]
username = "svc"
password = "secret"
algorithm = "sha256"
client_id = "billing"

[producer]
ack_tracking = true
partitioner = "murmur2"

[group]
channel_capacity = 64
initial_offset = "earliest"
assignment_strategy = "roundrobin"
ready_timeout_ms = 1500

[log]
level = "debug"
"#;

#[test]
fn test_load_without_file_uses_defaults() {
    let config = AppConfig::load(None).unwrap();
    assert_eq!(config, AppConfig::default());
    assert!(!config.producer.ack_tracking);
    assert_eq!(config.producer.partitioner, PartitionStrategy::RoundRobin);
    assert_eq!(config.group.initial_offset, StartOffset::Latest);
    assert!(config.group.ready_timeout().is_none());
}

#[test]
fn test_load_full_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conduit.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = AppConfig::load(Some(&path)).unwrap();
    assert_eq!(
        config.kafka.bootstrap_servers().unwrap(),
        "kafka-1:9093,kafka-2:9092"
    );
    assert_eq!(config.kafka.scram_algorithm().mechanism(), "SCRAM-SHA-256");
    assert_eq!(config.kafka.client_id, "billing");
    assert!(config.producer.ack_tracking);
    assert_eq!(config.producer.partitioner, PartitionStrategy::Murmur2);
    assert_eq!(config.group.channel_capacity, 64);
    assert_eq!(config.group.initial_offset, StartOffset::Earliest);
    assert_eq!(config.group.ready_timeout_ms, Some(1500));
    assert_eq!(config.log.level(), LogLevel::Debug);
    // untouched keys keep their defaults
    assert_eq!(config.group.claim_buffer, AppConfig::default().group.claim_buffer);
}

#[test]
fn test_load_rejects_invalid_sections() {
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("capacity.toml");
    fs::write(&path, "[group]\nchannel_capacity = 0\n").unwrap();
    assert!(matches!(AppConfig::load(Some(&path)), Err(KafkaError::Config(_))));

    let path = dir.path().join("offset.toml");
    fs::write(&path, "[group]\ninitial_offset = \"sideways\"\n").unwrap();
    assert!(AppConfig::load(Some(&path)).is_err());

    let path = dir.path().join("broken.toml");
    fs::write(&path, "[kafka\nbrokers = ").unwrap();
    assert!(AppConfig::load(Some(&path)).is_err());

    assert!(AppConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
}

#[test]
fn test_overrides_beat_file_and_defaults() {
    let mut store = SettingsStore::new();
    store.set_default("group.channel_capacity", 10i64).unwrap();
    store.set_default("group.claim_buffer", 8i64).unwrap();
    store.read("[group]\nchannel_capacity = 20\n").unwrap();
    store.set("kafka.username", "override").unwrap();

    let config = AppConfig::from_store(&store).unwrap();
    assert_eq!(config.group.channel_capacity, 20);
    assert_eq!(config.group.claim_buffer, 8);
    assert_eq!(config.kafka.username, "override");

    store.set("group.channel_capacity", 30i64).unwrap();
    assert_eq!(store.get_as::<usize>("group.channel_capacity").unwrap(), Some(30));
}

#[test]
fn test_store_round_trips_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("settings.toml");

    let mut store = SettingsStore::new();
    store.set("kafka.client_id", "writer").unwrap();
    store.set("group.initial_offset", "earliest").unwrap();
    store.write(&path).unwrap();

    let mut reloaded = SettingsStore::new();
    reloaded.read_file(&path).unwrap();
    let config = AppConfig::from_store(&reloaded).unwrap();
    assert_eq!(config.kafka.client_id, "writer");
    assert_eq!(config.group.initial_offset, StartOffset::Earliest);
}

#[test]
fn test_ensure_file_creates_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a").join("b").join("conduit.toml");

    assert!(ensure_file(&path, 0o600).unwrap());
    assert!(path.exists());
    assert!(!ensure_file(&path, 0o600).unwrap());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    // an empty file is a valid, all-defaults configuration
    assert_eq!(AppConfig::load(Some(&path)).unwrap(), AppConfig::default());
}
