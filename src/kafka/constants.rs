//! Client constants
//!
//! This module centralizes the defaults and magic numbers used by the client.
//! Using named constants keeps the configuration layer and the components in
//! agreement about what "default" means.

use std::time::Duration;

// ===== Connection Defaults =====

/// Client id sent to the broker when none is configured
pub const DEFAULT_CLIENT_ID: &str = "sasl_scram_client";

/// Security protocol used when none is configured
///
/// SCRAM credentials are always sent, so the default is a SASL protocol.
pub const DEFAULT_SECURITY_PROTOCOL: &str = "SASL_PLAINTEXT";

/// Timeout for the metadata fetch performed while opening a session
pub const DEFAULT_METADATA_TIMEOUT_MS: u64 = 10_000;

/// Default broker port when an address omits it
pub const DEFAULT_BROKER_PORT: u16 = 9092;

// ===== SCRAM =====

/// Algorithm name for SCRAM-SHA-256 in configuration files
pub const ALGORITHM_SHA256: &str = "sha256";

/// Algorithm name for SCRAM-SHA-512 in configuration files
pub const ALGORITHM_SHA512: &str = "sha512";

/// SASL mechanism name for SCRAM-SHA-256
pub const SASL_SCRAM_SHA256: &str = "SCRAM-SHA-256";

/// SASL mechanism name for SCRAM-SHA-512
pub const SASL_SCRAM_SHA512: &str = "SCRAM-SHA-512";

/// PBKDF2 iteration count used when deriving verifier credentials
///
/// 4096 is the minimum recommended by RFC 7677 and the value Kafka uses.
pub const SCRAM_DEFAULT_ITERATIONS: u32 = 4096;

/// Lowest iteration count a client accepts from a server-first message
pub const SCRAM_MIN_ITERATIONS: u32 = 4096;

/// Length of the random client/server nonce in bytes (before base64)
pub const SCRAM_NONCE_BYTES: usize = 24;

/// Length of the random salt in bytes
pub const SCRAM_SALT_BYTES: usize = 16;

// ===== Producer Defaults =====

/// How long a tracked send waits for the broker acknowledgment
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 30_000;

/// Records buffered between `send` and the broker pipeline before the
/// in-flight limit applies
pub const DEFAULT_PRODUCER_IN_FLIGHT: usize = 256;

// ===== Consumer Group Defaults =====

/// Capacity of the coordinator output channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Records buffered per claim between the broker and the claim handler
pub const DEFAULT_CLAIM_BUFFER: usize = 256;

/// Group session timeout
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Maximum time members have to rejoin during a rebalance
pub const DEFAULT_REBALANCE_TIMEOUT_MS: u64 = 60_000;

/// Pause before rejoining after a failed consume round
pub const DEFAULT_REBALANCE_RETRY_BACKOFF_MS: u64 = 2_000;

/// Assignment strategy used when none is configured
pub const DEFAULT_ASSIGNMENT_STRATEGY: &str = "range";

// ===== Offsets =====

/// Sentinel for "start from the oldest retained record"
pub const OFFSET_EARLIEST: i64 = -2;

/// Sentinel for "start from the next record produced"
pub const OFFSET_LATEST: i64 = -1;

// ===== Logging =====

/// Log level used when none is configured
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Convert a millisecond constant to a `Duration`
pub const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
