//! kafka_conduit E2E Test Suite
//!
//! Runs the client against a live cluster with a SCRAM user:
//! - Test isolation via unique topic/group names
//! - Topics created and deleted through the admin API
//!
//! ## Test Categories
//!
//! - **producer**: tracked sends, read back, key routing
//! - **consumer_group**: full delivery, rebalance, resume after restart
//!
//! ## Usage
//!
//! ```bash
//! KAFKA_BROKERS=localhost:9092 KAFKA_USERNAME=admin KAFKA_PASSWORD=admin-secret \
//!     cargo run -p kafka_test --release
//! ```

// Infrastructure modules
pub mod common;
pub mod setup;

// Test modules
pub mod consumer_group;
pub mod producer;

pub use setup::TestContext;

pub use consumer_group::{
    test_group_receives_everything, test_rebalance_keeps_channel, test_restart_resumes_from_commit,
};
pub use producer::{test_key_routing, test_produce_and_read_back};
