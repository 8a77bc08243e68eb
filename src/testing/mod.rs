//! Testing utilities for kafka_conduit
//!
//! Unit tests run against the in-process `MemoryBroker`, so no cluster is
//! needed. It's only compiled when running tests.
//!
//! # Organization
//! - `mocks.rs` - Canned configuration values
//! - `helpers.rs` - Broker fixtures and async wait helpers

#![cfg(test)]

pub mod helpers;
pub mod mocks;

// Re-export commonly used items
pub use helpers::{collect_messages, wait_until, TestCluster};
pub use mocks::{mock_app_config, mock_broker_config, TEST_PASSWORD, TEST_USER};
