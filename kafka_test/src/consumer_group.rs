//! Consumer group E2E tests
//!
//! Exercise the coordinator against a real group coordinator: first
//! assignment, rebalance when a second member joins, and resuming from
//! committed offsets after a restart.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kafka_conduit::kafka::CoordinatorState;
use kafka_conduit::Client;

use crate::common::{app_config, collect, TestResult, TEST_TIMEOUT};
use crate::setup::TestContext;

/// Every produced record reaches the group exactly once while membership is
/// stable
pub async fn test_group_receives_everything() -> TestResult {
    println!("=== Test: Group Receives Everything ===\n");
    let ctx = TestContext::new().await?;
    let topic = ctx.unique_topic("group-all", 2).await?;
    let group_id = ctx.unique_group("group-all");

    let client = Client::connect(app_config("e2e-group-all")).await?;
    let group = client.consumer_group(&group_id, &[&topic]).await?;
    if group.state() != CoordinatorState::Consuming {
        return Err(format!("group in state {} after start", group.state()).into());
    }

    for i in 0..100 {
        let key = if i % 2 == 0 { "k0" } else { "k1" };
        client
            .producer()
            .send(&topic, Some(key.as_bytes()), format!("v{}", i).as_bytes())?;
    }

    let messages = collect(&group, 100, TEST_TIMEOUT).await?;
    let values: HashSet<Vec<u8>> = messages
        .iter()
        .filter_map(|m| m.value().map(<[u8]>::to_vec))
        .collect();
    if values.len() != 100 {
        return Err(format!("expected 100 distinct values, got {}", values.len()).into());
    }
    println!("✅ 100 records received");

    client.close().await;
    ctx.cleanup().await?;
    Ok(())
}

/// A second member joining moves partitions without replacing the first
/// member's output channel
pub async fn test_rebalance_keeps_channel() -> TestResult {
    println!("=== Test: Rebalance Keeps Channel ===\n");
    let ctx = TestContext::new().await?;
    let topic = ctx.unique_topic("group-rebalance", 4).await?;
    let group_id = ctx.unique_group("group-rebalance");

    let first = Client::connect(app_config("e2e-rebalance-a")).await?;
    let first_group = first.consumer_group(&group_id, &[&topic]).await?;
    let channel = first_group.messages();
    println!("   first member owns {:?}", first_group.assigned());

    let second = Client::connect(app_config("e2e-rebalance-b")).await?;
    let second_group = second.consumer_group(&group_id, &[&topic]).await?;
    println!("   second member owns {:?}", second_group.assigned());

    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while first_group.assigned().len() + second_group.assigned().len() != 4 {
        if tokio::time::Instant::now() >= deadline {
            return Err("partitions never settled across both members".into());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if !Arc::ptr_eq(&channel, &first_group.messages()) {
        return Err("output channel replaced during rebalance".into());
    }
    println!("✅ 4 partitions split across two members, channel unchanged");

    second.close().await;
    first.close().await;
    ctx.cleanup().await?;
    Ok(())
}

/// A restarted member continues after the last committed offset
pub async fn test_restart_resumes_from_commit() -> TestResult {
    println!("=== Test: Restart Resumes From Commit ===\n");
    let ctx = TestContext::new().await?;
    let topic = ctx.unique_topic("group-resume", 1).await?;
    let group_id = ctx.unique_group("group-resume");

    let client = Client::connect(app_config("e2e-resume-1")).await?;
    let group = client.consumer_group(&group_id, &[&topic]).await?;
    for i in 0..5 {
        client.producer().send(&topic, None, format!("first-{}", i).as_bytes())?;
    }
    collect(&group, 5, TEST_TIMEOUT).await?;
    client.close().await;

    let client = Client::connect(app_config("e2e-resume-2")).await?;
    client.producer().send(&topic, None, b"second-0")?;
    let group = client.consumer_group(&group_id, &[&topic]).await?;
    let messages = collect(&group, 1, TEST_TIMEOUT).await?;
    if messages[0].value() != Some(&b"second-0"[..]) {
        return Err(format!("resumed at offset {}", messages[0].offset()).into());
    }
    println!("✅ resumed at offset {}", messages[0].offset());

    client.close().await;
    ctx.cleanup().await?;
    Ok(())
}
