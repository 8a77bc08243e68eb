//! Producer and partition consumer E2E tests

use kafka_conduit::kafka::PartitionStrategy;
use kafka_conduit::{Client, PartitionConsumer, StartOffset};

use crate::common::{app_config, TestResult, TEST_TIMEOUT};
use crate::setup::TestContext;

/// Tracked sends report their offsets and can be read back in order
pub async fn test_produce_and_read_back() -> TestResult {
    println!("=== Test: Produce and Read Back ===\n");
    let ctx = TestContext::new().await?;
    let topic = ctx.unique_topic("produce-read", 1).await?;

    let client = Client::connect(app_config("e2e-producer")).await?;
    let mut first_offset = None;
    for i in 0..5 {
        let position = client
            .producer()
            .send_tracked(&topic, Some(b"key"), format!("message-{}", i).as_bytes())?
            .await?;
        first_offset.get_or_insert(position.offset);
        println!("   message-{} at offset {}", i, position.offset);
    }
    let first_offset = first_offset.ok_or("no deliveries")?;

    let consumer =
        PartitionConsumer::open(client.session(), &topic, 0, StartOffset::At(first_offset)).await?;
    for i in 0..5 {
        let record = tokio::time::timeout(TEST_TIMEOUT, consumer.next())
            .await?
            .ok_or("partition consumer closed")??;
        let expected = format!("message-{}", i);
        if record.value.as_deref() != Some(expected.as_bytes()) {
            return Err(format!("offset {} held {:?}", record.offset, record.value).into());
        }
    }
    println!("✅ 5 records read back in order");

    consumer.close().await?;
    client.close().await;
    ctx.cleanup().await?;
    Ok(())
}

/// Murmur2 partitioning sends every record with one key to one partition
pub async fn test_key_routing() -> TestResult {
    println!("=== Test: Key Routing ===\n");
    let ctx = TestContext::new().await?;
    let topic = ctx.unique_topic("key-routing", 4).await?;

    let mut config = app_config("e2e-key-routing");
    config.producer.partitioner = PartitionStrategy::Murmur2;
    let client = Client::connect(config).await?;

    let mut partitions = Vec::new();
    for i in 0..10 {
        let position = client
            .producer()
            .send_tracked(&topic, Some(b"sticky"), format!("{}", i).as_bytes())?
            .await?;
        partitions.push(position.partition);
    }
    partitions.dedup();
    if partitions.len() != 1 {
        return Err(format!("key spread across partitions {:?}", partitions).into());
    }
    println!("✅ all records on partition {}", partitions[0]);

    client.close().await;
    ctx.cleanup().await?;
    Ok(())
}
