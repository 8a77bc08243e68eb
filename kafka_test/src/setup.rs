//! Test environment setup and teardown
//!
//! Provides TestContext for test isolation with automatic cleanup via RAII.

use std::sync::Arc;
use std::time::Duration;

use kafka_conduit::ClientSession;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::common::{admin_config, broker_config, TestResult};

/// Test context providing isolation and automatic cleanup
///
/// Each test should create its own TestContext which:
/// - Generates unique topic/group names to prevent collisions
/// - Creates topics through the admin API
/// - Deletes them again on drop
pub struct TestContext {
    /// Unique identifier for this test run
    pub test_id: String,
    admin: Arc<AdminClient<DefaultClientContext>>,
    topics_created: Arc<Mutex<Vec<String>>>,
}

impl TestContext {
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let admin: AdminClient<DefaultClientContext> = admin_config().create()?;
        Ok(Self {
            test_id: Uuid::new_v4().to_string()[..8].to_string(),
            admin: Arc::new(admin),
            topics_created: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Create a topic with a unique name and wait until the cluster lists it
    pub async fn unique_topic(
        &self,
        base: &str,
        partitions: i32,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let uuid_str = Uuid::new_v4().to_string();
        let name = format!("{}-{}-{}", base, self.test_id, &uuid_str[..8]);

        let new_topic = NewTopic::new(&name, partitions, TopicReplication::Fixed(1));
        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));
        for result in self.admin.create_topics(&[new_topic], &opts).await? {
            result.map_err(|(topic, code)| format!("create {} failed: {}", topic, code))?;
        }
        self.topics_created.lock().await.push(name.clone());

        // metadata propagates asynchronously after CreateTopics returns
        let session = ClientSession::open(broker_config("kafka-test-setup")).await?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(ids) = session.partitions(&name).await {
                if ids.len() == partitions as usize {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                session.close().await?;
                return Err(format!("topic {} never became visible", name).into());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        session.close().await?;

        Ok(name)
    }

    /// Generate a unique consumer group ID for this test
    pub fn unique_group(&self, base: &str) -> String {
        let uuid_str = Uuid::new_v4().to_string();
        format!("{}-{}-{}", base, self.test_id, &uuid_str[..8])
    }

    /// Manually trigger cleanup (also called automatically on drop)
    pub async fn cleanup(&self) -> TestResult {
        let topics: Vec<String> = self.topics_created.lock().await.drain(..).collect();
        delete_topics(&self.admin, &topics).await
    }
}

async fn delete_topics(admin: &AdminClient<DefaultClientContext>, topics: &[String]) -> TestResult {
    if topics.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = topics.iter().map(String::as_str).collect();
    admin.delete_topics(&names, &AdminOptions::new()).await?;
    Ok(())
}

impl Drop for TestContext {
    fn drop(&mut self) {
        // Best-effort: nothing is cleaned if the runtime is already gone
        let topics = self.topics_created.clone();
        let admin = self.admin.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let topics: Vec<String> = topics.lock().await.drain(..).collect();
                let _ = delete_topics(&admin, &topics).await;
            });
        }
    }
}

/// Verify that the cluster accepts our credentials
pub async fn verify_server_ready() -> TestResult {
    let session = ClientSession::open(broker_config("kafka-test-probe")).await?;
    let topics = session.topics().await?;
    println!("Cluster reachable, {} topics visible", topics.len());
    session.close().await?;
    Ok(())
}
