//! Consumer group scenarios against the in-process broker

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::{ConsumerGroupCoordinator, CoordinatorState};
use crate::config::GroupSettings;
use crate::kafka::error::KafkaError;
use crate::kafka::messages::StartOffset;
use crate::kafka::producer::Producer;
use crate::testing::{collect_messages, mock_app_config, wait_until, TestCluster};

const LIMIT: Duration = Duration::from_secs(5);

fn settings() -> GroupSettings {
    mock_app_config("unused").group
}

#[tokio::test]
async fn test_hundred_records_arrive_once_in_partition_order() {
    let cluster = TestCluster::with_topics(&[("t", 2)]);
    let group = cluster.started_group("c1", "g1", &["t"], settings()).await;
    assert_eq!(group.state(), CoordinatorState::Consuming);

    let session = cluster.session("producer").await;
    let producer = Producer::new(&session, Default::default()).unwrap();
    for i in 0..100 {
        let key = if i % 2 == 0 { "k0" } else { "k1" };
        producer
            .send("t", Some(key.as_bytes()), format!("v{}", i).as_bytes())
            .unwrap();
    }
    producer.close().await.unwrap();

    let messages = collect_messages(&group, 100, LIMIT).await;
    let values: HashSet<Vec<u8>> = messages
        .iter()
        .map(|m| m.value().unwrap_or_default().to_vec())
        .collect();
    assert_eq!(values.len(), 100);

    let mut last: HashMap<i32, i64> = HashMap::new();
    for message in &messages {
        if let Some(previous) = last.insert(message.partition(), message.offset()) {
            assert!(message.offset() > previous, "out of order on {}", message.partition());
        }
    }
    assert_eq!(last.len(), 2);

    let broker = cluster.broker.clone();
    assert!(
        wait_until(LIMIT, || {
            let broker = broker.clone();
            async move {
                broker.committed_offset("g1", "t", 0) == Some(50)
                    && broker.committed_offset("g1", "t", 1) == Some(50)
            }
        })
        .await
    );
    group.stop().await;
}

#[tokio::test]
async fn test_output_channel_survives_rebalance() {
    let cluster = TestCluster::with_topics(&[("t", 2)]);
    let first = cluster.started_group("a", "g", &["t"], settings()).await;
    let channel = first.messages();
    let first_ref = &first;
    assert_eq!(first.generation(), Some(1));
    assert_eq!(first.assigned().len(), 2);

    cluster.fill("t", 2, 10, 2);
    assert_eq!(collect_messages(&first, 10, LIMIT).await.len(), 10);

    let second = cluster.started_group("b", "g", &["t"], settings()).await;
    assert_eq!(second.generation(), Some(2));
    assert!(wait_until(LIMIT, || async move { first_ref.generation() == Some(2) }).await);
    assert_eq!(first.assigned().len() + second.assigned().len(), 2);
    assert!(Arc::ptr_eq(&channel, &first.messages()));

    cluster.fill("t", 2, 20, 2);
    let (a, b) = tokio::join!(
        collect_messages(&first, 10, LIMIT),
        collect_messages(&second, 10, LIMIT)
    );
    assert_eq!(a.len() + b.len(), 20);

    second.stop().await;
    assert!(wait_until(LIMIT, || async move { first_ref.generation() == Some(3) }).await);
    assert!(wait_until(LIMIT, || async move { first_ref.assigned().len() == 2 }).await);
    assert!(Arc::ptr_eq(&channel, &first.messages()));
    first.stop().await;
}

#[tokio::test]
async fn test_full_channel_stops_commits() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    cluster.fill("t", 1, 10, 1);
    let group = cluster
        .started_group(
            "c1",
            "g",
            &["t"],
            GroupSettings {
                channel_capacity: 4,
                claim_buffer: 1,
                ..settings()
            },
        )
        .await;

    let broker = cluster.broker.clone();
    assert!(wait_until(LIMIT, || {
        let broker = broker.clone();
        async move { broker.commit_count("g") == 4 }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.commit_count("g"), 4);
    // the fifth record is waiting to be forwarded, so it is not committed
    assert_eq!(broker.committed_offset("g", "t", 0), Some(4));

    let message = group.recv().await.unwrap();
    assert_eq!(message.offset(), 0);
    assert!(wait_until(LIMIT, || {
        let broker = broker.clone();
        async move { broker.commit_count("g") == 5 }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.commit_count("g"), 5);
    group.stop().await;
}

#[tokio::test]
async fn test_ready_with_zero_claims() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    let owner = cluster.started_group("aaa", "g", &["t"], settings()).await;
    let idle = cluster.started_group("zzz", "g", &["t"], settings()).await;
    let owner_ref = &owner;

    assert_eq!(idle.state(), CoordinatorState::Consuming);
    assert!(idle.assigned().is_empty());
    assert!(wait_until(LIMIT, || async move { owner_ref.assigned().len() == 1 }).await);

    idle.stop().await;
    owner.stop().await;
}

#[tokio::test]
async fn test_stop_twice_is_safe() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    let group = cluster.started_group("c1", "g", &["t"], settings()).await;

    group.stop().await;
    assert_eq!(group.state(), CoordinatorState::Closed);
    tokio::time::timeout(Duration::from_secs(1), group.stop())
        .await
        .expect("second stop returns promptly");
    assert_eq!(group.state(), CoordinatorState::Closed);

    assert!(group.recv().await.is_none());
    assert!(cluster.broker.group_members("g").is_empty());
    assert!(group.start(&["t"]).await.is_err());
}

#[tokio::test]
async fn test_start_unknown_topic_is_join_error() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    let session = cluster.session("c1").await;
    let group = ConsumerGroupCoordinator::new(session, "g", settings()).unwrap();

    let err = group.start(&["missing"]).await.unwrap_err();
    assert!(matches!(err, KafkaError::Join(_)));
    assert_eq!(group.state(), CoordinatorState::Closed);
}

#[tokio::test]
async fn test_ready_timeout_is_join_error() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    let group_settings = GroupSettings {
        rebalance_timeout_ms: 10_000,
        ready_timeout_ms: Some(100),
        ..settings()
    };

    // a member that joins once and then never comes back for the rebalance
    let stuck_session = cluster.session("stuck").await;
    let stuck = stuck_session
        .cluster()
        .unwrap()
        .join_group("g", &["t".to_string()], &group_settings)
        .await
        .unwrap();
    let _generation = stuck.join().await.unwrap();

    let session = cluster.session("c1").await;
    let group = ConsumerGroupCoordinator::new(session, "g", group_settings).unwrap();
    let err = group.start(&["t"]).await.unwrap_err();
    assert!(matches!(err, KafkaError::Join(_)));
    assert_eq!(group.state(), CoordinatorState::Closed);
    stuck.close().await.unwrap();
}

#[tokio::test]
async fn test_protocol_errors_keep_group_running() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    let group = cluster.started_group("c1", "g", &["t"], settings()).await;

    assert_eq!(cluster.broker.broadcast_group_error("g", "coordinator moved"), 1);
    cluster.fill("t", 1, 3, 1);
    assert_eq!(collect_messages(&group, 3, LIMIT).await.len(), 3);
    assert_eq!(group.state(), CoordinatorState::Consuming);
    group.stop().await;
}

#[tokio::test]
async fn test_restart_resumes_after_committed_offset() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    cluster.fill("t", 1, 5, 1);

    let group = cluster.started_group("c1", "g", &["t"], settings()).await;
    assert_eq!(collect_messages(&group, 5, LIMIT).await.len(), 5);
    group.stop().await;

    cluster.fill("t", 1, 2, 1);
    let group = cluster.started_group("c2", "g", &["t"], settings()).await;
    let messages = collect_messages(&group, 2, LIMIT).await;
    assert_eq!(messages[0].offset(), 5);
    assert_eq!(messages[1].offset(), 6);
    group.stop().await;
}

#[tokio::test]
async fn test_latest_skips_existing_records() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    cluster.fill("t", 1, 3, 1);
    let group = cluster
        .started_group(
            "c1",
            "g",
            &["t"],
            GroupSettings {
                initial_offset: StartOffset::Latest,
                ..settings()
            },
        )
        .await;

    cluster.fill("t", 1, 1, 1);
    let messages = collect_messages(&group, 1, LIMIT).await;
    assert_eq!(messages[0].offset(), 3);
    group.stop().await;
}

#[tokio::test]
async fn test_dropped_coordinator_leaves_group() {
    let cluster = TestCluster::with_topics(&[("t", 1)]);
    let group = cluster.started_group("c1", "g", &["t"], settings()).await;
    assert_eq!(cluster.broker.group_members("g").len(), 1);
    drop(group);

    let broker = cluster.broker.clone();
    assert!(wait_until(LIMIT, || {
        let broker = broker.clone();
        async move { broker.group_members("g").is_empty() }
    })
    .await);
}
