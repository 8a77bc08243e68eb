// End-to-end tests through the `Client` facade
//
// Each test wires a full client (session, producer, partition consumer,
// consumer group) against the in-process broker and checks the behaviour a
// caller would observe.

mod helpers;

use std::collections::HashSet;
use std::sync::Arc;

use helpers::{app_config, broker_with, collect, eventually, fill, LIMIT};
use kafka_conduit::kafka::CoordinatorState;
use kafka_conduit::{Client, KafkaError, StartOffset};

#[tokio::test]
async fn test_produced_records_reach_the_group() {
    let broker = broker_with(&[("orders", 3)]);
    let consumer = Client::connect_with(app_config("consumer"), &broker)
        .await
        .unwrap();
    let group = consumer.consumer_group("billing", &["orders"]).await.unwrap();
    assert_eq!(group.state(), CoordinatorState::Consuming);
    assert_eq!(group.assigned().len(), 3);

    let producer = Client::connect_with(app_config("producer"), &broker)
        .await
        .unwrap();
    for i in 0..30 {
        producer
            .producer()
            .send("orders", None, format!("order-{}", i).as_bytes())
            .unwrap();
    }

    let messages = collect(&group, 30).await;
    let values: HashSet<Vec<u8>> = messages
        .iter()
        .filter_map(|m| m.value().map(|v| v.to_vec()))
        .collect();
    assert_eq!(values.len(), 30);
    for partition in 0..3 {
        assert_eq!(broker.high_watermark("orders", partition).unwrap(), 10);
    }

    producer.close().await;
    consumer.close().await;
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_two_clients_split_and_rebalance() {
    let broker = broker_with(&[("events", 4)]);
    let first = Client::connect_with(app_config("first"), &broker)
        .await
        .unwrap();
    let first_group = first.consumer_group("g", &["events"]).await.unwrap();
    let channel = first_group.messages();

    let second = Client::connect_with(app_config("second"), &broker)
        .await
        .unwrap();
    let second_group = second.consumer_group("g", &["events"]).await.unwrap();

    let first_ref = &first_group;
    assert!(eventually(|| async move { first_ref.generation() == Some(2) }).await);
    assert!(eventually(|| async move { first_ref.assigned().len() == 2 }).await);
    assert_eq!(second_group.assigned().len(), 2);

    fill(&broker, "events", 4, 40);
    let (a, b) = tokio::join!(collect(&first_group, 20), collect(&second_group, 20));
    let mut seen: Vec<(i32, i64)> = a
        .iter()
        .chain(b.iter())
        .map(|m| (m.partition(), m.offset()))
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 40);

    second.close().await;
    assert!(eventually(|| async move { first_ref.assigned().len() == 4 }).await);
    assert!(Arc::ptr_eq(&channel, &first_group.messages()));
    first.close().await;
    assert!(broker.group_members("g").is_empty());
}

#[tokio::test]
async fn test_partition_consumer_reads_tracked_sends() {
    let broker = broker_with(&[("audit", 1)]);
    let client = Client::connect_with(app_config("auditor"), &broker)
        .await
        .unwrap();

    let mut positions = Vec::new();
    for i in 0..3 {
        let delivery = client
            .producer()
            .send_tracked("audit", Some(b"k"), format!("entry-{}", i).as_bytes())
            .unwrap();
        positions.push(delivery.await.unwrap());
    }
    assert_eq!(
        positions.iter().map(|p| p.offset).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let reader = client
        .partition_consumer("audit", 0, StartOffset::At(1))
        .await
        .unwrap();
    let record = tokio::time::timeout(LIMIT, reader.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.offset, 1);
    assert_eq!(record.value.as_deref(), Some(&b"entry-1"[..]));

    client.close().await;
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn test_failed_consumers_do_not_poison_the_client() {
    let broker = broker_with(&[("t", 1)]);
    let client = Client::connect_with(app_config("c"), &broker).await.unwrap();

    let err = client
        .partition_consumer("t", 7, StartOffset::Earliest)
        .await
        .unwrap_err();
    assert!(matches!(err, KafkaError::Join(_)));
    let err = client.consumer_group("g", &["missing"]).await.unwrap_err();
    assert!(matches!(err, KafkaError::Join(_)));

    // the failed attempts left both slots free
    client
        .partition_consumer("t", 0, StartOffset::Earliest)
        .await
        .unwrap();
    client.consumer_group("g", &["t"]).await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn test_wrong_password_is_connection_error() {
    let broker = broker_with(&[("t", 1)]);
    let mut config = app_config("c");
    config.kafka.password = "not-it".into();

    let err = Client::connect_with(config, &broker).await.unwrap_err();
    assert!(matches!(err, KafkaError::Connection(_)));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_close_twice_is_safe() {
    let broker = broker_with(&[("t", 1)]);
    let client = Client::connect_with(app_config("c"), &broker).await.unwrap();
    let group = client.consumer_group("g", &["t"]).await.unwrap();

    client.close().await;
    tokio::time::timeout(LIMIT, client.close())
        .await
        .expect("second close returns");
    assert_eq!(group.state(), CoordinatorState::Closed);
    assert!(client.session().is_closed());
    assert!(client.producer().send("t", None, b"late").is_err());
}
