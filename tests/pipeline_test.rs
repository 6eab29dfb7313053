// ============================================================================
// Pipeline Integration Tests
// ============================================================================
//
// End-to-end behaviour of publisher + relays over the in-process broker:
// atomic staging, rollback, exactly-once relay across failures, restarts and
// rebalances, and per-partition ordering.
//
// ============================================================================


use courier::bootstrap::{relay_transactional_id, start_in_memory};
use courier::kafka::memory::{MemoryStagingConsumer, MemoryTransactionalProducer};
use courier::kafka::{
    MemoryBroker, Payload, StagingConsumer, Topology, TransactionalProducer,
};
use courier::publisher::{PublishError, Publisher};
use courier::relay::StagingRelay;
use courier::Config;
use courier_config::TopicsConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use test_utils::{WAIT, eventually, messages, test_config, within};

type MemoryRelay = StagingRelay<MemoryTransactionalProducer, MemoryStagingConsumer>;

fn single_partition_config() -> Config {
    Config {
        topics: TopicsConfig {
            partitions: 1,
            ..TopicsConfig::default()
        },
        ..test_config()
    }
}

/// Topics and a publisher, no relays
async fn staging_only(config: &Config) -> (MemoryBroker, Publisher<MemoryTransactionalProducer>) {
    let broker = MemoryBroker::new();
    let topology = Topology::from_config(&config.topics);
    topology.ensure_all(broker.admin().as_ref()).await.unwrap();
    let publisher = Publisher::for_topology(broker.transactional_producer("publisher"), &topology);
    (broker, publisher)
}

fn relay_a(broker: &MemoryBroker, config: &Config, transactional_id: &str) -> MemoryRelay {
    StagingRelay::new(
        broker.transactional_producer(transactional_id),
        broker.consumer(config.kafka.consumer_group.clone(), "stagingA"),
        "publicA",
        config.relay.clone(),
    )
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_messages_reach_every_topic() {
    let broker = MemoryBroker::new();
    let pipeline = start_in_memory(&test_config(), &broker).await.unwrap();

    let receipt = pipeline
        .publisher
        .publish(&messages(&["Message 1", "Message 2"]))
        .await
        .unwrap();
    assert_eq!(receipt.published_count, 2);

    let expected = vec!["Message 1".to_string(), "Message 2".to_string()];
    assert_eq!(sorted(broker.contents("stagingA")), expected);
    assert_eq!(sorted(broker.contents("stagingB")), expected);

    assert!(
        eventually(WAIT, || broker.contents("publicA").len() == 2
            && broker.contents("publicB").len() == 2)
        .await
    );
    assert_eq!(sorted(broker.contents("publicA")), expected);
    assert_eq!(sorted(broker.contents("publicB")), expected);

    pipeline.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn scenario_b_sentinel_leaves_no_trace() {
    let broker = MemoryBroker::new();
    let pipeline = start_in_memory(&test_config(), &broker).await.unwrap();

    let err = pipeline
        .publisher
        .publish(&messages(&["Message 1", "FAIL", "Message 2"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Rollback { position: 1 }));

    // Give the relays time to (not) see anything
    tokio::time::sleep(Duration::from_millis(200)).await;
    for topic in ["stagingA", "stagingB", "publicA", "publicB"] {
        assert!(broker.payloads(topic).is_empty(), "{} is not empty", topic);
    }

    pipeline.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn scenario_c_empty_publish_succeeds() {
    let broker = MemoryBroker::new();
    let pipeline = start_in_memory(&test_config(), &broker).await.unwrap();

    let receipt = pipeline.publisher.publish(&[]).await.unwrap();
    assert_eq!(receipt.published_count, 0);
    assert!(broker.payloads("stagingA").is_empty());

    pipeline.shutdown(WAIT).await.unwrap();
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn staging_topics_keep_input_order() {
    let config = single_partition_config();
    let (broker, publisher) = staging_only(&config).await;
    let input: Vec<String> = (0..20).map(|i| format!("msg-{:02}", i)).collect();

    publisher.publish(&input).await.unwrap();

    assert_eq!(broker.contents("stagingA"), input);
    assert_eq!(broker.contents("stagingB"), input);
}

#[tokio::test]
async fn rollback_after_successful_call_keeps_earlier_call() {
    let config = test_config();
    let (broker, publisher) = staging_only(&config).await;

    publisher.publish(&messages(&["kept"])).await.unwrap();
    publisher
        .publish(&messages(&["dropped", "FAIL"]))
        .await
        .unwrap_err();

    assert_eq!(broker.contents("stagingA"), ["kept"]);
    assert_eq!(broker.contents("stagingB"), ["kept"]);
}

#[tokio::test]
async fn concurrent_publishes_are_each_atomic() {
    let config = test_config();
    let (broker, publisher) = staging_only(&config).await;
    let publisher = Arc::new(publisher);

    let mut handles = Vec::new();
    for call in 0..10 {
        let publisher = publisher.clone();
        handles.push(tokio::spawn(async move {
            let batch: Vec<String> = (0..5).map(|i| format!("call-{}-{}", call, i)).collect();
            publisher.publish(&batch).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(broker.payloads("stagingA").len(), 50);
    assert_eq!(sorted(broker.contents("stagingA")), sorted(broker.contents("stagingB")));
}

#[tokio::test]
async fn relay_preserves_order_and_bytes() {
    let config = single_partition_config();
    let (broker, publisher) = staging_only(&config).await;
    let input: Vec<String> = (0..25).map(|i| format!("ordered-{:02}", i)).collect();
    publisher.publish(&input).await.unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(relay_a(&broker, &config, "relay-a").run(shutdown.clone()));

    assert!(eventually(WAIT, || broker.payloads("publicA").len() == 25).await);
    shutdown.store(true, Ordering::SeqCst);
    within(handle).await.unwrap().unwrap();

    assert_eq!(broker.payloads("publicA"), broker.payloads("stagingA"));
    assert_eq!(broker.contents("publicA"), input);
    assert_eq!(broker.committed_offset(&config.kafka.consumer_group, "stagingA", 0), Some(25));
}

#[tokio::test]
async fn relay_commit_failures_do_not_duplicate() {
    let config = test_config();
    let (broker, publisher) = staging_only(&config).await;
    let input: Vec<String> = (0..9).map(|i| format!("retry-{}", i)).collect();
    publisher.publish(&input).await.unwrap();

    // Staging is committed; only the relay sees these failures
    broker.fail_next_commits(3);
    broker.fail_next_sends(2);

    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(relay_a(&broker, &config, "relay-a").run(shutdown.clone()));

    assert!(eventually(WAIT, || broker.payloads("publicA").len() >= 9).await);
    // A duplicate would show up shortly after
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.store(true, Ordering::SeqCst);
    let stats = within(handle).await.unwrap().unwrap();

    assert_eq!(sorted(broker.contents("publicA")), sorted(input));
    assert_eq!(stats.committed, 9);
    assert_eq!(stats.aborted, 5);
}

#[tokio::test]
async fn restarted_relay_fences_its_predecessor() {
    let config = single_partition_config();
    let (broker, publisher) = staging_only(&config).await;
    publisher.publish(&messages(&["only-once"])).await.unwrap();
    let transactional_id = relay_transactional_id(&config, "stagingA");

    // The first incarnation writes to publicA and dies before committing
    let crashed = {
        let producer = broker.transactional_producer(transactional_id.clone());
        let consumer = broker.consumer(config.kafka.consumer_group.clone(), "stagingA");
        let record = consumer.poll(WAIT).await.unwrap().unwrap();

        producer.begin_transaction().await.unwrap();
        producer.send("publicA", &record.payload).await.unwrap();
        producer
            .send_offsets_to_transaction(
                &[record.offset_commit()],
                consumer.group_metadata().unwrap(),
            )
            .await
            .unwrap();
        producer
    };
    assert!(broker.payloads("publicA").is_empty());

    // Restart with the same transactional.id
    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(relay_a(&broker, &config, &transactional_id).run(shutdown.clone()));

    assert!(eventually(WAIT, || !broker.payloads("publicA").is_empty()).await);

    // The zombie cannot finish its transaction
    let err = crashed.commit_transaction().await.unwrap_err();
    assert!(err.is_fatal());

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.store(true, Ordering::SeqCst);
    within(handle).await.unwrap().unwrap();

    assert_eq!(broker.contents("publicA"), ["only-once"]);
}

#[tokio::test]
async fn rebalance_between_relays_is_exactly_once() {
    let config = test_config();
    let (broker, publisher) = staging_only(&config).await;

    let pod0_stop = Arc::new(AtomicBool::new(false));
    let pod1_stop = Arc::new(AtomicBool::new(false));
    let pod0 = tokio::spawn(relay_a(&broker, &config, "relay-stagingA-0").run(pod0_stop.clone()));
    let pod1 = tokio::spawn(relay_a(&broker, &config, "relay-stagingA-1").run(pod1_stop.clone()));

    let first: Vec<String> = (0..30).map(|i| format!("first-{}", i)).collect();
    publisher.publish(&first).await.unwrap();
    assert!(eventually(WAIT, || broker.payloads("publicA").len() >= 30).await);

    // pod 1 leaves the group; pod 0 takes over its partitions
    pod1_stop.store(true, Ordering::SeqCst);
    within(pod1).await.unwrap().unwrap();

    let second: Vec<String> = (0..30).map(|i| format!("second-{}", i)).collect();
    publisher.publish(&second).await.unwrap();
    assert!(eventually(WAIT, || broker.payloads("publicA").len() >= 60).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    pod0_stop.store(true, Ordering::SeqCst);
    within(pod0).await.unwrap().unwrap();

    let relayed = broker.contents("publicA");
    let unique: HashSet<&String> = relayed.iter().collect();
    assert_eq!(relayed.len(), 60);
    assert_eq!(unique.len(), 60);
}

#[tokio::test]
async fn aborted_publish_is_never_relayed() {
    let broker = MemoryBroker::new();
    let pipeline = start_in_memory(&test_config(), &broker).await.unwrap();

    broker.fail_next_commits(1);
    let err = pipeline
        .publisher
        .publish(&messages(&["lost"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Broker(_)));

    pipeline
        .publisher
        .publish(&messages(&["delivered"]))
        .await
        .unwrap();

    assert!(eventually(WAIT, || broker.contents("publicB").len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.contents("publicA"), ["delivered"]);
    assert_eq!(broker.contents("publicB"), ["delivered"]);

    pipeline.shutdown(WAIT).await.unwrap();
}

#[test]
fn public_records_are_valid_payloads() {
    let bytes = Payload::new("Message 1").to_bytes().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(json["content"], "Message 1");
    assert!(json["timestamp"].is_i64());
}
