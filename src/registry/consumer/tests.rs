use std::sync::Arc;
use std::time::Duration;

use super::adapter::BufferHandler;
use super::*;
use crate::broker::{ConsumeOutcome, InMemoryBroker, MessageHandler, MessageView};

fn spec(topic: &str, group: &str) -> ConsumerSpec {
    ConsumerSpec {
        endpoint: "127.0.0.1:9876".into(),
        access_key_id: "k".into(),
        access_key_secret: "s".into(),
        instance_id: "i1".into(),
        topic: topic.into(),
        group_id: group.into(),
        tag_expression: "*".into(),
    }
}

fn registry_with(
    settings: ConsumerRegistrySettings,
) -> (ConsumerRegistry, InMemoryBroker, Arc<ProxyMetrics>) {
    let broker = InMemoryBroker::new();
    let metrics = Arc::new(ProxyMetrics::new());
    let registry = ConsumerRegistry::new(Arc::new(broker.clone()), Arc::clone(&metrics), settings);
    (registry, broker, metrics)
}

fn registry() -> (ConsumerRegistry, InMemoryBroker, Arc<ProxyMetrics>) {
    registry_with(ConsumerRegistrySettings::default())
}

fn view(id: &str) -> MessageView {
    MessageView {
        message_id: id.into(),
        topic: "T".into(),
        body: b"body".to_vec(),
        tag: "tagA".into(),
        properties: Default::default(),
        born_timestamp: 1,
        reconsume_times: 0,
    }
}

#[tokio::test]
async fn test_create_fresh() {
    let (registry, broker, metrics) = registry();

    let outcome = registry.create(&spec("T", "G")).await.unwrap();
    assert!(!outcome.reused);
    assert_eq!(outcome.refs, 1);
    assert_eq!(broker.consumers_started(), 1);
    assert_eq!(metrics.active_consumers(), 1);

    let record = registry.get(outcome.handle).await.unwrap();
    assert_eq!(record.group_id, "G");
    assert_eq!(record.topics(), vec!["T".to_string()]);
}

#[tokio::test]
async fn test_topic_growth_is_idempotent() {
    let (registry, broker, _) = registry();

    let first = registry.create(&spec("T1", "G")).await.unwrap();
    let second = registry.create(&spec("T2", "G")).await.unwrap();
    let third = registry.create(&spec("T1", "G")).await.unwrap();

    assert!(second.reused);
    assert!(third.reused);
    assert_eq!(third.refs, 3);
    assert_eq!(broker.consumers_started(), 1);

    let record = registry.get(first.handle).await.unwrap();
    assert_eq!(record.topics(), vec!["T1".to_string(), "T2".to_string()]);
    assert_eq!(record.refs(), 3);

    // Every handle aliases the same record and shares the buffer.
    let r2 = registry.get(second.handle).await.unwrap();
    assert!(Arc::ptr_eq(&record, &r2));
}

#[tokio::test]
async fn test_different_groups_are_isolated() {
    let (registry, broker, _) = registry();
    registry.create(&spec("T", "G1")).await.unwrap();
    registry.create(&spec("T", "G2")).await.unwrap();
    assert_eq!(broker.consumers_started(), 2);
    assert_eq!(registry.canonical_count().await, 2);
}

#[tokio::test]
async fn test_stale_canonical_is_replaced() {
    let settings = ConsumerRegistrySettings {
        reuse_threshold: Duration::from_millis(5),
        ..Default::default()
    };
    let (registry, broker, metrics) = registry_with(settings);

    let first = registry.create(&spec("T", "G")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = registry.create(&spec("T", "G")).await.unwrap();
    assert!(!second.reused);
    assert_eq!(broker.consumers_started(), 2);
    assert_eq!(broker.consumers_shutdown(), 1);
    assert_eq!(metrics.active_consumers(), 1);

    // The stale record's handle is gone along with its canonical entry.
    assert!(registry.get(first.handle).await.is_none());
    assert_eq!(registry.handle_count().await, 1);
    assert_eq!(registry.canonical_count().await, 1);
}

#[tokio::test]
async fn test_subscription_add_failure_falls_through_to_fresh_consumer() {
    let (registry, broker, _) = registry();

    let first = registry.create(&spec("T1", "G")).await.unwrap();

    // Only the subscription add on the running consumer fails; the fresh
    // consumer built afterwards subscribes cleanly.
    broker.set_fail_subscribe_times(1);
    let second = registry.create(&spec("T2", "G")).await.unwrap();
    assert!(!second.reused);
    assert_eq!(broker.consumers_started(), 2);

    // The running consumer kept its state.
    let old = registry.get(first.handle).await.unwrap();
    assert_eq!(old.topics(), vec!["T1".to_string()]);
    assert_eq!(old.refs(), 1);

    // The canonical entry now names the fresh consumer.
    let third = registry.create(&spec("T2", "G")).await.unwrap();
    assert!(third.reused);
    let fresh = registry.get(second.handle).await.unwrap();
    assert_eq!(fresh.refs(), 2);
}

#[tokio::test]
async fn test_create_failure_registers_nothing() {
    let (registry, broker, metrics) = registry();

    broker.set_fail_consumer_create(true);
    assert!(registry.create(&spec("T", "G")).await.is_err());
    broker.set_fail_consumer_create(false);

    broker.set_fail_subscribe_times(1);
    assert!(registry.create(&spec("T", "G")).await.is_err());

    broker.set_fail_consumer_start(true);
    assert!(registry.create(&spec("T", "G")).await.is_err());
    broker.set_fail_consumer_start(false);

    assert_eq!(registry.handle_count().await, 0);
    assert_eq!(registry.canonical_count().await, 0);
    assert_eq!(metrics.active_consumers(), 0);
}

#[tokio::test]
async fn test_release_tears_down_at_zero() {
    let (registry, broker, metrics) = registry();

    let first = registry.create(&spec("T1", "G")).await.unwrap();
    let second = registry.create(&spec("T2", "G")).await.unwrap();
    let record = registry.get(first.handle).await.unwrap();

    registry.release(first.handle).await.unwrap();
    assert_eq!(broker.consumers_shutdown(), 0);
    assert!(!record.cancel_token().is_cancelled());

    registry.release(second.handle).await.unwrap();
    assert_eq!(broker.consumers_shutdown(), 1);
    assert_eq!(metrics.active_consumers(), 0);
    assert!(record.cancel_token().is_cancelled());
    assert_eq!(registry.handle_count().await, 0);
    assert_eq!(registry.canonical_count().await, 0);

    // Buffer closed: the callback path can no longer push.
    let err = record.buffer_sender().try_send(Message::default());
    assert!(err.is_err());
}

#[tokio::test]
async fn test_release_repoints_canonical_to_surviving_alias() {
    let (registry, broker, _) = registry();

    let first = registry.create(&spec("T", "G")).await.unwrap();
    let _second = registry.create(&spec("T", "G")).await.unwrap();
    registry.release(first.handle).await.unwrap();

    let third = registry.create(&spec("T", "G")).await.unwrap();
    assert!(third.reused);
    assert_eq!(broker.consumers_started(), 1);
}

#[tokio::test]
async fn test_sweep_releases_idle_consumers() {
    let (registry, broker, _) = registry();
    registry.create(&spec("T", "G")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.sweep(Duration::from_millis(1)).await, 1);
    assert_eq!(registry.handle_count().await, 0);
    assert_eq!(broker.consumers_shutdown(), 1);
}

#[tokio::test]
async fn test_shutdown_all_shuts_each_broker_consumer_once() {
    let (registry, broker, metrics) = registry();

    // Five handles over two broker consumers.
    registry.create(&spec("T1", "G1")).await.unwrap();
    registry.create(&spec("T2", "G1")).await.unwrap();
    registry.create(&spec("T3", "G1")).await.unwrap();
    registry.create(&spec("T1", "G2")).await.unwrap();
    registry.create(&spec("T2", "G2")).await.unwrap();
    assert_eq!(registry.handle_count().await, 5);

    let count = registry.shutdown_all().await;
    assert_eq!(count, 2);
    assert_eq!(broker.consumers_shutdown(), 2);
    assert_eq!(registry.handle_count().await, 0);
    assert_eq!(registry.canonical_count().await, 0);
    assert_eq!(metrics.active_consumers(), 0);
}

#[tokio::test]
async fn test_collect_matches() {
    let (registry, _, _) = registry();
    let a = registry.create(&spec("T1", "G1")).await.unwrap();
    let b = registry.create(&spec("T2", "G1")).await.unwrap();
    let _c = registry.create(&spec("T1", "G2")).await.unwrap();

    let by_id = registry.collect_matches(Some(a.handle), "", "").await;
    assert_eq!(by_id, vec![a.handle]);

    let mut by_group = registry.collect_matches(None, "G1", "").await;
    by_group.sort();
    let mut expected = vec![a.handle, b.handle];
    expected.sort();
    assert_eq!(by_group, expected);

    // Topic filter matches against the record's whole topic set, so both
    // aliases of the G1 consumer match either topic.
    let by_topic = registry.collect_matches(None, "G1", "T2").await;
    assert_eq!(by_topic.len(), 2);

    assert!(registry.collect_matches(None, "G1", "T9").await.is_empty());
    assert!(registry.collect_matches(None, "", "").await.is_empty());
}

// ---------------------------------------------------------------------------
// Callback adapter
// ---------------------------------------------------------------------------

fn adapter(
    capacity: usize,
    push_timeout: Duration,
) -> (
    BufferHandler,
    mpsc::Receiver<Message>,
    CancellationToken,
    Arc<ProxyMetrics>,
) {
    let (tx, rx) = mpsc::channel(capacity);
    let cancel = CancellationToken::new();
    let metrics = Arc::new(ProxyMetrics::new());
    let handler = BufferHandler::new(tx, cancel.clone(), Arc::clone(&metrics), push_timeout);
    (handler, rx, cancel, metrics)
}

#[tokio::test]
async fn test_adapter_pushes_batch_in_order() {
    let (handler, mut rx, _cancel, metrics) = adapter(8, Duration::from_secs(5));

    let outcome = handler.handle(vec![view("m1"), view("m2")]).await;
    assert_eq!(outcome, ConsumeOutcome::Success);
    assert_eq!(metrics.messages_received(), 2);

    assert_eq!(rx.recv().await.unwrap().message_id, "m1");
    let second = rx.recv().await.unwrap();
    assert_eq!(second.message_id, "m2");
    assert_eq!(second.receipt_handle, "m2");
    assert_eq!(second.message_body, b"body");
}

#[tokio::test]
async fn test_adapter_full_buffer_times_out_as_retry_later() {
    let (handler, _rx, _cancel, metrics) = adapter(1, Duration::from_millis(20));

    assert_eq!(handler.handle(vec![view("m1")]).await, ConsumeOutcome::Success);
    // Buffer is full and nobody drains it: the push deadline elapses.
    assert_eq!(
        handler.handle(vec![view("m2")]).await,
        ConsumeOutcome::RetryLater
    );
    assert_eq!(metrics.channel_full_events(), 1);
}

#[tokio::test]
async fn test_adapter_cancellation_defers_without_full_event() {
    let (handler, _rx, cancel, metrics) = adapter(1, Duration::from_secs(5));

    assert_eq!(handler.handle(vec![view("m1")]).await, ConsumeOutcome::Success);
    cancel.cancel();
    assert_eq!(
        handler.handle(vec![view("m2")]).await,
        ConsumeOutcome::RetryLater
    );
    assert_eq!(metrics.channel_full_events(), 0);
}

#[tokio::test]
async fn test_adapter_closed_buffer_defers() {
    let (handler, mut rx, _cancel, metrics) = adapter(4, Duration::from_secs(5));
    rx.close();

    assert_eq!(
        handler.handle(vec![view("m1")]).await,
        ConsumeOutcome::RetryLater
    );
    assert_eq!(metrics.channel_full_events(), 0);
}
