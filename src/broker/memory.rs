//! In-memory broker for standalone mode.
//!
//! Routes messages between producers and consumer groups within a single
//! process. Ideal for local development and testing without an external
//! broker. Delivery is FIFO per group; `RetryLater` outcomes are redelivered
//! with an incremented reconsume count until the configured maximum.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    BrokerConnector, BrokerConsumer, BrokerError, BrokerProducer, ConsumerSettings, MessageHandler,
    MessageView, OutboundMessage, ProducerSettings, Result, SendReceipt,
};

/// Default pause before a `RetryLater` message is redelivered.
const REDELIVER_DELAY: Duration = Duration::from_millis(250);

/// Tag filter compiled from a subscription expression.
///
/// `*` and the empty expression match everything; otherwise the expression
/// is a `||`-separated list of accepted tags.
#[derive(Debug, Clone)]
enum TagFilter {
    All,
    Tags(HashSet<String>),
}

impl TagFilter {
    fn parse(expression: &str) -> Self {
        let expression = expression.trim();
        if expression.is_empty() || expression == "*" {
            return TagFilter::All;
        }
        TagFilter::Tags(
            expression
                .split("||")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    fn matches(&self, tag: &str) -> bool {
        match self {
            TagFilter::All => true,
            TagFilter::Tags(tags) => tags.contains(tag),
        }
    }
}

struct SubscriptionEntry {
    topic: String,
    filter: TagFilter,
    handler: Arc<dyn MessageHandler>,
}

/// Routing entry for one consumer group.
struct GroupRoute {
    owner: Uuid,
    inbox: mpsc::UnboundedSender<MessageView>,
    subscriptions: Arc<std::sync::RwLock<Vec<SubscriptionEntry>>>,
}

/// Shared state between the connector and every producer/consumer it built.
#[derive(Default)]
struct BrokerCore {
    groups: RwLock<HashMap<String, GroupRoute>>,

    producers_started: AtomicUsize,
    producers_shutdown: AtomicUsize,
    consumers_started: AtomicUsize,
    consumers_shutdown: AtomicUsize,

    fail_producer_create: AtomicBool,
    fail_producer_start: AtomicBool,
    fail_consumer_create: AtomicBool,
    fail_subscribe_times: AtomicI32,
    fail_consumer_start: AtomicBool,
}

/// In-process broker backing standalone mode and tests.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    core: Arc<BrokerCore>,
    redeliver_delay: Option<Duration>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the redelivery pause, for tests exercising retry paths.
    pub fn with_redeliver_delay(delay: Duration) -> Self {
        Self {
            core: Arc::default(),
            redeliver_delay: Some(delay),
        }
    }

    pub fn producers_started(&self) -> usize {
        self.core.producers_started.load(Ordering::SeqCst)
    }

    pub fn producers_shutdown(&self) -> usize {
        self.core.producers_shutdown.load(Ordering::SeqCst)
    }

    pub fn consumers_started(&self) -> usize {
        self.core.consumers_started.load(Ordering::SeqCst)
    }

    pub fn consumers_shutdown(&self) -> usize {
        self.core.consumers_shutdown.load(Ordering::SeqCst)
    }

    pub fn set_fail_producer_create(&self, fail: bool) {
        self.core.fail_producer_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_producer_start(&self, fail: bool) {
        self.core.fail_producer_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_consumer_create(&self, fail: bool) {
        self.core.fail_consumer_create.store(fail, Ordering::SeqCst);
    }

    /// Make the next `times` subscribe calls fail.
    pub fn set_fail_subscribe_times(&self, times: i32) {
        self.core.fail_subscribe_times.store(times, Ordering::SeqCst);
    }

    pub fn set_fail_consumer_start(&self, fail: bool) {
        self.core.fail_consumer_start.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn producer(&self, settings: ProducerSettings) -> Result<Arc<dyn BrokerProducer>> {
        if self.core.fail_producer_create.load(Ordering::SeqCst) {
            return Err(BrokerError::ProducerCreate("injected failure".into()));
        }
        Ok(Arc::new(MemoryProducer {
            core: Arc::clone(&self.core),
            group: settings.group,
            started: AtomicBool::new(false),
        }))
    }

    async fn consumer(&self, settings: ConsumerSettings) -> Result<Arc<dyn BrokerConsumer>> {
        if self.core.fail_consumer_create.load(Ordering::SeqCst) {
            return Err(BrokerError::ConsumerCreate("injected failure".into()));
        }
        let owner = Uuid::new_v4();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(std::sync::RwLock::new(Vec::new()));

        // Route registration replaces any previous consumer of this group;
        // messages routed between now and start() queue in the inbox.
        self.core.groups.write().await.insert(
            settings.group.clone(),
            GroupRoute {
                owner,
                inbox: inbox_tx.clone(),
                subscriptions: Arc::clone(&subscriptions),
            },
        );

        Ok(Arc::new(MemoryConsumer {
            core: Arc::clone(&self.core),
            owner,
            group: settings.group,
            subscriptions,
            inbox_tx,
            inbox_rx: std::sync::Mutex::new(Some(inbox_rx)),
            stop: CancellationToken::new(),
            max_reconsume_times: settings.max_reconsume_times,
            redeliver_delay: self.redeliver_delay.unwrap_or(REDELIVER_DELAY),
        }))
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct MemoryProducer {
    core: Arc<BrokerCore>,
    group: String,
    started: AtomicBool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn start(&self) -> Result<()> {
        if self.core.fail_producer_start.load(Ordering::SeqCst) {
            return Err(BrokerError::ProducerStart("injected failure".into()));
        }
        self.started.store(true, Ordering::SeqCst);
        self.core.producers_started.fetch_add(1, Ordering::SeqCst);
        debug!(group = %self.group, "In-memory producer started");
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(BrokerError::Send("producer not started".into()));
        }

        let mut properties = message.properties.clone();
        if !message.keys.is_empty() {
            properties.insert("KEYS".to_string(), message.keys.join(" "));
        }
        if !message.sharding_key.is_empty() {
            properties.insert("SHARDING_KEY".to_string(), message.sharding_key.clone());
        }

        let view = MessageView {
            message_id: Uuid::new_v4().simple().to_string().to_uppercase(),
            topic: message.topic.clone(),
            body: message.body,
            tag: message.tag.clone(),
            properties,
            born_timestamp: now_millis(),
            reconsume_times: 0,
        };

        let groups = self.core.groups.read().await;
        for (group, route) in groups.iter() {
            let matched = {
                let subs = route.subscriptions.read().expect("subscription lock");
                subs.iter()
                    .any(|s| s.topic == message.topic && s.filter.matches(&message.tag))
            };
            if matched && route.inbox.send(view.clone()).is_err() {
                debug!(group = %group, "Group inbox closed, skipping delivery");
            }
        }

        Ok(SendReceipt {
            message_id: view.message_id,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.core.producers_shutdown.fetch_add(1, Ordering::SeqCst);
        debug!(group = %self.group, "In-memory producer shut down");
        Ok(())
    }
}

struct MemoryConsumer {
    core: Arc<BrokerCore>,
    owner: Uuid,
    group: String,
    subscriptions: Arc<std::sync::RwLock<Vec<SubscriptionEntry>>>,
    inbox_tx: mpsc::UnboundedSender<MessageView>,
    inbox_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<MessageView>>>,
    stop: CancellationToken,
    max_reconsume_times: u32,
    redeliver_delay: Duration,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        tag_expression: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.core.fail_subscribe_times.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(BrokerError::Subscribe("injected failure".into()));
        }
        let mut subs = self.subscriptions.write().expect("subscription lock");
        subs.retain(|s| s.topic != topic);
        subs.push(SubscriptionEntry {
            topic: topic.to_string(),
            filter: TagFilter::parse(tag_expression),
            handler,
        });
        debug!(group = %self.group, topic = %topic, expression = %tag_expression, "Subscription registered");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.core.fail_consumer_start.load(Ordering::SeqCst) {
            return Err(BrokerError::ConsumerStart("injected failure".into()));
        }
        let mut rx = self
            .inbox_rx
            .lock()
            .expect("inbox lock")
            .take()
            .ok_or_else(|| BrokerError::ConsumerStart("consumer already started".into()))?;

        self.core.consumers_started.fetch_add(1, Ordering::SeqCst);

        let this = MemoryConsumerLoop {
            group: self.group.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            inbox_tx: self.inbox_tx.clone(),
            stop: self.stop.clone(),
            max_reconsume_times: self.max_reconsume_times,
            redeliver_delay: self.redeliver_delay,
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.stop.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        Some(view) => this.deliver(view).await,
                        None => break,
                    }
                }
            }
            debug!(group = %this.group, "In-memory delivery loop stopped");
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop.cancel();
        let mut groups = self.core.groups.write().await;
        if groups.get(&self.group).is_some_and(|r| r.owner == self.owner) {
            groups.remove(&self.group);
        }
        drop(groups);
        self.core.consumers_shutdown.fetch_add(1, Ordering::SeqCst);
        debug!(group = %self.group, "In-memory consumer shut down");
        Ok(())
    }
}

/// Owned copy of the consumer state moved into the delivery task.
struct MemoryConsumerLoop {
    group: String,
    subscriptions: Arc<std::sync::RwLock<Vec<SubscriptionEntry>>>,
    inbox_tx: mpsc::UnboundedSender<MessageView>,
    stop: CancellationToken,
    max_reconsume_times: u32,
    redeliver_delay: Duration,
}

impl MemoryConsumerLoop {
    async fn deliver(&self, view: MessageView) {
        let handler = {
            let subs = self.subscriptions.read().expect("subscription lock");
            subs.iter()
                .find(|s| s.topic == view.topic)
                .map(|s| Arc::clone(&s.handler))
        };
        let Some(handler) = handler else {
            warn!(group = %self.group, topic = %view.topic, "No subscription for delivered topic");
            return;
        };

        match handler.handle(vec![view.clone()]).await {
            super::ConsumeOutcome::Success => {}
            super::ConsumeOutcome::RetryLater => {
                if (view.reconsume_times as u32) < self.max_reconsume_times {
                    let inbox = self.inbox_tx.clone();
                    let delay = self.redeliver_delay;
                    let mut redelivery = view;
                    redelivery.reconsume_times += 1;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inbox.send(redelivery);
                    });
                } else {
                    warn!(
                        group = %self.group,
                        message_id = %view.message_id,
                        reconsume_times = view.reconsume_times,
                        "Dropping message after max reconsume attempts"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConsumeOutcome, Credentials};
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex;

    fn producer_settings() -> ProducerSettings {
        ProducerSettings {
            endpoint: "127.0.0.1:9876".into(),
            credentials: Credentials::default(),
            group: "test_producer_group".into(),
            retry_times: 2,
        }
    }

    fn consumer_settings(group: &str) -> ConsumerSettings {
        ConsumerSettings {
            endpoint: "127.0.0.1:9876".into(),
            credentials: Credentials::default(),
            group: group.into(),
            consume_from: crate::broker::ConsumeFrom::LastOffset,
            model: crate::broker::ConsumeModel::Clustering,
            pull_timeout: Duration::from_secs(5),
            pull_interval: Duration::from_secs(1),
            max_reconsume_times: 3,
            batch_max_size: 32,
        }
    }

    /// Collects delivered messages; optionally defers the first N batches.
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<MessageView>>>,
        defer_remaining: Arc<AtomicI32>,
    }

    impl RecordingHandler {
        fn new() -> (Self, Arc<Mutex<Vec<MessageView>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    seen: Arc::clone(&seen),
                    defer_remaining: Arc::new(AtomicI32::new(0)),
                },
                seen,
            )
        }

        fn deferring(n: i32) -> (Self, Arc<Mutex<Vec<MessageView>>>) {
            let (handler, seen) = Self::new();
            handler.defer_remaining.store(n, Ordering::SeqCst);
            (handler, seen)
        }
    }

    impl MessageHandler for RecordingHandler {
        fn handle(&self, batch: Vec<MessageView>) -> BoxFuture<'static, ConsumeOutcome> {
            let seen = Arc::clone(&self.seen);
            let defer = Arc::clone(&self.defer_remaining);
            Box::pin(async move {
                if defer.fetch_sub(1, Ordering::SeqCst) > 0 {
                    return ConsumeOutcome::RetryLater;
                }
                seen.lock().unwrap().extend(batch);
                ConsumeOutcome::Success
            })
        }
    }

    #[test]
    fn test_tag_filter_parse() {
        assert!(TagFilter::parse("*").matches("anything"));
        assert!(TagFilter::parse("").matches("anything"));
        assert!(TagFilter::parse("tagA").matches("tagA"));
        assert!(!TagFilter::parse("tagA").matches("tagB"));
        assert!(TagFilter::parse("tagA || tagB").matches("tagB"));
        assert!(!TagFilter::parse("tagA || tagB").matches("tagC"));
    }

    #[tokio::test]
    async fn test_route_to_matching_group() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer(consumer_settings("g1")).await.unwrap();
        let (handler, seen) = RecordingHandler::new();
        consumer
            .subscribe("T1", "*", Arc::new(handler))
            .await
            .unwrap();
        consumer.start().await.unwrap();

        let producer = broker.producer(producer_settings()).await.unwrap();
        producer.start().await.unwrap();
        producer
            .send(OutboundMessage {
                topic: "T1".into(),
                body: b"hello".to_vec(),
                tag: "tagA".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = seen.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body, b"hello");
        assert_eq!(delivered[0].tag, "tagA");
        assert_eq!(delivered[0].reconsume_times, 0);
    }

    #[tokio::test]
    async fn test_tag_filter_drops_unmatched() {
        let broker = InMemoryBroker::new();
        let consumer = broker.consumer(consumer_settings("g1")).await.unwrap();
        let (handler, seen) = RecordingHandler::new();
        consumer
            .subscribe("T1", "tagA", Arc::new(handler))
            .await
            .unwrap();
        consumer.start().await.unwrap();

        let producer = broker.producer(producer_settings()).await.unwrap();
        producer.start().await.unwrap();
        for tag in ["tagA", "tagB"] {
            producer
                .send(OutboundMessage {
                    topic: "T1".into(),
                    body: tag.as_bytes().to_vec(),
                    tag: tag.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = seen.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].tag, "tagA");
    }

    #[tokio::test]
    async fn test_retry_later_redelivers_with_incremented_count() {
        let broker = InMemoryBroker::with_redeliver_delay(Duration::from_millis(10));
        let consumer = broker.consumer(consumer_settings("g1")).await.unwrap();
        let (handler, seen) = RecordingHandler::deferring(2);
        consumer
            .subscribe("T1", "*", Arc::new(handler))
            .await
            .unwrap();
        consumer.start().await.unwrap();

        let producer = broker.producer(producer_settings()).await.unwrap();
        producer.start().await.unwrap();
        producer
            .send(OutboundMessage {
                topic: "T1".into(),
                body: b"retry me".to_vec(),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let delivered = seen.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].reconsume_times, 2);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let broker = InMemoryBroker::new();
        let producer = broker.producer(producer_settings()).await.unwrap();
        let err = producer
            .send(OutboundMessage {
                topic: "T1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Send(_)));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let broker = InMemoryBroker::new();

        broker.set_fail_producer_create(true);
        assert!(broker.producer(producer_settings()).await.is_err());
        broker.set_fail_producer_create(false);

        broker.set_fail_producer_start(true);
        let producer = broker.producer(producer_settings()).await.unwrap();
        assert!(producer.start().await.is_err());
        broker.set_fail_producer_start(false);

        broker.set_fail_subscribe_times(1);
        let consumer = broker.consumer(consumer_settings("g1")).await.unwrap();
        let (handler, _) = RecordingHandler::new();
        assert!(consumer
            .subscribe("T1", "*", Arc::new(handler))
            .await
            .is_err());
        // The injected failure is consumed; the retry succeeds.
        let (handler, _) = RecordingHandler::new();
        assert!(consumer
            .subscribe("T1", "*", Arc::new(handler))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_counters() {
        let broker = InMemoryBroker::new();
        let producer = broker.producer(producer_settings()).await.unwrap();
        producer.start().await.unwrap();
        producer.shutdown().await.unwrap();

        let consumer = broker.consumer(consumer_settings("g1")).await.unwrap();
        let (handler, _) = RecordingHandler::new();
        consumer
            .subscribe("T1", "*", Arc::new(handler))
            .await
            .unwrap();
        consumer.start().await.unwrap();
        consumer.shutdown().await.unwrap();

        assert_eq!(broker.producers_started(), 1);
        assert_eq!(broker.producers_shutdown(), 1);
        assert_eq!(broker.consumers_started(), 1);
        assert_eq!(broker.consumers_shutdown(), 1);
    }
}
