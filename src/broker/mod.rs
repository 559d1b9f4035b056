//! Broker client seam.
//!
//! This module contains:
//! - `BrokerConnector` trait: constructs broker-facing producers/consumers
//! - `BrokerProducer` / `BrokerConsumer` traits: the SDK surface the proxy uses
//! - `MessageHandler` trait: push-mode delivery callback
//! - Message and settings types shared across implementations
//!
//! The registries talk to the broker only through these traits; the
//! in-process implementation backs standalone mode and tests, and an
//! SDK-backed connector plugs in behind the same seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub mod memory;

pub use memory::InMemoryBroker;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to create producer: {0}")]
    ProducerCreate(String),

    #[error("Failed to start producer: {0}")]
    ProducerStart(String),

    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Failed to create consumer: {0}")]
    ConsumerCreate(String),

    #[error("Failed to subscribe topic: {0}")]
    Subscribe(String),

    #[error("Failed to start consumer: {0}")]
    ConsumerStart(String),

    #[error("Failed to shut down: {0}")]
    Shutdown(String),
}

/// Credentials passed through to the broker unchanged.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// Construction parameters for a broker producer.
///
/// The endpoint is resolved pass-through: the string is handed to the broker
/// verbatim, with no name-server lookup in the proxy.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub endpoint: String,
    pub credentials: Credentials,
    /// Synthesized group name, unique per broker producer instance.
    pub group: String,
    pub retry_times: u32,
}

/// Offset from which a fresh consumer group starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumeFrom {
    #[default]
    LastOffset,
    FirstOffset,
}

/// Message distribution model within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumeModel {
    /// Each message goes to one consumer in the group.
    #[default]
    Clustering,
    /// Each message goes to every consumer in the group.
    Broadcasting,
}

/// Construction parameters for a broker push consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub endpoint: String,
    pub credentials: Credentials,
    /// Caller-supplied group name, used verbatim so predefined groups work.
    pub group: String,
    pub consume_from: ConsumeFrom,
    pub model: ConsumeModel,
    pub pull_timeout: Duration,
    pub pull_interval: Duration,
    pub max_reconsume_times: u32,
    pub batch_max_size: usize,
}

/// Message handed to a producer for publication.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub tag: String,
    pub keys: Vec<String>,
    pub sharding_key: String,
    /// Broker-native delay level, 1..=18; 0 means unset.
    pub delay_level: i32,
    pub properties: HashMap<String, String>,
}

/// Receipt returned by a successful send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Message delivered by the broker to a consumer callback.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub message_id: String,
    pub topic: String,
    pub body: Vec<u8>,
    pub tag: String,
    pub properties: HashMap<String, String>,
    pub born_timestamp: i64,
    pub reconsume_times: i32,
}

/// Outcome of handling a delivered batch.
///
/// `RetryLater` leaves the messages in broker storage for redelivery; the
/// proxy uses it as its backpressure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Success,
    RetryLater,
}

/// Push-mode delivery callback registered per subscription.
pub trait MessageHandler: Send + Sync {
    /// Process a delivered batch. The returned outcome acknowledges (or
    /// defers) the whole batch.
    fn handle(&self, batch: Vec<MessageView>) -> BoxFuture<'static, ConsumeOutcome>;
}

/// Broker-facing producer.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Start the producer. Must be called once before `send`.
    async fn start(&self) -> Result<()>;

    /// Synchronous send; returns once the broker acknowledges the message.
    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt>;

    /// Release broker-side resources. Idempotence is not required of
    /// implementations; callers guarantee exactly one invocation.
    async fn shutdown(&self) -> Result<()>;
}

/// Broker-facing push consumer.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Register a subscription. May be called again after `start` to grow
    /// the topic set of a running consumer.
    async fn subscribe(
        &self,
        topic: &str,
        tag_expression: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Start message delivery.
    async fn start(&self) -> Result<()>;

    /// Stop delivery and release broker-side resources.
    async fn shutdown(&self) -> Result<()>;
}

/// Factory for broker producers and consumers.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Construct (but do not start) a producer.
    async fn producer(&self, settings: ProducerSettings) -> Result<Arc<dyn BrokerProducer>>;

    /// Construct (but do not start) a push consumer.
    async fn consumer(&self, settings: ConsumerSettings) -> Result<Arc<dyn BrokerConsumer>>;
}
