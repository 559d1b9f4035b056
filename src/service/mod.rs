//! gRPC service façade.
//!
//! Implements the `RocketMqProxy` contract by composing the registries:
//! create paths go through canonical-key sharing, send paths resolve and
//! touch a producer handle, `ReceiveMessages` hands the consumer's buffer
//! to a stream pump, and the cleanup RPCs resolve candidates under the
//! registry lock and release them outside it.
//!
//! Failure policy: unknown handles are gRPC `NotFound`; broker failures are
//! reported in-band (`success = false` plus the broker error text) and
//! never fail the RPC.

mod stream;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::OutboundMessage;
use crate::metrics::ProxyMetrics;
use crate::proto::rocket_mq_proxy_server::RocketMqProxy;
use crate::proto::{
    AckMessageRequest, AckMessageResponse, CleanupConsumerRequest, CleanupConsumerResponse,
    CleanupProducerRequest, CleanupProducerResponse, CreateConsumerRequest,
    CreateConsumerResponse, CreateProducerRequest, CreateProducerResponse, HealthCheckRequest,
    HealthCheckResponse, Message, MessageProperties, ReceiveMessagesRequest, SendMessageRequest,
    SendMessageResponse, SendOrderedMessageRequest, SendTransactionMessageRequest,
    SendTransactionMessageResponse,
};
use crate::proto::SendDelayMessageRequest;
use crate::registry::producer::ProducerRecord;
use crate::registry::{now_millis, now_nanos, ConsumerSpec, ProducerSpec};
use crate::{ConsumerRegistry, ProducerRegistry};

/// Broker property carrying an absolute epoch-millisecond delivery time.
const START_DELIVER_TIME_PROPERTY: &str = "__STARTDELIVERTIME";

/// Highest broker-native delay level.
const MAX_DELAY_LEVEL: i32 = 18;

/// The proxy's gRPC service.
pub struct ProxyService {
    producers: Arc<ProducerRegistry>,
    consumers: Arc<ConsumerRegistry>,
    metrics: Arc<ProxyMetrics>,
}

impl ProxyService {
    pub fn new(
        producers: Arc<ProducerRegistry>,
        consumers: Arc<ConsumerRegistry>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            producers,
            consumers,
            metrics,
        }
    }

    pub fn producers(&self) -> &Arc<ProducerRegistry> {
        &self.producers
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        &self.consumers
    }

    /// Shutdown cascade: every broker producer, then every broker consumer,
    /// each exactly once. Run by the signal handler before the server stops.
    pub async fn shutdown_all(&self) {
        info!("Cleaning up all broker resources");
        self.producers.shutdown_all().await;
        self.consumers.shutdown_all().await;
        info!("All broker resources cleaned up");
    }

    async fn resolve_producer(&self, producer_id: &str) -> Result<Arc<ProducerRecord>, Status> {
        let handle = Uuid::parse_str(producer_id)
            .map_err(|_| Status::not_found("Producer not found"))?;
        let record = self
            .producers
            .get(handle)
            .await
            .ok_or_else(|| Status::not_found("Producer not found"))?;
        record.touch();
        Ok(record)
    }

    async fn send_through(
        &self,
        record: &ProducerRecord,
        message: OutboundMessage,
        kind: &str,
    ) -> SendMessageResponse {
        match record.send(message).await {
            Ok(receipt) => {
                self.metrics.inc_messages_sent();
                SendMessageResponse {
                    success: true,
                    message: format!("{kind} sent successfully"),
                    receipt_handle: receipt.message_id.clone(),
                    message_id: receipt.message_id,
                }
            }
            Err(e) => {
                self.metrics.inc_error_count();
                SendMessageResponse {
                    success: false,
                    message: e.to_string(),
                    ..Default::default()
                }
            }
        }
    }
}

/// Apply the property fields every send variant honours: custom properties
/// and the message key.
fn apply_common_properties(message: &mut OutboundMessage, props: &MessageProperties) {
    for (k, v) in &props.properties {
        message.properties.insert(k.clone(), v.clone());
    }
    if !props.message_key.is_empty() {
        message.keys.push(props.message_key.clone());
    }
}

#[tonic::async_trait]
impl RocketMqProxy for ProxyService {
    async fn create_producer(
        &self,
        request: Request<CreateProducerRequest>,
    ) -> Result<Response<CreateProducerResponse>, Status> {
        let req = request.into_inner();
        info!(
            topic = %req.topic,
            instance_id = %req.instance_id,
            endpoint = %req.endpoint,
            "Creating producer"
        );

        let spec = ProducerSpec {
            endpoint: req.endpoint,
            access_key_id: req.access_key_id,
            access_key_secret: req.access_key_secret,
            instance_id: req.instance_id,
            topic: req.topic,
        };

        match self.producers.create(&spec).await {
            Ok(outcome) => Ok(Response::new(CreateProducerResponse {
                success: true,
                message: if outcome.reused {
                    format!("Producer reused (ref: {})", outcome.refs)
                } else {
                    "Producer created successfully".to_string()
                },
                producer_id: outcome.handle.to_string(),
            })),
            Err(e) => {
                self.metrics.inc_error_count();
                Ok(Response::new(CreateProducerResponse {
                    success: false,
                    message: e.to_string(),
                    producer_id: String::new(),
                }))
            }
        }
    }

    async fn send_message(
        &self,
        request: Request<SendMessageRequest>,
    ) -> Result<Response<SendMessageResponse>, Status> {
        let req = request.into_inner();
        let record = self.resolve_producer(&req.producer_id).await?;
        debug!(producer_id = %req.producer_id, "Sending message");

        let mut message = OutboundMessage {
            topic: record.topic.clone(),
            body: req.message_body,
            tag: req.tag,
            ..Default::default()
        };
        if let Some(props) = req.properties.as_ref() {
            apply_common_properties(&mut message, props);
            if !props.sharding_key.is_empty() {
                message.sharding_key = props.sharding_key.clone();
            }
            if props.start_deliver_time > 0 {
                message.properties.insert(
                    START_DELIVER_TIME_PROPERTY.to_string(),
                    props.start_deliver_time.to_string(),
                );
                debug!(
                    start_deliver_time = props.start_deliver_time,
                    "Using arbitrary precision delay"
                );
            }
        }

        Ok(Response::new(
            self.send_through(&record, message, "Message").await,
        ))
    }

    async fn send_ordered_message(
        &self,
        request: Request<SendOrderedMessageRequest>,
    ) -> Result<Response<SendMessageResponse>, Status> {
        let req = request.into_inner();
        if req.sharding_key.is_empty() {
            return Err(Status::invalid_argument(
                "sharding_key is required for ordered messages",
            ));
        }
        let record = self.resolve_producer(&req.producer_id).await?;
        debug!(
            producer_id = %req.producer_id,
            sharding_key = %req.sharding_key,
            "Sending ordered message"
        );

        let mut message = OutboundMessage {
            topic: record.topic.clone(),
            body: req.message_body,
            tag: req.tag,
            sharding_key: req.sharding_key,
            ..Default::default()
        };
        if let Some(props) = req.properties.as_ref() {
            apply_common_properties(&mut message, props);
        }

        Ok(Response::new(
            self.send_through(&record, message, "Ordered message").await,
        ))
    }

    async fn send_delay_message(
        &self,
        request: Request<SendDelayMessageRequest>,
    ) -> Result<Response<SendMessageResponse>, Status> {
        let req = request.into_inner();
        let record = self.resolve_producer(&req.producer_id).await?;
        debug!(
            producer_id = %req.producer_id,
            delay_level = req.delay_time_level,
            start_deliver_time = req.start_deliver_time,
            "Sending delay message"
        );

        let mut message = OutboundMessage {
            topic: record.topic.clone(),
            body: req.message_body,
            tag: req.tag,
            ..Default::default()
        };

        if req.start_deliver_time > 0 {
            message.properties.insert(
                START_DELIVER_TIME_PROPERTY.to_string(),
                req.start_deliver_time.to_string(),
            );
            debug!(
                start_deliver_time = req.start_deliver_time,
                "Using arbitrary precision delay"
            );
        } else if (1..=MAX_DELAY_LEVEL).contains(&req.delay_time_level) {
            message.delay_level = req.delay_time_level;
            debug!(delay_level = req.delay_time_level, "Using broker delay level");
        }

        if let Some(props) = req.properties.as_ref() {
            apply_common_properties(&mut message, props);
        }

        Ok(Response::new(
            self.send_through(&record, message, "Delay message").await,
        ))
    }

    /// Pseudo-transaction: the immunity window degrades to delayed delivery
    /// via `__STARTDELIVERTIME` and the transaction id is synthetic. There
    /// is no confirm/rollback phase.
    async fn send_transaction_message(
        &self,
        request: Request<SendTransactionMessageRequest>,
    ) -> Result<Response<SendTransactionMessageResponse>, Status> {
        let req = request.into_inner();
        let record = self.resolve_producer(&req.producer_id).await?;
        debug!(
            producer_id = %req.producer_id,
            immunity_seconds = req.trans_check_immunity_time,
            "Sending transaction message"
        );

        let mut message = OutboundMessage {
            topic: record.topic.clone(),
            body: req.message_body,
            tag: req.tag,
            ..Default::default()
        };
        if req.trans_check_immunity_time > 0 {
            let deliver_at = now_millis() + req.trans_check_immunity_time * 1000;
            message.properties.insert(
                START_DELIVER_TIME_PROPERTY.to_string(),
                deliver_at.to_string(),
            );
        }
        if let Some(props) = req.properties.as_ref() {
            apply_common_properties(&mut message, props);
        }

        let sent = self
            .send_through(&record, message, "Transaction message")
            .await;
        let transaction_id = if sent.success {
            format!("trans_{}_{}", sent.message_id, now_nanos())
        } else {
            String::new()
        };
        Ok(Response::new(SendTransactionMessageResponse {
            success: sent.success,
            message: sent.message,
            message_id: sent.message_id,
            receipt_handle: sent.receipt_handle,
            transaction_id,
        }))
    }

    async fn create_consumer(
        &self,
        request: Request<CreateConsumerRequest>,
    ) -> Result<Response<CreateConsumerResponse>, Status> {
        let req = request.into_inner();
        info!(topic = %req.topic, group_id = %req.group_id, "Creating consumer");

        let spec = ConsumerSpec {
            endpoint: req.endpoint,
            access_key_id: req.access_key_id,
            access_key_secret: req.access_key_secret,
            instance_id: req.instance_id,
            topic: req.topic,
            group_id: req.group_id,
            tag_expression: if req.tag_expression.is_empty() {
                "*".to_string()
            } else {
                req.tag_expression
            },
        };

        match self.consumers.create(&spec).await {
            Ok(outcome) => Ok(Response::new(CreateConsumerResponse {
                success: true,
                message: if outcome.reused {
                    format!("Consumer reused (ref: {})", outcome.refs)
                } else {
                    format!("Consumer created successfully for group: {}", spec.group_id)
                },
                consumer_id: outcome.handle.to_string(),
            })),
            Err(e) => {
                self.metrics.inc_error_count();
                Ok(Response::new(CreateConsumerResponse {
                    success: false,
                    message: e.to_string(),
                    consumer_id: String::new(),
                }))
            }
        }
    }

    type ReceiveMessagesStream = ReceiverStream<Result<Message, Status>>;

    async fn receive_messages(
        &self,
        request: Request<ReceiveMessagesRequest>,
    ) -> Result<Response<Self::ReceiveMessagesStream>, Status> {
        let req = request.into_inner();
        let handle = Uuid::parse_str(&req.consumer_id)
            .map_err(|_| Status::not_found("Consumer not found"))?;
        let record = self
            .consumers
            .get(handle)
            .await
            .ok_or_else(|| Status::not_found("Consumer not found"))?;
        record.touch();
        info!(consumer_id = %handle, group_id = %record.group_id, "Starting message stream");

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(stream::pump_messages(
            Arc::clone(&self.consumers),
            handle,
            record,
            tx,
        ));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    /// Acknowledgement is folded into the push callback's return value, so
    /// this RPC exists for API symmetry only; receipt handles are not
    /// correlated.
    async fn ack_message(
        &self,
        request: Request<AckMessageRequest>,
    ) -> Result<Response<AckMessageResponse>, Status> {
        let req = request.into_inner();
        debug!(consumer_id = %req.consumer_id, "Acking message");
        Ok(Response::new(AckMessageResponse {
            success: true,
            message: "Message acknowledged".to_string(),
        }))
    }

    async fn cleanup_producer(
        &self,
        request: Request<CleanupProducerRequest>,
    ) -> Result<Response<CleanupProducerResponse>, Status> {
        let req = request.into_inner();
        info!(
            producer_id = %req.producer_id,
            topic = %req.topic,
            endpoint = %req.endpoint,
            "Manual producer cleanup request"
        );

        let candidates = if !req.producer_id.is_empty() {
            match Uuid::parse_str(&req.producer_id) {
                Ok(id) => self.producers.collect_matches(Some(id), "", "").await,
                Err(_) => Vec::new(),
            }
        } else {
            self.producers
                .collect_matches(None, &req.topic, &req.endpoint)
                .await
        };

        let mut cleaned = 0i32;
        let mut failures = Vec::new();
        for handle in candidates {
            match self.producers.release(handle).await {
                Ok(()) => {
                    cleaned += 1;
                    info!(producer_id = %handle, "Manually cleaned up producer");
                }
                Err(e) => failures.push(format!("Producer {handle}: {e}")),
            }
        }

        let success = failures.is_empty();
        let message = if cleaned > 0 {
            let mut message = format!("Successfully cleaned up {cleaned} producer(s)");
            if !failures.is_empty() {
                message.push_str(&format!(
                    ", but {} failed: {}",
                    failures.len(),
                    failures.join("; ")
                ));
            }
            message
        } else if !req.producer_id.is_empty() {
            "No producer found with the specified ID".to_string()
        } else {
            "No producers found matching the criteria".to_string()
        };

        Ok(Response::new(CleanupProducerResponse {
            success,
            message,
            cleaned_count: cleaned,
        }))
    }

    async fn cleanup_consumer(
        &self,
        request: Request<CleanupConsumerRequest>,
    ) -> Result<Response<CleanupConsumerResponse>, Status> {
        let req = request.into_inner();
        info!(
            consumer_id = %req.consumer_id,
            group_id = %req.group_id,
            topic = %req.topic,
            "Manual consumer cleanup request"
        );

        let candidates = if !req.consumer_id.is_empty() {
            match Uuid::parse_str(&req.consumer_id) {
                Ok(id) => self.consumers.collect_matches(Some(id), "", "").await,
                Err(_) => Vec::new(),
            }
        } else {
            self.consumers
                .collect_matches(None, &req.group_id, &req.topic)
                .await
        };

        let mut cleaned = 0i32;
        let mut failures = Vec::new();
        for handle in candidates {
            match self.consumers.release(handle).await {
                Ok(()) => {
                    cleaned += 1;
                    info!(consumer_id = %handle, "Manually cleaned up consumer");
                }
                Err(e) => failures.push(format!("Consumer {handle}: {e}")),
            }
        }

        let success = failures.is_empty();
        let message = if cleaned > 0 {
            let mut message = format!("Successfully cleaned up {cleaned} consumer(s)");
            if !failures.is_empty() {
                message.push_str(&format!(
                    ", but {} failed: {}",
                    failures.len(),
                    failures.join("; ")
                ));
            }
            message
        } else if !req.consumer_id.is_empty() {
            "No consumer found with the specified ID".to_string()
        } else {
            "No consumers found matching the criteria".to_string()
        };

        Ok(Response::new(CleanupConsumerResponse {
            success,
            message,
            cleaned_count: cleaned,
        }))
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(HealthCheckResponse {
            healthy: true,
            message: "Service is healthy".to_string(),
        }))
    }
}
