//! Broker callback adapter.
//!
//! Bridges push-mode broker deliveries into a consumer's bounded buffer.
//! The buffer is the backpressure boundary: when it stays full past the
//! push timeout the batch is deferred back to the broker with `RetryLater`
//! instead of being dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{ConsumeOutcome, MessageHandler, MessageView};
use crate::metrics::ProxyMetrics;
use crate::proto::Message;

/// Pushes delivered messages onto a consumer's bounded buffer.
///
/// One adapter is registered per subscription; topic growth registers the
/// same buffer and cancellation scope under additional topics.
pub(crate) struct BufferHandler {
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    metrics: Arc<ProxyMetrics>,
    push_timeout: Duration,
}

impl BufferHandler {
    pub(crate) fn new(
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
        metrics: Arc<ProxyMetrics>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            tx,
            cancel,
            metrics,
            push_timeout,
        }
    }
}

fn into_proto(view: MessageView) -> Message {
    Message {
        receipt_handle: view.message_id.clone(),
        message_id: view.message_id,
        message_body: view.body,
        tag: view.tag,
        properties: view.properties,
        born_timestamp: view.born_timestamp,
        reconsume_times: view.reconsume_times,
    }
}

impl MessageHandler for BufferHandler {
    fn handle(&self, batch: Vec<MessageView>) -> BoxFuture<'static, ConsumeOutcome> {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let metrics = Arc::clone(&self.metrics);
        let push_timeout = self.push_timeout;

        Box::pin(async move {
            for view in batch {
                metrics.inc_messages_received();
                let message_id = view.message_id.clone();
                let message = into_proto(view);

                let permit = tokio::select! {
                    reserved = tx.reserve() => match reserved {
                        Ok(permit) => permit,
                        Err(_) => {
                            // Buffer closed during teardown; redeliver.
                            debug!(message_id = %message_id, "Buffer closed, deferring message");
                            return ConsumeOutcome::RetryLater;
                        }
                    },
                    _ = cancel.cancelled() => {
                        debug!(message_id = %message_id, "Consumer cancelled, deferring message");
                        return ConsumeOutcome::RetryLater;
                    }
                    _ = tokio::time::sleep(push_timeout) => {
                        warn!(message_id = %message_id, "Message buffer full, deferring to broker redelivery");
                        metrics.inc_channel_full_events();
                        return ConsumeOutcome::RetryLater;
                    }
                };
                permit.send(message);
                debug!(message_id = %message_id, "Message buffered");
            }
            ConsumeOutcome::Success
        })
    }
}
