//! Stream pump for `ReceiveMessages`.
//!
//! Drains a consumer's buffer into the RPC response channel, keeps the
//! consumer's last-active timestamp fresh, and detects client disconnect.
//! Whatever ends the loop, the pump releases the handle before returning;
//! this is the single place where a client going away becomes broker
//! resource release.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, info};
use uuid::Uuid;

use crate::proto::Message;
use crate::registry::consumer::{ConsumerRecord, ConsumerRegistry};

/// Interval between last-active refreshes while the stream idles.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Pump loop spawned per `ReceiveMessages` call.
pub(crate) async fn pump_messages(
    registry: Arc<ConsumerRegistry>,
    handle: Uuid,
    record: Arc<ConsumerRecord>,
    tx: mpsc::Sender<Result<Message, Status>>,
) {
    let cancel = record.cancel_token();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    heartbeat.tick().await;

    debug!(consumer_id = %handle, "Consumer ready to receive messages");

    {
        let mut buffer = record.buffer().await;
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    info!(consumer_id = %handle, "Client disconnected");
                    break;
                }
                _ = cancel.cancelled() => {
                    debug!(consumer_id = %handle, "Consumer cancelled, ending stream");
                    break;
                }
                _ = heartbeat.tick() => {
                    record.touch();
                    debug!(consumer_id = %handle, group_id = %record.group_id, "Stream heartbeat");
                }
                maybe = buffer.recv() => match maybe {
                    Some(message) => {
                        if tx.send(Ok(message)).await.is_err() {
                            debug!(consumer_id = %handle, "Client disconnected during send");
                            break;
                        }
                        record.touch();
                    }
                    None => {
                        debug!(consumer_id = %handle, "Message buffer closed");
                        break;
                    }
                }
            }
        }
    }

    match registry.release(handle).await {
        Ok(()) => info!(consumer_id = %handle, "Consumer released after stream end"),
        Err(e) => debug!(consumer_id = %handle, error = %e, "Consumer already released at stream end"),
    }
}
