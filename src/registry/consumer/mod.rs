//! Consumer registry.
//!
//! Shares one broker push consumer between every handle created with the
//! same (endpoint, access-key, instance, group) tuple; topic is not part of
//! the key, so reuse with a new topic grows the running consumer's
//! subscription set instead of creating a second group member. Each record
//! carries a bounded message buffer filled by the broker callback and
//! drained by the stream pump, and a cancellation scope that unblocks both
//! sides during teardown.

mod adapter;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    BrokerConnector, BrokerConsumer, ConsumeFrom, ConsumeModel, ConsumerSettings, Credentials,
};
use crate::config::ProxyConfig;
use crate::metrics::ProxyMetrics;
use crate::proto::Message;

use adapter::BufferHandler;

use super::{now_millis, ConsumerKey, CreateOutcome, RegistryError, Result};

/// Broker-side retry ceiling before a message is parked.
const MAX_RECONSUME_TIMES: u32 = 3;

/// Maximum messages per callback batch.
const BATCH_MAX_SIZE: usize = 32;

/// Connection parameters for a consumer create call.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub instance_id: String,
    pub topic: String,
    pub group_id: String,
    pub tag_expression: String,
}

impl ConsumerSpec {
    fn key(&self) -> ConsumerKey {
        ConsumerKey {
            endpoint: self.endpoint.clone(),
            access_key_id: self.access_key_id.clone(),
            instance_id: self.instance_id.clone(),
            group_id: self.group_id.clone(),
        }
    }
}

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct ConsumerRegistrySettings {
    /// Capacity of each consumer's message buffer.
    pub buffer_size: usize,
    /// How long the callback adapter waits for buffer space before
    /// deferring a message back to the broker.
    pub push_timeout: Duration,
    /// Maximum idle age at which an existing group consumer is still reused
    /// rather than replaced.
    pub reuse_threshold: Duration,
    /// Broker pull timeout forwarded to consumer construction.
    pub pull_timeout: Duration,
    /// Broker pull interval forwarded to consumer construction.
    pub pull_interval: Duration,
}

impl Default for ConsumerRegistrySettings {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            push_timeout: Duration::from_secs(5),
            reuse_threshold: Duration::from_secs(300),
            pull_timeout: Duration::from_secs(5),
            pull_interval: Duration::from_secs(1),
        }
    }
}

impl ConsumerRegistrySettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            buffer_size: config.message_buffer_size,
            pull_timeout: config.pull_timeout,
            pull_interval: config.pull_interval,
            ..Self::default()
        }
    }
}

/// A broker consumer plus its buffer, cancellation scope, and bookkeeping.
pub struct ConsumerRecord {
    broker: Arc<dyn BrokerConsumer>,
    pub group_id: String,
    pub endpoint: String,
    pub instance_id: String,
    pub access_key_id: String,
    topics: std::sync::Mutex<BTreeSet<String>>,
    buffer_tx: mpsc::Sender<Message>,
    buffer_rx: Mutex<mpsc::Receiver<Message>>,
    cancel: CancellationToken,
    refs: AtomicUsize,
    created_at: i64,
    last_active: AtomicI64,
}

impl ConsumerRecord {
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::SeqCst);
    }

    /// Topics this broker consumer is subscribed to, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .expect("topic set lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.lock().expect("topic set lock").contains(topic)
    }

    fn add_topic(&self, topic: &str) {
        self.topics
            .lock()
            .expect("topic set lock")
            .insert(topic.to_string());
    }

    /// Scope token observed by the callback adapter and the stream pump.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Exclusive access to the buffer's receiving end, held by the stream
    /// pump for the lifetime of one `ReceiveMessages` call.
    pub async fn buffer(&self) -> MutexGuard<'_, mpsc::Receiver<Message>> {
        self.buffer_rx.lock().await
    }

    /// Close the buffer so the callback adapter stops pushing; buffered
    /// messages stay drainable.
    async fn close_buffer(&self) {
        self.buffer_rx.lock().await.close();
    }

    fn key(&self) -> ConsumerKey {
        ConsumerKey {
            endpoint: self.endpoint.clone(),
            access_key_id: self.access_key_id.clone(),
            instance_id: self.instance_id.clone(),
            group_id: self.group_id.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer_sender(&self) -> mpsc::Sender<Message> {
        self.buffer_tx.clone()
    }
}

#[derive(Default)]
struct ConsumerMaps {
    by_handle: HashMap<Uuid, Arc<ConsumerRecord>>,
    canonical: HashMap<ConsumerKey, Uuid>,
}

/// Registry of broker consumers keyed by handle and by connection identity.
pub struct ConsumerRegistry {
    maps: RwLock<ConsumerMaps>,
    connector: Arc<dyn BrokerConnector>,
    metrics: Arc<ProxyMetrics>,
    settings: ConsumerRegistrySettings,
}

impl ConsumerRegistry {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<ProxyMetrics>,
        settings: ConsumerRegistrySettings,
    ) -> Self {
        Self {
            maps: RwLock::new(ConsumerMaps::default()),
            connector,
            metrics,
            settings,
        }
    }

    fn buffer_handler(&self, tx: mpsc::Sender<Message>, cancel: CancellationToken) -> Arc<BufferHandler> {
        Arc::new(BufferHandler::new(
            tx,
            cancel,
            Arc::clone(&self.metrics),
            self.settings.push_timeout,
        ))
    }

    /// Create a consumer handle.
    ///
    /// A live group consumer (idle within the reuse threshold) is aliased,
    /// growing its topic set when the requested topic is new. A stale one is
    /// cascade-cleaned first. Otherwise a fresh broker consumer is
    /// constructed, subscribed, and started; any failure in that sequence
    /// cancels the scope and leaves the registry untouched.
    pub async fn create(&self, spec: &ConsumerSpec) -> Result<CreateOutcome> {
        let key = spec.key();
        let mut maps = self.maps.write().await;

        if let Some(&canonical) = maps.canonical.get(&key) {
            if let Some(record) = maps.by_handle.get(&canonical).cloned() {
                let idle = now_millis() - record.last_active();
                if idle <= self.settings.reuse_threshold.as_millis() as i64 {
                    let mut poisoned_add = false;
                    if !record.has_topic(&spec.topic) {
                        let handler = self
                            .buffer_handler(record.buffer_tx.clone(), record.cancel.clone());
                        match record
                            .broker
                            .subscribe(&spec.topic, &spec.tag_expression, handler)
                            .await
                        {
                            Ok(()) => {
                                record.add_topic(&spec.topic);
                                info!(
                                    group_id = %spec.group_id,
                                    topic = %spec.topic,
                                    "Added topic to running consumer"
                                );
                            }
                            Err(e) => {
                                // Leave the running consumer as it was and
                                // build a fresh one for this caller.
                                warn!(
                                    group_id = %spec.group_id,
                                    topic = %spec.topic,
                                    error = %e,
                                    "Subscription add failed, creating fresh consumer"
                                );
                                poisoned_add = true;
                            }
                        }
                    }
                    if !poisoned_add {
                        let handle = Uuid::new_v4();
                        let refs = record.refs.fetch_add(1, Ordering::SeqCst) + 1;
                        record.touch();
                        maps.by_handle.insert(handle, record);
                        info!(
                            consumer_id = %handle,
                            group_id = %spec.group_id,
                            refs,
                            "Reusing consumer"
                        );
                        return Ok(CreateOutcome {
                            handle,
                            reused: true,
                            refs,
                        });
                    }
                } else {
                    info!(
                        group_id = %spec.group_id,
                        idle_ms = idle,
                        "Replacing stale consumer"
                    );
                    self.cascade_clean(&mut maps, &record).await;
                }
            }
        }

        // Fresh construction. The group name is the caller's, verbatim, so
        // predefined groups keep working.
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.settings.buffer_size);

        let consumer = match self
            .connector
            .consumer(ConsumerSettings {
                endpoint: spec.endpoint.clone(),
                credentials: Credentials {
                    access_key: spec.access_key_id.clone(),
                    secret_key: spec.access_key_secret.clone(),
                },
                group: spec.group_id.clone(),
                consume_from: ConsumeFrom::LastOffset,
                model: ConsumeModel::Clustering,
                pull_timeout: self.settings.pull_timeout,
                pull_interval: self.settings.pull_interval,
                max_reconsume_times: MAX_RECONSUME_TIMES,
                batch_max_size: BATCH_MAX_SIZE,
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };

        let handler = self.buffer_handler(tx.clone(), cancel.clone());
        if let Err(e) = consumer
            .subscribe(&spec.topic, &spec.tag_expression, handler)
            .await
        {
            cancel.cancel();
            return Err(e.into());
        }
        if let Err(e) = consumer.start().await {
            cancel.cancel();
            return Err(e.into());
        }

        let handle = Uuid::new_v4();
        let now = now_millis();
        let record = Arc::new(ConsumerRecord {
            broker: consumer,
            group_id: spec.group_id.clone(),
            endpoint: spec.endpoint.clone(),
            instance_id: spec.instance_id.clone(),
            access_key_id: spec.access_key_id.clone(),
            topics: std::sync::Mutex::new(BTreeSet::from([spec.topic.clone()])),
            buffer_tx: tx,
            buffer_rx: Mutex::new(rx),
            cancel,
            refs: AtomicUsize::new(1),
            created_at: now,
            last_active: AtomicI64::new(now),
        });
        maps.by_handle.insert(handle, record);
        maps.canonical.insert(key, handle);
        self.metrics.inc_active_consumers();

        info!(
            consumer_id = %handle,
            group_id = %spec.group_id,
            topic = %spec.topic,
            "New consumer created"
        );
        Ok(CreateOutcome {
            handle,
            reused: false,
            refs: 1,
        })
    }

    /// Tear down a record while the create critical section holds the write
    /// lock: the replacement consumer must not start while the old group
    /// member is still attached to the broker.
    async fn cascade_clean(&self, maps: &mut ConsumerMaps, record: &Arc<ConsumerRecord>) {
        record.cancel.cancel();
        // A stale record has no running stream pump (a pump's heartbeat
        // keeps the record fresh), so the buffer lock is uncontended here.
        record.close_buffer().await;

        let removed: Vec<Uuid> = maps
            .by_handle
            .iter()
            .filter(|(_, r)| Arc::ptr_eq(r, record))
            .map(|(id, _)| *id)
            .collect();
        for id in &removed {
            maps.by_handle.remove(id);
        }
        maps.canonical.retain(|_, id| !removed.contains(id));

        if let Err(e) = record.broker.shutdown().await {
            warn!(group_id = %record.group_id, error = %e, "Error shutting down stale consumer");
        }
        self.metrics.dec_active_consumers();
        info!(group_id = %record.group_id, handles = removed.len(), "Stale consumer cleaned up");
    }

    /// Look up the record behind a handle.
    pub async fn get(&self, handle: Uuid) -> Option<Arc<ConsumerRecord>> {
        self.maps.read().await.by_handle.get(&handle).cloned()
    }

    /// Advance a handle's last-active timestamp; returns false if unknown.
    pub async fn touch(&self, handle: Uuid) -> bool {
        match self.maps.read().await.by_handle.get(&handle) {
            Some(record) => {
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Release one handle; at refcount zero the scope is cancelled, the
    /// buffer closed, every aliasing handle removed, and the broker
    /// consumer shut down with the lock released.
    pub async fn release(&self, handle: Uuid) -> Result<()> {
        let teardown = {
            let mut maps = self.maps.write().await;
            let record = maps
                .by_handle
                .remove(&handle)
                .ok_or(RegistryError::HandleNotFound(handle))?;
            let remaining = record.refs.fetch_sub(1, Ordering::SeqCst) - 1;

            if remaining > 0 {
                let key = record.key();
                if maps.canonical.get(&key) == Some(&handle) {
                    let alias = maps
                        .by_handle
                        .iter()
                        .find(|(_, r)| Arc::ptr_eq(r, &record))
                        .map(|(id, _)| *id);
                    match alias {
                        Some(alias) => {
                            maps.canonical.insert(key, alias);
                        }
                        None => {
                            maps.canonical.remove(&key);
                        }
                    }
                }
                debug!(
                    consumer_id = %handle,
                    refs = remaining,
                    "Consumer handle released, instance preserved"
                );
                None
            } else {
                let mut removed: Vec<Uuid> = maps
                    .by_handle
                    .iter()
                    .filter(|(_, r)| Arc::ptr_eq(r, &record))
                    .map(|(id, _)| *id)
                    .collect();
                for id in &removed {
                    maps.by_handle.remove(id);
                }
                removed.push(handle);
                maps.canonical.retain(|_, id| !removed.contains(id));

                // Cancel inside the critical section so the callback path
                // stops racing the buffer close.
                record.cancel.cancel();
                Some(record)
            }
        };

        if let Some(record) = teardown {
            record.close_buffer().await;
            if let Err(e) = record.broker.shutdown().await {
                warn!(consumer_id = %handle, error = %e, "Error shutting down consumer");
            }
            self.metrics.dec_active_consumers();
            info!(consumer_id = %handle, group_id = %record.group_id, "Consumer cleanup completed");
        }
        Ok(())
    }

    /// Release every handle idle for longer than `timeout`.
    pub async fn sweep(&self, timeout: Duration) -> usize {
        let cutoff = timeout.as_millis() as i64;
        let idle: Vec<Uuid> = {
            let maps = self.maps.read().await;
            let now = now_millis();
            maps.by_handle
                .iter()
                .filter(|(_, r)| now - r.last_active() > cutoff)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut released = 0;
        for handle in idle {
            info!(consumer_id = %handle, "Cleaning up inactive consumer");
            match self.release(handle).await {
                Ok(()) => released += 1,
                Err(e) => debug!(consumer_id = %handle, error = %e, "Inactive consumer already gone"),
            }
        }
        released
    }

    /// Shut down every distinct broker consumer exactly once and clear the
    /// registry. Used by the graceful shutdown cascade.
    pub async fn shutdown_all(&self) -> usize {
        let records: Vec<Arc<ConsumerRecord>> = {
            let mut maps = self.maps.write().await;
            maps.canonical.clear();
            maps.by_handle.drain().map(|(_, r)| r).collect()
        };

        let mut seen = HashSet::new();
        let mut count = 0;
        for record in records {
            if !seen.insert(Arc::as_ptr(&record) as usize) {
                continue;
            }
            record.cancel.cancel();
            record.close_buffer().await;
            if let Err(e) = record.broker.shutdown().await {
                warn!(group_id = %record.group_id, error = %e, "Error shutting down consumer");
            }
            count += 1;
        }
        self.metrics.reset_active_consumers();
        info!(count, "All consumers shut down");
        count
    }

    /// Resolve cleanup candidates: a specific handle, or every handle whose
    /// group matches (optionally narrowed to records subscribed to a topic).
    pub async fn collect_matches(
        &self,
        consumer_id: Option<Uuid>,
        group_id: &str,
        topic: &str,
    ) -> Vec<Uuid> {
        let maps = self.maps.read().await;
        if let Some(id) = consumer_id {
            return if maps.by_handle.contains_key(&id) {
                vec![id]
            } else {
                Vec::new()
            };
        }
        if group_id.is_empty() {
            return Vec::new();
        }
        maps.by_handle
            .iter()
            .filter(|(_, r)| r.group_id == group_id && (topic.is_empty() || r.has_topic(topic)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of live handles.
    pub async fn handle_count(&self) -> usize {
        self.maps.read().await.by_handle.len()
    }

    /// Number of canonical connection-key entries.
    pub async fn canonical_count(&self) -> usize {
        self.maps.read().await.canonical.len()
    }
}

#[cfg(test)]
mod tests;
