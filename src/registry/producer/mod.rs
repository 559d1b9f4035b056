//! Producer registry.
//!
//! Shares one broker producer between every handle created with the same
//! (endpoint, access-key, instance, topic) tuple. Aliased handles store the
//! same record; the record's refcount tracks how many handles are alive and
//! the broker producer is shut down when the last one is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    self, BrokerConnector, BrokerProducer, Credentials, OutboundMessage, ProducerSettings,
    SendReceipt,
};
use crate::metrics::ProxyMetrics;

use super::{now_millis, now_nanos, CreateOutcome, ProducerKey, RegistryError, Result};

/// Broker retry count applied to every producer the registry constructs.
const PRODUCER_RETRY_TIMES: u32 = 2;

/// Connection parameters for a producer create call.
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub instance_id: String,
    pub topic: String,
}

impl ProducerSpec {
    fn key(&self) -> ProducerKey {
        ProducerKey {
            endpoint: self.endpoint.clone(),
            access_key_id: self.access_key_id.clone(),
            instance_id: self.instance_id.clone(),
            topic: self.topic.clone(),
        }
    }
}

/// A broker producer plus its sharing bookkeeping.
///
/// One record is stored under every handle that aliases it; refcount
/// mutations happen only inside the registry's write-lock critical sections.
pub struct ProducerRecord {
    broker: Arc<dyn BrokerProducer>,
    pub topic: String,
    pub endpoint: String,
    pub instance_id: String,
    pub access_key_id: String,
    refs: AtomicUsize,
    created_at: i64,
    last_active: AtomicI64,
}

impl ProducerRecord {
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::SeqCst)
    }

    /// Advance last-active to now.
    pub fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::SeqCst);
    }

    /// Send through the shared broker producer.
    pub async fn send(&self, message: OutboundMessage) -> broker::Result<SendReceipt> {
        self.broker.send(message).await
    }

    fn key(&self) -> ProducerKey {
        ProducerKey {
            endpoint: self.endpoint.clone(),
            access_key_id: self.access_key_id.clone(),
            instance_id: self.instance_id.clone(),
            topic: self.topic.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_refs(&self, refs: usize) {
        self.refs.store(refs, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ProducerMaps {
    by_handle: HashMap<Uuid, Arc<ProducerRecord>>,
    canonical: HashMap<ProducerKey, Uuid>,
}

/// Registry of broker producers keyed by handle and by connection identity.
pub struct ProducerRegistry {
    maps: RwLock<ProducerMaps>,
    connector: Arc<dyn BrokerConnector>,
    metrics: Arc<ProxyMetrics>,
}

impl ProducerRegistry {
    pub fn new(connector: Arc<dyn BrokerConnector>, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            maps: RwLock::new(ProducerMaps::default()),
            connector,
            metrics,
        }
    }

    /// Create a producer handle, reusing an existing broker producer when
    /// the connection identity matches.
    ///
    /// On a miss, the broker producer is constructed and started while the
    /// write lock is held; nothing else can observe the partial state
    /// because registration happens before the lock is released.
    pub async fn create(&self, spec: &ProducerSpec) -> Result<CreateOutcome> {
        let key = spec.key();
        let mut maps = self.maps.write().await;

        if let Some(&canonical) = maps.canonical.get(&key) {
            if let Some(record) = maps.by_handle.get(&canonical).cloned() {
                let handle = Uuid::new_v4();
                let refs = record.refs.fetch_add(1, Ordering::SeqCst) + 1;
                record.touch();
                maps.by_handle.insert(handle, record);
                info!(
                    producer_id = %handle,
                    topic = %spec.topic,
                    instance_id = %spec.instance_id,
                    refs,
                    "Reusing producer"
                );
                return Ok(CreateOutcome {
                    handle,
                    reused: true,
                    refs,
                });
            }
        }

        // Group names must be unique per broker producer instance.
        let group = format!("grpc_proxy_producer_{}", now_nanos());
        let producer = self
            .connector
            .producer(ProducerSettings {
                endpoint: spec.endpoint.clone(),
                credentials: Credentials {
                    access_key: spec.access_key_id.clone(),
                    secret_key: spec.access_key_secret.clone(),
                },
                group: group.clone(),
                retry_times: PRODUCER_RETRY_TIMES,
            })
            .await?;

        if let Err(e) = producer.start().await {
            if let Err(shutdown_err) = producer.shutdown().await {
                warn!(error = %shutdown_err, "Error discarding unstarted producer");
            }
            return Err(e.into());
        }

        let handle = Uuid::new_v4();
        let now = now_millis();
        let record = Arc::new(ProducerRecord {
            broker: producer,
            topic: spec.topic.clone(),
            endpoint: spec.endpoint.clone(),
            instance_id: spec.instance_id.clone(),
            access_key_id: spec.access_key_id.clone(),
            refs: AtomicUsize::new(1),
            created_at: now,
            last_active: AtomicI64::new(now),
        });
        maps.by_handle.insert(handle, record);
        maps.canonical.insert(key, handle);
        self.metrics.inc_active_producers();

        info!(
            producer_id = %handle,
            group = %group,
            topic = %spec.topic,
            instance_id = %spec.instance_id,
            "New producer created"
        );
        Ok(CreateOutcome {
            handle,
            reused: false,
            refs: 1,
        })
    }

    /// Look up the record behind a handle.
    pub async fn get(&self, handle: Uuid) -> Option<Arc<ProducerRecord>> {
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

    /// Release one handle.
    ///
    /// While other handles still alias the record only this handle is
    /// removed (re-pointing the canonical entry if it named this handle).
    /// At refcount zero every aliasing handle and canonical entry goes, and
    /// the broker producer is shut down with the lock released.
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
                    producer_id = %handle,
                    refs = remaining,
                    "Producer handle released, instance preserved"
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
                Some(record)
            }
        };

        if let Some(record) = teardown {
            if let Err(e) = record.broker.shutdown().await {
                warn!(producer_id = %handle, error = %e, "Error shutting down producer");
            }
            self.metrics.dec_active_producers();
            info!(producer_id = %handle, topic = %record.topic, "Producer cleanup completed");
        }
        Ok(())
    }

    /// Release every handle idle for longer than `timeout`.
    ///
    /// Candidates are collected under the read lock and released afterwards;
    /// each release re-takes the write lock.
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
            info!(producer_id = %handle, "Cleaning up inactive producer");
            match self.release(handle).await {
                Ok(()) => released += 1,
                Err(e) => debug!(producer_id = %handle, error = %e, "Inactive producer already gone"),
            }
        }
        released
    }

    /// Recount aliases per shared record and overwrite divergent refcounts.
    ///
    /// Divergence is logged and repaired, never fatal. Returns the number of
    /// records repaired.
    pub async fn validate_and_repair(&self) -> usize {
        let maps = self.maps.write().await;

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for record in maps.by_handle.values() {
            *counts.entry(Arc::as_ptr(record) as usize).or_insert(0) += 1;
        }

        let mut repaired = 0;
        let mut seen = HashSet::new();
        for record in maps.by_handle.values() {
            let ptr = Arc::as_ptr(record) as usize;
            if !seen.insert(ptr) {
                continue;
            }
            let actual = counts[&ptr];
            let recorded = record.refs.load(Ordering::SeqCst);
            if recorded != actual {
                warn!(
                    topic = %record.topic,
                    recorded,
                    actual,
                    "Producer refcount diverged, repairing"
                );
                record.refs.store(actual, Ordering::SeqCst);
                self.metrics.inc_refcount_repairs();
                repaired += 1;
            }
        }
        repaired
    }

    /// Shut down every distinct broker producer exactly once and clear the
    /// registry. Used by the graceful shutdown cascade.
    pub async fn shutdown_all(&self) -> usize {
        let records: Vec<Arc<ProducerRecord>> = {
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
            if let Err(e) = record.broker.shutdown().await {
                warn!(topic = %record.topic, error = %e, "Error shutting down producer");
            }
            count += 1;
        }
        self.metrics.reset_active_producers();
        info!(count, "All producers shut down");
        count
    }

    /// Resolve cleanup candidates: a specific handle, or every handle
    /// matching a topic (optionally narrowed by endpoint).
    pub async fn collect_matches(
        &self,
        producer_id: Option<Uuid>,
        topic: &str,
        endpoint: &str,
    ) -> Vec<Uuid> {
        let maps = self.maps.read().await;
        if let Some(id) = producer_id {
            return if maps.by_handle.contains_key(&id) {
                vec![id]
            } else {
                Vec::new()
            };
        }
        if topic.is_empty() {
            return Vec::new();
        }
        maps.by_handle
            .iter()
            .filter(|(_, r)| r.topic == topic && (endpoint.is_empty() || r.endpoint == endpoint))
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
