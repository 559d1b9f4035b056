//! Proxy metrics.
//!
//! Centralized atomic counters and gauges, shared by reference between the
//! registries, the callback adapters, and the HTTP snapshot endpoint.
//! Gauges track distinct live broker references, not handle counts.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

/// Atomic counters and gauges for the proxy.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    active_producers: AtomicI64,
    active_consumers: AtomicI64,
    messages_sent: AtomicI64,
    messages_received: AtomicI64,
    messages_per_second: AtomicI64,
    error_count: AtomicI64,
    channel_full_events: AtomicI64,
    refcount_repairs: AtomicI64,
}

/// Point-in-time view of all counters, serialized by `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_producers: i64,
    pub active_consumers: i64,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub messages_per_second: i64,
    pub error_count: i64,
    pub channel_full_events: i64,
    pub refcount_repairs: i64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_active_producers(&self) {
        self.active_producers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_producers(&self) {
        self.active_producers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reset the producer gauge, used by the shutdown cascade.
    pub fn reset_active_producers(&self) {
        self.active_producers.store(0, Ordering::Relaxed);
    }

    pub fn inc_active_consumers(&self) {
        self.active_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_consumers(&self) {
        self.active_consumers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reset the consumer gauge, used by the shutdown cascade.
    pub fn reset_active_consumers(&self) {
        self.active_consumers.store(0, Ordering::Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_error_count(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_channel_full_events(&self) {
        self.channel_full_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refcount_repairs(&self) {
        self.refcount_repairs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_producers(&self) -> i64 {
        self.active_producers.load(Ordering::Relaxed)
    }

    pub fn active_consumers(&self) -> i64 {
        self.active_consumers.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> i64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> i64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> i64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn channel_full_events(&self) -> i64 {
        self.channel_full_events.load(Ordering::Relaxed)
    }

    pub fn refcount_repairs(&self) -> i64 {
        self.refcount_repairs.load(Ordering::Relaxed)
    }

    /// Capture the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_producers: self.active_producers.load(Ordering::Relaxed),
            active_consumers: self.active_consumers.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_per_second: self.messages_per_second.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            channel_full_events: self.channel_full_events.load(Ordering::Relaxed),
            refcount_repairs: self.refcount_repairs.load(Ordering::Relaxed),
        }
    }

    /// Spawn a task that recomputes the messages-per-second gauge once a
    /// second from the sent/received counter deltas.
    pub fn spawn_rate_tracker(self: Arc<Self>) -> JoinHandle<()> {
        let metrics = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_total = 0i64;
            loop {
                ticker.tick().await;
                let total = metrics.messages_sent.load(Ordering::Relaxed)
                    + metrics.messages_received.load(Ordering::Relaxed);
                metrics
                    .messages_per_second
                    .store(total - last_total, Ordering::Relaxed);
                last_total = total;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_roundtrip() {
        let metrics = ProxyMetrics::new();
        metrics.inc_active_producers();
        metrics.inc_active_producers();
        metrics.dec_active_producers();
        metrics.inc_messages_sent();
        metrics.inc_channel_full_events();

        let snap = metrics.snapshot();
        assert_eq!(snap.active_producers, 1);
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.channel_full_events, 1);
        assert_eq!(snap.error_count, 0);
    }

    #[test]
    fn test_gauge_reset() {
        let metrics = ProxyMetrics::new();
        metrics.inc_active_consumers();
        metrics.inc_active_consumers();
        metrics.reset_active_consumers();
        assert_eq!(metrics.active_consumers(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ProxyMetrics::new();
        metrics.inc_messages_received();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["messages_received"], 1);
        assert_eq!(json["active_producers"], 0);
    }
}
