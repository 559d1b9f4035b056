//! Cleanup scheduler.
//!
//! Three periodic tasks keep the registries bounded: an idle-producer
//! sweep, a producer refcount repair pass, and an idle-consumer sweep (its
//! longer threshold survives transient client reconnects in cluster mode).
//! All tasks stop when the shared cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{ConsumerRegistry, ProducerRegistry};

/// Tick cadences and idle thresholds for the periodic tasks.
#[derive(Debug, Clone)]
pub struct SweepSchedule {
    pub producer_sweep_interval: Duration,
    pub producer_idle_timeout: Duration,
    pub refcount_repair_interval: Duration,
    pub consumer_sweep_interval: Duration,
    pub consumer_idle_timeout: Duration,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            producer_sweep_interval: Duration::from_secs(30),
            producer_idle_timeout: Duration::from_secs(60),
            refcount_repair_interval: Duration::from_secs(300),
            consumer_sweep_interval: Duration::from_secs(120),
            consumer_idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Owns the periodic cleanup tasks.
pub struct CleanupScheduler {
    producers: Arc<ProducerRegistry>,
    consumers: Arc<ConsumerRegistry>,
    schedule: SweepSchedule,
    stop: CancellationToken,
}

impl CleanupScheduler {
    pub fn new(producers: Arc<ProducerRegistry>, consumers: Arc<ConsumerRegistry>) -> Self {
        Self::with_schedule(producers, consumers, SweepSchedule::default())
    }

    pub fn with_schedule(
        producers: Arc<ProducerRegistry>,
        consumers: Arc<ConsumerRegistry>,
        schedule: SweepSchedule,
    ) -> Self {
        Self {
            producers,
            consumers,
            schedule,
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops every spawned task when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Spawn the three periodic tasks.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        info!(
            producer_interval_secs = self.schedule.producer_sweep_interval.as_secs(),
            producer_idle_secs = self.schedule.producer_idle_timeout.as_secs(),
            consumer_interval_secs = self.schedule.consumer_sweep_interval.as_secs(),
            consumer_idle_secs = self.schedule.consumer_idle_timeout.as_secs(),
            "Starting cleanup tasks"
        );
        vec![
            self.spawn_producer_sweep(),
            self.spawn_refcount_repair(),
            self.spawn_consumer_sweep(),
        ]
    }

    fn spawn_producer_sweep(&self) -> JoinHandle<()> {
        let producers = Arc::clone(&self.producers);
        let stop = self.stop.clone();
        let interval = self.schedule.producer_sweep_interval;
        let timeout = self.schedule.producer_idle_timeout;
        tokio::spawn(async move {
            let mut ticker = ticker(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let released = producers.sweep(timeout).await;
                        if released > 0 {
                            info!(released, "Idle producer sweep completed");
                        } else {
                            debug!("Idle producer sweep found nothing");
                        }
                    }
                }
            }
        })
    }

    fn spawn_refcount_repair(&self) -> JoinHandle<()> {
        let producers = Arc::clone(&self.producers);
        let stop = self.stop.clone();
        let interval = self.schedule.refcount_repair_interval;
        tokio::spawn(async move {
            let mut ticker = ticker(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let repaired = producers.validate_and_repair().await;
                        if repaired > 0 {
                            info!(repaired, "Producer refcount repair completed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_consumer_sweep(&self) -> JoinHandle<()> {
        let consumers = Arc::clone(&self.consumers);
        let stop = self.stop.clone();
        let interval = self.schedule.consumer_sweep_interval;
        let timeout = self.schedule.consumer_idle_timeout;
        tokio::spawn(async move {
            let mut ticker = ticker(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let released = consumers.sweep(timeout).await;
                        if released > 0 {
                            info!(released, "Idle consumer sweep completed");
                        } else {
                            debug!("Idle consumer sweep found nothing");
                        }
                    }
                }
            }
        })
    }
}

/// Interval whose first tick fires after one full period.
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::metrics::ProxyMetrics;
    use crate::registry::{ConsumerRegistrySettings, ConsumerSpec, ProducerSpec};

    fn registries() -> (Arc<ProducerRegistry>, Arc<ConsumerRegistry>, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(ProxyMetrics::new());
        let producers = Arc::new(ProducerRegistry::new(
            Arc::new(broker.clone()),
            Arc::clone(&metrics),
        ));
        let consumers = Arc::new(ConsumerRegistry::new(
            Arc::new(broker.clone()),
            metrics,
            ConsumerRegistrySettings::default(),
        ));
        (producers, consumers, broker)
    }

    #[tokio::test]
    async fn test_sweepers_release_idle_handles() {
        let (producers, consumers, broker) = registries();

        producers
            .create(&ProducerSpec {
                endpoint: "127.0.0.1:9876".into(),
                access_key_id: "k".into(),
                access_key_secret: "s".into(),
                instance_id: "i1".into(),
                topic: "T".into(),
            })
            .await
            .unwrap();
        consumers
            .create(&ConsumerSpec {
                endpoint: "127.0.0.1:9876".into(),
                access_key_id: "k".into(),
                access_key_secret: "s".into(),
                instance_id: "i1".into(),
                topic: "T".into(),
                group_id: "G".into(),
                tag_expression: "*".into(),
            })
            .await
            .unwrap();

        let schedule = SweepSchedule {
            producer_sweep_interval: Duration::from_millis(20),
            producer_idle_timeout: Duration::from_millis(5),
            refcount_repair_interval: Duration::from_millis(20),
            consumer_sweep_interval: Duration::from_millis(20),
            consumer_idle_timeout: Duration::from_millis(5),
        };
        let scheduler =
            CleanupScheduler::with_schedule(Arc::clone(&producers), Arc::clone(&consumers), schedule);
        let stop = scheduler.stop_token();
        let tasks = scheduler.spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(producers.handle_count().await, 0);
        assert_eq!(consumers.handle_count().await, 0);
        assert_eq!(broker.producers_shutdown(), 1);
        assert_eq!(broker.consumers_shutdown(), 1);

        stop.cancel();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_stop_token_ends_tasks_without_sweeping() {
        let (producers, consumers, _broker) = registries();
        producers
            .create(&ProducerSpec {
                endpoint: "127.0.0.1:9876".into(),
                access_key_id: "k".into(),
                access_key_secret: "s".into(),
                instance_id: "i1".into(),
                topic: "T".into(),
            })
            .await
            .unwrap();

        let scheduler = CleanupScheduler::new(Arc::clone(&producers), consumers);
        let stop = scheduler.stop_token();
        let tasks = scheduler.spawn();

        stop.cancel();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
        }
        // Nothing was swept; the handle survived.
        assert_eq!(producers.handle_count().await, 1);
    }
}
