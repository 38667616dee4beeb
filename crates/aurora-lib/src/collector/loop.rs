//! Metrics collection loop
//!
//! Ticks the collector on a fixed interval, records how late each tick ran
//! as event-loop lag, and forwards every sample over a channel.

use super::{MetricSample, MetricsCollector};
use crate::observability::MonitorMetrics;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the metrics collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Collection interval (default: 5 seconds)
    pub interval: Duration,
    /// Channel buffer size for collected samples
    pub buffer_size: usize,
    /// Consecutive failures before each error is logged at warn level
    pub warn_after_failures: u32,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            buffer_size: 64,
            warn_after_failures: 3,
        }
    }
}

/// Periodically samples the host until shutdown
pub struct CollectionLoop {
    collector: Arc<MetricsCollector>,
    config: CollectionConfig,
    samples_tx: mpsc::Sender<MetricSample>,
    metrics: Option<MonitorMetrics>,
    consecutive_failures: u32,
}

impl CollectionLoop {
    pub fn new(
        collector: Arc<MetricsCollector>,
        config: CollectionConfig,
    ) -> (Self, mpsc::Receiver<MetricSample>) {
        let (samples_tx, samples_rx) = mpsc::channel(config.buffer_size.max(1));

        let loop_instance = Self {
            collector,
            config,
            samples_tx,
            metrics: None,
            consecutive_failures: 0,
        };

        (loop_instance, samples_rx)
    }

    /// Record tick latency and failures in Prometheus
    pub fn with_metrics(mut self, metrics: MonitorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until a shutdown signal arrives or the receiver is dropped
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting metrics collection loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                scheduled = ticker.tick() => {
                    self.collector.record_loop_lag(Instant::now().saturating_duration_since(scheduled));

                    if !self.tick().await {
                        info!("Sample receiver dropped, stopping collection loop");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down metrics collection loop");
                    break;
                }
            }
        }
    }

    /// Collect once; returns false once nobody is listening
    async fn tick(&mut self) -> bool {
        let start = Instant::now();

        match self.collector.collect().await {
            Ok(sample) => {
                self.consecutive_failures = 0;
                if let Some(ref metrics) = self.metrics {
                    metrics.observe_collection_latency(start.elapsed().as_secs_f64());
                }
                debug!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    cpu_percent = sample.cpu.percent,
                    memory_percent = sample.memory.percent,
                    "Collection cycle complete"
                );
                self.samples_tx.send(sample).await.is_ok()
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if let Some(ref metrics) = self.metrics {
                    metrics.inc_collection_errors();
                }
                if self.consecutive_failures >= self.config.warn_after_failures {
                    warn!(
                        error = %e,
                        consecutive_failures = self.consecutive_failures,
                        "Metrics collection failing"
                    );
                } else {
                    debug!(error = %e, "Failed to collect metrics");
                }
                true
            }
        }
    }
}

/// Builder for creating the collection loop
pub struct CollectionLoopBuilder {
    collector: Option<Arc<MetricsCollector>>,
    config: CollectionConfig,
}

impl CollectionLoopBuilder {
    pub fn new() -> Self {
        Self {
            collector: None,
            config: CollectionConfig::default(),
        }
    }

    pub fn collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn build(self) -> Result<(CollectionLoop, mpsc::Receiver<MetricSample>)> {
        let collector = self
            .collector
            .ok_or_else(|| anyhow::anyhow!("Collector is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Collection interval must be greater than zero");
        }

        Ok(CollectionLoop::new(collector, self.config))
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CpuTimes, RawReadings, SystemSource};
    use crate::config::MetricsConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Source whose CPU counters advance by a fixed amount each read
    struct MockSource {
        reads: AtomicU64,
        fail: bool,
    }

    impl MockSource {
        fn new(fail: bool) -> Self {
            Self {
                reads: AtomicU64::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl SystemSource for MockSource {
        async fn read(&self) -> Result<RawReadings> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("source unavailable");
            }
            Ok(RawReadings {
                cpu: CpuTimes {
                    idle: n * 75,
                    total: n * 100,
                },
                cores: 4,
                memory_total: 1000,
                memory_available: 400,
                ..RawReadings::default()
            })
        }
    }

    fn collector(fail: bool) -> (Arc<MetricsCollector>, Arc<MockSource>) {
        let source = Arc::new(MockSource::new(fail));
        let collector = Arc::new(MetricsCollector::new(source.clone(), &MetricsConfig::default()));
        (collector, source)
    }

    #[test]
    fn test_collection_config_default() {
        let config = CollectionConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.buffer_size, 64);
    }

    #[test]
    fn test_collection_loop_builder_missing_collector() {
        assert!(CollectionLoopBuilder::new().build().is_err());
    }

    #[test]
    fn test_collection_loop_builder_rejects_zero_interval() {
        let (collector, _) = collector(false);
        let result = CollectionLoopBuilder::new()
            .collector(collector)
            .interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_forwards_samples_until_shutdown() {
        let (collector, source) = collector(false);
        let (collection_loop, mut rx) = CollectionLoopBuilder::new()
            .collector(collector.clone())
            .interval(Duration::from_millis(100))
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(collection_loop.run(shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert!(first.cpu.baseline);

        let second = rx.recv().await.unwrap();
        assert!(!second.cpu.baseline);
        assert_eq!(second.cpu.percent, 25.0);
        assert_eq!(second.memory.percent, 60.0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(source.reads.load(Ordering::SeqCst) >= 2);
        assert!(collector.len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_collection_errors() {
        let (collector, source) = collector(true);
        let (collection_loop, _rx) = CollectionLoop::new(
            collector,
            CollectionConfig {
                interval: Duration::from_millis(10),
                ..CollectionConfig::default()
            },
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(collection_loop.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(55)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(source.reads.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_in_metrics() {
        let (collector, _) = collector(true);
        let metrics = MonitorMetrics::new().unwrap();
        let (collection_loop, _rx) = CollectionLoop::new(
            collector,
            CollectionConfig {
                interval: Duration::from_millis(10),
                ..CollectionConfig::default()
            },
        );
        let collection_loop = collection_loop.with_metrics(metrics.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(collection_loop.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(25)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        let errors: f64 = text
            .lines()
            .find_map(|l| l.strip_prefix("aurora_collection_errors_total "))
            .unwrap()
            .parse()
            .unwrap();
        assert!(errors >= 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_receiver_dropped() {
        let (collector, _) = collector(false);
        let (collection_loop, rx) = CollectionLoop::new(collector, CollectionConfig::default());
        drop(rx);

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        collection_loop.run(shutdown_rx).await;
    }
}
