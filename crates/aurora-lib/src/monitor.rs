//! Orchestrator
//!
//! `Monitor` owns one instance of every component, runs the periodic loops
//! (collection, detection, watchdog, health checks) and routes events from
//! the bus into alerts, healing triggers, logs and Prometheus metrics.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::{AlertInput, AlertLevel, AlertManager};
use crate::anomaly::{Anomaly, AnomalyDetector};
use crate::clock::unix_millis;
use crate::collector::{CollectionConfig, CollectionLoop, MetricSample, MetricsCollector, ProcfsSource, SystemSource};
use crate::config::{CircuitBreakerConfig, MonitorConfig, RateLimiterConfig};
use crate::error::{HealingError, MonitorError};
use crate::events::{EventBus, MonitorEvent};
use crate::healing::{AutoHealer, HealTarget, HealTrigger, ProcessWatchdog, WatchdogStatus};
use crate::health::{components, HealthCheck, HealthRegistry, HealthResponse};
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::protection::{CircuitBreaker, CircuitBreakerManager, CircuitState, RateLimiter, RateLimiterManager};

const SOURCE_MONITOR: &str = "aurora.monitor";
const SOURCE_METRICS: &str = "aurora.metrics";
const SOURCE_ANOMALY: &str = "aurora.anomaly";
const SOURCE_BREAKER: &str = "aurora.circuit_breaker";
const SOURCE_LIMITER: &str = "aurora.rate_limiter";
const SOURCE_HEALTH: &str = "aurora.health";

/// Which components are enabled
#[derive(Debug, Clone, Serialize)]
pub struct ComponentPresence {
    pub metrics_collector: bool,
    pub anomaly_detector: bool,
    pub auto_healer: bool,
    pub watchdog: bool,
    pub alert_manager: bool,
    pub health_checks: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub app_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub components: ComponentPresence,
    pub circuit_breakers: usize,
    pub open_breakers: Vec<String>,
    pub rate_limiters: usize,
    pub health_checks: usize,
    pub heal_targets: usize,
    pub health_score: f64,
    pub watchdog: WatchdogStatus,
}

#[derive(Default)]
struct RuntimeState {
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    started: Option<(Instant, DateTime<Utc>)>,
}

struct Inner {
    config: MonitorConfig,
    events: EventBus,
    collector: Arc<MetricsCollector>,
    detector: Arc<AnomalyDetector>,
    breakers: CircuitBreakerManager,
    limiters: RateLimiterManager,
    alerts: AlertManager,
    healer: Arc<AutoHealer>,
    watchdog: Arc<ProcessWatchdog>,
    health: HealthRegistry,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
    runtime: Mutex<RuntimeState>,
}

/// Cloneable handle to the protection runtime
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    /// Monitor sampling the configured procfs root
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        let source = ProcfsSource::new(&config.metrics.proc_root, &config.metrics.disk_path);
        Self::with_source(config, Arc::new(source))
    }

    pub fn with_source(config: MonitorConfig, source: Arc<dyn SystemSource>) -> Result<Self, MonitorError> {
        config.validate()?;

        let events = EventBus::default();
        let metrics = MonitorMetrics::new()?;
        let alerts = AlertManager::from_config(config.alerts.clone(), events.clone());

        let collector = Arc::new(MetricsCollector::new(source, &config.metrics));
        let detector = Arc::new(AnomalyDetector::new(config.anomaly.clone()).with_events(events.clone()));
        let breakers = CircuitBreakerManager::new(config.circuit_breaker.clone()).with_events(events.clone());
        let limiters = RateLimiterManager::new(config.rate_limiter.clone()).with_events(events.clone());
        let healer = Arc::new(AutoHealer::new(config.healer.clone(), alerts.clone()).with_events(events.clone()));
        let watchdog =
            Arc::new(ProcessWatchdog::new(config.watchdog.clone(), alerts.clone()).with_events(events.clone()));
        let logger = StructuredLogger::new(config.app_name.to_string());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                events,
                collector,
                detector,
                breakers,
                limiters,
                alerts,
                healer,
                watchdog,
                health: HealthRegistry::new(),
                metrics,
                logger,
                runtime: Mutex::new(RuntimeState::default()),
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.inner.alerts
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.inner.detector
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.inner.collector
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.inner.breakers
    }

    pub fn limiters(&self) -> &RateLimiterManager {
        &self.inner.limiters
    }

    pub fn healer(&self) -> &AutoHealer {
        &self.inner.healer
    }

    pub fn watchdog(&self) -> &ProcessWatchdog {
        &self.inner.watchdog
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn metrics(&self) -> &MonitorMetrics {
        &self.inner.metrics
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().shutdown.is_some()
    }

    /// Spawn the enabled loops and the event router
    pub async fn start(&self) -> Result<(), MonitorError> {
        let shutdown = {
            let mut runtime = self.inner.runtime.lock();
            if runtime.shutdown.is_some() {
                return Err(MonitorError::AlreadyRunning);
            }
            let (tx, _) = broadcast::channel(1);
            runtime.shutdown = Some(tx.clone());
            runtime.started = Some((Instant::now(), Utc::now()));
            tx
        };

        let config = &self.inner.config;
        let health = &self.inner.health;
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            self.clone().route_events(self.subscribe(), shutdown.subscribe()),
        ));

        health.register(components::ALERTS).await;

        if config.metrics.enabled {
            health.register(components::COLLECTOR).await;
            let (collection_loop, samples) = CollectionLoop::new(
                self.inner.collector.clone(),
                CollectionConfig {
                    interval: config.metrics.collection_interval(),
                    ..CollectionConfig::default()
                },
            );
            let collection_loop = collection_loop.with_metrics(self.inner.metrics.clone());
            tasks.push(tokio::spawn(collection_loop.run(shutdown.subscribe())));
            tasks.push(tokio::spawn(self.clone().consume_samples(samples)));
        }

        if config.anomaly.enabled {
            health.register(components::DETECTOR).await;
            tasks.push(tokio::spawn(self.clone().detection_loop(shutdown.subscribe())));
        }

        if config.watchdog.enabled {
            health.register(components::WATCHDOG).await;
            let watchdog = self.inner.watchdog.clone();
            let rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move { watchdog.run(rx).await }));
        }

        if config.healer.enabled {
            health.register(components::HEALER).await;
        }

        if config.health.enabled {
            tasks.push(tokio::spawn(self.clone().health_loop(shutdown.subscribe())));
        }

        self.inner.runtime.lock().tasks = tasks;
        health.set_ready(true).await;

        self.inner.logger.log_startup(env!("CARGO_PKG_VERSION"));
        self.inner
            .alerts
            .info(
                SOURCE_MONITOR,
                "Monitor started",
                format!("Aurora monitor started for {}", config.app_name),
            )
            .await;
        Ok(())
    }

    /// Signal shutdown, abort the loops and pending alert flushes.
    /// Returns false if the monitor was not running.
    pub async fn stop(&self) -> bool {
        let (shutdown, tasks) = {
            let mut runtime = self.inner.runtime.lock();
            let Some(shutdown) = runtime.shutdown.take() else {
                return false;
            };
            runtime.started = None;
            (shutdown, std::mem::take(&mut runtime.tasks))
        };

        let _ = shutdown.send(());
        for task in &tasks {
            task.abort();
        }
        self.inner.alerts.shutdown();
        self.inner.health.set_ready(false).await;

        self.inner.logger.log_shutdown("stop requested");
        self.inner
            .alerts
            .info(
                SOURCE_MONITOR,
                "Monitor stopped",
                format!("Aurora monitor stopped for {}", self.inner.config.app_name),
            )
            .await;
        true
    }

    /// Take a sample now and run it through the same pipeline as the loop
    pub async fn collect(&self) -> Result<MetricSample, MonitorError> {
        let sample = self.inner.collector.collect().await?;
        self.process_sample(&sample).await;
        Ok(sample)
    }

    pub fn latest_metrics(&self) -> Option<MetricSample> {
        self.inner.collector.latest()
    }

    pub fn metrics_history(&self, limit: Option<usize>) -> Vec<MetricSample> {
        self.inner.collector.history(limit)
    }

    /// Feed a host-defined metric (error rate, request latency, queue depth)
    /// into the anomaly detector
    pub fn record_metric(&self, name: &str, value: f64) {
        self.inner.detector.add_sample(name, value, unix_millis());
    }

    /// Run detection once; each finding goes to the healer policy for its type
    pub async fn detect(&self) -> Vec<Anomaly> {
        let found = self.inner.detector.detect();
        if self.inner.config.healer.enabled && !found.is_empty() {
            let mut ordered = found.clone();
            ordered.sort_by(|a, b| b.severity.cmp(&a.severity));
            self.spawn_heal(ordered.into_iter().map(HealTrigger::Anomaly).collect());
        }
        found
    }

    pub fn create_circuit_breaker(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        self.inner.breakers.get_or_create(name, config)
    }

    pub fn create_rate_limiter(&self, name: &str, config: Option<RateLimiterConfig>) -> Arc<RateLimiter> {
        self.inner.limiters.get_or_create(name, config)
    }

    pub async fn register_health_check(&self, name: &str, check: Arc<dyn HealthCheck>) -> bool {
        self.inner.health.register_check(name, check).await
    }

    pub fn register_heal_target(&self, name: &str, target: Arc<dyn HealTarget>) -> bool {
        self.inner.healer.register_target(name, target)
    }

    /// A dependency failed; reconnect it through the healer
    pub async fn report_failure(&self, target: &str, reason: &str) -> Result<u32, HealingError> {
        self.inner.healer.report_failure(target, reason).await
    }

    pub async fn heartbeat(&self) {
        self.inner.watchdog.heartbeat().await;
    }

    pub async fn status(&self) -> MonitorStatus {
        let config = &self.inner.config;
        let started = self.inner.runtime.lock().started;

        MonitorStatus {
            running: started.is_some(),
            app_name: config.app_name.to_string(),
            started_at: started.map(|(_, at)| at),
            uptime_secs: started.map_or(0.0, |(at, _)| at.elapsed().as_secs_f64()),
            components: ComponentPresence {
                metrics_collector: config.metrics.enabled,
                anomaly_detector: config.anomaly.enabled,
                auto_healer: config.healer.enabled,
                watchdog: config.watchdog.enabled,
                alert_manager: config.alerts.enabled,
                health_checks: config.health.enabled,
            },
            circuit_breakers: self.inner.breakers.len(),
            open_breakers: self.inner.breakers.open_breakers(),
            rate_limiters: self.inner.limiters.len(),
            health_checks: self.inner.health.check_count().await,
            heal_targets: self.inner.healer.target_names().len(),
            health_score: self.inner.detector.health_score(),
            watchdog: self.inner.watchdog.status(),
        }
    }

    /// Run host checks and refresh built-in component health
    pub async fn run_health_checks(&self) -> HealthResponse {
        let health = &self.inner.health;
        health.run_checks(self.inner.config.health.timeout()).await;

        if self.inner.config.watchdog.enabled {
            if self.inner.watchdog.is_alive() {
                health.set_healthy(components::WATCHDOG).await;
            } else {
                health.set_unhealthy(components::WATCHDOG, "heartbeat timeout exceeded").await;
            }
        }

        if self.inner.config.metrics.enabled {
            if let Some(latest) = self.inner.collector.latest() {
                let stale_after = self.inner.config.metrics.collection_interval_ms.saturating_mul(3) as i64;
                let age = unix_millis() - latest.timestamp;
                if age > stale_after {
                    health
                        .set_degraded(components::COLLECTOR, format!("last sample {age}ms ago"))
                        .await;
                } else {
                    health.set_healthy(components::COLLECTOR).await;
                }
            }
        }

        if self.inner.config.healer.enabled {
            let exhausted = self.inner.healer.stats().exhausted_targets;
            if exhausted > 0 {
                health
                    .set_degraded(components::HEALER, format!("{exhausted} target(s) exhausted"))
                    .await;
            } else {
                health.set_healthy(components::HEALER).await;
            }
        }

        let response = health.health().await;
        let failed = response.failing();
        if !failed.is_empty() {
            warn!(failed = ?failed, "Health checks failed");
            self.spawn_alert(AlertInput::new(
                AlertLevel::Warning,
                SOURCE_HEALTH,
                "Health check failed",
                format!("Failing: {}", failed.join(", ")),
            ));
        }
        response
    }

    async fn process_sample(&self, sample: &MetricSample) {
        self.inner.metrics.observe_sample(sample);
        if self.inner.config.anomaly.enabled {
            for (name, value) in sample.detector_inputs() {
                self.inner.detector.add_sample(name, value, sample.timestamp);
            }
            self.inner.metrics.set_health_score(self.inner.detector.health_score());
        }
        self.inner.events.publish(MonitorEvent::Metrics(sample.clone()));
        self.check_thresholds(sample).await;
    }

    /// CPU and memory breaches alert and trigger the healer; disk only alerts
    async fn check_thresholds(&self, sample: &MetricSample) {
        let limits = &self.inner.config.metrics;
        let mut breaches = Vec::new();

        if !sample.cpu.baseline && sample.cpu.percent > limits.cpu_threshold {
            breaches.push((
                "cpu.percent",
                sample.cpu.percent,
                limits.cpu_threshold,
                AlertLevel::Warning,
                "High CPU usage",
                true,
            ));
        }
        if sample.memory.percent > limits.memory_threshold {
            breaches.push((
                "memory.percent",
                sample.memory.percent,
                limits.memory_threshold,
                AlertLevel::Warning,
                "High memory usage",
                true,
            ));
        }
        if sample.disk.percent > limits.disk_threshold {
            breaches.push((
                "disk.percent",
                sample.disk.percent,
                limits.disk_threshold,
                AlertLevel::Critical,
                "Disk almost full",
                false,
            ));
        }

        for (metric, value, threshold, level, title, heal) in breaches {
            self.inner
                .alerts
                .send(
                    AlertInput::new(
                        level,
                        SOURCE_METRICS,
                        title,
                        format!("{metric} at {value:.1}% (threshold {threshold:.0}%)"),
                    )
                    .with_metadata("metric", metric)
                    .with_metadata("value", value),
                )
                .await;

            if heal && self.inner.config.healer.enabled {
                self.spawn_heal(vec![HealTrigger::Threshold {
                    metric: metric.to_string(),
                    value,
                    threshold,
                }]);
            }
        }
    }

    /// Triggers run one after another so their reconnects never overlap
    fn spawn_heal(&self, triggers: Vec<HealTrigger>) {
        let healer = self.inner.healer.clone();
        tokio::spawn(async move {
            for trigger in &triggers {
                let report = healer.handle_trigger(trigger).await;
                for (target, result) in report.reconnects {
                    if let Err(e) = result {
                        debug!(target_name = %target, error = %e, "Triggered recovery did not heal");
                    }
                }
            }
        });
    }

    fn spawn_alert(&self, input: AlertInput) {
        let alerts = self.inner.alerts.clone();
        tokio::spawn(async move {
            alerts.send(input).await;
        });
    }

    async fn consume_samples(self, mut samples: mpsc::Receiver<MetricSample>) {
        while let Some(sample) = samples.recv().await {
            self.process_sample(&sample).await;
        }
    }

    async fn detection_loop(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.inner.config.anomaly.detection_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let found = self.detect().await;
                    if !found.is_empty() {
                        debug!(count = found.len(), "Detection cycle found anomalies");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn health_loop(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.inner.config.health.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_health_checks().await;
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn route_events(
        self,
        mut events: broadcast::Receiver<MonitorEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event router fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        info!("Event router stopped");
    }

    fn handle_event(&self, event: MonitorEvent) {
        let metrics = &self.inner.metrics;
        let logger = &self.inner.logger;

        match event {
            MonitorEvent::Anomaly(anomaly) => {
                metrics.record_anomaly(&anomaly);
                logger.log_anomaly(&anomaly);
                self.spawn_alert(
                    AlertInput::new(
                        AlertLevel::Warning,
                        SOURCE_ANOMALY,
                        format!("Anomaly: {} on {}", anomaly.kind, anomaly.metric),
                        anomaly.description.clone(),
                    )
                    .with_metadata("severity", anomaly.severity.as_str())
                    .with_metadata("observed", anomaly.observed_value)
                    .with_metadata("expected", anomaly.expected_value),
                );
            }
            MonitorEvent::StateChange { breaker, from, to, .. } => {
                metrics.set_breaker_state(&breaker, to);
                logger.log_state_change(&breaker, from, to);
                match to {
                    CircuitState::Open => self.spawn_alert(AlertInput::new(
                        AlertLevel::Critical,
                        SOURCE_BREAKER,
                        format!("Circuit breaker {breaker} opened"),
                        format!("{breaker} moved from {from} to open; calls are rejected"),
                    )),
                    CircuitState::Closed => self.spawn_alert(AlertInput::new(
                        AlertLevel::Info,
                        SOURCE_BREAKER,
                        format!("Circuit breaker {breaker} closed"),
                        format!("{breaker} recovered from {from}"),
                    )),
                    CircuitState::HalfOpen => {}
                }
            }
            MonitorEvent::RateLimited {
                limiter,
                client,
                retry_after_ms,
                ..
            } => {
                metrics.inc_limiter_rejections(&limiter);
                logger.log_rate_limited(&limiter, client.as_deref(), retry_after_ms);
                let who = client.map(|c| format!(" for client {c}")).unwrap_or_default();
                self.spawn_alert(AlertInput::new(
                    AlertLevel::Warning,
                    SOURCE_LIMITER,
                    format!("Rate limit exceeded: {limiter}"),
                    format!("{limiter} rejected a request{who}; retry after {retry_after_ms}ms"),
                ));
            }
            MonitorEvent::Alert(alert) => metrics.record_alert(alert.level.as_str()),
            MonitorEvent::Healed { target, attempts } => {
                metrics.record_heal("healed");
                logger.log_healing(&target, attempts, true);
            }
            MonitorEvent::HealingExhausted { target, attempts } => {
                metrics.record_heal("exhausted");
                logger.log_healing(&target, attempts, false);
            }
            MonitorEvent::ProcessUnresponsive { silent_for_ms } => {
                metrics.set_watchdog_alive(false);
                logger.log_watchdog(true, silent_for_ms);
            }
            MonitorEvent::ProcessRecovered { downtime_ms } => {
                metrics.set_watchdog_alive(true);
                logger.log_watchdog(false, downtime_ms);
            }
            MonitorEvent::Metrics(_) | MonitorEvent::ChannelReconnected { .. } => {}
        }
    }
}
