//! Observability for the protection runtime
//!
//! Provides:
//! - Prometheus metrics on a per-monitor registry (resource gauges, anomaly,
//!   alert and healing counters, breaker state, watchdog liveness)
//! - Structured JSON logging with tracing

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tracing::{error, info, warn};

use crate::anomaly::{Anomaly, Severity};
use crate::collector::MetricSample;
use crate::protection::CircuitState;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

const NAMESPACE: &str = "aurora";

/// Prometheus metrics owned by one monitor instance.
///
/// Clones share the same collectors. Nothing is registered with the
/// process-wide default registry, so several monitors can coexist.
#[derive(Clone)]
pub struct MonitorMetrics {
    registry: Registry,
    cpu_percent: Gauge,
    memory_percent: Gauge,
    disk_percent: Gauge,
    event_loop_lag_ms: Gauge,
    health_score: Gauge,
    collection_latency_seconds: Histogram,
    collection_errors: IntCounter,
    anomalies: IntCounterVec,
    alerts: IntCounterVec,
    breaker_state: IntGaugeVec,
    limiter_rejections: IntCounterVec,
    heal_outcomes: IntCounterVec,
    watchdog_alive: IntGauge,
}

impl MonitorMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<Gauge, prometheus::Error> {
            let gauge = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec, prometheus::Error> {
            let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let cpu_percent = gauge("cpu_percent", "Host CPU usage percent")?;
        let memory_percent = gauge("memory_percent", "Host memory usage percent")?;
        let disk_percent = gauge("disk_percent", "Disk usage percent of the monitored path")?;
        let event_loop_lag_ms = gauge("event_loop_lag_ms", "Scheduling delay of the collection loop")?;
        let health_score = gauge("health_score", "Composite 0-100 health score")?;

        let collection_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("collection_latency_seconds", "Time spent collecting one sample")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(collection_latency_seconds.clone()))?;

        let collection_errors = IntCounter::with_opts(
            Opts::new("collection_errors_total", "Failed collection ticks").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(collection_errors.clone()))?;

        let anomalies = counter_vec(
            "anomalies_total",
            "Anomalies detected by type and severity",
            &["type", "severity"],
        )?;
        let alerts = counter_vec("alerts_total", "Dispatched alerts by level", &["level"])?;
        let limiter_rejections = counter_vec(
            "rate_limiter_rejections_total",
            "Requests rejected per rate limiter",
            &["limiter"],
        )?;
        let heal_outcomes = counter_vec(
            "heal_outcomes_total",
            "Healing recoveries by outcome",
            &["outcome"],
        )?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Breaker state per name (0 closed, 1 half open, 2 open)",
            )
            .namespace(NAMESPACE),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let watchdog_alive = IntGauge::with_opts(
            Opts::new("watchdog_alive", "1 while heartbeats arrive within the timeout")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(watchdog_alive.clone()))?;
        watchdog_alive.set(1);

        Ok(Self {
            registry,
            cpu_percent,
            memory_percent,
            disk_percent,
            event_loop_lag_ms,
            health_score,
            collection_latency_seconds,
            collection_errors,
            anomalies,
            alerts,
            breaker_state,
            limiter_rejections,
            heal_outcomes,
            watchdog_alive,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric in the registry
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn observe_sample(&self, sample: &MetricSample) {
        if !sample.cpu.baseline {
            self.cpu_percent.set(sample.cpu.percent);
        }
        self.memory_percent.set(sample.memory.percent);
        self.disk_percent.set(sample.disk.percent);
        self.event_loop_lag_ms.set(sample.event_loop.lag_ms);
    }

    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.collection_latency_seconds.observe(duration_secs);
    }

    pub fn inc_collection_errors(&self) {
        self.collection_errors.inc();
    }

    pub fn set_health_score(&self, score: f64) {
        self.health_score.set(score);
    }

    pub fn record_anomaly(&self, anomaly: &Anomaly) {
        self.anomalies
            .with_label_values(&[anomaly.kind.as_str(), anomaly.severity.as_str()])
            .inc();
    }

    pub fn record_alert(&self, level: &str) {
        self.alerts.with_label_values(&[level]).inc();
    }

    pub fn set_breaker_state(&self, breaker: &str, state: CircuitState) {
        self.breaker_state
            .with_label_values(&[breaker])
            .set(state.as_gauge());
    }

    pub fn inc_limiter_rejections(&self, limiter: &str) {
        self.limiter_rejections.with_label_values(&[limiter]).inc();
    }

    /// `outcome` is `healed` or `exhausted`
    pub fn record_heal(&self, outcome: &str) {
        self.heal_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn set_watchdog_alive(&self, alive: bool) {
        self.watchdog_alive.set(i64::from(alive));
    }
}

/// Structured logger for runtime events
///
/// Every method emits exactly one event with an `event` field so log
/// pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    app_name: String,
}

impl StructuredLogger {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Log an anomaly detection event
    pub fn log_anomaly(&self, anomaly: &Anomaly) {
        if anomaly.severity >= Severity::High {
            warn!(
                event = "anomaly_detected",
                app = %self.app_name,
                anomaly_type = %anomaly.kind,
                metric = %anomaly.metric,
                severity = %anomaly.severity,
                observed = anomaly.observed_value,
                expected = anomaly.expected_value,
                deviation = anomaly.deviation,
                "{}", anomaly.description
            );
        } else {
            info!(
                event = "anomaly_detected",
                app = %self.app_name,
                anomaly_type = %anomaly.kind,
                metric = %anomaly.metric,
                severity = %anomaly.severity,
                observed = anomaly.observed_value,
                expected = anomaly.expected_value,
                deviation = anomaly.deviation,
                "{}", anomaly.description
            );
        }
    }

    pub fn log_state_change(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(
                event = "circuit_state_change",
                app = %self.app_name,
                breaker = %breaker,
                from = %from,
                to = %to,
                "Circuit breaker opened"
            ),
            _ => info!(
                event = "circuit_state_change",
                app = %self.app_name,
                breaker = %breaker,
                from = %from,
                to = %to,
                "Circuit breaker state changed"
            ),
        }
    }

    pub fn log_rate_limited(&self, limiter: &str, client: Option<&str>, retry_after_ms: u64) {
        info!(
            event = "rate_limited",
            app = %self.app_name,
            limiter = %limiter,
            client = ?client,
            retry_after_ms = retry_after_ms,
            "Request rejected by rate limiter"
        );
    }

    /// Log the end of a recovery, successful or not
    pub fn log_healing(&self, target: &str, attempts: u32, healed: bool) {
        if healed {
            info!(
                event = "healing_succeeded",
                app = %self.app_name,
                target = %target,
                attempts = attempts,
                "Healing target recovered"
            );
        } else {
            error!(
                event = "healing_exhausted",
                app = %self.app_name,
                target = %target,
                attempts = attempts,
                "Healing attempts exhausted"
            );
        }
    }

    pub fn log_watchdog(&self, unresponsive: bool, duration_ms: u64) {
        if unresponsive {
            error!(
                event = "process_unresponsive",
                app = %self.app_name,
                silent_for_ms = duration_ms,
                "Heartbeat timeout exceeded"
            );
        } else {
            info!(
                event = "process_recovered",
                app = %self.app_name,
                downtime_ms = duration_ms,
                "Heartbeats resumed"
            );
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "monitor_started",
            app = %self.app_name,
            version = %version,
            "Aurora monitor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            app = %self.app_name,
            reason = %reason,
            "Aurora monitor shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyType;

    #[test]
    fn test_independent_registries() {
        // two instances must not collide on metric names
        let first = MonitorMetrics::new().unwrap();
        let second = MonitorMetrics::new().unwrap();

        first.record_alert("critical");
        let text = String::from_utf8(first.encode().unwrap()).unwrap();
        assert!(text.contains("aurora_alerts_total{level=\"critical\"} 1"));

        let text = String::from_utf8(second.encode().unwrap()).unwrap();
        assert!(!text.contains("aurora_alerts_total{level=\"critical\"}"));
    }

    #[test]
    fn test_metrics_are_exposed() {
        let metrics = MonitorMetrics::new().unwrap();
        let mut sample = MetricSample::default();
        sample.memory.percent = 42.5;
        metrics.observe_sample(&sample);
        metrics.observe_collection_latency(0.002);
        metrics.set_breaker_state("openai", CircuitState::Open);
        metrics.inc_limiter_rejections("telegram");
        metrics.record_heal("healed");
        metrics.set_watchdog_alive(false);
        metrics.record_anomaly(&Anomaly {
            kind: AnomalyType::Spike,
            metric: "cpu.percent".into(),
            observed_value: 95.0,
            expected_value: 20.0,
            deviation: 4.75,
            severity: Severity::Medium,
            description: "spike".into(),
            timestamp: 0,
        });

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("aurora_memory_percent 42.5"));
        assert!(text.contains("aurora_circuit_breaker_state{breaker=\"openai\"} 2"));
        assert!(text.contains("aurora_rate_limiter_rejections_total{limiter=\"telegram\"} 1"));
        assert!(text.contains("aurora_anomalies_total{severity=\"medium\",type=\"spike\"} 1"));
        assert!(text.contains("aurora_watchdog_alive 0"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-app");
        assert_eq!(logger.app_name(), "test-app");
    }
}
