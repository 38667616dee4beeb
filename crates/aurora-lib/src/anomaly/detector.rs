//! Multi-check anomaly detector
//!
//! Each tracked metric keeps its own time window. `detect()` runs the
//! outlier, spike, trend, leak and error-rate checks against every metric
//! that has at least three samples.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use super::leak_detector::{detect_leak, is_memory_metric};
use super::stats::{MetricStats, MetricWindow};
use crate::config::AnomalyConfig;
use crate::events::{EventBus, MonitorEvent};

/// Minimum samples per metric before any check runs
const MIN_SAMPLES_FOR_DETECTION: usize = 3;

/// Anomalies newer than this lower the health score
const HEALTH_LOOKBACK_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Outlier,
    Spike,
    GrowingTrend,
    DecliningTrend,
    MemoryLeak,
    HighErrorRate,
    LatencyIncrease,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Outlier => "outlier",
            AnomalyType::Spike => "spike",
            AnomalyType::GrowingTrend => "growing_trend",
            AnomalyType::DecliningTrend => "declining_trend",
            AnomalyType::MemoryLeak => "memory_leak",
            AnomalyType::HighErrorRate => "high_error_rate",
            AnomalyType::LatencyIncrease => "latency_increase",
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    fn from_z_score(z: f64) -> Self {
        if z >= 5.0 {
            Severity::Critical
        } else if z >= 4.0 {
            Severity::High
        } else if z >= 3.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn from_spike_ratio(ratio: f64) -> Self {
        if ratio >= 5.0 {
            Severity::Critical
        } else if ratio >= 3.0 {
            Severity::High
        } else if ratio >= 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn from_trend(trend: f64) -> Self {
        let trend = trend.abs();
        if trend >= 60.0 {
            Severity::Critical
        } else if trend >= 40.0 {
            Severity::High
        } else if trend >= 20.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Score penalty applied per recent anomaly
    fn penalty(&self) -> f64 {
        match self {
            Severity::Low => 2.0,
            Severity::Medium => 5.0,
            Severity::High => 10.0,
            Severity::Critical => 20.0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected anomaly; never modified after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "anomaly_type")]
    pub kind: AnomalyType,
    pub metric: String,
    pub observed_value: f64,
    pub expected_value: f64,
    pub deviation: f64,
    pub severity: Severity,
    pub description: String,
    /// Timestamp (ms) of the sample that triggered it
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStats {
    pub tracked_metrics: usize,
    pub total_detected: u64,
    pub history_len: usize,
    pub by_type: BTreeMap<AnomalyType, u64>,
    pub by_severity: BTreeMap<Severity, u64>,
    pub metrics: BTreeMap<String, MetricStats>,
}

#[derive(Debug, Default)]
struct DetectorState {
    metrics: HashMap<String, MetricWindow>,
    history: VecDeque<Anomaly>,
    total_detected: u64,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    events: Option<EventBus>,
    state: Mutex<DetectorState>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            events: None,
            state: Mutex::new(DetectorState::default()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Record one value for `metric` at `timestamp` (unix ms)
    pub fn add_sample(&self, metric: &str, value: f64, timestamp: i64) {
        if !value.is_finite() {
            return;
        }
        let window_ms = self.config.window_span_ms();
        let mut state = self.state.lock();
        state
            .metrics
            .entry(metric.to_string())
            .or_insert_with(|| MetricWindow::new(window_ms))
            .add_sample(timestamp, value);
    }

    /// Run every check once and return what matched
    pub fn detect(&self) -> Vec<Anomaly> {
        let found = {
            let mut state = self.state.lock();

            let mut names: Vec<&String> = state.metrics.keys().collect();
            names.sort();

            let mut found = Vec::new();
            for name in names {
                let window = &state.metrics[name];
                if window.len() < MIN_SAMPLES_FOR_DETECTION {
                    continue;
                }
                self.check_metric(name, window, &mut found);
            }

            for anomaly in &found {
                state.history.push_back(anomaly.clone());
            }
            while state.history.len() > self.config.history_size {
                state.history.pop_front();
            }
            state.total_detected += found.len() as u64;
            found
        };

        for anomaly in &found {
            debug!(
                metric = %anomaly.metric,
                anomaly_type = %anomaly.kind,
                severity = %anomaly.severity,
                observed = anomaly.observed_value,
                expected = anomaly.expected_value,
                "Anomaly detected"
            );
            if let Some(ref events) = self.events {
                events.publish(MonitorEvent::Anomaly(anomaly.clone()));
            }
        }

        found
    }

    fn check_metric(&self, name: &str, window: &MetricWindow, out: &mut Vec<Anomaly>) {
        let Some(last) = window.last_value() else {
            return;
        };
        let timestamp = window.last_timestamp().unwrap_or_default();
        let anomaly = |kind, expected: f64, deviation: f64, severity, description: String| Anomaly {
            kind,
            metric: name.to_string(),
            observed_value: last,
            expected_value: expected,
            deviation,
            severity,
            description,
            timestamp,
        };

        // Outlier
        let std_dev = window.std_dev();
        if std_dev > f64::EPSILON {
            let z = (last - window.mean()).abs() / std_dev;
            if z > self.config.z_score_threshold {
                out.push(anomaly(
                    AnomalyType::Outlier,
                    window.mean(),
                    z,
                    Severity::from_z_score(z),
                    format!("{name} is {z:.2} standard deviations from the mean {:.2}", window.mean()),
                ));
            }
        }

        // Spike
        if let Some(previous) = window.previous_value() {
            if previous.abs() > f64::EPSILON {
                let ratio = last / previous;
                if ratio > self.config.spike_multiplier {
                    out.push(anomaly(
                        AnomalyType::Spike,
                        previous,
                        ratio,
                        Severity::from_spike_ratio(ratio),
                        format!("{name} jumped {ratio:.2}x from {previous:.2} to {last:.2}"),
                    ));
                }
            }
        }

        // Trend
        let trend = window.trend_percent();
        if trend.abs() > self.config.trend_threshold {
            let kind = if trend < 0.0 {
                AnomalyType::DecliningTrend
            } else if is_latency_metric(name) {
                AnomalyType::LatencyIncrease
            } else {
                AnomalyType::GrowingTrend
            };
            out.push(anomaly(
                kind,
                window.mean(),
                trend,
                Severity::from_trend(trend),
                format!("{name} changed {trend:+.1}% across the window"),
            ));
        }

        // Memory leak
        if is_memory_metric(name) {
            if let Some(signal) = detect_leak(window) {
                out.push(anomaly(
                    AnomalyType::MemoryLeak,
                    window.mean(),
                    signal.trend_percent,
                    Severity::High,
                    format!(
                        "{name} increased for {} of {} consecutive samples",
                        signal.run_length, signal.window_length
                    ),
                ));
            }
        }

        // Error rate
        if is_error_metric(name) && last > self.config.error_rate_threshold {
            let ratio = last / self.config.error_rate_threshold.max(f64::EPSILON);
            let severity = if ratio >= 4.0 {
                Severity::Critical
            } else if ratio >= 2.0 {
                Severity::High
            } else {
                Severity::Medium
            };
            out.push(anomaly(
                AnomalyType::HighErrorRate,
                self.config.error_rate_threshold,
                ratio,
                severity,
                format!(
                    "{name} at {last:.2} exceeds threshold {:.2}",
                    self.config.error_rate_threshold
                ),
            ));
        }
    }

    /// Most recent anomalies, newest last
    pub fn history(&self, limit: Option<usize>) -> Vec<Anomaly> {
        let state = self.state.lock();
        let skip = limit.map(|l| state.history.len().saturating_sub(l)).unwrap_or(0);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn metric_stats(&self, metric: &str) -> Option<MetricStats> {
        self.state.lock().metrics.get(metric).map(MetricWindow::stats)
    }

    pub fn tracked_metrics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().metrics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> DetectorStats {
        let state = self.state.lock();
        let mut by_type = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for anomaly in &state.history {
            *by_type.entry(anomaly.kind).or_insert(0) += 1;
            *by_severity.entry(anomaly.severity).or_insert(0) += 1;
        }

        DetectorStats {
            tracked_metrics: state.metrics.len(),
            total_detected: state.total_detected,
            history_len: state.history.len(),
            by_type,
            by_severity,
            metrics: state
                .metrics
                .iter()
                .map(|(name, window)| (name.clone(), window.stats()))
                .collect(),
        }
    }

    /// 0-100, lowered by resource pressure and recent anomalies
    pub fn health_score(&self) -> f64 {
        let state = self.state.lock();
        let latest = |name: &str| state.metrics.get(name).and_then(MetricWindow::last_value);

        let mut score = 100.0;
        score -= (latest("cpu.percent").unwrap_or(0.0) - 50.0).max(0.0) * 0.5;
        score -= (latest("memory.percent").unwrap_or(0.0) - 50.0).max(0.0) * 0.5;
        score -= (latest("disk.percent").unwrap_or(0.0) - 70.0).max(0.0);

        let now = state
            .metrics
            .values()
            .filter_map(MetricWindow::last_timestamp)
            .max()
            .unwrap_or(0);
        score -= state
            .history
            .iter()
            .filter(|a| now - a.timestamp < HEALTH_LOOKBACK_MS)
            .map(|a| a.severity.penalty())
            .sum::<f64>();

        score.clamp(0.0, 100.0)
    }

    /// Forget all metric windows and anomaly history
    pub fn reset(&self) {
        *self.state.lock() = DetectorState::default();
    }
}

fn is_latency_metric(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("latency") || name.contains("lag")
}

fn is_error_metric(name: &str) -> bool {
    name.to_ascii_lowercase().contains("error")
}
