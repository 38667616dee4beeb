//! Host and process metrics collection
//!
//! `MetricsCollector` turns raw counters from a `SystemSource` into
//! `MetricSample`s and keeps a bounded history of them. CPU usage is a delta
//! between consecutive reads, so the first sample is only a baseline.

mod procfs;
mod r#loop;
mod sample;


pub use procfs::{
    parse_loadavg, parse_meminfo, parse_net_dev, parse_self_stat, parse_stat, parse_status,
    parse_uptime, CpuTimes, DiskUsage, ProcessStatus, ProcfsSource, RawReadings,
};
pub use r#loop::{CollectionConfig, CollectionLoop, CollectionLoopBuilder};
pub use sample::{
    AllocatorMetrics, CpuMetrics, DiskMetrics, EventLoopMetrics, MemoryMetrics, MetricSample,
    NetworkMetrics, ProcessMetrics,
};

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::unix_millis;
use crate::config::MetricsConfig;
use crate::error::MonitorError;
use sample::{percent_of, round2};

pub use async_trait::async_trait;

/// Source of raw system counters
#[async_trait]
pub trait SystemSource: Send + Sync {
    async fn read(&self) -> Result<RawReadings>;
}

#[derive(Debug, Default)]
struct CollectorState {
    previous_cpu: Option<CpuTimes>,
    history: VecDeque<MetricSample>,
    loop_lag_ms: f64,
}

/// Samples the host and owns the sample history
pub struct MetricsCollector {
    source: Arc<dyn SystemSource>,
    history_size: usize,
    disk_path: String,
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    pub fn new(source: Arc<dyn SystemSource>, config: &MetricsConfig) -> Self {
        Self {
            source,
            history_size: config.history_size.max(1),
            disk_path: config.disk_path.clone(),
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Collector reading the configured proc root and disk path
    pub fn procfs(config: &MetricsConfig) -> Self {
        let source = ProcfsSource::new(&config.proc_root, &config.disk_path);
        Self::new(Arc::new(source), config)
    }

    /// Take a sample and append it to history
    pub async fn collect(&self) -> Result<MetricSample, MonitorError> {
        let raw = self
            .source
            .read()
            .await
            .map_err(|e| MonitorError::Collection(format!("{e:#}")))?;

        let mut state = self.state.lock();

        let (cpu_percent, baseline) = match state.previous_cpu {
            Some(prev) => (cpu_percent(prev, raw.cpu), false),
            None => (0.0, true),
        };
        state.previous_cpu = Some(raw.cpu);

        let memory_used = raw.memory_total.saturating_sub(raw.memory_available);
        let disk = raw.disk.unwrap_or_default();

        let sample = MetricSample {
            timestamp: unix_millis(),
            cpu: CpuMetrics {
                percent: cpu_percent,
                cores: raw.cores,
                load_average: raw.load_average,
                baseline,
            },
            memory: MemoryMetrics {
                total: raw.memory_total,
                used: memory_used,
                available: raw.memory_available,
                percent: percent_of(memory_used, raw.memory_total),
            },
            disk: DiskMetrics {
                path: self.disk_path.clone(),
                total: disk.total,
                used: disk.used,
                percent: percent_of(disk.used, disk.total),
            },
            network: NetworkMetrics {
                rx_bytes: raw.rx_bytes,
                tx_bytes: raw.tx_bytes,
                rx_errors: raw.rx_errors,
                tx_errors: raw.tx_errors,
            },
            event_loop: EventLoopMetrics {
                lag_ms: state.loop_lag_ms,
            },
            process: ProcessMetrics {
                pid: raw.pid,
                uptime_secs: raw.uptime_secs,
                threads: raw.threads,
                virtual_bytes: raw.virtual_bytes,
            },
            allocator: AllocatorMetrics {
                heap_bytes: raw.heap_bytes,
                resident_bytes: raw.resident_bytes,
                peak_resident_bytes: raw.peak_resident_bytes,
            },
        };

        state.history.push_back(sample.clone());
        while state.history.len() > self.history_size {
            state.history.pop_front();
        }

        Ok(sample)
    }

    /// Scheduling delay observed by the collection loop
    pub fn record_loop_lag(&self, lag: Duration) {
        self.state.lock().loop_lag_ms = round2(lag.as_secs_f64() * 1000.0);
    }

    pub fn latest(&self) -> Option<MetricSample> {
        self.state.lock().history.back().cloned()
    }

    /// Up to `limit` most recent samples, oldest first
    pub fn history(&self, limit: Option<usize>) -> Vec<MetricSample> {
        let state = self.state.lock();
        let skip = limit.map(|l| state.history.len().saturating_sub(l)).unwrap_or(0);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().history.is_empty()
    }

    /// Drop history; the next sample becomes a new CPU baseline
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.previous_cpu = None;
    }

    /// Per-second rate of change of a dotted-path field over `window`
    pub fn get_rate(&self, path: &str, window: Duration) -> f64 {
        let state = self.state.lock();
        rate_over(state.history.iter(), path, window.as_millis() as i64)
    }
}

/// Rate between the oldest and newest samples within `window_ms` of the newest
pub(crate) fn rate_over<'a>(
    samples: impl DoubleEndedIterator<Item = &'a MetricSample> + Clone,
    path: &str,
    window_ms: i64,
) -> f64 {
    let Some(newest) = samples.clone().next_back() else {
        return 0.0;
    };
    let cutoff = newest.timestamp - window_ms;
    let in_window: Vec<&MetricSample> = samples.filter(|s| s.timestamp >= cutoff).collect();

    if in_window.len() < 2 {
        return 0.0;
    }
    let oldest = in_window[0];

    let elapsed_secs = (newest.timestamp - oldest.timestamp) as f64 / 1000.0;
    if elapsed_secs <= 0.0 {
        return 0.0;
    }

    match (oldest.field(path), newest.field(path)) {
        (Some(start), Some(end)) => (end - start) / elapsed_secs,
        _ => 0.0,
    }
}

/// `100 - idle share of elapsed ticks`, clamped to [0, 100]
fn cpu_percent(previous: CpuTimes, current: CpuTimes) -> f64 {
    let total_delta = current.total as i128 - previous.total as i128;
    let idle_delta = current.idle as i128 - previous.idle as i128;
    if total_delta <= 0 {
        return 0.0;
    }
    let percent = 100.0 - (idle_delta as f64 / total_delta as f64) * 100.0;
    round2(percent.clamp(0.0, 100.0))
}
