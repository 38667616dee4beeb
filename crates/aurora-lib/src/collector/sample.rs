//! Metric sample data model

use serde::{Deserialize, Serialize};

/// One collection tick's worth of host statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
    pub event_loop: EventLoopMetrics,
    pub process: ProcessMetrics,
    pub allocator: AllocatorMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub percent: f64,
    pub cores: usize,
    /// 1, 5 and 15 minute load averages
    pub load_average: [f64; 3],
    /// True when no previous tick existed to diff against
    pub baseline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub path: String,
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLoopMetrics {
    pub lag_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub uptime_secs: f64,
    pub threads: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocatorMetrics {
    /// Data segment size, the closest procfs proxy for heap usage
    pub heap_bytes: u64,
    pub resident_bytes: u64,
    pub peak_resident_bytes: u64,
}

impl MetricSample {
    /// Values fed to the anomaly detector each tick, keyed by metric name
    pub fn detector_inputs(&self) -> Vec<(&'static str, f64)> {
        let mut inputs = vec![
            ("memory.percent", self.memory.percent),
            ("disk.percent", self.disk.percent),
            ("event_loop.lag_ms", self.event_loop.lag_ms),
            ("allocator.heap_bytes", self.allocator.heap_bytes as f64),
            ("process.threads", self.process.threads as f64),
        ];
        if !self.cpu.baseline {
            inputs.push(("cpu.percent", self.cpu.percent));
        }
        inputs
    }

    /// Numeric field addressed by a dotted path such as `network.rx_bytes`
    pub fn field(&self, path: &str) -> Option<f64> {
        let value = serde_json::to_value(self).ok()?;
        let pointer = format!("/{}", path.replace('.', "/"));
        value.pointer(&pointer)?.as_f64()
    }
}

/// Round to two decimal places
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `part / total * 100`, rounded; 0 when total is 0
pub(crate) fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(part as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup_by_dotted_path() {
        let mut sample = MetricSample::default();
        sample.network.rx_bytes = 4096;
        sample.cpu.load_average = [0.5, 1.0, 1.5];

        assert_eq!(sample.field("network.rx_bytes"), Some(4096.0));
        assert_eq!(sample.field("cpu.load_average.1"), Some(1.0));
        assert_eq!(sample.field("network.nope"), None);
        assert_eq!(sample.field("disk.path"), None);
    }

    #[test]
    fn test_baseline_cpu_is_not_fed_to_detector() {
        let mut sample = MetricSample::default();
        sample.cpu.baseline = true;
        assert!(sample.detector_inputs().iter().all(|(name, _)| *name != "cpu.percent"));

        sample.cpu.baseline = false;
        assert!(sample.detector_inputs().iter().any(|(name, _)| *name == "cpu.percent"));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(1, 3), 33.33);
        assert_eq!(percent_of(5, 0), 0.0);
    }
}
