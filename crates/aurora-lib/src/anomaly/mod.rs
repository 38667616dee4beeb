//! Statistical anomaly detection over named metric streams
//!
//! This module provides detection for:
//! - Outliers (z-score against the window)
//! - Spikes between consecutive samples
//! - Growing/declining trends and latency increases
//! - Memory leaks (long monotonically increasing runs)
//! - Error rates above a fixed threshold

mod detector;
mod leak_detector;
mod stats;

pub use detector::{Anomaly, AnomalyDetector, AnomalyType, DetectorStats, Severity};
pub use leak_detector::{detect_leak, is_memory_metric, longest_increasing_run, LeakSignal};
pub use stats::{MetricStats, MetricWindow};
