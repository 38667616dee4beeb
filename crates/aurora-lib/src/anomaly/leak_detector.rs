//! Memory leak detection
//!
//! A leak is reported when memory is trending up and most of the window is a
//! single unbroken run of increasing samples.

use super::stats::MetricWindow;

/// Minimum samples required for leak detection
const MIN_SAMPLES_FOR_DETECTION: usize = 10;

/// Minimum trend percent before the run is inspected
const MIN_TREND_PERCENT: f64 = 10.0;

/// Share of the window the increasing run must exceed
const MONOTONICITY_THRESHOLD: f64 = 0.7;

/// Result of a positive leak check
#[derive(Debug, Clone, PartialEq)]
pub struct LeakSignal {
    pub run_length: usize,
    pub window_length: usize,
    pub trend_percent: f64,
}

impl LeakSignal {
    pub fn monotonicity(&self) -> f64 {
        self.run_length as f64 / self.window_length as f64
    }
}

/// Only memory-like metrics are checked for leaks
pub fn is_memory_metric(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("memory") || name.contains("heap")
}

pub fn detect_leak(window: &MetricWindow) -> Option<LeakSignal> {
    let trend = window.trend_percent();
    if trend < MIN_TREND_PERCENT || window.len() < MIN_SAMPLES_FOR_DETECTION {
        return None;
    }

    let run = longest_increasing_run(window.values());
    if (run as f64) > MONOTONICITY_THRESHOLD * window.len() as f64 {
        Some(LeakSignal {
            run_length: run,
            window_length: window.len(),
            trend_percent: trend,
        })
    } else {
        None
    }
}

/// Length, in samples, of the longest strictly increasing stretch
pub fn longest_increasing_run(values: impl IntoIterator<Item = f64>) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous: Option<f64> = None;

    for value in values {
        current = match previous {
            Some(prev) if value > prev => current + 1,
            _ => 1,
        };
        longest = longest.max(current);
        previous = Some(value);
    }

    longest
}
