//! Time-windowed statistics for a single metric

use serde::Serialize;
use std::collections::VecDeque;

/// Hard cap on retained samples regardless of the time window
const MAX_WINDOW_SAMPLES: usize = 10_000;

/// Minimum samples before a trend is reported
const MIN_SAMPLES_FOR_TREND: usize = 3;

/// Rolling window of `(timestamp_ms, value)` samples
///
/// Statistics are recomputed from the retained samples after every insert,
/// never updated incrementally.
#[derive(Debug, Clone)]
pub struct MetricWindow {
    samples: VecDeque<(i64, f64)>,
    window_ms: i64,
    mean: f64,
    std_dev: f64,
    trend_percent: f64,
}

/// Serializable summary of a metric window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub trend_percent: f64,
    pub last_value: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl MetricWindow {
    pub fn new(window_ms: i64) -> Self {
        Self {
            samples: VecDeque::new(),
            window_ms: window_ms.max(1),
            mean: 0.0,
            std_dev: 0.0,
            trend_percent: 0.0,
        }
    }

    /// Add a sample, drop everything older than the window, recompute
    pub fn add_sample(&mut self, timestamp: i64, value: f64) {
        self.samples.push_back((timestamp, value));
        self.expire_old_samples(timestamp);
        while self.samples.len() > MAX_WINDOW_SAMPLES {
            self.samples.pop_front();
        }
        self.recalculate();
    }

    fn expire_old_samples(&mut self, current_time: i64) {
        let cutoff = current_time - self.window_ms;
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn recalculate(&mut self) {
        let count = self.samples.len();
        if count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            self.trend_percent = 0.0;
            return;
        }

        self.mean = self.samples.iter().map(|(_, v)| v).sum::<f64>() / count as f64;

        // Two-pass sample variance (Bessel's correction)
        self.std_dev = if count > 1 {
            let variance = self
                .samples
                .iter()
                .map(|(_, v)| (v - self.mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        self.trend_percent = self.compute_trend();
    }

    /// Percent change from the first half's mean to the second half's
    fn compute_trend(&self) -> f64 {
        let count = self.samples.len();
        if count < MIN_SAMPLES_FOR_TREND {
            return 0.0;
        }

        let half = count / 2;
        let first = self.samples.iter().take(half).map(|(_, v)| v).sum::<f64>() / half as f64;
        let second =
            self.samples.iter().skip(half).map(|(_, v)| v).sum::<f64>() / (count - half) as f64;

        if first.abs() < f64::EPSILON {
            return 0.0;
        }

        (second - first) / first * 100.0
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn trend_percent(&self) -> f64 {
        self.trend_percent
    }

    pub fn last_value(&self) -> Option<f64> {
        self.samples.back().map(|(_, v)| *v)
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.samples.back().map(|(ts, _)| *ts)
    }

    /// The value before the most recent one
    pub fn previous_value(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        self.samples.get(n - 2).map(|(_, v)| *v)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|(_, v)| *v)
    }

    pub fn min(&self) -> Option<f64> {
        self.values()
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn max(&self) -> Option<f64> {
        self.values()
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn stats(&self) -> MetricStats {
        MetricStats {
            count: self.len(),
            mean: self.mean,
            std_dev: self.std_dev,
            trend_percent: self.trend_percent,
            last_value: self.last_value(),
            min: self.min(),
            max: self.max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_values_have_zero_std_dev() {
        let mut window = MetricWindow::new(60_000);
        for i in 0..5 {
            window.add_sample(i * 1000, 42.0);
        }

        assert_eq!(window.mean(), 42.0);
        assert_eq!(window.std_dev(), 0.0);
        assert_eq!(window.trend_percent(), 0.0);
    }

    #[test]
    fn test_sample_std_dev_uses_bessel_correction() {
        let mut window = MetricWindow::new(60_000);
        for (i, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate() {
            window.add_sample(i as i64, *v);
        }

        assert_eq!(window.mean(), 5.0);
        // sum of squares 32 over n-1 = 7
        assert!((window.std_dev() - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_old_samples_expire() {
        let mut window = MetricWindow::new(10_000);
        window.add_sample(0, 1.0);
        window.add_sample(5_000, 2.0);
        window.add_sample(15_000, 3.0);

        assert_eq!(window.len(), 2);
        assert_eq!(window.min(), Some(2.0));
    }

    #[test]
    fn test_trend_needs_three_samples() {
        let mut window = MetricWindow::new(60_000);
        window.add_sample(0, 10.0);
        window.add_sample(1, 20.0);
        assert_eq!(window.trend_percent(), 0.0);

        window.add_sample(2, 20.0);
        // halves [10] and [20, 20]
        assert_eq!(window.trend_percent(), 100.0);
    }

    #[test]
    fn test_trend_zero_when_first_half_mean_is_zero() {
        let mut window = MetricWindow::new(60_000);
        for (i, v) in [0.0, 0.0, 5.0, 9.0].iter().enumerate() {
            window.add_sample(i as i64, *v);
        }
        assert_eq!(window.trend_percent(), 0.0);
    }

    #[test]
    fn test_previous_value() {
        let mut window = MetricWindow::new(60_000);
        window.add_sample(0, 1.0);
        assert_eq!(window.previous_value(), None);
        window.add_sample(1, 2.0);
        assert_eq!(window.previous_value(), Some(1.0));
        assert_eq!(window.last_value(), Some(2.0));
    }
}
