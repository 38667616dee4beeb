//! Runtime configuration
//!
//! Every section deserializes with defaults, so an empty file (or no file at
//! all) yields a working configuration. Durations are in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable prefix, e.g. `AURORA__METRICS__CPU_THRESHOLD=90`
pub const ENV_PREFIX: &str = "AURORA";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub app_name: AppName,
    pub metrics: MetricsConfig,
    pub anomaly: AnomalyConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub healer: HealerConfig,
    pub watchdog: WatchdogConfig,
    pub alerts: AlertsConfig,
    pub health: HealthCheckConfig,
}

/// Name the host application reports itself as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppName(pub String);

impl Default for AppName {
    fn default() -> Self {
        AppName("aurora-app".to_string())
    }
}

impl std::fmt::Display for AppName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub collection_interval_ms: u64,
    pub history_size: usize,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    /// Mount point whose usage is reported
    pub disk_path: String,
    pub proc_root: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval_ms: 5_000,
            history_size: 1_000,
            cpu_threshold: 85.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            disk_path: "/".to_string(),
            proc_root: "/proc".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub enabled: bool,
    /// Number of detection intervals kept in each metric window
    pub window_size: usize,
    pub detection_interval_ms: u64,
    pub z_score_threshold: f64,
    pub spike_multiplier: f64,
    /// Percent change between window halves
    pub trend_threshold: f64,
    pub error_rate_threshold: f64,
    pub history_size: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 60,
            detection_interval_ms: 5_000,
            z_score_threshold: 2.0,
            spike_multiplier: 3.0,
            trend_threshold: 20.0,
            error_rate_threshold: 5.0,
            history_size: 1_000,
        }
    }
}

impl AnomalyConfig {
    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    /// Samples older than this are dropped from a metric window
    pub fn window_span_ms(&self) -> i64 {
        (self.window_size as i64).saturating_mul(self.detection_interval_ms as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Time spent open before a trial is allowed
    pub timeout_ms: u64,
    /// Closed-state counters are cleared after this long without a failure
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 30_000,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Global refill rate in tokens per second
    pub rate: f64,
    pub burst: f64,
    pub per_client: bool,
    pub client_rate: f64,
    pub client_burst: f64,
    /// Client buckets kept before idle full ones are pruned
    pub max_clients: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 150.0,
            per_client: true,
            client_rate: 10.0,
            client_burst: 20.0,
            max_clients: 10_000,
        }
    }
}

impl RateLimiterConfig {
    /// Global-only limiter; burst defaults to one and a half times the rate
    pub fn with_rate(rate: f64) -> Self {
        Self {
            rate,
            burst: rate * 1.5,
            per_client: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    pub enabled: bool,
    pub max_heal_attempts: u32,
    pub heal_cooldown_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub history_size: usize,
    /// Memory percent at which pressure relief starts
    pub memory_pressure_threshold: f64,
    pub cpu_pressure_threshold: f64,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_heal_attempts: 3,
            heal_cooldown_ms: 60_000,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            history_size: 500,
            memory_pressure_threshold: 80.0,
            cpu_pressure_threshold: 90.0,
        }
    }
}

impl HealerConfig {
    pub fn heal_cooldown(&self) -> Duration {
        Duration::from_millis(self.heal_cooldown_ms)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub heartbeat_timeout_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_timeout_ms: 30_000,
            check_interval_ms: 10_000,
        }
    }
}

impl WatchdogConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub cooldown_ms: u64,
    pub history_size: usize,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
    /// Timeout applied to each channel delivery
    pub channel_timeout_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_ms: 300_000,
            history_size: 10_000,
            slack_webhook_url: None,
            discord_webhook_url: None,
            webhook_url: None,
            channel_timeout_ms: 10_000,
        }
    }
}

impl AlertsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MonitorConfig {
    /// Load from an optional file layered under `AURORA__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        let config: MonitorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a loop spin or a check meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("metrics.cpu_threshold", self.metrics.cpu_threshold),
            ("metrics.memory_threshold", self.metrics.memory_threshold),
            ("metrics.disk_threshold", self.metrics.disk_threshold),
            ("healer.memory_pressure_threshold", self.healer.memory_pressure_threshold),
            ("healer.cpu_pressure_threshold", self.healer.cpu_pressure_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::invalid(field, format!("{value} is not a percentage")));
            }
        }

        for (field, value) in [
            ("metrics.collection_interval_ms", self.metrics.collection_interval_ms),
            ("anomaly.detection_interval_ms", self.anomaly.detection_interval_ms),
            ("watchdog.check_interval_ms", self.watchdog.check_interval_ms),
            ("watchdog.heartbeat_timeout_ms", self.watchdog.heartbeat_timeout_ms),
            ("health.check_interval_ms", self.health.check_interval_ms),
            ("circuit_breaker.timeout_ms", self.circuit_breaker.timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker.success_threshold", "must be at least 1"));
        }
        if self.rate_limiter.rate <= 0.0 || self.rate_limiter.burst <= 0.0 {
            return Err(ConfigError::invalid("rate_limiter", "rate and burst must be positive"));
        }
        if self.rate_limiter.per_client
            && (self.rate_limiter.client_rate <= 0.0 || self.rate_limiter.client_burst <= 0.0)
        {
            return Err(ConfigError::invalid(
                "rate_limiter",
                "client_rate and client_burst must be positive",
            ));
        }
        if self.anomaly.window_size < 3 {
            return Err(ConfigError::invalid("anomaly.window_size", "must hold at least 3 samples"));
        }
        if self.metrics.history_size == 0 || self.alerts.history_size == 0 {
            return Err(ConfigError::invalid("history_size", "must be greater than zero"));
        }

        Ok(())
    }
}
