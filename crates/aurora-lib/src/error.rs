//! Error taxonomy for the protection runtime

use std::time::Duration;
use thiserror::Error;

use crate::protection::CircuitState;

/// Setup and collection failures
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Invalid or unreadable configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failed to read raw system statistics
    #[error("Failed to collect metrics: {0}")]
    Collection(String),

    /// Prometheus registry rejected a metric
    #[error("Metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),

    /// The orchestrator is already running
    #[error("Monitor is already running")]
    AlreadyRunning,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Raised when a circuit breaker refuses a call without invoking it
#[derive(Debug, Clone, Error)]
#[error("Circuit breaker '{name}' is {state}. Retry after {}ms", .retry_after.as_millis())]
pub struct CircuitBreakerError {
    pub name: String,
    pub state: CircuitState,
    pub retry_after: Duration,
}

/// Outcome of a guarded call that did not return a value
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call; the operation never ran
    #[error(transparent)]
    Rejected(CircuitBreakerError),

    /// The operation ran and failed
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, BreakerError::Rejected(_))
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            BreakerError::Rejected(_) => None,
        }
    }
}

/// Admission refused by a rate limiter
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// Not enough tokens in the global or client bucket
    #[error("Rate limit exceeded for '{limiter}'{}. Retry after {}ms", client_note(.client), .retry_after.as_millis())]
    Exceeded {
        limiter: String,
        client: Option<String>,
        retry_after: Duration,
    },

    /// Cost must be a positive, finite number of tokens
    #[error("Invalid cost {cost} for rate limiter '{limiter}'")]
    InvalidCost { limiter: String, cost: f64 },
}

fn client_note(client: &Option<String>) -> String {
    client
        .as_deref()
        .map(|c| format!(" (client {c})"))
        .unwrap_or_default()
}

impl RateLimitError {
    pub fn client(&self) -> Option<&str> {
        match self {
            RateLimitError::Exceeded { client, .. } => client.as_deref(),
            RateLimitError::InvalidCost { .. } => None,
        }
    }

    /// Zero for invalid requests, which never become admissible
    pub fn retry_after(&self) -> Duration {
        match self {
            RateLimitError::Exceeded { retry_after, .. } => *retry_after,
            RateLimitError::InvalidCost { .. } => Duration::ZERO,
        }
    }
}

/// Auto-healer refusals and failures
#[derive(Debug, Clone, Error)]
pub enum HealingError {
    #[error("No healing target named '{0}'")]
    UnknownTarget(String),

    #[error("Target '{target}' is cooling down for another {}ms", .remaining.as_millis())]
    CoolingDown { target: String, remaining: Duration },

    #[error("Target '{0}' already has a recovery in progress")]
    InProgress(String),

    #[error("Healing exhausted for '{target}' after {attempts} attempts")]
    Exhausted { target: String, attempts: u32 },
}

/// Heartbeat missed for longer than the configured timeout
#[derive(Debug, Clone, Error)]
#[error("No heartbeat for {}ms (timeout {}ms)", .silent_for.as_millis(), .timeout.as_millis())]
pub struct WatchdogTimeout {
    pub silent_for: Duration,
    pub timeout: Duration,
}

/// An alert sink failed to deliver; never fatal
#[derive(Debug, Clone, Error)]
#[error("Alert channel '{channel}' failed: {reason}")]
pub struct ChannelError {
    pub channel: String,
    pub reason: String,
}

impl ChannelError {
    pub fn new(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}
