//! Aurora Guard self-protection runtime
//!
//! This crate provides the core functionality for:
//! - Host and process metrics collection from procfs
//! - Statistical anomaly detection
//! - Circuit breakers and token-bucket rate limiting
//! - Auto-healing of dependencies and a heartbeat watchdog
//! - Alert fan-out with cooldown and aggregation
//! - Health checks and observability

pub mod alerts;
pub mod anomaly;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod healing;
pub mod health;
pub mod monitor;
pub mod observability;
pub mod protection;

pub use alerts::{Alert, AlertInput, AlertLevel, AlertManager};
pub use anomaly::{Anomaly, AnomalyDetector, AnomalyType, Severity};
pub use config::MonitorConfig;
pub use error::MonitorError;
pub use events::{EventBus, MonitorEvent};
pub use health::{
    ComponentHealth, ComponentSource, ComponentStatus, HealthCheck, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use monitor::{Monitor, MonitorStatus};
pub use observability::{MonitorMetrics, StructuredLogger};
pub use protection::{CircuitBreaker, CircuitState, RateLimiter};
