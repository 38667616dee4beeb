//! Component health for the liveness and readiness endpoints
//!
//! One table holds two kinds of entries: the monitor's own components,
//! whose status it sets after each health pass, and host checks, which are
//! run with a timeout on every pass and keep a failure streak.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Ordered best to worst; the overall status is the worst component's
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still operational, e.g. a stale sample or an exhausted heal target
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentSource {
    /// Collector, detector, watchdog, healer or alerts
    Builtin,
    /// Registered through [`HealthRegistry::register_check`]
    Check,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub source: ComponentSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failed check runs in a row. Always 0 for built-in components.
    pub consecutive_failures: u32,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, source: ComponentSource, message: Option<String>) -> Self {
        Self {
            status,
            source,
            message,
            consecutive_failures: 0,
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }

    /// Names of unhealthy components, in name order
    pub fn failing(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Names of the built-in components
pub mod components {
    pub const COLLECTOR: &str = "collector";
    pub const DETECTOR: &str = "anomaly_detector";
    pub const WATCHDOG: &str = "watchdog";
    pub const HEALER: &str = "auto_healer";
    pub const ALERTS: &str = "alerts";
}

/// Host-provided check of a dependency such as a database or broker
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Registry {
    components: BTreeMap<String, ComponentHealth>,
    checks: BTreeMap<String, Arc<dyn HealthCheck>>,
    started: bool,
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry").finish_non_exhaustive()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named check. Fails if the name is taken by a check or a built-in component.
    pub async fn register_check(&self, name: &str, check: Arc<dyn HealthCheck>) -> bool {
        let mut registry = self.inner.write().await;
        if registry.checks.contains_key(name) || registry.components.contains_key(name) {
            return false;
        }
        registry.checks.insert(name.to_string(), check);
        registry.components.insert(
            name.to_string(),
            ComponentHealth::new(ComponentStatus::Healthy, ComponentSource::Check, None),
        );
        true
    }

    pub async fn check_count(&self) -> usize {
        self.inner.read().await.checks.len()
    }

    /// Run every registered check, bounding each by `timeout`
    pub async fn run_checks(&self, timeout: Duration) {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .inner
            .read()
            .await
            .checks
            .iter()
            .map(|(name, check)| (name.clone(), check.clone()))
            .collect();

        let mut results = Vec::with_capacity(checks.len());
        for (name, check) in checks {
            let failure = match tokio::time::timeout(timeout, check.check()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    warn!(check = %name, error = %e, "Health check failed");
                    Some(format!("{e:#}"))
                }
                Err(_) => {
                    warn!(check = %name, timeout_ms = timeout.as_millis() as u64, "Health check timed out");
                    Some(format!("timed out after {}ms", timeout.as_millis()))
                }
            };
            results.push((name, failure));
        }

        let mut registry = self.inner.write().await;
        for (name, failure) in results {
            let streak = registry
                .components
                .get(&name)
                .map_or(0, |c| c.consecutive_failures);
            let mut health = match failure {
                None => ComponentHealth::new(ComponentStatus::Healthy, ComponentSource::Check, None),
                Some(message) => {
                    ComponentHealth::new(ComponentStatus::Unhealthy, ComponentSource::Check, Some(message))
                }
            };
            if health.status == ComponentStatus::Unhealthy {
                health.consecutive_failures = streak.saturating_add(1);
            }
            debug!(
                check = %name,
                status = ?health.status,
                consecutive_failures = health.consecutive_failures,
                "Health check complete"
            );
            registry.components.insert(name, health);
        }
    }

    /// Track a built-in component, starting healthy
    pub async fn register(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut registry = self.inner.write().await;
        let source = registry
            .components
            .get(name)
            .map_or(ComponentSource::Builtin, |c| c.source);
        registry
            .components
            .insert(name.to_string(), ComponentHealth::new(status, source, message));
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into())).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into())).await;
    }

    /// Flipped by the monitor on start and stop
    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.started = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse::from_components(self.inner.read().await.components.clone())
    }

    /// Ready once started, as long as no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        if !self.inner.read().await.started {
            return ReadinessResponse {
                ready: false,
                reason: Some("monitor not started".to_string()),
            };
        }
        let health = self.health().await;
        let failing = health.failing();
        if failing.is_empty() {
            ReadinessResponse { ready: true, reason: None }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", failing.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCheck(Option<&'static str>);

    #[async_trait]
    impl HealthCheck for StaticCheck {
        async fn check(&self) -> anyhow::Result<()> {
            match self.0 {
                None => Ok(()),
                Some(reason) => anyhow::bail!(reason),
            }
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl HealthCheck for HangingCheck {
        async fn check(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy_but_not_ready() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("monitor not started"));
    }

    #[tokio::test]
    async fn test_overall_status_is_worst_component() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;
        registry.register(components::WATCHDOG).await;
        registry.register(components::HEALER).await;

        registry.set_degraded(components::HEALER, "1 target(s) exhausted").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::WATCHDOG, "heartbeat timeout exceeded").await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(health.failing(), vec![components::WATCHDOG]);
        assert_eq!(health.components[components::COLLECTOR].source, ComponentSource::Builtin);
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_degraded(components::COLLECTOR, "last sample 30000ms ago").await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::COLLECTOR, "read failed").await;
        registry.set_unhealthy(components::ALERTS, "channel down").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("unhealthy: alerts, collector"));
    }

    #[tokio::test]
    async fn test_check_names_are_unique() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;

        assert!(registry.register_check("redis", Arc::new(StaticCheck(None))).await);
        assert!(!registry.register_check("redis", Arc::new(StaticCheck(Some("x")))).await);
        assert!(!registry.register_check(components::COLLECTOR, Arc::new(StaticCheck(None))).await);
        assert_eq!(registry.check_count().await, 1);
    }

    #[tokio::test]
    async fn test_failure_streak_counts_and_resets() {
        let registry = HealthRegistry::new();
        registry.register_check("redis", Arc::new(StaticCheck(None))).await;
        registry
            .register_check("telegram", Arc::new(StaticCheck(Some("401 unauthorized"))))
            .await;

        registry.run_checks(Duration::from_secs(1)).await;
        registry.run_checks(Duration::from_secs(1)).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        let redis = &health.components["redis"];
        assert_eq!(redis.status, ComponentStatus::Healthy);
        assert_eq!(redis.consecutive_failures, 0);
        let telegram = &health.components["telegram"];
        assert_eq!(telegram.source, ComponentSource::Check);
        assert_eq!(telegram.consecutive_failures, 2);
        assert_eq!(telegram.message.as_deref(), Some("401 unauthorized"));

        // A manual override keeps the entry a check
        registry.set_healthy("telegram").await;
        let health = registry.health().await;
        assert_eq!(health.components["telegram"].source, ComponentSource::Check);
        assert_eq!(health.components["telegram"].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_check_times_out() {
        let registry = HealthRegistry::new();
        registry.register_check("slow", Arc::new(HangingCheck)).await;

        registry.run_checks(Duration::from_millis(50)).await;

        let health = registry.health().await;
        assert_eq!(health.components["slow"].status, ComponentStatus::Unhealthy);
        assert_eq!(health.components["slow"].message.as_deref(), Some("timed out after 50ms"));
    }

    #[test]
    fn test_serialized_shape() {
        let mut entries = BTreeMap::new();
        entries.insert(
            components::DETECTOR.to_string(),
            ComponentHealth::new(ComponentStatus::Degraded, ComponentSource::Builtin, Some("slow".into())),
        );
        let json = serde_json::to_value(HealthResponse::from_components(entries)).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["components"]["anomaly_detector"]["source"], "builtin");
        assert_eq!(json["components"]["anomaly_detector"]["consecutive_failures"], 0);
    }
}
