//! Healing actions and per-anomaly policies
//!
//! An anomaly type maps to a [`HealingPolicy`]: an ordered chain of actions
//! tried until one succeeds, plus whether unhealthy targets should be
//! reconnected. Actions with no registered handler are skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::anomaly::AnomalyType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingActionKind {
    GcCollect,
    CacheClear,
    MemoryTrim,
    ThreadCleanup,
    PoolReset,
    Reconnect,
    Custom,
}

impl HealingActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingActionKind::GcCollect => "gc_collect",
            HealingActionKind::CacheClear => "cache_clear",
            HealingActionKind::MemoryTrim => "memory_trim",
            HealingActionKind::ThreadCleanup => "thread_cleanup",
            HealingActionKind::PoolReset => "pool_reset",
            HealingActionKind::Reconnect => "reconnect",
            HealingActionKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for HealingActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealOutcome {
    Success,
    /// Some registered caches or pools failed
    Partial,
    Failed,
    /// Nothing registered to run
    Skipped,
}

/// Host-supplied implementation of an action, such as releasing arena memory
#[async_trait]
pub trait HealingHandler: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

/// A cache the healer may empty under memory pressure
pub trait Cache: Send + Sync {
    fn clear(&self) -> anyhow::Result<()>;
}

/// A connection pool the healer may drop and rebuild
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn reset(&self) -> anyhow::Result<()>;
}

/// What a trigger maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKey {
    Anomaly(AnomalyType),
    Threshold,
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKey::Anomaly(kind) => write!(f, "{kind}"),
            PolicyKey::Threshold => f.write_str("threshold"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingPolicy {
    /// Tried in order until one succeeds
    pub actions: Vec<HealingActionKind>,
    /// Also recover targets that fail their health check
    pub reconnect_targets: bool,
    pub cooldown_ms: u64,
    /// Failed actions allowed before the policy stops running
    pub max_attempts: u32,
    /// Move on to the next action when one fails
    pub escalate_on_failure: bool,
    pub enabled: bool,
}

impl HealingPolicy {
    pub fn new(actions: Vec<HealingActionKind>, cooldown_ms: u64, max_attempts: u32) -> Self {
        Self {
            actions,
            reconnect_targets: false,
            cooldown_ms,
            max_attempts,
            escalate_on_failure: true,
            enabled: true,
        }
    }

    pub fn with_reconnect(mut self) -> Self {
        self.reconnect_targets = true;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Built-in policies. Trend anomalies on throughput have no policy.
pub fn default_policies() -> HashMap<PolicyKey, HealingPolicy> {
    use HealingActionKind::*;

    HashMap::from([
        (
            PolicyKey::Anomaly(AnomalyType::MemoryLeak),
            HealingPolicy::new(vec![GcCollect, CacheClear, MemoryTrim], 30_000, 5),
        ),
        (
            PolicyKey::Anomaly(AnomalyType::GrowingTrend),
            HealingPolicy::new(vec![GcCollect, CacheClear], 120_000, 2),
        ),
        (
            PolicyKey::Anomaly(AnomalyType::Spike),
            HealingPolicy::new(vec![GcCollect], 30_000, 3).with_reconnect(),
        ),
        (
            PolicyKey::Anomaly(AnomalyType::Outlier),
            HealingPolicy::new(Vec::new(), 60_000, 3).with_reconnect(),
        ),
        (
            PolicyKey::Anomaly(AnomalyType::HighErrorRate),
            HealingPolicy::new(vec![PoolReset], 60_000, 3).with_reconnect(),
        ),
        (
            PolicyKey::Anomaly(AnomalyType::LatencyIncrease),
            HealingPolicy::new(vec![PoolReset], 60_000, 3).with_reconnect(),
        ),
        (
            PolicyKey::Threshold,
            HealingPolicy::new(Vec::new(), 60_000, 3).with_reconnect(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declining_trend_has_no_policy() {
        let policies = default_policies();
        assert!(!policies.contains_key(&PolicyKey::Anomaly(AnomalyType::DecliningTrend)));

        let leak = &policies[&PolicyKey::Anomaly(AnomalyType::MemoryLeak)];
        assert_eq!(
            leak.actions,
            vec![
                HealingActionKind::GcCollect,
                HealingActionKind::CacheClear,
                HealingActionKind::MemoryTrim
            ]
        );
        assert!(!leak.reconnect_targets);
        assert!(policies[&PolicyKey::Threshold].reconnect_targets);
    }

    #[test]
    fn test_action_names() {
        assert_eq!(HealingActionKind::PoolReset.to_string(), "pool_reset");
        assert_eq!(
            serde_json::to_string(&HealingActionKind::GcCollect).unwrap(),
            "\"gc_collect\""
        );
        assert_eq!(PolicyKey::Anomaly(AnomalyType::Spike).to_string(), "spike");
    }
}
