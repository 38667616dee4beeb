//! Auto-healer
//!
//! Two kinds of corrective work run here. Anomalies and resource pressure
//! are mapped through [`HealingPolicy`] to chains of actions (cache clears,
//! pool resets, host-registered handlers) that escalate until one succeeds.
//! Named targets (chat channels, provider clients) are reconnected when they
//! report failure or fail their health check on a trigger. Each target gets
//! at most `max_heal_attempts` reconnects; consecutive attempts are spaced by
//! the per-target cooldown and an exponential backoff. An exhausted target
//! stays down until the next anomaly or threshold trigger re-arms it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::actions::{
    default_policies, Cache, ConnectionPool, HealOutcome, HealingActionKind, HealingHandler,
    HealingPolicy, PolicyKey,
};
use crate::alerts::{AlertInput, AlertLevel, AlertManager};
use crate::anomaly::Anomaly;
use crate::clock::{system_clock, SharedClock};
use crate::config::HealerConfig;
use crate::error::HealingError;
use crate::events::{EventBus, MonitorEvent};

const ALERT_SOURCE: &str = "aurora.healer";
const MEMORY_PRESSURE: &str = "memory_pressure";
const CPU_PRESSURE: &str = "cpu_pressure";

/// Something the healer can reconnect
#[async_trait]
pub trait HealTarget: Send + Sync {
    async fn reconnect(&self) -> anyhow::Result<()>;

    /// Healthy unless overridden
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Why the healer was woken up
#[derive(Debug, Clone)]
pub enum HealTrigger {
    Anomaly(Anomaly),
    Threshold {
        metric: String,
        value: f64,
        threshold: f64,
    },
}

impl HealTrigger {
    fn describe(&self) -> String {
        match self {
            HealTrigger::Anomaly(a) => format!("{} on {}", a.kind, a.metric),
            HealTrigger::Threshold {
                metric,
                value,
                threshold,
            } => format!("{metric} at {value:.1} over {threshold:.1}"),
        }
    }
}

/// One corrective action: a reconnect attempt on a target, or a policy action
#[derive(Debug, Clone, Serialize)]
pub struct HealingAction {
    /// Target name, or the policy subject such as `memory_leak:process.memory_rss_mb`
    pub target: String,
    pub action_type: HealingActionKind,
    pub attempt: u32,
    pub outcome: HealOutcome,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What one trigger did
#[derive(Debug, Default)]
pub struct HealReport {
    pub actions: Vec<HealingAction>,
    /// Outcome per target that needed recovery
    pub reconnects: Vec<(String, Result<u32, HealingError>)>,
}

impl HealReport {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.reconnects.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub name: String,
    pub healthy: bool,
    pub attempts: u32,
    pub exhausted: bool,
    pub in_progress: bool,
    pub recoveries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_ms_ago: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealerStats {
    pub enabled: bool,
    pub targets: usize,
    pub healthy_targets: usize,
    pub exhausted_targets: usize,
    pub total_actions: u64,
    /// Includes partial successes
    pub successful_actions: u64,
    pub failed_actions: u64,
    pub skipped_actions: u64,
    /// Percentage of actions that succeeded
    pub success_rate: f64,
    pub actions_by_type: BTreeMap<&'static str, u64>,
    pub registered_handlers: usize,
    pub registered_caches: usize,
    pub registered_pools: usize,
}

#[derive(Debug, Default)]
struct TargetState {
    healthy: bool,
    attempts: u32,
    exhausted: bool,
    in_progress: bool,
    recoveries: u64,
    last_attempt: Option<Instant>,
    last_error: Option<String>,
}

struct Entry {
    target: Arc<dyn HealTarget>,
    state: TargetState,
}

#[derive(Debug, Default)]
struct PolicyRun {
    attempts: u32,
    last_run: Option<Instant>,
}

struct HealerState {
    targets: BTreeMap<String, Entry>,
    policies: HashMap<PolicyKey, HealingPolicy>,
    runs: HashMap<String, PolicyRun>,
    handlers: HashMap<HealingActionKind, Arc<dyn HealingHandler>>,
    caches: Vec<(String, Arc<dyn Cache>)>,
    pools: Vec<(String, Arc<dyn ConnectionPool>)>,
    history: VecDeque<HealingAction>,
    by_type: BTreeMap<&'static str, u64>,
    successful: u64,
    failed: u64,
    skipped: u64,
}

impl Default for HealerState {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            policies: default_policies(),
            runs: HashMap::new(),
            handlers: HashMap::new(),
            caches: Vec::new(),
            pools: Vec::new(),
            history: VecDeque::new(),
            by_type: BTreeMap::new(),
            successful: 0,
            failed: 0,
            skipped: 0,
        }
    }
}

/// Clears a target's in-progress flag however its recovery ends
struct RecoveryGuard<'a> {
    healer: &'a AutoHealer,
    name: &'a str,
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.healer.state.lock().targets.get_mut(self.name) {
            entry.state.in_progress = false;
        }
    }
}

pub struct AutoHealer {
    config: HealerConfig,
    clock: SharedClock,
    alerts: AlertManager,
    events: Option<EventBus>,
    state: Mutex<HealerState>,
}

impl AutoHealer {
    pub fn new(config: HealerConfig, alerts: AlertManager) -> Self {
        Self::with_clock(config, alerts, system_clock())
    }

    pub fn with_clock(config: HealerConfig, alerts: AlertManager, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            alerts,
            events: None,
            state: Mutex::new(HealerState::default()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &HealerConfig {
        &self.config
    }

    /// Register `target` under `name`; the first registration wins
    pub fn register_target(&self, name: &str, target: Arc<dyn HealTarget>) -> bool {
        let mut state = self.state.lock();
        if state.targets.contains_key(name) {
            return false;
        }
        state.targets.insert(
            name.to_string(),
            Entry {
                target,
                state: TargetState {
                    healthy: true,
                    ..TargetState::default()
                },
            },
        );
        info!(target_name = name, "Registered healing target");
        true
    }

    pub fn unregister_target(&self, name: &str) -> bool {
        self.state.lock().targets.remove(name).is_some()
    }

    pub fn target_names(&self) -> Vec<String> {
        self.state.lock().targets.keys().cloned().collect()
    }

    /// Install the implementation of `kind`, replacing any earlier one
    pub fn register_handler(&self, kind: HealingActionKind, handler: Arc<dyn HealingHandler>) {
        self.state.lock().handlers.insert(kind, handler);
        debug!(action = %kind, "Registered healing handler");
    }

    /// Replace the policy for `key`
    pub fn register_policy(&self, key: PolicyKey, policy: HealingPolicy) {
        let prefix = format!("{key}:");
        let mut state = self.state.lock();
        state.policies.insert(key, policy);
        state.runs.retain(|subject, _| !subject.starts_with(&prefix));
    }

    pub fn policy(&self, key: PolicyKey) -> Option<HealingPolicy> {
        self.state.lock().policies.get(&key).cloned()
    }

    pub fn register_cache(&self, name: &str, cache: Arc<dyn Cache>) {
        self.state.lock().caches.push((name.to_string(), cache));
    }

    pub fn register_pool(&self, name: &str, pool: Arc<dyn ConnectionPool>) {
        self.state.lock().pools.push((name.to_string(), pool));
    }

    /// Delay before retry `attempt` (2 = first retry): base * 2^(attempt-2), capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.config
            .base_backoff()
            .saturating_mul(factor)
            .min(self.config.max_backoff())
    }

    /// A target reported a failure; recover it
    pub async fn report_failure(&self, name: &str, reason: &str) -> Result<u32, HealingError> {
        {
            let mut state = self.state.lock();
            let entry = state
                .targets
                .get_mut(name)
                .ok_or_else(|| HealingError::UnknownTarget(name.to_string()))?;
            entry.state.healthy = false;
            entry.state.last_error = Some(reason.to_string());
        }
        warn!(target_name = name, reason, "Healing target reported failure");
        self.recover(name).await
    }

    /// Route a trigger to its policy. Anomalies run the policy's action
    /// chain; CPU and memory breaches run the graded pressure responses.
    /// Either may then recover unhealthy targets.
    pub async fn handle_trigger(&self, trigger: &HealTrigger) -> HealReport {
        let mut report = HealReport::default();
        if !self.config.enabled {
            return report;
        }
        debug!(trigger = %trigger.describe(), "Healer triggered");

        let reconnect = match trigger {
            HealTrigger::Anomaly(anomaly) => {
                let key = PolicyKey::Anomaly(anomaly.kind);
                let Some(policy) = self.policy(key).filter(|p| p.enabled) else {
                    debug!(anomaly = %anomaly.kind, "No healing policy for anomaly type");
                    return report;
                };
                let subject = format!("{key}:{}", anomaly.metric);
                report.actions = self.run_policy(&subject, &policy).await;
                policy.reconnect_targets
            }
            HealTrigger::Threshold { metric, value, .. } => {
                report.actions = match metric.as_str() {
                    "memory.percent" => self.handle_memory_pressure(*value).await,
                    "cpu.percent" => self.handle_cpu_pressure(*value).await,
                    _ => Vec::new(),
                };
                self.policy(PolicyKey::Threshold)
                    .is_some_and(|p| p.enabled && p.reconnect_targets)
            }
        };

        if reconnect {
            report.reconnects = self.reconnect_unhealthy().await;
        }
        report
    }

    /// Run `policy` for `subject` unless it is cooling down or out of attempts
    async fn run_policy(&self, subject: &str, policy: &HealingPolicy) -> Vec<HealingAction> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            let run = state.runs.entry(subject.to_string()).or_default();
            if let Some(last) = run.last_run {
                if now.saturating_duration_since(last) < policy.cooldown() {
                    debug!(subject, "Healing policy cooling down");
                    return Vec::new();
                }
            }
            if run.attempts >= policy.max_attempts {
                debug!(subject, attempts = run.attempts, "Healing policy out of attempts");
                return Vec::new();
            }
            run.last_run = Some(now);
        }

        let mut actions = Vec::new();
        for &kind in &policy.actions {
            let action = self.run_action(subject, kind).await;
            let outcome = action.outcome;
            actions.push(action);

            match outcome {
                HealOutcome::Success => {
                    if let Some(run) = self.state.lock().runs.get_mut(subject) {
                        run.attempts = 0;
                    }
                    break;
                }
                HealOutcome::Failed => {
                    let attempts = {
                        let mut state = self.state.lock();
                        let run = state.runs.entry(subject.to_string()).or_default();
                        run.attempts += 1;
                        run.attempts
                    };
                    if !policy.escalate_on_failure || attempts >= policy.max_attempts {
                        break;
                    }
                    info!(subject, failed = %kind, "Escalating to next healing action");
                }
                HealOutcome::Partial | HealOutcome::Skipped => {}
            }
        }
        actions
    }

    /// Graded response to memory use: light at the threshold, everything at 95%
    pub async fn handle_memory_pressure(&self, percent: f64) -> Vec<HealingAction> {
        if !self.config.enabled || percent < self.config.memory_pressure_threshold {
            return Vec::new();
        }
        if !self.claim_pressure_slot(MEMORY_PRESSURE) {
            return Vec::new();
        }

        let chain: &[HealingActionKind] = if percent >= 95.0 {
            &[
                HealingActionKind::GcCollect,
                HealingActionKind::CacheClear,
                HealingActionKind::MemoryTrim,
            ]
        } else if percent >= 90.0 {
            &[HealingActionKind::GcCollect, HealingActionKind::CacheClear]
        } else {
            &[HealingActionKind::GcCollect]
        };
        info!(memory_percent = percent, actions = chain.len(), "Relieving memory pressure");

        let mut actions = Vec::with_capacity(chain.len());
        for &kind in chain {
            actions.push(self.run_action(MEMORY_PRESSURE, kind).await);
        }
        actions
    }

    pub async fn handle_cpu_pressure(&self, percent: f64) -> Vec<HealingAction> {
        if !self.config.enabled || percent < self.config.cpu_pressure_threshold {
            return Vec::new();
        }
        if !self.claim_pressure_slot(CPU_PRESSURE) {
            return Vec::new();
        }
        info!(cpu_percent = percent, "Relieving CPU pressure");
        vec![self.run_action(CPU_PRESSURE, HealingActionKind::ThreadCleanup).await]
    }

    fn claim_pressure_slot(&self, subject: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let run = state.runs.entry(subject.to_string()).or_default();
        if let Some(last) = run.last_run {
            if now.saturating_duration_since(last) < self.config.heal_cooldown() {
                return false;
            }
        }
        run.last_run = Some(now);
        true
    }

    async fn run_action(&self, subject: &str, kind: HealingActionKind) -> HealingAction {
        let started = self.clock.now();
        let handler = self.state.lock().handlers.get(&kind).cloned();

        let (outcome, error) = match (handler, kind) {
            (Some(handler), _) => match handler.run().await {
                Ok(()) => (HealOutcome::Success, None),
                Err(e) => (HealOutcome::Failed, Some(format!("{e:#}"))),
            },
            (None, HealingActionKind::CacheClear) => self.clear_caches(),
            (None, HealingActionKind::PoolReset) => self.reset_pools().await,
            (None, HealingActionKind::Reconnect) => {
                let results = self.reconnect_unhealthy().await;
                summarize(results.iter().map(|(name, r)| (name.as_str(), r.as_ref().err())))
            }
            (None, _) => (HealOutcome::Skipped, Some(format!("no handler for {kind}"))),
        };

        let duration = self.clock.now().saturating_duration_since(started);
        match outcome {
            HealOutcome::Failed | HealOutcome::Partial => {
                warn!(subject, action = %kind, outcome = ?outcome, error = ?error, "Healing action did not fully succeed")
            }
            _ => debug!(subject, action = %kind, outcome = ?outcome, "Healing action finished"),
        }
        let action = self.record(subject, kind, 1, outcome, duration, error);

        if matches!(outcome, HealOutcome::Success | HealOutcome::Failed) {
            let level = if outcome == HealOutcome::Success {
                AlertLevel::Info
            } else {
                AlertLevel::Warning
            };
            let mut message = format!("{subject}: {outcome:?} in {}ms", action.duration_ms);
            if let Some(ref error) = action.error {
                message.push_str(&format!(". Error: {error}"));
            }
            self.alerts
                .send(
                    AlertInput::new(level, ALERT_SOURCE, format!("Auto-healing: {kind}"), message)
                        .with_metadata("action", kind.as_str()),
                )
                .await;
        }
        action
    }

    fn clear_caches(&self) -> (HealOutcome, Option<String>) {
        let caches = self.state.lock().caches.clone();
        let results: Vec<(String, anyhow::Result<()>)> = caches
            .iter()
            .map(|(name, cache)| (name.clone(), cache.clear()))
            .collect();
        summarize(results.iter().map(|(name, r)| (name.as_str(), r.as_ref().err())))
    }

    async fn reset_pools(&self) -> (HealOutcome, Option<String>) {
        let pools = self.state.lock().pools.clone();
        let mut results = Vec::with_capacity(pools.len());
        for (name, pool) in pools {
            let result = pool.reset().await;
            results.push((name, result));
        }
        summarize(results.iter().map(|(name, r)| (name.as_str(), r.as_ref().err())))
    }

    /// Re-arm exhausted targets, then recover every target that fails its
    /// health check
    async fn reconnect_unhealthy(&self) -> Vec<(String, Result<u32, HealingError>)> {
        let candidates: Vec<(String, Arc<dyn HealTarget>)> = {
            let mut state = self.state.lock();
            state
                .targets
                .iter_mut()
                .filter(|(_, entry)| !entry.state.in_progress)
                .map(|(name, entry)| {
                    if entry.state.exhausted {
                        entry.state.exhausted = false;
                        entry.state.attempts = 0;
                        info!(target_name = %name, "Re-armed exhausted healing target");
                    }
                    (name.clone(), entry.target.clone())
                })
                .collect()
        };

        let mut outcomes = Vec::new();
        for (name, target) in candidates {
            let needs_recovery = match target.health_check().await {
                Ok(()) => !self.is_healthy(&name),
                Err(e) => {
                    self.mark_unhealthy(&name, &format!("{e:#}"));
                    true
                }
            };
            if needs_recovery {
                let result = self.recover(&name).await;
                outcomes.push((name, result));
            }
        }
        outcomes
    }

    fn is_healthy(&self, name: &str) -> bool {
        self.state
            .lock()
            .targets
            .get(name)
            .map_or(true, |e| e.state.healthy)
    }

    fn mark_unhealthy(&self, name: &str, reason: &str) {
        if let Some(entry) = self.state.lock().targets.get_mut(name) {
            entry.state.healthy = false;
            entry.state.last_error = Some(reason.to_string());
        }
    }

    /// Reconnect `name`, retrying until success or the attempt budget runs out.
    /// Returns the number of attempts the successful recovery took.
    pub async fn recover(&self, name: &str) -> Result<u32, HealingError> {
        let target = {
            let mut state = self.state.lock();
            let entry = state
                .targets
                .get_mut(name)
                .ok_or_else(|| HealingError::UnknownTarget(name.to_string()))?;

            if entry.state.in_progress {
                return Err(HealingError::InProgress(name.to_string()));
            }
            if entry.state.exhausted {
                return Err(HealingError::Exhausted {
                    target: name.to_string(),
                    attempts: entry.state.attempts,
                });
            }
            if let Some(last) = entry.state.last_attempt {
                let elapsed = self.clock.now().saturating_duration_since(last);
                let cooldown = self.config.heal_cooldown();
                if elapsed < cooldown {
                    return Err(HealingError::CoolingDown {
                        target: name.to_string(),
                        remaining: cooldown - elapsed,
                    });
                }
            }
            entry.state.in_progress = true;
            entry.target.clone()
        };

        let _guard = RecoveryGuard { healer: self, name };
        self.run_attempts(name, target).await
    }

    async fn run_attempts(&self, name: &str, target: Arc<dyn HealTarget>) -> Result<u32, HealingError> {
        let max_attempts = self.config.max_heal_attempts.max(1);

        loop {
            let (attempt, wait) = {
                let mut state = self.state.lock();
                let Some(entry) = state.targets.get_mut(name) else {
                    return Err(HealingError::UnknownTarget(name.to_string()));
                };
                entry.state.attempts += 1;
                let attempt = entry.state.attempts;
                let remaining_cooldown = entry
                    .state
                    .last_attempt
                    .map(|last| {
                        self.config
                            .heal_cooldown()
                            .saturating_sub(self.clock.now().saturating_duration_since(last))
                    })
                    .unwrap_or(Duration::ZERO);
                (attempt, remaining_cooldown.max(self.backoff_for(attempt)))
            };

            if !wait.is_zero() {
                debug!(target_name = name, attempt, wait_ms = wait.as_millis() as u64, "Waiting before reconnect");
                tokio::time::sleep(wait).await;
            }

            let started = self.clock.now();
            if let Some(entry) = self.state.lock().targets.get_mut(name) {
                entry.state.last_attempt = Some(started);
            }

            let outcome = match target.reconnect().await {
                Ok(()) => target.health_check().await,
                Err(e) => Err(e),
            };
            let duration = self.clock.now().saturating_duration_since(started);

            match outcome {
                Ok(()) => {
                    self.record(name, HealingActionKind::Reconnect, attempt, HealOutcome::Success, duration, None);
                    self.on_healed(name, attempt).await;
                    return Ok(attempt);
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(target_name = name, attempt, max_attempts, error = %error, "Reconnect attempt failed");
                    self.record(
                        name,
                        HealingActionKind::Reconnect,
                        attempt,
                        HealOutcome::Failed,
                        duration,
                        Some(error),
                    );
                    if attempt >= max_attempts {
                        self.on_exhausted(name, attempt).await;
                        return Err(HealingError::Exhausted {
                            target: name.to_string(),
                            attempts: attempt,
                        });
                    }
                }
            }
        }
    }

    fn record(
        &self,
        subject: &str,
        kind: HealingActionKind,
        attempt: u32,
        outcome: HealOutcome,
        duration: Duration,
        error: Option<String>,
    ) -> HealingAction {
        let mut state = self.state.lock();
        match outcome {
            HealOutcome::Success | HealOutcome::Partial => state.successful += 1,
            HealOutcome::Failed => state.failed += 1,
            HealOutcome::Skipped => state.skipped += 1,
        }
        *state.by_type.entry(kind.as_str()).or_insert(0) += 1;

        if kind == HealingActionKind::Reconnect {
            if let Some(entry) = state.targets.get_mut(subject) {
                match outcome {
                    HealOutcome::Success => {
                        entry.state.healthy = true;
                        entry.state.attempts = 0;
                        entry.state.recoveries += 1;
                        entry.state.last_error = None;
                    }
                    HealOutcome::Failed => {
                        entry.state.healthy = false;
                        entry.state.last_error = error.clone();
                    }
                    HealOutcome::Partial | HealOutcome::Skipped => {}
                }
            }
        }

        let action = HealingAction {
            target: subject.to_string(),
            action_type: kind,
            attempt,
            outcome,
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            error,
        };
        state.history.push_back(action.clone());
        while state.history.len() > self.config.history_size.max(1) {
            state.history.pop_front();
        }
        action
    }

    async fn on_healed(&self, name: &str, attempts: u32) {
        info!(target_name = name, attempts, "Healing target recovered");
        if let Some(events) = &self.events {
            events.publish(MonitorEvent::Healed {
                target: name.to_string(),
                attempts,
            });
            events.publish(MonitorEvent::ChannelReconnected {
                target: name.to_string(),
            });
        }
        self.alerts
            .send(
                AlertInput::new(
                    AlertLevel::Info,
                    ALERT_SOURCE,
                    format!("{name} recovered"),
                    format!("{name} reconnected after {attempts} attempt(s)"),
                )
                .with_metadata("attempts", attempts),
            )
            .await;
    }

    async fn on_exhausted(&self, name: &str, attempts: u32) {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.targets.get_mut(name) {
                entry.state.exhausted = true;
            }
        }
        warn!(target_name = name, attempts, "Healing attempts exhausted");
        if let Some(events) = &self.events {
            events.publish(MonitorEvent::HealingExhausted {
                target: name.to_string(),
                attempts,
            });
        }
        self.alerts
            .send(
                AlertInput::new(
                    AlertLevel::Critical,
                    ALERT_SOURCE,
                    format!("Healing exhausted for {name}"),
                    format!("{name} is still down after {attempts} reconnect attempts"),
                )
                .with_metadata("attempts", attempts),
            )
            .await;
    }

    /// Most recent actions, oldest first
    pub fn history(&self, limit: Option<usize>) -> Vec<HealingAction> {
        let state = self.state.lock();
        let skip = limit
            .map(|l| state.history.len().saturating_sub(l))
            .unwrap_or(0);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn target_status(&self, name: &str) -> Option<TargetStatus> {
        let state = self.state.lock();
        state.targets.get(name).map(|e| self.status_of(name, &e.state))
    }

    pub fn all_target_status(&self) -> Vec<TargetStatus> {
        let state = self.state.lock();
        state
            .targets
            .iter()
            .map(|(name, e)| self.status_of(name, &e.state))
            .collect()
    }

    fn status_of(&self, name: &str, state: &TargetState) -> TargetStatus {
        TargetStatus {
            name: name.to_string(),
            healthy: state.healthy,
            attempts: state.attempts,
            exhausted: state.exhausted,
            in_progress: state.in_progress,
            recoveries: state.recoveries,
            last_error: state.last_error.clone(),
            last_attempt_ms_ago: state
                .last_attempt
                .map(|at| self.clock.now().saturating_duration_since(at).as_millis() as u64),
        }
    }

    pub fn stats(&self) -> HealerStats {
        let state = self.state.lock();
        let total = state.successful + state.failed + state.skipped;
        HealerStats {
            enabled: self.config.enabled,
            targets: state.targets.len(),
            healthy_targets: state.targets.values().filter(|e| e.state.healthy).count(),
            exhausted_targets: state.targets.values().filter(|e| e.state.exhausted).count(),
            total_actions: total,
            successful_actions: state.successful,
            failed_actions: state.failed,
            skipped_actions: state.skipped,
            success_rate: if total > 0 {
                state.successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            actions_by_type: state.by_type.clone(),
            registered_handlers: state.handlers.len(),
            registered_caches: state.caches.len(),
            registered_pools: state.pools.len(),
        }
    }

    /// Forget history, counters, and policy cooldowns; registrations stay
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.runs.clear();
        state.by_type.clear();
        state.successful = 0;
        state.failed = 0;
        state.skipped = 0;
    }
}

/// Fold per-item results into one outcome and a joined error message
fn summarize<'a, E: std::fmt::Display + 'a>(
    results: impl Iterator<Item = (&'a str, Option<&'a E>)>,
) -> (HealOutcome, Option<String>) {
    let mut total = 0;
    let mut errors = Vec::new();
    for (name, error) in results {
        total += 1;
        if let Some(e) = error {
            errors.push(format!("{name}: {e:#}"));
        }
    }
    let outcome = match (total, errors.len()) {
        (0, _) => HealOutcome::Skipped,
        (_, 0) => HealOutcome::Success,
        (t, f) if f == t => HealOutcome::Failed,
        _ => HealOutcome::Partial,
    };
    let error = (!errors.is_empty()).then(|| errors.join("; "));
    (outcome, error)
}
