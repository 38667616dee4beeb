//! Circuit breaker state machine
//!
//! closed -> open after `failure_threshold` consecutive failures; open ->
//! half_open for the first call after `timeout`; half_open -> closed after
//! `success_threshold` consecutive successes, or straight back to open on any
//! failure. Only one trial runs in half_open at a time.
//!
//! A [`CallPolicy`] can exclude errors from failure accounting (a 404 from a
//! healthy API, say), observe counted failures, and supply a fallback value
//! for calls the breaker rejects or that leave it open.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clock::{system_clock, unix_millis, SharedClock};
use crate::config::CircuitBreakerConfig;
use crate::error::{BreakerError, CircuitBreakerError};
use crate::events::{EventBus, MonitorEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 closed, 1 half_open, 2 open
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub open_count: u64,
    pub failure_rate: f64,
    pub average_response_ms: f64,
    pub time_until_retry_ms: u64,
    /// Time spent in the current state
    pub state_age_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    open_count: u64,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    timed_calls: u64,
    total_response: Duration,
}

impl BreakerInner {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            open_count: 0,
            opened_at: None,
            last_state_change: now,
            last_failure: None,
            trial_in_flight: false,
            timed_calls: 0,
            total_response: Duration::ZERO,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }

        self.state = to;
        self.last_state_change = now;

        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.consecutive_successes = 0;
                self.open_count += 1;
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                self.last_failure = None;
            }
        }

        Some((from, to))
    }

    fn remaining_open(&self, now: Instant, timeout: Duration) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                timeout.saturating_sub(now.saturating_duration_since(opened_at))
            }
            _ => Duration::ZERO,
        }
    }
}

type ErrorFilter<'a, E> = Box<dyn Fn(&E) -> bool + Send + 'a>;
type FailureHook<'a, E> = Box<dyn Fn(&E) + Send + 'a>;
type Fallback<'a, T> = Box<dyn FnOnce() -> T + Send + 'a>;

/// Per-call options for [`CircuitBreaker::execute_with`]
pub struct CallPolicy<'a, T, E> {
    excluded: Option<ErrorFilter<'a, E>>,
    on_failure: Option<FailureHook<'a, E>>,
    fallback: Option<Fallback<'a, T>>,
}

impl<T, E> Default for CallPolicy<'_, T, E> {
    fn default() -> Self {
        Self {
            excluded: None,
            on_failure: None,
            fallback: None,
        }
    }
}

impl<'a, T, E> CallPolicy<'a, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors matching `filter` are returned to the caller but never counted
    pub fn exclude(mut self, filter: impl Fn(&E) -> bool + Send + 'a) -> Self {
        self.excluded = Some(Box::new(filter));
        self
    }

    /// Called for every counted failure
    pub fn on_failure(mut self, hook: impl Fn(&E) + Send + 'a) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Value to return instead of a rejection, or instead of the error of a
    /// call that left the breaker open
    pub fn fallback(mut self, fallback: impl FnOnce() -> T + Send + 'a) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    fn is_excluded(&self, error: &E) -> bool {
        self.excluded.as_ref().is_some_and(|filter| filter(error))
    }
}

/// Call-guarding breaker for one dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    events: Option<EventBus>,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            events: None,
            inner: Mutex::new(BreakerInner::new(now)),
        }
    }

    /// Publish state transitions on the given bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state; an expired open timeout is only acted on by the next call
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn time_until_retry(&self) -> Duration {
        let now = self.clock.now();
        self.inner.lock().remaining_open(now, self.config.timeout())
    }

    /// Ask for permission to make one call
    pub fn try_acquire(&self) -> Result<Permit<'_>, CircuitBreakerError> {
        let now = self.clock.now();
        let mut transition = None;

        let result = {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;

            if inner.state == CircuitState::Closed {
                if let Some(last_failure) = inner.last_failure {
                    if now.saturating_duration_since(last_failure) >= self.config.reset_timeout() {
                        inner.consecutive_failures = 0;
                        inner.consecutive_successes = 0;
                        inner.last_failure = None;
                    }
                }
            }

            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let remaining = inner.remaining_open(now, self.config.timeout());
                    if remaining.is_zero() {
                        transition = inner.transition(CircuitState::HalfOpen, now);
                        inner.trial_in_flight = true;
                        Ok(true)
                    } else {
                        inner.rejected_calls += 1;
                        Err(self.rejection(CircuitState::Open, remaining))
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        inner.rejected_calls += 1;
                        Err(self.rejection(CircuitState::HalfOpen, Duration::ZERO))
                    } else {
                        inner.trial_in_flight = true;
                        Ok(true)
                    }
                }
            }
        };

        self.announce(transition);

        result.map(|trial| Permit {
            breaker: self,
            trial,
            started: now,
            settled: false,
        })
    }

    /// Run `op` under the breaker. A rejection never invokes `op`.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(CallPolicy::default(), op).await
    }

    /// Run `op` under the breaker with per-call error filtering and fallback
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        policy: CallPolicy<'_, T, E>,
        op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                return match policy.fallback {
                    Some(fallback) => Ok(fallback()),
                    None => Err(BreakerError::Rejected(rejection)),
                };
            }
        };

        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) if policy.is_excluded(&e) => {
                // neither outcome; a trial slot is freed on drop
                drop(permit);
                Err(BreakerError::Operation(e))
            }
            Err(e) => {
                if let Some(ref hook) = policy.on_failure {
                    hook(&e);
                }
                permit.failure();
                match policy.fallback {
                    Some(fallback) if self.state() == CircuitState::Open => Ok(fallback()),
                    _ => Err(BreakerError::Operation(e)),
                }
            }
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let completed = inner.total_successes + inner.total_failures;

        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            open_count: inner.open_count,
            failure_rate: if completed > 0 {
                inner.total_failures as f64 / completed as f64 * 100.0
            } else {
                0.0
            },
            average_response_ms: if inner.timed_calls > 0 {
                inner.total_response.as_secs_f64() * 1000.0 / inner.timed_calls as f64
            } else {
                0.0
            },
            time_until_retry_ms: inner.remaining_open(now, self.config.timeout()).as_millis() as u64,
            state_age_ms: now.saturating_duration_since(inner.last_state_change).as_millis() as u64,
        }
    }

    /// Return to closed and clear all counters
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            let transition = inner.transition(CircuitState::Closed, now);
            let last_state_change = inner.last_state_change;
            *inner = BreakerInner {
                last_state_change,
                ..BreakerInner::new(now)
            };
            transition
        };
        self.announce(transition);
    }

    /// Open the breaker regardless of the failure count
    pub fn force_open(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.trial_in_flight = false;
            inner.transition(CircuitState::Open, now)
        };
        self.announce(transition);
    }

    fn record(&self, trial: bool, started: Instant, success: bool) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            if trial {
                inner.trial_in_flight = false;
            }
            inner.timed_calls += 1;
            inner.total_response += now.saturating_duration_since(started);

            if success {
                inner.total_successes += 1;
                match inner.state {
                    CircuitState::Closed => {
                        inner.consecutive_failures = 0;
                        inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                        None
                    }
                    CircuitState::HalfOpen => {
                        inner.consecutive_successes += 1;
                        if inner.consecutive_successes >= self.config.success_threshold {
                            inner.transition(CircuitState::Closed, now)
                        } else {
                            None
                        }
                    }
                    // a call admitted before the breaker opened
                    CircuitState::Open => None,
                }
            } else {
                inner.total_failures += 1;
                inner.last_failure = Some(now);
                match inner.state {
                    CircuitState::Closed => {
                        inner.consecutive_successes = 0;
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.config.failure_threshold {
                            inner.transition(CircuitState::Open, now)
                        } else {
                            None
                        }
                    }
                    CircuitState::HalfOpen => inner.transition(CircuitState::Open, now),
                    CircuitState::Open => None,
                }
            }
        };
        self.announce(transition);
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn rejection(&self, state: CircuitState, retry_after: Duration) -> CircuitBreakerError {
        CircuitBreakerError {
            name: self.name.clone(),
            state,
            retry_after,
        }
    }

    fn announce(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %from,
                to = %to,
                timeout_ms = self.config.timeout_ms,
                "Circuit breaker opened"
            ),
            _ => info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed"),
        }

        if let Some(ref events) = self.events {
            events.publish(MonitorEvent::StateChange {
                breaker: self.name.clone(),
                from,
                to,
                timestamp: unix_millis(),
            });
        }
    }
}

/// Admission for a single guarded call
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`]. A permit
/// dropped without an outcome counts as neither and frees the half-open trial slot.
#[must_use = "report the call outcome with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    started: Instant,
    settled: bool,
}

impl std::fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("breaker", &self.breaker.name)
            .field("trial", &self.trial)
            .field("started", &self.started)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.trial, self.started, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.trial, self.started, false);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Name-keyed registry of breakers
pub struct CircuitBreakerManager {
    defaults: CircuitBreakerConfig,
    clock: SharedClock,
    events: Option<EventBus>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_clock(defaults, system_clock())
    }

    pub fn with_clock(defaults: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            defaults,
            clock,
            events: None,
            breakers: DashMap::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Existing breaker for `name`, or a new one built from `config` (or the defaults)
    pub fn get_or_create(&self, name: &str, config: Option<CircuitBreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::with_clock(
                    name,
                    config.unwrap_or_else(|| self.defaults.clone()),
                    self.clock.clone(),
                );
                if let Some(ref events) = self.events {
                    breaker = breaker.with_events(events.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self.breakers.iter().map(|e| e.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Names of breakers currently not closed
    pub fn open_breakers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| e.value().state() != CircuitState::Closed)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure_threshold: u32, success_threshold: u32, timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            timeout_ms,
            reset_timeout_ms: 60_000,
        }
    }

    fn breaker(cfg: CircuitBreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock("api", cfg, Arc::new(clock.clone()));
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.execute(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let (breaker, _clock) = breaker(config(3, 2, 5000));

        for _ in 0..3 {
            let err = fail(&breaker).await.unwrap_err();
            assert!(!err.is_rejected());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        match result {
            Err(BreakerError::Rejected(e)) => {
                assert_eq!(e.name, "api");
                assert_eq!(e.state, CircuitState::Open);
                assert_eq!(e.retry_after, Duration::from_millis(5000));
            }
            other => panic!("expected rejection, got {:?}", other.map_err(|e| e.to_string())),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_success_before_threshold_resets_failures() {
        let (breaker, _clock) = breaker(config(3, 2, 5000));

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();

        let stats = breaker.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.consecutive_successes, 1);

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_then_closes() {
        let (breaker, clock) = breaker(config(3, 2, 5000));
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }

        clock.advance_ms(4999);
        assert!(fail(&breaker).await.unwrap_err().is_rejected());

        clock.advance_ms(1);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let stats = breaker.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.consecutive_successes, 0);
        assert_eq!(stats.open_count, 1);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_and_restamps() {
        let (breaker, clock) = breaker(config(1, 2, 1000));
        fail(&breaker).await.unwrap_err();

        clock.advance_ms(1000);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.time_until_retry(), Duration::from_millis(1000));
        assert_eq!(breaker.stats().open_count, 2);
    }

    #[test]
    fn test_single_trial_in_half_open() {
        let (breaker, clock) = breaker(config(1, 1, 1000));
        breaker.try_acquire().unwrap().failure();
        clock.advance_ms(1000);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());

        let other = breaker.try_acquire().unwrap_err();
        assert_eq!(other.state, CircuitState::HalfOpen);

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let (breaker, clock) = breaker(config(1, 1, 1000));
        breaker.try_acquire().unwrap().failure();
        clock.advance_ms(1000);

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        trial.success();
    }

    #[test]
    fn test_closed_counters_expire_after_reset_timeout() {
        let mut cfg = config(3, 1, 1000);
        cfg.reset_timeout_ms = 10_000;
        let (breaker, clock) = breaker(cfg);

        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        clock.advance_ms(10_000);

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 1);
    }

    #[test]
    fn test_counters_never_both_nonzero() {
        let (breaker, _clock) = breaker(config(10, 1, 1000));
        for i in 0..20 {
            let permit = breaker.try_acquire().unwrap();
            if i % 3 == 0 {
                permit.failure();
            } else {
                permit.success();
            }
            let stats = breaker.stats();
            assert!(stats.consecutive_failures == 0 || stats.consecutive_successes == 0);
        }
    }

    #[tokio::test]
    async fn test_excluded_errors_do_not_count() {
        let (breaker, _clock) = breaker(config(2, 1, 5000));
        let not_found = || CallPolicy::new().exclude(|e: &&str| *e == "not found");

        for _ in 0..5 {
            let result = breaker
                .execute_with(not_found(), || async { Err::<(), _>("not found") })
                .await;
            assert!(matches!(result, Err(BreakerError::Operation("not found"))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().total_failures, 0);

        for _ in 0..2 {
            breaker
                .execute_with(not_found(), || async { Err::<(), _>("timeout") })
                .await
                .unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_excluded_error_frees_trial_slot() {
        let (breaker, clock) = breaker(config(1, 1, 1000));
        fail(&breaker).await.unwrap_err();
        clock.advance_ms(1000);

        breaker
            .execute_with(CallPolicy::new().exclude(|_: &&str| true), || async {
                Err::<(), _>("ignored")
            })
            .await
            .unwrap_err();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test]
    async fn test_fallback_and_failure_hook() {
        let (breaker, _clock) = breaker(config(2, 1, 5000));
        let failures = AtomicU32::new(0);
        let policy = || {
            CallPolicy::new()
                .on_failure(|_: &&str| {
                    failures.fetch_add(1, Ordering::SeqCst);
                })
                .fallback(|| "cached")
        };

        // still closed after the first failure, so the error surfaces
        let first = breaker.execute_with(policy(), || async { Err("boom") }).await;
        assert!(matches!(first, Err(BreakerError::Operation("boom"))));

        // this failure opens the breaker, so the fallback answers
        let second = breaker.execute_with(policy(), || async { Err("boom") }).await;
        assert_eq!(second.unwrap(), "cached");
        assert_eq!(failures.load(Ordering::SeqCst), 2);

        let invoked = AtomicU32::new(0);
        let rejected = breaker
            .execute_with(policy(), || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok("fresh")
            })
            .await;
        assert_eq!(rejected.unwrap(), "cached");
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock("db", config(1, 1, 100), Arc::new(clock.clone()))
            .with_events(bus);

        breaker.try_acquire().unwrap().failure();
        clock.advance_ms(100);
        breaker.try_acquire().unwrap().success();

        let mut seen = Vec::new();
        while let Ok(MonitorEvent::StateChange { from, to, .. }) = rx.try_recv() {
            seen.push((from, to));
        }
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_force_open_and_reset() {
        let (breaker, _clock) = breaker(config(5, 1, 30_000));
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().total_calls, 0);
    }

    #[test]
    fn test_manager_is_idempotent() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let a = manager.get_or_create("telegram", Some(config(2, 1, 1000)));
        let b = manager.get_or_create("telegram", None);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 2);
        assert_eq!(manager.len(), 1);

        manager.get_or_create("discord", None);
        assert_eq!(manager.names(), vec!["discord", "telegram"]);
        assert_eq!(manager.get("discord").unwrap().config().failure_threshold, 5);
    }

    #[test]
    fn test_manager_reset_all() {
        let manager = CircuitBreakerManager::new(config(1, 1, 60_000));
        manager.get_or_create("a", None).force_open();
        manager.get_or_create("b", None).force_open();
        assert_eq!(manager.open_breakers().len(), 2);

        manager.reset_all();
        assert!(manager.open_breakers().is_empty());
    }
}
