//! Token-bucket rate limiter with optional per-client buckets
//!
//! The global bucket and every client bucket live under one mutex, so a
//! global debit refunded after a client rejection is never observed half done.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::token_bucket::{is_valid_cost, TokenBucket};
use crate::clock::{system_clock, SharedClock};
use crate::config::RateLimiterConfig;
use crate::error::RateLimitError;
use crate::events::{EventBus, MonitorEvent};

/// Interval between retries in `acquire_wait`
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Integrations with a built-in limiter profile
pub const PRESET_NAMES: &[&str] = &[
    "telegram", "discord", "whatsapp", "slack", "openai", "anthropic", "gemini",
];

/// Limiter profile tuned for a known external service
pub fn preset(name: &str) -> Option<RateLimiterConfig> {
    let (rate, burst, client) = match name {
        // 30 msg/s per bot, about one per second per chat
        "telegram" => (30.0, 30.0, Some((1.0, 3.0))),
        // 50 req/s global, 5 per 5s per channel
        "discord" => (50.0, 50.0, Some((1.0, 5.0))),
        "whatsapp" => (80.0, 80.0, Some((1.0, 5.0))),
        // roughly one message per second per channel
        "slack" => (1.0, 3.0, Some((1.0, 1.0))),
        "openai" => (10.0, 20.0, None),
        "anthropic" => (5.0, 10.0, None),
        "gemini" => (1.0, 5.0, None),
        _ => return None,
    };

    let base = RateLimiterConfig::default();
    Some(match client {
        Some((client_rate, client_burst)) => RateLimiterConfig {
            rate,
            burst,
            per_client: true,
            client_rate,
            client_burst,
            max_clients: base.max_clients,
        },
        None => RateLimiterConfig {
            rate,
            burst,
            per_client: false,
            ..base
        },
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub rate: f64,
    pub burst: f64,
    pub available_tokens: f64,
    pub total_requests: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rejection_rate: f64,
    /// Highest number of accepted requests seen in one second
    pub peak_rate_per_sec: u64,
    pub active_clients: usize,
}

#[derive(Debug)]
struct ClientBucket {
    bucket: TokenBucket,
    last_seen: Instant,
}

#[derive(Debug)]
struct LimiterState {
    global: TokenBucket,
    clients: HashMap<String, ClientBucket>,
    total: u64,
    accepted: u64,
    rejected: u64,
    window_start: Instant,
    window_count: u64,
    peak_per_sec: u64,
}

impl LimiterState {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            global: TokenBucket::new(config.burst, config.rate, now),
            clients: HashMap::new(),
            total: 0,
            accepted: 0,
            rejected: 0,
            window_start: now,
            window_count: 0,
            peak_per_sec: 0,
        }
    }

    fn count_accepted(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.window_count = 0;
        }
        self.window_count += 1;
        self.peak_per_sec = self.peak_per_sec.max(self.window_count);
    }
}

/// Admission control for one integration
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    clock: SharedClock,
    events: Option<EventBus>,
    state: Mutex<LimiterState>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: RateLimiterConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            state: Mutex::new(LimiterState::new(&config, now)),
            config,
            clock,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Debit `cost` tokens from the global bucket and, if enabled, the client bucket
    pub fn try_acquire(&self, client: Option<&str>, cost: f64) -> Result<(), RateLimitError> {
        let result = self.attempt(client, cost, true);
        if let Err(ref e) = result {
            self.announce_rejection(e, cost);
        }
        result
    }

    pub fn acquire(&self, client: Option<&str>, cost: f64) -> bool {
        self.try_acquire(client, cost).is_ok()
    }

    /// Retry every few milliseconds until admitted or `max_wait` runs out.
    /// A `max_wait` too large to represent as a deadline waits indefinitely.
    pub async fn acquire_wait(&self, client: Option<&str>, cost: f64, max_wait: Duration) -> bool {
        let deadline = self.clock.now().checked_add(max_wait);

        loop {
            let err = match self.attempt(client, cost, false) {
                Ok(()) => {
                    self.record_outcome(true);
                    return true;
                }
                Err(e @ RateLimitError::InvalidCost { .. }) => {
                    self.announce_rejection(&e, cost);
                    return false;
                }
                Err(e) => e,
            };

            let pause = match deadline {
                Some(deadline) => {
                    let now = self.clock.now();
                    if now >= deadline {
                        self.record_outcome(false);
                        self.announce_rejection(&err, cost);
                        return false;
                    }
                    POLL_INTERVAL.min(deadline.saturating_duration_since(now))
                }
                None => POLL_INTERVAL,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Time until `cost` tokens are available for this client
    pub fn wait_time(&self, client: Option<&str>, cost: f64) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.projected_wait(&mut state, client, cost, now)
    }

    pub fn available_tokens(&self) -> f64 {
        let now = self.clock.now();
        self.state.lock().global.available(now)
    }

    pub fn client_tokens(&self, client: &str) -> Option<f64> {
        let now = self.clock.now();
        self.state
            .lock()
            .clients
            .get_mut(client)
            .map(|entry| entry.bucket.available(now))
    }

    /// Refill every bucket and clear statistics
    pub fn reset(&self) {
        let now = self.clock.now();
        *self.state.lock() = LimiterState::new(&self.config, now);
    }

    pub fn reset_client(&self, client: &str) -> bool {
        self.state.lock().clients.remove(client).is_some()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        let mut state = self.state.lock();

        RateLimiterStats {
            name: self.name.clone(),
            rate: self.config.rate,
            burst: self.config.burst,
            available_tokens: state.global.available(now),
            total_requests: state.total,
            accepted: state.accepted,
            rejected: state.rejected,
            rejection_rate: if state.total > 0 {
                state.rejected as f64 / state.total as f64 * 100.0
            } else {
                0.0
            },
            peak_rate_per_sec: state.peak_per_sec,
            active_clients: state.clients.len(),
        }
    }

    fn attempt(&self, client: Option<&str>, cost: f64, record: bool) -> Result<(), RateLimitError> {
        if !is_valid_cost(cost) {
            return Err(RateLimitError::InvalidCost {
                limiter: self.name.clone(),
                cost,
            });
        }

        let now = self.clock.now();
        let mut state = self.state.lock();

        let admitted = if !state.global.try_consume(cost, now) {
            false
        } else {
            match client.filter(|_| self.config.per_client) {
                Some(id) => {
                    if !state.clients.contains_key(id) {
                        self.prune_clients(&mut state, now);
                        state.clients.insert(
                            id.to_string(),
                            ClientBucket {
                                bucket: TokenBucket::new(self.config.client_burst, self.config.client_rate, now),
                                last_seen: now,
                            },
                        );
                    }
                    let client_ok = state
                        .clients
                        .get_mut(id)
                        .map(|entry| {
                            entry.last_seen = now;
                            entry.bucket.try_consume(cost, now)
                        })
                        .unwrap_or(false);
                    if !client_ok {
                        state.global.refund(cost);
                    }
                    client_ok
                }
                None => true,
            }
        };

        if admitted {
            if record {
                state.total += 1;
                state.accepted += 1;
            }
            state.count_accepted(now);
            return Ok(());
        }

        if record {
            state.total += 1;
            state.rejected += 1;
        }
        let retry_after = self.projected_wait(&mut state, client, cost, now);

        Err(RateLimitError::Exceeded {
            limiter: self.name.clone(),
            client: client.map(str::to_string),
            retry_after,
        })
    }

    fn record_outcome(&self, accepted: bool) {
        let mut state = self.state.lock();
        state.total += 1;
        if accepted {
            state.accepted += 1;
        } else {
            state.rejected += 1;
        }
    }

    fn projected_wait(
        &self,
        state: &mut LimiterState,
        client: Option<&str>,
        cost: f64,
        now: Instant,
    ) -> Duration {
        let global = state.global.wait_time(cost, now);
        let client_wait = client
            .filter(|_| self.config.per_client)
            .and_then(|id| state.clients.get_mut(id))
            .map(|entry| entry.bucket.wait_time(cost, now))
            .unwrap_or(Duration::ZERO);
        global.max(client_wait)
    }

    /// Drop idle (full) client buckets once the map reaches its cap. If every
    /// client is still draining, evict the least recently seen ones instead.
    fn prune_clients(&self, state: &mut LimiterState, now: Instant) {
        let cap = self.config.max_clients.max(1);
        if state.clients.len() < cap {
            return;
        }
        let before = state.clients.len();
        state.clients.retain(|_, entry| !entry.bucket.is_full(now));

        while state.clients.len() >= cap {
            let oldest = state
                .clients
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => state.clients.remove(&id),
                None => break,
            };
        }
        debug!(
            limiter = %self.name,
            pruned = before - state.clients.len(),
            "Pruned client buckets"
        );
    }

    fn announce_rejection(&self, err: &RateLimitError, cost: f64) {
        if let RateLimitError::InvalidCost { .. } = err {
            warn!(limiter = %self.name, cost, "Refused request with invalid cost");
            return;
        }
        let retry_after_ms = err.retry_after().as_millis() as u64;
        debug!(
            limiter = %self.name,
            client = ?err.client(),
            retry_after_ms,
            "Rate limit exceeded"
        );

        if let Some(ref events) = self.events {
            events.publish(MonitorEvent::RateLimited {
                limiter: self.name.clone(),
                client: err.client().map(str::to_string),
                cost,
                retry_after_ms,
            });
        }
    }
}

/// Name-keyed registry of limiters
pub struct RateLimiterManager {
    defaults: RateLimiterConfig,
    clock: SharedClock,
    events: Option<EventBus>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterManager {
    pub fn new(defaults: RateLimiterConfig) -> Self {
        Self::with_clock(defaults, system_clock())
    }

    pub fn with_clock(defaults: RateLimiterConfig, clock: SharedClock) -> Self {
        Self {
            defaults,
            clock,
            events: None,
            limiters: DashMap::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Existing limiter for `name`, or a new one from `config`, the preset of
    /// the same name, or the defaults, in that order
    pub fn get_or_create(&self, name: &str, config: Option<RateLimiterConfig>) -> Arc<RateLimiter> {
        if let Some(existing) = self.limiters.get(name) {
            return existing.clone();
        }

        self.limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = config
                    .or_else(|| preset(name))
                    .unwrap_or_else(|| self.defaults.clone());
                let mut limiter = RateLimiter::with_clock(name, config, self.clock.clone());
                if let Some(ref events) = self.events {
                    limiter = limiter.with_events(events.clone());
                }
                Arc::new(limiter)
            })
            .clone()
    }

    /// Limiter for a known integration; `None` if no preset exists for it
    pub fn for_integration(&self, integration: &str) -> Option<Arc<RateLimiter>> {
        let config = preset(integration)?;
        Some(self.get_or_create(integration, Some(config)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|l| l.clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.remove(name).map(|(_, l)| l)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all_stats(&self) -> Vec<RateLimiterStats> {
        let mut stats: Vec<RateLimiterStats> = self.limiters.iter().map(|e| e.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        for entry in self.limiters.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_pending, assert_ready};

    fn limiter(config: RateLimiterConfig) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock("test", config, Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn per_client(rate: f64, burst: f64, client_rate: f64, client_burst: f64) -> RateLimiterConfig {
        RateLimiterConfig {
            rate,
            burst,
            per_client: true,
            client_rate,
            client_burst,
            max_clients: 100,
        }
    }

    #[test]
    fn test_burst_of_five_admits_exactly_five() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            rate: 5.0,
            burst: 5.0,
            per_client: false,
            ..RateLimiterConfig::default()
        });

        let accepted = (0..10).filter(|_| limiter.acquire(None, 1.0)).count();
        assert_eq!(accepted, 5);

        let stats = limiter.stats();
        assert_eq!(stats.accepted, 5);
        assert_eq!(stats.rejected, 5);
        assert_eq!(stats.peak_rate_per_sec, 5);
    }

    #[test]
    fn test_refills_over_time() {
        let (limiter, clock) = limiter(RateLimiterConfig::with_rate(2.0));
        while limiter.acquire(None, 1.0) {}

        clock.advance_ms(500);
        assert!(limiter.acquire(None, 1.0));
        assert!(!limiter.acquire(None, 1.0));
    }

    #[test]
    fn test_client_rejection_refunds_global() {
        let (limiter, _clock) = limiter(per_client(100.0, 10.0, 1.0, 2.0));

        assert!(limiter.acquire(Some("chat-1"), 1.0));
        assert!(limiter.acquire(Some("chat-1"), 1.0));
        assert_eq!(limiter.available_tokens(), 8.0);

        let err = limiter.try_acquire(Some("chat-1"), 1.0).unwrap_err();
        assert_eq!(err.client(), Some("chat-1"));
        assert_eq!(err.retry_after(), Duration::from_millis(1000));
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded for 'test' (client chat-1). Retry after 1000ms"
        );
        assert_eq!(limiter.available_tokens(), 8.0);

        // other clients are unaffected
        assert!(limiter.acquire(Some("chat-2"), 1.0));
    }

    #[test]
    fn test_client_ignored_when_per_client_disabled() {
        let (limiter, _clock) = limiter(RateLimiterConfig::with_rate(10.0));
        for _ in 0..5 {
            assert!(limiter.acquire(Some("same"), 1.0));
        }
        assert_eq!(limiter.stats().active_clients, 0);
    }

    #[test]
    fn test_wait_time_is_max_of_global_and_client() {
        let (limiter, _clock) = limiter(per_client(2.0, 1.0, 0.5, 1.0));
        assert!(limiter.acquire(Some("u"), 1.0));

        // global needs 500ms, client needs 2000ms
        assert_eq!(limiter.wait_time(None, 1.0), Duration::from_millis(500));
        assert_eq!(limiter.wait_time(Some("u"), 1.0), Duration::from_millis(2000));
    }

    #[test]
    fn test_reset_client_restores_capacity() {
        let (limiter, _clock) = limiter(per_client(100.0, 100.0, 1.0, 1.0));
        assert!(limiter.acquire(Some("u"), 1.0));
        assert!(!limiter.acquire(Some("u"), 1.0));

        assert!(limiter.reset_client("u"));
        assert!(limiter.acquire(Some("u"), 1.0));
    }

    #[test]
    fn test_idle_clients_are_pruned_at_cap() {
        let mut config = per_client(1000.0, 1000.0, 1.0, 1.0);
        config.max_clients = 3;
        let (limiter, clock) = limiter(config);

        for id in ["a", "b", "c"] {
            assert!(limiter.acquire(Some(id), 1.0));
        }
        clock.advance_ms(1000);

        assert!(limiter.acquire(Some("d"), 1.0));
        assert_eq!(limiter.stats().active_clients, 1);
    }

    #[test]
    fn test_busy_clients_are_evicted_oldest_first() {
        let mut config = per_client(1000.0, 1000.0, 0.01, 5.0);
        config.max_clients = 3;
        let (limiter, clock) = limiter(config);

        for id in ["a", "b", "c"] {
            assert!(limiter.acquire(Some(id), 1.0));
            clock.advance_ms(10);
        }
        // "a" is seen again, so "b" is now the least recent
        assert!(limiter.acquire(Some("a"), 1.0));

        for id in ["d", "e", "f", "g"] {
            assert!(limiter.acquire(Some(id), 1.0));
            clock.advance_ms(10);
            assert!(limiter.stats().active_clients <= 3);
        }
        assert!(limiter.client_tokens("b").is_none());
        assert!(limiter.client_tokens("g").is_some());
    }

    #[test]
    fn test_invalid_costs_are_refused() {
        let (limiter, _clock) = limiter(RateLimiterConfig {
            rate: 5.0,
            burst: 5.0,
            per_client: false,
            ..RateLimiterConfig::default()
        });

        assert!(!limiter.acquire(None, -5.0));
        let err = limiter.try_acquire(None, f64::NAN).unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidCost { .. }));
        assert_eq!(err.to_string(), "Invalid cost NaN for rate limiter 'test'");
        assert!(limiter.available_tokens() <= 5.0);

        let accepted = (0..10).filter(|_| limiter.acquire(None, 1.0)).count();
        assert_eq!(accepted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait_with_invalid_cost_returns_immediately() {
        let limiter = RateLimiter::new("wait", RateLimiterConfig::with_rate(5.0));
        let start = Instant::now();
        assert!(!limiter.acquire_wait(None, -1.0, Duration::from_secs(5)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.available_tokens(), 7.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait_without_deadline() {
        let limiter = Arc::new(RateLimiter::new("stalled", RateLimiterConfig {
            rate: 0.0,
            burst: 1.0,
            per_client: false,
            ..RateLimiterConfig::default()
        }));
        assert!(limiter.acquire(None, 1.0));
        assert_eq!(limiter.wait_time(None, 1.0), Duration::MAX);

        let waiter = limiter.clone();
        let mut task = tokio_test::task::spawn(async move {
            waiter.acquire_wait(None, 1.0, Duration::MAX).await
        });
        assert_pending!(task.poll());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_pending!(task.poll());
        assert_eq!(limiter.stats().rejected, 0);

        limiter.reset();
        tokio::time::advance(POLL_INTERVAL).await;
        assert!(assert_ready!(task.poll()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait_succeeds_after_refill() {
        let limiter = RateLimiter::new("wait", RateLimiterConfig {
            rate: 10.0,
            burst: 1.0,
            per_client: false,
            ..RateLimiterConfig::default()
        });
        assert!(limiter.acquire(None, 1.0));

        assert!(limiter.acquire_wait(None, 1.0, Duration::from_millis(500)).await);
        let stats = limiter.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait_times_out() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let limiter = RateLimiter::new("slow", RateLimiterConfig {
            rate: 0.1,
            burst: 1.0,
            per_client: false,
            ..RateLimiterConfig::default()
        })
        .with_events(bus);
        assert!(limiter.acquire(None, 1.0));

        let start = Instant::now();
        assert!(!limiter.acquire_wait(None, 1.0, Duration::from_millis(200)).await);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(limiter.stats().rejected, 1);

        match rx.try_recv() {
            Ok(MonitorEvent::RateLimited { limiter, .. }) => assert_eq!(limiter, "slow"),
            other => panic!("expected rate_limited event, got {:?}", other),
        }
    }

    #[test]
    fn test_presets_cover_integrations() {
        for name in PRESET_NAMES {
            let config = preset(name).unwrap();
            assert!(config.rate > 0.0 && config.burst > 0.0, "{name}");
        }
        assert!(preset("unknown").is_none());
        assert!(preset("telegram").unwrap().per_client);
        assert!(!preset("openai").unwrap().per_client);
    }

    #[test]
    fn test_manager_uses_presets_and_is_idempotent() {
        let manager = RateLimiterManager::new(RateLimiterConfig::default());

        let telegram = manager.get_or_create("telegram", None);
        assert_eq!(telegram.config().rate, 30.0);
        assert!(Arc::ptr_eq(&telegram, &manager.get_or_create("telegram", None)));

        let custom = manager.get_or_create("internal", None);
        assert_eq!(custom.config().rate, 100.0);

        assert!(manager.for_integration("gemini").is_some());
        assert!(manager.for_integration("nope").is_none());
        assert_eq!(manager.names(), vec!["gemini", "internal", "telegram"]);
    }
}
