//! Alert manager: cooldown, aggregation, fan-out and history

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::channels::{AlertChannel, ConsoleChannel};
use super::{Alert, AlertAggregate, AlertInput, AlertLevel, AlertQuery, AlertStats};
use crate::clock::{system_clock, SharedClock};
use crate::config::AlertsConfig;
use crate::events::{EventBus, MonitorEvent};

/// Last dispatch of a key: when (monotonic) and the alert's wall-clock time
#[derive(Debug, Clone, Copy)]
struct LastSent {
    at: Instant,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct AlertState {
    history: VecDeque<Alert>,
    last_sent: HashMap<String, LastSent>,
    aggregates: HashMap<String, AlertAggregate>,
    flushes: HashMap<String, AbortHandle>,
}

enum Decision {
    Dispatch,
    Suppress { schedule_flush: bool },
}

struct Inner {
    config: AlertsConfig,
    clock: SharedClock,
    console: ConsoleChannel,
    channels: Vec<Box<dyn AlertChannel>>,
    events: Option<EventBus>,
    next_id: AtomicU64,
    state: Mutex<AlertState>,
}

/// Cloneable handle; clones share history and cooldown state
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl AlertManager {
    /// Manager with the console channel plus the webhooks named in `config`
    pub fn new(config: AlertsConfig) -> Self {
        let channels = super::channels_from_config(&config);
        Self::with_channels(config, channels, system_clock(), None)
    }

    pub fn with_channels(
        config: AlertsConfig,
        channels: Vec<Box<dyn AlertChannel>>,
        clock: SharedClock,
        events: Option<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                console: ConsoleChannel,
                channels,
                events,
                next_id: AtomicU64::new(1),
                state: Mutex::new(AlertState::default()),
            }),
        }
    }

    /// Same channels and configuration, publishing onto `events`
    pub fn from_config(config: AlertsConfig, events: EventBus) -> Self {
        let channels = super::channels_from_config(&config);
        Self::with_channels(config, channels, system_clock(), Some(events))
    }

    pub fn config(&self) -> &AlertsConfig {
        &self.inner.config
    }

    pub fn channel_names(&self) -> Vec<String> {
        std::iter::once(self.inner.console.name())
            .chain(self.inner.channels.iter().map(|c| c.name()))
            .map(String::from)
            .collect()
    }

    fn next_id(&self) -> String {
        format!("alert-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Build an alert and dispatch it unless its key is cooling down.
    ///
    /// A suppressed alert is returned with `suppressed` set and counted in
    /// the key's aggregate; the first suppression schedules a flush one
    /// cooldown later.
    pub async fn send(&self, input: AlertInput) -> Alert {
        let mut alert = Alert::from_input(self.next_id(), input);
        if !self.inner.config.enabled {
            debug!(title = %alert.title, "Alerts disabled, dropping alert");
            return alert;
        }

        let key = alert.key();
        let cooldown = self.inner.config.cooldown();
        let now = self.inner.clock.now();

        let decision = {
            let mut state = self.inner.state.lock();
            match state.last_sent.get(&key).copied() {
                Some(last) if now.saturating_duration_since(last.at) < cooldown => {
                    alert.suppressed = true;
                    match state.aggregates.get_mut(&key) {
                        Some(aggregate) => {
                            aggregate.count += 1;
                            aggregate.last_occurrence = alert.timestamp;
                            aggregate.sample = alert.clone();
                            Decision::Suppress {
                                schedule_flush: false,
                            }
                        }
                        None => {
                            state.aggregates.insert(
                                key.clone(),
                                AlertAggregate {
                                    key: key.clone(),
                                    count: 2,
                                    first_occurrence: last.timestamp,
                                    last_occurrence: alert.timestamp,
                                    sample: alert.clone(),
                                },
                            );
                            Decision::Suppress {
                                schedule_flush: true,
                            }
                        }
                    }
                }
                _ => {
                    state.last_sent.insert(
                        key.clone(),
                        LastSent {
                            at: now,
                            timestamp: alert.timestamp,
                        },
                    );
                    Decision::Dispatch
                }
            }
        };

        match decision {
            Decision::Dispatch => self.dispatch(alert).await,
            Decision::Suppress { schedule_flush } => {
                debug!(key = %key, "Alert suppressed by cooldown");
                if schedule_flush {
                    self.schedule_flush(key, cooldown);
                }
                alert
            }
        }
    }

    pub async fn info(&self, source: &str, title: &str, message: impl Into<String>) -> Alert {
        self.send(AlertInput::new(AlertLevel::Info, source, title, message)).await
    }

    pub async fn warning(&self, source: &str, title: &str, message: impl Into<String>) -> Alert {
        self.send(AlertInput::new(AlertLevel::Warning, source, title, message)).await
    }

    pub async fn error(&self, source: &str, title: &str, message: impl Into<String>) -> Alert {
        self.send(AlertInput::new(AlertLevel::Error, source, title, message)).await
    }

    pub async fn critical(&self, source: &str, title: &str, message: impl Into<String>) -> Alert {
        self.send(AlertInput::new(AlertLevel::Critical, source, title, message)).await
    }

    fn schedule_flush(&self, key: String, delay: std::time::Duration) {
        let manager = self.clone();
        let flush_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.flush(&flush_key).await;
        });

        let mut state = self.inner.state.lock();
        // the aggregate may already be gone if clear() ran in between
        if state.aggregates.contains_key(&key) {
            state.flushes.insert(key, handle.abort_handle());
        } else {
            handle.abort();
        }
    }

    /// Emit the aggregated alert for `key`, if any
    async fn flush(&self, key: &str) -> Option<Alert> {
        let aggregate = {
            let mut state = self.inner.state.lock();
            state.flushes.remove(key);
            state.aggregates.remove(key)
        }?;

        let window = aggregate.last_occurrence - aggregate.first_occurrence;
        let mut alert = aggregate.sample;
        alert.id = self.next_id();
        alert.timestamp = Utc::now();
        alert.suppressed = false;
        alert.occurrences = aggregate.count;
        alert.message = format!(
            "{} (occurred {} times in {}s)",
            alert.message,
            aggregate.count,
            window.num_seconds()
        );
        alert
            .metadata
            .insert("occurrences".into(), aggregate.count.into());
        alert.metadata.insert(
            "first_occurrence".into(),
            aggregate.first_occurrence.to_rfc3339().into(),
        );

        Some(self.dispatch(alert).await)
    }

    /// Console first, then each external channel; failures are logged only
    async fn dispatch(&self, mut alert: Alert) -> Alert {
        if self.inner.console.send(&alert).await.is_ok() {
            alert.sent_to.push(self.inner.console.name().to_string());
        }

        for channel in &self.inner.channels {
            match channel.send(&alert).await {
                Ok(()) => alert.sent_to.push(channel.name().to_string()),
                Err(e) => warn!(channel = channel.name(), error = %e, "Alert delivery failed"),
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.history.push_back(alert.clone());
            while state.history.len() > self.inner.config.history_size.max(1) {
                state.history.pop_front();
            }
        }

        if let Some(events) = &self.inner.events {
            events.publish(MonitorEvent::Alert(alert.clone()));
        }
        alert
    }

    /// Mark an alert in history as acknowledged; false if unknown
    pub fn acknowledge(&self, id: &str, by: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.history.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                alert.acknowledged_by = Some(by.to_string());
                alert.acknowledged_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Dispatched alerts matching `query`, oldest first
    pub fn history(&self, query: &AlertQuery) -> Vec<Alert> {
        let state = self.inner.state.lock();
        let matches: Vec<Alert> = state
            .history
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        let skip = query
            .limit
            .map(|l| matches.len().saturating_sub(l))
            .unwrap_or(0);
        matches.into_iter().skip(skip).collect()
    }

    pub fn unacknowledged(&self, min_level: Option<AlertLevel>) -> Vec<Alert> {
        self.history(&AlertQuery {
            level: min_level,
            acknowledged: Some(false),
            ..AlertQuery::default()
        })
    }

    /// Open aggregates, i.e. keys with pending flushes
    pub fn aggregates(&self) -> Vec<AlertAggregate> {
        let state = self.inner.state.lock();
        let mut aggregates: Vec<AlertAggregate> = state.aggregates.values().cloned().collect();
        aggregates.sort_by(|a, b| a.key.cmp(&b.key));
        aggregates
    }

    pub fn stats(&self) -> AlertStats {
        let state = self.inner.state.lock();
        let cutoff = Utc::now() - ChronoDuration::hours(24);

        let mut by_level = BTreeMap::new();
        let mut by_source = BTreeMap::new();
        for alert in &state.history {
            *by_level.entry(alert.level).or_insert(0) += 1;
            let prefix = alert.source.split('.').next().unwrap_or_default().to_string();
            *by_source.entry(prefix).or_insert(0) += 1;
        }

        AlertStats {
            enabled: self.inner.config.enabled,
            total_alerts: state.history.len(),
            unacknowledged: state.history.iter().filter(|a| !a.acknowledged).count(),
            last_24_hours: state.history.iter().filter(|a| a.timestamp >= cutoff).count(),
            by_level,
            by_source,
            aggregates: state.aggregates.len(),
            channels: self.channel_names(),
        }
    }

    /// Drop history, cooldowns and aggregates, cancelling pending flushes
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        for (_, handle) in state.flushes.drain() {
            handle.abort();
        }
        *state = AlertState::default();
    }

    /// Cancel pending flushes; history is kept
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        for (_, handle) in state.flushes.drain() {
            handle.abort();
        }
        state.aggregates.clear();
    }
}
