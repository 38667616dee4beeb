//! Heartbeat watchdog
//!
//! The host calls `heartbeat()` periodically. A check loop compares the time
//! since the last heartbeat with the timeout and declares the process
//! unresponsive once per episode; the next heartbeat ends the episode.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::alerts::{AlertInput, AlertLevel, AlertManager};
use crate::clock::{system_clock, SharedClock};
use crate::config::WatchdogConfig;
use crate::error::WatchdogTimeout;
use crate::events::{EventBus, MonitorEvent};

const ALERT_SOURCE: &str = "aurora.watchdog";

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub alive: bool,
    pub last_heartbeat_ms_ago: u64,
    pub timeout_ms: u64,
    pub heartbeats: u64,
    /// Unresponsive episodes since start
    pub episodes: u64,
}

#[derive(Debug)]
struct WatchdogState {
    last_heartbeat: Instant,
    unresponsive_since: Option<Instant>,
    heartbeats: u64,
    episodes: u64,
}

pub struct ProcessWatchdog {
    config: WatchdogConfig,
    clock: SharedClock,
    alerts: AlertManager,
    events: Option<EventBus>,
    state: Mutex<WatchdogState>,
}

impl ProcessWatchdog {
    pub fn new(config: WatchdogConfig, alerts: AlertManager) -> Self {
        Self::with_clock(config, alerts, system_clock())
    }

    /// The heartbeat clock starts at construction and again when `run` starts
    pub fn with_clock(config: WatchdogConfig, alerts: AlertManager, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            alerts,
            events: None,
            state: Mutex::new(WatchdogState {
                last_heartbeat: now,
                unresponsive_since: None,
                heartbeats: 0,
                episodes: 0,
            }),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Record liveness; ends an unresponsive episode if one is open
    pub async fn heartbeat(&self) {
        let now = self.clock.now();
        let downtime = {
            let mut state = self.state.lock();
            state.last_heartbeat = now;
            state.heartbeats += 1;
            state
                .unresponsive_since
                .take()
                .map(|since| now.saturating_duration_since(since))
        };

        if let Some(downtime) = downtime {
            let downtime_ms = downtime.as_millis() as u64;
            info!(downtime_ms, "Process responsive again");
            if let Some(events) = &self.events {
                events.publish(MonitorEvent::ProcessRecovered { downtime_ms });
            }
            self.alerts
                .send(
                    AlertInput::new(
                        AlertLevel::Info,
                        ALERT_SOURCE,
                        "Process recovered",
                        format!("Heartbeats resumed after {downtime_ms}ms"),
                    )
                    .with_metadata("downtime_ms", downtime_ms),
                )
                .await;
        }
    }

    /// Start a fresh silence window without counting a heartbeat
    pub fn rearm(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.last_heartbeat = now;
        state.unresponsive_since = None;
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().unresponsive_since.is_none()
    }

    /// Compare heartbeat age with the timeout. Alerts only on the check that
    /// opens an episode; later checks in the same episode just return the error.
    pub async fn check(&self) -> Result<(), WatchdogTimeout> {
        let timeout = self.config.heartbeat_timeout();
        let now = self.clock.now();

        let (silent_for, opened) = {
            let mut state = self.state.lock();
            let silent_for = now.saturating_duration_since(state.last_heartbeat);
            if silent_for <= timeout {
                return Ok(());
            }
            let opened = state.unresponsive_since.is_none();
            if opened {
                state.unresponsive_since = Some(now);
                state.episodes += 1;
            }
            (silent_for, opened)
        };

        if opened {
            let silent_for_ms = silent_for.as_millis() as u64;
            error!(silent_for_ms, timeout_ms = timeout.as_millis() as u64, "Process unresponsive");
            if let Some(events) = &self.events {
                events.publish(MonitorEvent::ProcessUnresponsive { silent_for_ms });
            }
            self.alerts
                .send(
                    AlertInput::new(
                        AlertLevel::Critical,
                        ALERT_SOURCE,
                        "Process unresponsive",
                        format!(
                            "No heartbeat for {silent_for_ms}ms (timeout {}ms)",
                            timeout.as_millis()
                        ),
                    )
                    .with_metadata("silent_for_ms", silent_for_ms),
                )
                .await;
        }

        Err(WatchdogTimeout {
            silent_for,
            timeout,
        })
    }

    pub fn status(&self) -> WatchdogStatus {
        let now = self.clock.now();
        let state = self.state.lock();
        WatchdogStatus {
            alive: state.unresponsive_since.is_none(),
            last_heartbeat_ms_ago: now.saturating_duration_since(state.last_heartbeat).as_millis() as u64,
            timeout_ms: self.config.heartbeat_timeout_ms,
            heartbeats: state.heartbeats,
            episodes: state.episodes,
        }
    }

    /// Check every `check_interval` until shutdown
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.check_interval().max(Duration::from_millis(1));
        info!(check_interval_ms = period.as_millis() as u64, "Starting watchdog");
        self.rearm();

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.check().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down watchdog");
                    break;
                }
            }
        }
    }
}
