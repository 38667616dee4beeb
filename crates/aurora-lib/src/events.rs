//! In-process event bus
//!
//! Every component publishes onto a shared `tokio::sync::broadcast` channel.
//! Publishing never blocks: a subscriber that falls behind loses the oldest
//! events and sees `RecvError::Lagged` on its next receive.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::alerts::Alert;
use crate::anomaly::Anomaly;
use crate::collector::MetricSample;
use crate::protection::CircuitState;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by the runtime
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Metrics(MetricSample),
    Anomaly(Anomaly),
    Alert(Alert),
    StateChange {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
        timestamp: i64,
    },
    RateLimited {
        limiter: String,
        client: Option<String>,
        cost: f64,
        retry_after_ms: u64,
    },
    Healed {
        target: String,
        attempts: u32,
    },
    ChannelReconnected {
        target: String,
    },
    HealingExhausted {
        target: String,
        attempts: u32,
    },
    ProcessUnresponsive {
        silent_for_ms: u64,
    },
    ProcessRecovered {
        downtime_ms: u64,
    },
}

impl MonitorEvent {
    /// Wire name of the event, matching the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::Metrics(_) => "metrics",
            MonitorEvent::Anomaly(_) => "anomaly",
            MonitorEvent::Alert(_) => "alert",
            MonitorEvent::StateChange { .. } => "state_change",
            MonitorEvent::RateLimited { .. } => "rate_limited",
            MonitorEvent::Healed { .. } => "healed",
            MonitorEvent::ChannelReconnected { .. } => "channel_reconnected",
            MonitorEvent::HealingExhausted { .. } => "healing_exhausted",
            MonitorEvent::ProcessUnresponsive { .. } => "process_unresponsive",
            MonitorEvent::ProcessRecovered { .. } => "process_recovered",
        }
    }
}

/// Cloneable publisher handle
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
