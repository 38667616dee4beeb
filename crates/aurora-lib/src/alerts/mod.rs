//! Alert model, dispatch and deduplication
//!
//! Every component reports problems through the `AlertManager`. Alerts that
//! repeat the same `(level, source, title)` inside the cooldown window are
//! folded into an aggregate and flushed once as a single summary alert.

mod channels;
mod manager;

pub use channels::{
    channels_from_config, AlertChannel, ConsoleChannel, DiscordChannel, SlackChannel,
    WebhookChannel,
};
pub use manager::AlertManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Alert level, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }

    /// Attachment color for chat webhooks
    pub fn color(&self) -> &'static str {
        match self {
            AlertLevel::Info => "#36a64f",
            AlertLevel::Warning => "#ffcc00",
            AlertLevel::Error => "#ff6600",
            AlertLevel::Critical => "#ff0000",
        }
    }

    /// Same color as an integer, the form Discord embeds expect
    pub fn color_code(&self) -> u32 {
        u32::from_str_radix(&self.color()[1..], 16).unwrap_or(0)
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller hands to `AlertManager::send`
#[derive(Debug, Clone)]
pub struct AlertInput {
    pub level: AlertLevel,
    pub source: String,
    pub title: String,
    pub message: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AlertInput {
    pub fn new(
        level: AlertLevel,
        source: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            source: source.into(),
            title: title.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Channels that accepted the alert
    pub sent_to: Vec<String>,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Folded into an aggregate instead of being dispatched
    pub suppressed: bool,
    /// Occurrences represented by this alert; above 1 only for aggregated alerts
    pub occurrences: u32,
}

impl Alert {
    pub(crate) fn from_input(id: String, input: AlertInput) -> Self {
        Self {
            id,
            level: input.level,
            title: input.title,
            message: input.message,
            source: input.source,
            timestamp: Utc::now(),
            metadata: input.metadata,
            sent_to: Vec::new(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            suppressed: false,
            occurrences: 1,
        }
    }

    /// Deduplication key
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.level, self.source, self.title)
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.level.as_str().to_uppercase(),
            self.title,
            self.message
        )
    }
}

/// Repeats of one key collected while its cooldown window is open
#[derive(Debug, Clone, Serialize)]
pub struct AlertAggregate {
    pub key: String,
    /// Includes the dispatched alert that opened the window
    pub count: u32,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    /// Most recent suppressed alert
    pub sample: Alert,
}

/// History filter; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertQuery {
    /// Minimum level
    pub level: Option<AlertLevel>,
    /// Substring of the alert source
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub acknowledged: Option<bool>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.level.map_or(true, |level| alert.level >= level)
            && self
                .source
                .as_deref()
                .map_or(true, |source| alert.source.contains(source))
            && self.since.map_or(true, |since| alert.timestamp >= since)
            && self
                .acknowledged
                .map_or(true, |acknowledged| alert.acknowledged == acknowledged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub enabled: bool,
    pub total_alerts: usize,
    pub unacknowledged: usize,
    pub last_24_hours: usize,
    pub by_level: BTreeMap<AlertLevel, u64>,
    /// Keyed by the first dotted segment of the source
    pub by_source: BTreeMap<String, u64>,
    pub aggregates: usize,
    pub channels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(level: AlertLevel, source: &str) -> Alert {
        Alert::from_input("a".into(), AlertInput::new(level, source, "t", "m"))
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(AlertLevel::Info < AlertLevel::Warning);
        assert!(AlertLevel::Error < AlertLevel::Critical);
        assert_eq!(AlertLevel::Critical.color_code(), 0xff0000);
    }

    #[test]
    fn test_key_uses_level_source_and_title() {
        let a = alert(AlertLevel::Warning, "aurora.metrics");
        assert_eq!(a.key(), "warning:aurora.metrics:t");
        assert_eq!(a.to_string(), "[WARNING] t: m");
    }

    #[test]
    fn test_query_filters() {
        let mut a = alert(AlertLevel::Error, "aurora.breaker");
        let query = AlertQuery {
            level: Some(AlertLevel::Warning),
            source: Some("breaker".into()),
            acknowledged: Some(false),
            ..AlertQuery::default()
        };
        assert!(query.matches(&a));

        a.acknowledged = true;
        assert!(!query.matches(&a));

        let strict = AlertQuery {
            level: Some(AlertLevel::Critical),
            ..AlertQuery::default()
        };
        assert!(!strict.matches(&a));
        assert!(AlertQuery::default().matches(&a));
    }

    #[test]
    fn test_alert_serializes_lowercase_level() {
        let json = serde_json::to_value(alert(AlertLevel::Critical, "x")).unwrap();
        assert_eq!(json["level"], "critical");
        assert!(json.get("acknowledged_by").is_none());
    }
}
