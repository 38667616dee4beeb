//! Alert delivery channels
//!
//! The console channel is always installed. Slack, Discord and generic JSON
//! webhooks are added when their URL is configured and parses.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{Alert, AlertLevel};
use crate::config::AlertsConfig;
use crate::error::ChannelError;

#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError>;
}

/// Writes alerts to the tracing output
pub struct ConsoleChannel;

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        match alert.level {
            AlertLevel::Info => info!(
                alert_id = %alert.id,
                source = %alert.source,
                occurrences = alert.occurrences,
                "[ALERT] {}: {}", alert.title, alert.message
            ),
            AlertLevel::Warning => warn!(
                alert_id = %alert.id,
                source = %alert.source,
                occurrences = alert.occurrences,
                "[ALERT] {}: {}", alert.title, alert.message
            ),
            AlertLevel::Error | AlertLevel::Critical => error!(
                alert_id = %alert.id,
                source = %alert.source,
                level = %alert.level,
                occurrences = alert.occurrences,
                "[ALERT] {}: {}", alert.title, alert.message
            ),
        }
        Ok(())
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build HTTP client with timeout, using defaults");
            reqwest::Client::new()
        })
}

async fn post_json(
    client: &reqwest::Client,
    channel: &str,
    url: &str,
    payload: &serde_json::Value,
) -> Result<(), ChannelError> {
    let response = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| ChannelError::new(channel, format!("request failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        debug!(channel, "Alert delivered");
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ChannelError::new(channel, format!("webhook returned {status}: {body}")))
    }
}

/// Slack incoming webhook
pub struct SlackChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: http_client(timeout),
        }
    }

    fn payload(alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "attachments": [{
                "color": alert.level.color(),
                "title": format!("[{}] {}", alert.level.as_str().to_uppercase(), alert.title),
                "text": alert.message,
                "fields": [
                    { "title": "Source", "value": alert.source, "short": true },
                    { "title": "Time", "value": alert.timestamp.to_rfc3339(), "short": true },
                    { "title": "Occurrences", "value": alert.occurrences.to_string(), "short": true },
                ],
                "footer": "Aurora Guard",
                "ts": alert.timestamp.timestamp(),
            }]
        })
    }
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        post_json(&self.client, self.name(), &self.webhook_url, &Self::payload(alert)).await
    }
}

/// Discord webhook using a single embed
pub struct DiscordChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: http_client(timeout),
        }
    }

    fn payload(alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "username": "Aurora Guard",
            "embeds": [{
                "title": format!("[{}] {}", alert.level.as_str().to_uppercase(), alert.title),
                "description": alert.message,
                "color": alert.level.color_code(),
                "timestamp": alert.timestamp.to_rfc3339(),
                "fields": [
                    { "name": "Source", "value": alert.source, "inline": true },
                    { "name": "Occurrences", "value": alert.occurrences.to_string(), "inline": true },
                ],
            }]
        })
    }
}

#[async_trait]
impl AlertChannel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        post_json(&self.client, self.name(), &self.webhook_url, &Self::payload(alert)).await
    }
}

/// Posts the serialized alert as-is
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let payload = serde_json::to_value(alert)
            .map_err(|e| ChannelError::new(self.name(), format!("serialization failed: {e}")))?;
        post_json(&self.client, self.name(), &self.url, &payload).await
    }
}

fn valid_url(kind: &str, url: Option<&String>) -> Option<String> {
    let url = url.map(|u| u.trim()).filter(|u| !u.is_empty())?;
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Some(url.to_string()),
        Ok(parsed) => {
            warn!(channel = kind, scheme = parsed.scheme(), "Unsupported webhook scheme, channel disabled");
            None
        }
        Err(e) => {
            warn!(channel = kind, error = %e, "Invalid webhook URL, channel disabled");
            None
        }
    }
}

/// External channels for the configured webhook URLs
pub fn channels_from_config(config: &AlertsConfig) -> Vec<Box<dyn AlertChannel>> {
    let timeout = config.channel_timeout();
    let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();

    if let Some(url) = valid_url("slack", config.slack_webhook_url.as_ref()) {
        info!("Adding Slack alert channel");
        channels.push(Box::new(SlackChannel::new(url, timeout)));
    }
    if let Some(url) = valid_url("discord", config.discord_webhook_url.as_ref()) {
        info!("Adding Discord alert channel");
        channels.push(Box::new(DiscordChannel::new(url, timeout)));
    }
    if let Some(url) = valid_url("webhook", config.webhook_url.as_ref()) {
        info!("Adding webhook alert channel");
        channels.push(Box::new(WebhookChannel::new(url, timeout)));
    }

    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertInput;
    use mockito::Matcher;

    fn alert() -> Alert {
        Alert::from_input(
            "alert-1".into(),
            AlertInput::new(AlertLevel::Critical, "aurora.breaker", "Circuit open", "api is failing"),
        )
    }

    #[tokio::test]
    async fn test_webhook_posts_alert_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "id": "alert-1",
                "level": "critical",
                "title": "Circuit open",
            })))
            .with_status(200)
            .create_async()
            .await;

        let channel = WebhookChannel::new(format!("{}/hook", server.url()), Duration::from_secs(5));
        channel.send(&alert()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_slack_payload_shape() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/slack")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "attachments": [{ "color": "#ff0000", "text": "api is failing" }]
            })))
            .with_status(200)
            .create_async()
            .await;

        let channel = SlackChannel::new(format!("{}/slack", server.url()), Duration::from_secs(5));
        channel.send(&alert()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_discord_payload_shape() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/discord")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "embeds": [{ "color": 0xff0000, "description": "api is failing" }]
            })))
            .with_status(204)
            .create_async()
            .await;

        let channel = DiscordChannel::new(format!("{}/discord", server.url()), Duration::from_secs(5));
        channel.send(&alert()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_channel_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let channel = WebhookChannel::new(format!("{}/hook", server.url()), Duration::from_secs(5));
        let err = channel.send(&alert()).await.unwrap_err();
        assert_eq!(err.channel, "webhook");
        assert!(err.reason.contains("500"));
    }

    #[test]
    fn test_channels_from_config_skips_invalid_urls() {
        let config = AlertsConfig {
            slack_webhook_url: Some("https://hooks.slack.com/services/x".into()),
            discord_webhook_url: Some("not a url".into()),
            webhook_url: Some("ftp://example.com/hook".into()),
            ..AlertsConfig::default()
        };
        let channels = channels_from_config(&config);
        let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["slack"]);

        assert!(channels_from_config(&AlertsConfig::default()).is_empty());
    }
}
