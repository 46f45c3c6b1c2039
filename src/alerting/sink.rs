//! Alert destinations

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use toolguard_core::Severity;
use tracing::{info, warn};

use super::event::AlertEvent;
use crate::config::{DestinationConfig, DestinationKind};
use crate::{Error, Result};

/// What a destination receives
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// One immediate alert
    Alert(AlertEvent),
    /// A batch of lower-severity alerts
    Digest {
        /// Batched events, oldest first
        events: Vec<AlertEvent>,
        /// Flush time
        flushed_at: DateTime<Utc>,
    },
}

impl Notification {
    /// Most urgent severity carried
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Alert(event) => event.severity,
            Self::Digest { events, .. } => events
                .iter()
                .map(|e| e.severity)
                .min()
                .unwrap_or(Severity::Info),
        }
    }
}

/// A notification transport
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Destination name
    fn name(&self) -> &str;

    /// Deliver one notification
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes alerts to the tracing log
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    /// Create a log sink
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::Alert(event) if event.is_escalation() => warn!(
                destination = %self.name,
                tool = %event.tool_id,
                severity = %event.severity,
                from = %event.old_status,
                to = %event.new_status,
                rationale = %event.rationale,
                "Tool health alert"
            ),
            Notification::Alert(event) => info!(
                destination = %self.name,
                tool = %event.tool_id,
                severity = %event.severity,
                from = %event.old_status,
                to = %event.new_status,
                rationale = %event.rationale,
                "Tool health alert"
            ),
            Notification::Digest { events, .. } => {
                for event in events {
                    info!(
                        destination = %self.name,
                        tool = %event.tool_id,
                        severity = %event.severity,
                        from = %event.old_status,
                        to = %event.new_status,
                        "Tool health digest entry"
                    );
                }
            }
        }
        Ok(())
    }
}

/// POSTs notifications as JSON
#[derive(Debug, Clone)]
pub struct WebhookSink {
    name: String,
    url: String,
    client: Client,
}

impl WebhookSink {
    /// Create a webhook sink
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("X-Toolguard-Severity", notification.severity().to_string())
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Notify {
                destination: self.name.clone(),
                message: format!("webhook returned HTTP {status}"),
            })
        }
    }
}

/// Build the sink a destination config describes
pub fn build_sink(config: &DestinationConfig) -> Result<std::sync::Arc<dyn AlertSink>> {
    Ok(match &config.kind {
        DestinationKind::Log => std::sync::Arc::new(LogSink::new(&config.name)),
        DestinationKind::Webhook { url, timeout } => {
            std::sync::Arc::new(WebhookSink::new(&config.name, url, *timeout)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolguard_core::HealthStatus;

    fn event(severity_tier: u8, new: HealthStatus) -> AlertEvent {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        AlertEvent::for_transition("roster", severity_tier, HealthStatus::Healthy, new, now, "test")
            .unwrap()
    }

    #[test]
    fn digest_severity_is_most_urgent_entry() {
        let digest = Notification::Digest {
            events: vec![event(3, HealthStatus::Degraded), event(3, HealthStatus::Critical)],
            flushed_at: Utc::now(),
        };
        assert_eq!(digest.severity(), Severity::Medium);
    }

    #[test]
    fn notification_json_is_tagged() {
        let json = serde_json::to_value(Notification::Alert(event(1, HealthStatus::Critical))).unwrap();
        assert_eq!(json["type"], "alert");
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["tool_id"], "roster");
    }

    #[tokio::test]
    async fn log_sink_always_delivers() {
        let sink = LogSink::new("log");
        let result = sink.send(&Notification::Alert(event(1, HealthStatus::Critical))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn webhook_to_closed_port_fails() {
        let sink = WebhookSink::new("hook", "http://127.0.0.1:9/alerts", Duration::from_millis(200)).unwrap();
        let result = sink.send(&Notification::Alert(event(1, HealthStatus::Critical))).await;
        assert!(result.is_err());
    }

    #[test]
    fn builds_configured_sinks() {
        let log = DestinationConfig {
            name: "ops-log".to_string(),
            kind: DestinationKind::Log,
            severities: Vec::new(),
        };
        assert_eq!(build_sink(&log).unwrap().name(), "ops-log");
    }
}
