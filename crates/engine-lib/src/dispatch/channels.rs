//! Built-in notification channels

use super::{async_trait, NotificationChannel, NotificationMetadata, SendOutcome};
use crate::models::NotificationSeverity;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Writes notifications to the structured log
#[derive(Debug, Clone, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, message: &str, metadata: &NotificationMetadata) -> SendOutcome {
        match metadata.severity {
            NotificationSeverity::Firing => warn!(
                event = "notification",
                rule = %metadata.rule,
                node = %metadata.node,
                severity = %metadata.severity,
                value = metadata.value,
                "{message}"
            ),
            NotificationSeverity::Resolved => info!(
                event = "notification",
                rule = %metadata.rule,
                node = %metadata.node,
                severity = %metadata.severity,
                value = metadata.value,
                "{message}"
            ),
        }
        SendOutcome::Success
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Alertmanager webhook alert format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// firing or resolved
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// RFC3339
    pub starts_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertmanagerPayload {
    pub alerts: Vec<AlertmanagerAlert>,
}

impl AlertmanagerAlert {
    pub fn from_notification(message: &str, metadata: &NotificationMetadata) -> Self {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), metadata.rule.clone());
        labels.insert("node".to_string(), metadata.node.clone());
        labels.insert("metric".to_string(), metadata.metric.clone());

        let mut annotations = HashMap::new();
        annotations.insert("summary".to_string(), message.to_string());
        annotations.insert("value".to_string(), metadata.value.to_string());
        annotations.insert("threshold".to_string(), metadata.threshold.to_string());

        let timestamp = metadata.event_time.to_rfc3339();
        let (starts_at, ends_at) = match metadata.severity {
            NotificationSeverity::Firing => (timestamp, None),
            NotificationSeverity::Resolved => (timestamp.clone(), Some(timestamp)),
        };

        Self {
            status: metadata.severity.to_string(),
            labels,
            annotations,
            starts_at,
            ends_at,
        }
    }
}

/// Posts Alertmanager-compatible JSON to an HTTP endpoint
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// 5xx and 429 are worth retrying; any other non-2xx is final
fn classify_status(status: StatusCode) -> SendOutcome {
    if status.is_success() {
        SendOutcome::Success
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SendOutcome::TransientError(format!("webhook returned {status}"))
    } else {
        SendOutcome::PermanentError(format!("webhook returned {status}"))
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, message: &str, metadata: &NotificationMetadata) -> SendOutcome {
        let payload = AlertmanagerPayload {
            alerts: vec![AlertmanagerAlert::from_notification(message, metadata)],
        };

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                SendOutcome::TransientError(e.to_string())
            }
            Err(e) => SendOutcome::PermanentError(e.to_string()),
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
