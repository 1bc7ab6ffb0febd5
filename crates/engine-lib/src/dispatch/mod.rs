//! Notification dispatch
//!
//! Alert transitions become [`NotificationRequest`]s that are queued,
//! deduplicated and delivered through a [`NotificationChannel`] with
//! exponential backoff on transient failures.

mod channels;
mod dispatcher;
pub mod template;

pub use channels::{AlertmanagerAlert, AlertmanagerPayload, LogChannel, WebhookChannel};
pub use dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherConfig, DispatcherStats, RetryPolicy,
};

use crate::models::NotificationSeverity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub use async_trait::async_trait;

/// A notification produced by an alert transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRequest {
    pub rule_name: String,
    pub node: String,
    pub metric: String,
    pub severity: NotificationSeverity,
    pub value: f64,
    pub threshold: f64,
    pub message_template: String,
    /// Values for the template placeholders
    pub context: BTreeMap<String, String>,
    pub event_time: DateTime<Utc>,
    /// `rule:node:state`
    pub dedupe_key: String,
}

impl NotificationRequest {
    pub fn dedupe_key_for(rule: &str, node: &str, severity: NotificationSeverity) -> String {
        format!("{rule}:{node}:{severity}")
    }

    /// The message with every known placeholder substituted
    pub fn rendered_message(&self) -> String {
        template::render(&self.message_template, &self.context)
    }

    pub fn metadata(&self) -> NotificationMetadata {
        NotificationMetadata {
            rule: self.rule_name.clone(),
            node: self.node.clone(),
            metric: self.metric.clone(),
            severity: self.severity,
            value: self.value,
            threshold: self.threshold,
            event_time: self.event_time,
            dedupe_key: self.dedupe_key.clone(),
        }
    }
}

/// Structured fields accompanying a rendered message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationMetadata {
    pub rule: String,
    pub node: String,
    pub metric: String,
    pub severity: NotificationSeverity,
    pub value: f64,
    pub threshold: f64,
    pub event_time: DateTime<Utc>,
    pub dedupe_key: String,
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// Worth retrying (timeouts, 5xx, connection errors)
    TransientError(String),
    /// Retrying would not help (4xx, malformed request)
    PermanentError(String),
}

/// A delivery target for notifications
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, message: &str, metadata: &NotificationMetadata) -> SendOutcome;

    /// Short identifier used in logs
    fn name(&self) -> &str;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted channel for dispatcher and engine tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Returns scripted outcomes in order, then `Success`; records every call
    #[derive(Default)]
    pub struct ScriptedChannel {
        script: Mutex<VecDeque<SendOutcome>>,
        pub sent: Mutex<Vec<(String, NotificationMetadata)>>,
    }

    impl ScriptedChannel {
        pub fn new(script: impl IntoIterator<Item = SendOutcome>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        async fn send(&self, message: &str, metadata: &NotificationMetadata) -> SendOutcome {
            self.sent.lock().push((message.to_string(), metadata.clone()));
            self.script.lock().pop_front().unwrap_or(SendOutcome::Success)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    pub fn request(rule: &str, node: &str, severity: NotificationSeverity) -> NotificationRequest {
        let context: BTreeMap<String, String> = [
            ("rule", rule.to_string()),
            ("node", node.to_string()),
            ("state", severity.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        NotificationRequest {
            rule_name: rule.to_string(),
            node: node.to_string(),
            metric: "network_receive_bytes".to_string(),
            severity,
            value: 1.0,
            threshold: 0.5,
            message_template: "{{rule}} {{state}} on {{node}}".to_string(),
            context,
            event_time: Utc::now(),
            dedupe_key: NotificationRequest::dedupe_key_for(rule, node, severity),
        }
    }
}
