//! Core data models shared by the engine components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single metric point scraped from a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub node: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(
        node: impl Into<String>,
        metric: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            node: node.into(),
            metric: metric.into(),
            value,
            timestamp,
        }
    }

    /// Key of the per-series state this sample belongs to
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.node, &self.metric)
    }
}

/// Identifies one (node, metric) series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub node: String,
    pub metric: String,
}

impl SeriesKey {
    pub fn new(node: &str, metric: &str) -> Self {
        Self {
            node: node.to_string(),
            metric: metric.to_string(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.metric)
    }
}

/// Whether an anomalous sample lies above or below its baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyDirection {
    Spike,
    Drop,
}

/// Severity of an anomaly, derived from the magnitude of its z-score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Warning,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn from_z_score(z_score: f64) -> Self {
        let magnitude = z_score.abs();
        if magnitude >= 5.0 {
            AnomalySeverity::Critical
        } else if magnitude >= 4.0 {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Warning
        }
    }
}

impl fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalySeverity::Warning => write!(f, "warning"),
            AnomalySeverity::High => write!(f, "high"),
            AnomalySeverity::Critical => write!(f, "critical"),
        }
    }
}

/// A sample that deviated from its rolling baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub node: String,
    pub metric: String,
    pub value: f64,
    pub z_score: f64,
    pub baseline_mean: f64,
    pub baseline_std_dev: f64,
    pub direction: AnomalyDirection,
    pub severity: AnomalySeverity,
    pub timestamp: DateTime<Utc>,
}

/// Inferred source -> destination traffic flow for one correlation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficFlowCorrelation {
    pub source_node: String,
    pub dest_node: String,
    pub transmit_bytes: f64,
    pub receive_bytes: f64,
    pub correlation_magnitude: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl TrafficFlowCorrelation {
    /// Ranking weight: large, well-matched flows first
    pub fn weight(&self) -> f64 {
        self.transmit_bytes * self.correlation_magnitude
    }
}

/// Notification severity, one per alert transition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSeverity {
    Firing,
    Resolved,
}

impl fmt::Display for NotificationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationSeverity::Firing => write!(f, "firing"),
            NotificationSeverity::Resolved => write!(f, "resolved"),
        }
    }
}
