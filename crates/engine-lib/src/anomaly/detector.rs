//! Z-score anomaly detection over rolling baselines
//!
//! Every sample is scored against its series' baseline as it stood before
//! the sample arrived, then appended to the baseline. Events above the
//! threshold go into a bounded FIFO buffer that backs the query surface.

use super::baseline::{
    BaselineSnapshot, BaselineStore, DEFAULT_WARMUP_COUNT, DEFAULT_WINDOW_CAPACITY,
};
use crate::models::{AnomalyDirection, AnomalyEvent, AnomalySeverity, MetricSample, SeriesKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Default number of retained anomaly events
const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Configuration for the anomaly detector
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Number of standard deviations to consider anomalous
    pub z_threshold: f64,
    /// Prior samples required before a series yields verdicts
    pub warmup_count: usize,
    /// Values retained per series
    pub window_capacity: usize,
    /// Optional trailing age bound for baseline values
    pub window_max_age: Option<Duration>,
    /// Capacity of the recent-events buffer
    pub event_capacity: usize,
    /// Baselines without a sample for this long are evicted by maintenance
    pub idle_ttl: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0, // 3 sigma
            warmup_count: DEFAULT_WARMUP_COUNT,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            window_max_age: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            idle_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl DetectorConfig {
    pub fn with_z_threshold(mut self, z_threshold: f64) -> Self {
        self.z_threshold = z_threshold;
        self
    }

    pub fn with_warmup_count(mut self, warmup_count: usize) -> Self {
        self.warmup_count = warmup_count;
        self
    }

    pub fn with_window(mut self, capacity: usize, max_age: Option<Duration>) -> Self {
        self.window_capacity = capacity;
        self.window_max_age = max_age;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }
}

/// Filters for anomaly queries; absent filters match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnomalyQuery {
    pub node: Option<String>,
    pub metric: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl AnomalyQuery {
    fn matches(&self, event: &AnomalyEvent) -> bool {
        self.node.as_deref().map_or(true, |n| n == event.node)
            && self.metric.as_deref().map_or(true, |m| m == event.metric)
            && self.since.map_or(true, |since| event.timestamp >= since)
    }
}

/// Scores samples against their baselines and records anomalies
pub struct AnomalyDetector {
    config: DetectorConfig,
    baselines: BaselineStore,
    events: RwLock<VecDeque<AnomalyEvent>>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            baselines: BaselineStore::new(config.window_capacity, config.window_max_age),
            events: RwLock::new(VecDeque::with_capacity(config.event_capacity.min(1024))),
            config,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Update the series baseline with `sample`, returning an event if the
    /// sample was anomalous relative to the prior baseline
    pub fn ingest(&self, sample: &MetricSample) -> Option<AnomalyEvent> {
        let key = sample.key();
        let warmup = self.config.warmup_count;
        let threshold = self.config.z_threshold;

        let event = self.baselines.with_window(&key, |window| {
            let verdict = if window.is_ready(warmup) {
                score(sample, window.mean, window.std_dev, threshold)
            } else {
                None
            };
            window.add_sample(sample.timestamp, sample.value);
            verdict
        })?;

        self.record(event.clone());
        Some(event)
    }

    fn record(&self, event: AnomalyEvent) {
        let mut events = self.events.write();
        while events.len() >= self.config.event_capacity.max(1) {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Matching events, newest first
    pub fn query(&self, query: &AnomalyQuery) -> Vec<AnomalyEvent> {
        let mut matched: Vec<AnomalyEvent> = {
            let events = self.events.read();
            events
                .iter()
                .rev()
                .filter(|e| query.matches(e))
                .cloned()
                .collect()
        };
        // Stable sort keeps reverse insertion order for equal timestamps
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched
    }

    pub fn baseline(&self, node: &str, metric: &str) -> Option<BaselineSnapshot> {
        self.baselines.snapshot(&SeriesKey::new(node, metric))
    }

    /// Drop baselines for series that went quiet before `cutoff`
    pub fn evict_idle(&self, cutoff: DateTime<Utc>) -> usize {
        self.baselines.evict_idle(cutoff)
    }

    pub fn tracked_series(&self) -> usize {
        self.baselines.len()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Score one value against a baseline; flat baselines never yield a verdict
fn score(sample: &MetricSample, mean: f64, std_dev: f64, threshold: f64) -> Option<AnomalyEvent> {
    if std_dev < f64::EPSILON {
        return None;
    }

    let z_score = (sample.value - mean) / std_dev;
    if z_score.abs() <= threshold {
        return None;
    }

    Some(AnomalyEvent {
        node: sample.node.clone(),
        metric: sample.metric.clone(),
        value: sample.value,
        z_score,
        baseline_mean: mean,
        baseline_std_dev: std_dev,
        direction: if z_score > 0.0 {
            AnomalyDirection::Spike
        } else {
            AnomalyDirection::Drop
        },
        severity: AnomalySeverity::from_z_score(z_score),
        timestamp: sample.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(node: &str, metric: &str, value: f64, secs: i64) -> MetricSample {
        MetricSample::new(node, metric, value, ts(secs))
    }

    /// Baseline alternating 95/105: mean 100, std dev ~5
    fn warm_up(detector: &AnomalyDetector, node: &str, metric: &str, n: i64) {
        for i in 0..n {
            let value = if i % 2 == 0 { 95.0 } else { 105.0 };
            assert!(detector.ingest(&sample(node, metric, value, i)).is_none());
        }
    }

    #[test]
    fn test_constant_series_never_anomalous() {
        let detector = AnomalyDetector::default();
        for i in 0..100 {
            assert!(detector.ingest(&sample("n1", "rx", 500.0, i)).is_none());
        }
        assert!(detector.query(&AnomalyQuery::default()).is_empty());
    }

    #[test]
    fn test_single_deviation_yields_exactly_one_event() {
        let detector = AnomalyDetector::default();
        warm_up(&detector, "n1", "rx", 10);

        let event = detector
            .ingest(&sample("n1", "rx", 200.0, 10))
            .expect("spike should be detected");
        assert!(event.z_score > 3.0);
        assert_eq!(event.direction, AnomalyDirection::Spike);
        assert_eq!(event.severity, AnomalySeverity::Critical);

        // Back to normal: no further events
        for i in 11..30 {
            let value = if i % 2 == 0 { 95.0 } else { 105.0 };
            assert!(detector.ingest(&sample("n1", "rx", value, i)).is_none());
        }
        assert_eq!(detector.query(&AnomalyQuery::default()).len(), 1);
    }

    #[test]
    fn test_no_verdict_before_warmup() {
        let detector = AnomalyDetector::default();
        warm_up(&detector, "n1", "rx", 9);

        // Only nine prior samples, however large the deviation
        assert!(detector.ingest(&sample("n1", "rx", 1e12, 9)).is_none());
    }

    #[test]
    fn test_drop_direction() {
        let detector = AnomalyDetector::default();
        warm_up(&detector, "n1", "rx", 20);

        let event = detector.ingest(&sample("n1", "rx", 0.0, 20)).unwrap();
        assert_eq!(event.direction, AnomalyDirection::Drop);
        assert!(event.z_score < -3.0);
    }

    #[test]
    fn test_query_filters_and_order() {
        let detector = AnomalyDetector::default();
        warm_up(&detector, "n1", "rx", 10);
        warm_up(&detector, "n2", "tx", 10);

        detector.ingest(&sample("n1", "rx", 300.0, 100));
        detector.ingest(&sample("n2", "tx", 300.0, 200));

        let all = detector.query(&AnomalyQuery::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].node, "n2"); // newest first

        let by_node = detector.query(&AnomalyQuery {
            node: Some("n1".to_string()),
            ..Default::default()
        });
        assert_eq!(by_node.len(), 1);

        let conjunctive = detector.query(&AnomalyQuery {
            node: Some("n1".to_string()),
            metric: Some("tx".to_string()),
            since: None,
        });
        assert!(conjunctive.is_empty());

        let recent = detector.query(&AnomalyQuery {
            since: Some(ts(150)),
            ..Default::default()
        });
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].node, "n2");

        let unknown = detector.query(&AnomalyQuery {
            node: Some("nope".to_string()),
            ..Default::default()
        });
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_query_is_idempotent() {
        let detector = AnomalyDetector::default();
        warm_up(&detector, "n1", "rx", 10);
        detector.ingest(&sample("n1", "rx", 300.0, 10));

        let first = detector.query(&AnomalyQuery::default());
        let second = detector.query(&AnomalyQuery::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_event_buffer_is_bounded() {
        let detector = AnomalyDetector::new(DetectorConfig {
            event_capacity: 3,
            ..Default::default()
        });

        for n in 0..5 {
            let node = format!("n{n}");
            warm_up(&detector, &node, "rx", 10);
            detector.ingest(&sample(&node, "rx", 500.0, 10 + n));
        }

        let events = detector.query(&AnomalyQuery::default());
        assert_eq!(events.len(), 3);
        // Oldest two were dropped
        assert!(events.iter().all(|e| e.node != "n0" && e.node != "n1"));
    }

    #[test]
    fn test_baseline_snapshot() {
        let detector = AnomalyDetector::default();
        warm_up(&detector, "n1", "rx", 10);

        let snapshot = detector.baseline("n1", "rx").unwrap();
        assert_eq!(snapshot.count, 10);
        assert!((snapshot.mean - 100.0).abs() < 1e-9);
        assert!(detector.baseline("n1", "tx").is_none());
    }
}
