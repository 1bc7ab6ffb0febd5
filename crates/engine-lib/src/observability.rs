//! Observability infrastructure for the engine
//!
//! Provides:
//! - Prometheus metrics (ingest volume, evaluation latency, notification outcomes)
//! - Structured JSON logging with tracing

use crate::alerting::{AlertStatus, RuleValidationError};
use crate::models::{AnomalyEvent, AnomalySeverity, TrafficFlowCorrelation};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    samples_ingested: IntCounter,
    samples_rejected: IntCounter,
    tracked_series: IntGauge,
    anomalies_detected: IntCounterVec,
    correlation_latency_seconds: Histogram,
    flows_correlated: IntGauge,
    rule_evaluation_latency_seconds: Histogram,
    rules_loaded: IntGauge,
    rule_reloads: IntCounterVec,
    alert_transitions: IntCounterVec,
    active_alerts: IntGauge,
    notifications: IntCounterVec,
    notification_queue_depth: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            samples_ingested: register_int_counter!(
                "netpulse_samples_ingested_total",
                "Total number of metric samples accepted"
            )
            .expect("Failed to register samples_ingested_total"),

            samples_rejected: register_int_counter!(
                "netpulse_samples_rejected_total",
                "Total number of malformed metric samples rejected"
            )
            .expect("Failed to register samples_rejected_total"),

            tracked_series: register_int_gauge!(
                "netpulse_tracked_series",
                "Number of (node, metric) series with a live baseline"
            )
            .expect("Failed to register tracked_series"),

            anomalies_detected: register_int_counter_vec!(
                "netpulse_anomalies_detected_total",
                "Total number of anomalies detected",
                &["severity"]
            )
            .expect("Failed to register anomalies_detected_total"),

            correlation_latency_seconds: register_histogram!(
                "netpulse_correlation_latency_seconds",
                "Time spent in one traffic correlation cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register correlation_latency_seconds"),

            flows_correlated: register_int_gauge!(
                "netpulse_flows_correlated",
                "Number of flows in the latest correlation result set"
            )
            .expect("Failed to register flows_correlated"),

            rule_evaluation_latency_seconds: register_histogram!(
                "netpulse_rule_evaluation_latency_seconds",
                "Time spent evaluating due alert rules in one tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register rule_evaluation_latency_seconds"),

            rules_loaded: register_int_gauge!(
                "netpulse_rules_loaded",
                "Number of alert rules in the active rule set"
            )
            .expect("Failed to register rules_loaded"),

            rule_reloads: register_int_counter_vec!(
                "netpulse_rule_reloads_total",
                "Rule reload attempts by result",
                &["result"]
            )
            .expect("Failed to register rule_reloads_total"),

            alert_transitions: register_int_counter_vec!(
                "netpulse_alert_transitions_total",
                "Alert state transitions that produced a notification",
                &["state"]
            )
            .expect("Failed to register alert_transitions_total"),

            active_alerts: register_int_gauge!(
                "netpulse_active_alerts",
                "Number of firing or resolving alerts"
            )
            .expect("Failed to register active_alerts"),

            notifications: register_int_counter_vec!(
                "netpulse_notifications_total",
                "Notification outcomes",
                &["outcome"]
            )
            .expect("Failed to register notifications_total"),

            notification_queue_depth: register_int_gauge!(
                "netpulse_notification_queue_depth",
                "Notifications waiting for delivery"
            )
            .expect("Failed to register notification_queue_depth"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the process-wide metrics; clones share the same
/// underlying collectors.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn inc_samples_ingested(&self) {
        self.inner().samples_ingested.inc();
    }

    pub fn inc_samples_rejected(&self) {
        self.inner().samples_rejected.inc();
    }

    pub fn set_tracked_series(&self, count: usize) {
        self.inner().tracked_series.set(count as i64);
    }

    pub fn inc_anomalies_detected(&self, severity: AnomalySeverity) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[&severity.to_string()])
            .inc();
    }

    pub fn observe_correlation(&self, duration_secs: f64, flows: usize) {
        self.inner().correlation_latency_seconds.observe(duration_secs);
        self.inner().flows_correlated.set(flows as i64);
    }

    pub fn observe_rule_evaluation(&self, duration_secs: f64) {
        self.inner().rule_evaluation_latency_seconds.observe(duration_secs);
    }

    pub fn set_rules_loaded(&self, count: usize) {
        self.inner().rules_loaded.set(count as i64);
    }

    /// `result` is "applied" or "rejected"
    pub fn inc_rule_reloads(&self, result: &str) {
        self.inner().rule_reloads.with_label_values(&[result]).inc();
    }

    pub fn inc_alert_transitions(&self, state: AlertStatus) {
        self.inner()
            .alert_transitions
            .with_label_values(&[&state.to_string()])
            .inc();
    }

    pub fn set_active_alerts(&self, count: usize) {
        self.inner().active_alerts.set(count as i64);
    }

    /// `outcome` is one of delivered, suppressed, failed, abandoned, dropped
    pub fn inc_notifications(&self, outcome: &str) {
        self.inner().notifications.with_label_values(&[outcome]).inc();
    }

    pub fn set_notification_queue_depth(&self, depth: usize) {
        self.inner().notification_queue_depth.set(depth as i64);
    }
}

/// Structured logger for significant engine events
///
/// Every record carries an `event` field so log pipelines can route on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn log_startup(&self, version: &str, rules_loaded: usize) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            version = %version,
            rules_loaded = rules_loaded,
            "Metrics engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Metrics engine shutting down"
        );
    }

    pub fn log_anomaly(&self, anomaly: &AnomalyEvent) {
        match anomaly.severity {
            AnomalySeverity::Critical => warn!(
                event = "anomaly_detected",
                instance = %self.instance,
                node = %anomaly.node,
                metric = %anomaly.metric,
                value = anomaly.value,
                z_score = anomaly.z_score,
                baseline_mean = anomaly.baseline_mean,
                direction = ?anomaly.direction,
                severity = %anomaly.severity,
                "Critical anomaly detected"
            ),
            _ => info!(
                event = "anomaly_detected",
                instance = %self.instance,
                node = %anomaly.node,
                metric = %anomaly.metric,
                value = anomaly.value,
                z_score = anomaly.z_score,
                baseline_mean = anomaly.baseline_mean,
                direction = ?anomaly.direction,
                severity = %anomaly.severity,
                "Anomaly detected"
            ),
        }
    }

    pub fn log_alert_transition(&self, rule: &str, node: &str, state: AlertStatus, value: f64) {
        info!(
            event = "alert_transition",
            instance = %self.instance,
            rule = %rule,
            node = %node,
            state = %state,
            value = value,
            "Alert state changed"
        );
    }

    pub fn log_rules_reloaded(&self, version: u64, rules: usize) {
        info!(
            event = "rules_reloaded",
            instance = %self.instance,
            version = version,
            rules = rules,
            "Alert rules reloaded"
        );
    }

    pub fn log_rules_rejected(&self, errors: &[RuleValidationError]) {
        let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        warn!(
            event = "rules_reload_rejected",
            instance = %self.instance,
            invalid_rules = errors.len(),
            details = ?details,
            "Rule reload rejected, keeping previous rule set"
        );
    }

    pub fn log_notification_failed(&self, dedupe_key: &str, attempts: u32, error: &str) {
        warn!(
            event = "notification_failed",
            instance = %self.instance,
            dedupe_key = %dedupe_key,
            attempts = attempts,
            error = %error,
            "Notification delivery failed"
        );
    }

    pub fn log_queue_overflow(&self, dropped_key: &str, capacity: usize) {
        warn!(
            event = "notification_queue_overflow",
            instance = %self.instance,
            dropped = %dropped_key,
            capacity = capacity,
            "Notification queue full, dropped oldest entry"
        );
    }

    pub fn log_flows_correlated(&self, flows: &[TrafficFlowCorrelation]) {
        let top = flows.first();
        info!(
            event = "flows_correlated",
            instance = %self.instance,
            flows = flows.len(),
            top_source = top.map(|f| f.source_node.as_str()).unwrap_or(""),
            top_dest = top.map(|f| f.dest_node.as_str()).unwrap_or(""),
            top_magnitude = top.map(|f| f.correlation_magnitude).unwrap_or(0.0),
            "Traffic correlation cycle complete"
        );
    }
}
