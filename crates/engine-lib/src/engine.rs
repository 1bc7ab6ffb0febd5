//! Engine facade
//!
//! Owns every component and exposes the operations callers use: ingest,
//! anomaly and flow queries, aggregation, active alerts and rule reloads.
//! Periodic work is driven by the loops in [`crate::runtime`].

use crate::aggregation::{self, AggregationRequest, AggregationResult};
use crate::alerting::{
    read_rule_file, ActiveAlert, AlertRuleEngine, AlertStateView, RuleDefinition, RuleEngineConfig,
    RuleSet, RuleSetError, RuleValidationError,
};
use crate::anomaly::{AnomalyDetector, AnomalyQuery, BaselineSnapshot, DetectorConfig};
use crate::correlation::{CorrelatorConfig, FlowSnapshot, TrafficFlowCorrelator};
use crate::dispatch::{Dispatcher, DispatcherConfig, DispatcherStats, NotificationChannel};
use crate::error::{EngineError, Result};
use crate::health::HealthRegistry;
use crate::history::{HistoryConfig, HistoryStats, SampleHistory};
use crate::models::{AnomalyEvent, MetricSample, TrafficFlowCorrelation};
use crate::observability::{EngineMetrics, StructuredLogger};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Configuration for every engine component
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Instance name attached to structured log events
    pub instance: String,
    pub detector: DetectorConfig,
    pub history: HistoryConfig,
    pub correlator: CorrelatorConfig,
    pub rules: RuleEngineConfig,
    pub dispatcher: DispatcherConfig,
    /// Rule file re-read by `reload_rules_from_file`
    pub rule_file: Option<PathBuf>,
    /// Capacity of the asynchronous ingest channel
    pub ingest_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance: "netpulse".to_string(),
            detector: DetectorConfig::default(),
            history: HistoryConfig::default(),
            correlator: CorrelatorConfig::default(),
            rules: RuleEngineConfig::default(),
            dispatcher: DispatcherConfig::default(),
            rule_file: None,
            ingest_buffer: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    pub fn with_correlator(mut self, correlator: CorrelatorConfig) -> Self {
        self.correlator = correlator;
        self
    }

    pub fn with_rules(mut self, rules: RuleEngineConfig) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_rule_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rule_file = Some(path.into());
        self
    }
}

/// Summary of engine state for status endpoints
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub instance: String,
    pub tracked_series: usize,
    pub history_series: usize,
    pub history_samples: usize,
    pub rules_loaded: usize,
    pub rule_set_version: u64,
    pub active_alerts: usize,
    pub flows: usize,
    pub last_correlation: Option<DateTime<Utc>>,
    pub dispatcher: DispatcherStats,
}

pub struct MetricsEngine {
    config: EngineConfig,
    history: Arc<SampleHistory>,
    detector: AnomalyDetector,
    correlator: TrafficFlowCorrelator,
    rules: AlertRuleEngine,
    dispatcher: Arc<Dispatcher>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl MetricsEngine {
    pub fn new(config: EngineConfig, channel: Arc<dyn NotificationChannel>) -> Self {
        let logger = StructuredLogger::new(config.instance.clone());
        let health = HealthRegistry::new();
        let history = Arc::new(SampleHistory::new(config.history.clone()));

        let dispatcher = Dispatcher::new(config.dispatcher.clone(), channel)
            .with_logger(logger.clone())
            .with_health(health.clone());

        Self {
            detector: AnomalyDetector::new(config.detector.clone()),
            correlator: TrafficFlowCorrelator::new(config.correlator.clone(), history.clone()),
            rules: AlertRuleEngine::new(config.rules.clone()).with_logger(logger.clone()),
            dispatcher: Arc::new(dispatcher),
            history,
            health,
            metrics: EngineMetrics::new(),
            logger,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn rule_engine(&self) -> &AlertRuleEngine {
        &self.rules
    }

    /// Validate and record one sample. Returns the anomaly it raised, if any.
    pub fn ingest(&self, sample: MetricSample) -> Result<Option<AnomalyEvent>> {
        if let Err(e) = validate_sample(&sample) {
            self.metrics.inc_samples_rejected();
            return Err(e);
        }

        self.history.record(&sample);
        self.rules.observe(&sample);
        let anomaly = self.detector.ingest(&sample);

        self.metrics.inc_samples_ingested();
        if let Some(event) = &anomaly {
            self.metrics.inc_anomalies_detected(event.severity);
            self.logger.log_anomaly(event);
        }
        Ok(anomaly)
    }

    pub fn get_anomalies(&self, query: &AnomalyQuery) -> Vec<AnomalyEvent> {
        self.detector.query(query)
    }

    pub fn baseline(&self, node: &str, metric: &str) -> Option<BaselineSnapshot> {
        self.detector.baseline(node, metric)
    }

    /// Flows of the latest correlation cycle
    pub fn get_traffic_flows(&self) -> Vec<TrafficFlowCorrelation> {
        self.correlator.latest()
    }

    pub fn flow_snapshot(&self) -> Arc<FlowSnapshot> {
        self.correlator.snapshot()
    }

    /// Run one correlation cycle over the configured window ending at `now`
    pub fn run_correlation(&self, now: DateTime<Utc>) -> Vec<TrafficFlowCorrelation> {
        let start = Instant::now();
        let flows = self.correlator.correlate(self.config.correlator.window, now);
        self.metrics
            .observe_correlation(start.elapsed().as_secs_f64(), flows.len());
        self.logger.log_flows_correlated(&flows);
        flows
    }

    pub fn compute_aggregation(&self, request: &AggregationRequest) -> Result<AggregationResult> {
        aggregation::compute(&self.history, request)
    }

    pub fn get_active_alerts(&self) -> Vec<ActiveAlert> {
        self.rules.active_alerts()
    }

    pub fn alert_states(&self) -> Vec<AlertStateView> {
        self.rules.alert_states()
    }

    /// Evaluate due rules and hand every resulting notification to the
    /// dispatcher queue. Returns the number of notifications queued.
    pub fn evaluate_rules(&self, now: DateTime<Utc>) -> usize {
        let start = Instant::now();
        let notifications = self.rules.evaluate_due(now);
        self.metrics
            .observe_rule_evaluation(start.elapsed().as_secs_f64());

        let count = notifications.len();
        for request in notifications {
            self.dispatcher.enqueue(request);
        }
        count
    }

    /// Startup load: valid rules are installed, invalid ones reported
    pub fn load_rules(&self, defs: &[RuleDefinition]) -> Vec<RuleValidationError> {
        self.rules.load_rules(defs)
    }

    /// All-or-nothing replacement of the rule set
    pub fn reload_rules(&self, defs: &[RuleDefinition]) -> Result<Arc<RuleSet>> {
        Ok(self.rules.reload_rules(defs)?)
    }

    /// Re-read the configured rule file and reload it all-or-nothing
    pub fn reload_rules_from_file(&self) -> Result<Arc<RuleSet>> {
        let path = self
            .config
            .rule_file
            .as_ref()
            .ok_or_else(|| RuleSetError::Source {
                path: "(none)".to_string(),
                message: "no rule file configured".to_string(),
            })?;

        let defs = read_rule_file(path).inspect_err(|e| {
            self.metrics.inc_rule_reloads("rejected");
            warn!(error = %e, "Failed to read rule file, keeping current rules");
        })?;
        self.reload_rules(&defs)
    }

    /// Evict expired history, idle baselines and stale alert state
    pub fn maintain(&self, now: DateTime<Utc>) {
        let idle_ttl = ChronoDuration::from_std(self.config.detector.idle_ttl)
            .unwrap_or(ChronoDuration::hours(1));

        let expired_values = self.history.evict_expired(now);
        let idle_baselines = self.detector.evict_idle(now - idle_ttl);
        let report = self.rules.maintain(now);
        self.metrics.set_tracked_series(self.detector.tracked_series());

        debug!(
            expired_values,
            idle_baselines,
            stale_values = report.stale_values,
            removed_states = report.removed_states,
            "Maintenance pass complete"
        );
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.history.stats()
    }

    pub fn status(&self) -> EngineStatus {
        let rules = self.rules.rules();
        let flows = self.correlator.snapshot();
        let history = self.history.stats();
        EngineStatus {
            instance: self.config.instance.clone(),
            tracked_series: self.detector.tracked_series(),
            history_series: history.series,
            history_samples: history.samples,
            rules_loaded: rules.len(),
            rule_set_version: rules.version(),
            active_alerts: self.rules.active_alerts().len(),
            flows: flows.flows.len(),
            last_correlation: flows.computed_at,
            dispatcher: self.dispatcher.stats(),
        }
    }
}

/// Reject samples with empty identifiers or a non-finite value
pub fn validate_sample(sample: &MetricSample) -> Result<()> {
    let reason = if sample.node.trim().is_empty() {
        "node must not be empty".to_string()
    } else if sample.metric.trim().is_empty() {
        "metric must not be empty".to_string()
    } else if !sample.value.is_finite() {
        format!("value must be finite, got {}", sample.value)
    } else {
        return Ok(());
    };
    Err(EngineError::InvalidSample(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::AlertStatus;
    use crate::dispatch::testing::ScriptedChannel;
    use crate::models::NotificationSeverity;
    use std::io::Write;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn engine() -> (MetricsEngine, Arc<ScriptedChannel>) {
        let channel = Arc::new(ScriptedChannel::default());
        (MetricsEngine::new(EngineConfig::default(), channel.clone()), channel)
    }

    fn rule(name: &str, metric: &str, threshold: f64) -> RuleDefinition {
        RuleDefinition {
            name: name.to_string(),
            metric: metric.to_string(),
            threshold,
            condition: "gt".to_string(),
            evaluation_interval_secs: 10,
            consecutive_required: 1,
            message: None,
        }
    }

    #[test]
    fn test_invalid_samples_rejected_without_side_effects() {
        let (engine, _) = engine();

        for sample in [
            MetricSample::new("", "rx", 1.0, ts(0)),
            MetricSample::new("n1", " ", 1.0, ts(0)),
            MetricSample::new("n1", "rx", f64::NAN, ts(0)),
            MetricSample::new("n1", "rx", f64::INFINITY, ts(0)),
        ] {
            assert!(matches!(engine.ingest(sample), Err(EngineError::InvalidSample(_))));
        }
        assert_eq!(engine.history_stats().samples, 0);
        assert!(engine.baseline("n1", "rx").is_none());
    }

    #[test]
    fn test_ingest_feeds_detector_history_and_rules() {
        let (engine, _) = engine();
        engine.load_rules(&[rule("rx-high", "rx", 150.0)]);

        for i in 0..10 {
            let value = if i % 2 == 0 { 95.0 } else { 105.0 };
            assert!(engine
                .ingest(MetricSample::new("n1", "rx", value, ts(i)))
                .unwrap()
                .is_none());
        }
        let anomaly = engine
            .ingest(MetricSample::new("n1", "rx", 200.0, ts(10)))
            .unwrap();
        assert!(anomaly.is_some());
        assert_eq!(engine.get_anomalies(&AnomalyQuery::default()).len(), 1);
        assert_eq!(engine.history_stats().samples, 11);

        assert_eq!(engine.evaluate_rules(ts(10)), 1);
        assert_eq!(engine.dispatcher().queue_len(), 1);
        let alerts = engine.get_active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].state, AlertStatus::Firing);
    }

    #[tokio::test]
    async fn test_repeat_transition_inside_dedupe_window_is_suppressed() {
        let (engine, channel) = engine();
        engine.load_rules(&[rule("rx-high", "rx", 100.0)]);

        // Fire, resolve, fire again inside the dedupe window
        for (secs, value) in [(0, 150.0), (10, 50.0), (20, 150.0)] {
            engine.ingest(MetricSample::new("n1", "rx", value, ts(secs))).unwrap();
            engine.evaluate_rules(ts(secs));
        }
        assert_eq!(engine.dispatcher().queue_len(), 3);

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let worker = tokio::spawn(engine.dispatcher().clone().run(shutdown_rx));

        for _ in 0..100 {
            let stats = engine.dispatcher().stats();
            if stats.delivered + stats.suppressed == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let _ = shutdown_tx.send(());
        worker.await.unwrap();

        let stats = engine.dispatcher().stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.suppressed, 1);
        assert_eq!(channel.calls(), 2);
        assert_eq!(
            channel.sent.lock()[1].1.severity,
            NotificationSeverity::Resolved
        );
    }

    #[test]
    fn test_reload_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[[rules]]\nname = \"a\"\nmetric = \"rx\"\nthreshold = 1.0\ncondition = \"gt\"\n"
        )
        .unwrap();

        let config = EngineConfig::default().with_rule_file(file.path());
        let engine = MetricsEngine::new(config, Arc::new(ScriptedChannel::default()));

        let set = engine.reload_rules_from_file().unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("a"));
    }

    #[test]
    fn test_reload_without_rule_file_is_source_error() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.reload_rules_from_file(),
            Err(EngineError::Rules(RuleSetError::Source { .. }))
        ));
    }

    #[test]
    fn test_correlation_cycle_publishes_flows() {
        let (engine, _) = engine();
        let tx = engine.config().correlator.transmit_metric.clone();
        let rx = engine.config().correlator.receive_metric.clone();

        engine.ingest(MetricSample::new("a", &tx, 0.0, ts(0))).unwrap();
        engine.ingest(MetricSample::new("a", &tx, 1000.0, ts(30))).unwrap();
        engine.ingest(MetricSample::new("b", &rx, 0.0, ts(0))).unwrap();
        engine.ingest(MetricSample::new("b", &rx, 990.0, ts(30))).unwrap();

        let flows = engine.run_correlation(ts(45));
        assert_eq!(flows.len(), 1);
        assert_eq!(engine.get_traffic_flows(), flows);
        assert_eq!(engine.status().flows, 1);
    }

    #[test]
    fn test_maintenance_evicts_idle_state() {
        let (engine, _) = engine();
        engine.ingest(MetricSample::new("n1", "rx", 1.0, ts(0))).unwrap();
        assert_eq!(engine.status().tracked_series, 1);

        engine.maintain(ts(2 * 60 * 60));
        assert_eq!(engine.status().tracked_series, 0);
        assert_eq!(engine.history_stats().series, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingest_keeps_every_series_intact() {
        const SAMPLES: i64 = 40;
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        let set_a = [rule("rx-high", "rx", 100.0)];
        let set_b = [rule("tx-high", "tx", 100.0)];
        engine.load_rules(&set_a);

        let mut producers = Vec::new();
        for n in 0..8 {
            for metric in ["rx", "tx"] {
                let engine = engine.clone();
                producers.push(tokio::spawn(async move {
                    let node = format!("n{n}");
                    for i in 0..SAMPLES {
                        let value = if i % 2 == 0 { 95.0 } else { 105.0 };
                        engine
                            .ingest(MetricSample::new(&node, metric, value, ts(i)))
                            .unwrap();
                        tokio::task::yield_now().await;
                    }
                }));
            }
        }

        let control = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for i in 0..SAMPLES {
                    let defs = if i % 2 == 0 { &set_b } else { &set_a };
                    engine.reload_rules(defs).unwrap();
                    engine.evaluate_rules(ts(i));
                    for alert in engine.get_active_alerts() {
                        assert!(alert.rule == "rx-high" || alert.rule == "tx-high");
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for producer in producers {
            producer.await.unwrap();
        }
        control.await.unwrap();

        for n in 0..8 {
            for metric in ["rx", "tx"] {
                let baseline = engine.baseline(&format!("n{n}"), metric).unwrap();
                assert_eq!(baseline.count, SAMPLES as usize, "n{n}/{metric}");
                assert!((baseline.mean - 100.0).abs() < 1e-9);
            }
        }
        assert_eq!(engine.history_stats().samples, 16 * SAMPLES as usize);

        let rules = engine.rule_engine().rules();
        assert!(rules.contains("rx-high"));
        for alert in engine.get_active_alerts() {
            assert!(rules.contains(&alert.rule));
        }
    }
}
