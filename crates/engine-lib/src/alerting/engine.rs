//! Threshold rule evaluation
//!
//! The engine tracks the latest value of every (node, metric), evaluates each
//! rule when its interval has elapsed and advances one [`AlertState`] per
//! (rule, node). Rule sets are swapped atomically: an evaluation pass reads a
//! single snapshot and never observes a half-applied reload.

use super::rules::{AlertRule, RuleDefinition, RuleSet, RuleSetError, RuleValidationError};
use super::state::{AlertState, AlertStatus, Transition};
use crate::dispatch::template::format_value;
use crate::dispatch::NotificationRequest;
use crate::models::{MetricSample, NotificationSeverity, SeriesKey};
use crate::observability::{EngineMetrics, StructuredLogger};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RuleEngineConfig {
    /// How often the evaluation loop checks for due rules
    pub tick: Duration,
    /// Latest values older than this are not evaluated
    pub stale_after: Duration,
    /// Nodes silent for this long lose their latest values and alert states
    pub node_ttl: Duration,
    /// Run maintenance every N ticks
    pub maintenance_every: u32,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            stale_after: Duration::from_secs(5 * 60),
            node_ttl: Duration::from_secs(60 * 60),
            maintenance_every: 60,
        }
    }
}

impl RuleEngineConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_node_ttl(mut self, node_ttl: Duration) -> Self {
        self.node_ttl = node_ttl;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct LatestValue {
    value: f64,
    timestamp: DateTime<Utc>,
}

/// A currently firing alert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAlert {
    pub rule: String,
    pub node: String,
    pub metric: String,
    pub state: AlertStatus,
    /// When the alert entered its current state
    pub since: DateTime<Utc>,
    pub value: Option<f64>,
    pub threshold: f64,
}

/// Alert state plus whether its rule still exists
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertStateView {
    #[serde(flatten)]
    pub state: AlertState,
    pub orphaned: bool,
}

/// What a maintenance pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub stale_values: usize,
    pub removed_states: usize,
}

pub struct AlertRuleEngine {
    config: RuleEngineConfig,
    rules: ArcSwap<RuleSet>,
    latest: DashMap<SeriesKey, LatestValue>,
    states: DashMap<(String, String), AlertState>,
    last_run: DashMap<String, DateTime<Utc>>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl AlertRuleEngine {
    pub fn new(config: RuleEngineConfig) -> Self {
        Self {
            config,
            rules: ArcSwap::from_pointee(RuleSet::empty()),
            latest: DashMap::new(),
            states: DashMap::new(),
            last_run: DashMap::new(),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("netpulse"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &RuleEngineConfig {
        &self.config
    }

    /// Snapshot of the active rule set
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    fn install(&self, set: RuleSet) -> Arc<RuleSet> {
        let set = Arc::new(set);
        self.last_run.retain(|name, _| set.contains(name));
        self.rules.store(set.clone());
        self.metrics.set_rules_loaded(set.len());
        set
    }

    /// Install every valid definition, reporting the rest. Used at startup,
    /// where a partially valid file is better than no alerting at all.
    pub fn load_rules(&self, defs: &[RuleDefinition]) -> Vec<RuleValidationError> {
        let version = self.rules.load().version() + 1;
        let (set, errors) = RuleSet::load_partial(defs, version);
        let set = self.install(set);
        self.logger.log_rules_reloaded(set.version(), set.len());
        if !errors.is_empty() {
            self.logger.log_rules_rejected(&errors);
        }
        errors
    }

    /// Replace the rule set only if every definition is valid
    pub fn reload_rules(&self, defs: &[RuleDefinition]) -> Result<Arc<RuleSet>, RuleSetError> {
        let version = self.rules.load().version() + 1;
        match RuleSet::try_from_definitions(defs, version) {
            Ok(set) => {
                let set = self.install(set);
                self.metrics.inc_rule_reloads("applied");
                self.logger.log_rules_reloaded(set.version(), set.len());
                Ok(set)
            }
            Err(e) => {
                self.metrics.inc_rule_reloads("rejected");
                self.logger.log_rules_rejected(e.validation_errors());
                Err(e)
            }
        }
    }

    /// Record a sample as the latest value of its series (older samples are ignored)
    pub fn observe(&self, sample: &MetricSample) {
        let incoming = LatestValue {
            value: sample.value,
            timestamp: sample.timestamp,
        };
        self.latest
            .entry(sample.key())
            .and_modify(|current| {
                if incoming.timestamp >= current.timestamp {
                    *current = incoming;
                }
            })
            .or_insert(incoming);
    }

    fn is_due(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_run.get(&rule.name).map(|t| *t) else {
            return true;
        };
        let interval = ChronoDuration::from_std(rule.evaluation_interval)
            .unwrap_or(ChronoDuration::seconds(60));
        now - last >= interval
    }

    /// Evaluate every rule whose interval has elapsed at `now`
    pub fn evaluate_due(&self, now: DateTime<Utc>) -> Vec<NotificationRequest> {
        let snapshot = self.rules.load_full();
        let mut notifications = Vec::new();

        for rule in snapshot.rules() {
            if !self.is_due(rule, now) {
                continue;
            }
            self.last_run.insert(rule.name.clone(), now);
            notifications.extend(self.evaluate_rule(rule, now));
        }

        self.metrics.set_active_alerts(self.active_alert_count(&snapshot));
        notifications
    }

    /// Evaluate one rule against the fresh latest value of every node that
    /// reports its metric
    pub fn evaluate_rule(&self, rule: &AlertRule, now: DateTime<Utc>) -> Vec<NotificationRequest> {
        let stale_after =
            ChronoDuration::from_std(self.config.stale_after).unwrap_or(ChronoDuration::minutes(5));
        let cutoff = now - stale_after;

        // Collect first so no map shard stays locked while states are updated
        let values: Vec<(String, f64)> = self
            .latest
            .iter()
            .filter(|entry| entry.key().metric == rule.metric && entry.timestamp >= cutoff)
            .map(|entry| (entry.key().node.clone(), entry.value))
            .collect();

        let mut notifications = Vec::new();
        for (node, value) in values {
            let condition_true = rule.condition.check(value, rule.threshold);
            let transition = {
                let mut state = self
                    .states
                    .entry((rule.name.clone(), node.clone()))
                    .or_insert_with(|| AlertState::new(&rule.name, &node, now));
                state.apply(condition_true, value, rule.consecutive_required, now)
            };

            if let Some(transition) = transition {
                let severity = match transition {
                    Transition::Fired => NotificationSeverity::Firing,
                    Transition::Resolved => NotificationSeverity::Resolved,
                };
                let status = match transition {
                    Transition::Fired => AlertStatus::Firing,
                    Transition::Resolved => AlertStatus::Resolved,
                };
                self.metrics.inc_alert_transitions(status);
                self.logger
                    .log_alert_transition(&rule.name, &node, status, value);
                notifications.push(notification(rule, &node, severity, value, now));
            }
        }

        debug!(rule = %rule.name, notifications = notifications.len(), "Rule evaluated");
        notifications
    }

    fn active_alert_count(&self, rules: &RuleSet) -> usize {
        self.states
            .iter()
            .filter(|s| s.status.is_active() && rules.contains(&s.rule))
            .count()
    }

    /// Firing and resolving alerts of rules in the current set, sorted by
    /// rule then node
    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        let rules = self.rules.load_full();
        let mut alerts: Vec<ActiveAlert> = self
            .states
            .iter()
            .filter(|s| s.status.is_active())
            .filter_map(|s| {
                let rule = rules.get(&s.rule)?;
                Some(ActiveAlert {
                    rule: s.rule.clone(),
                    node: s.node.clone(),
                    metric: rule.metric.clone(),
                    state: s.status,
                    since: s.since,
                    value: s.last_value,
                    threshold: rule.threshold,
                })
            })
            .collect();
        alerts.sort_by(|a, b| a.rule.cmp(&b.rule).then_with(|| a.node.cmp(&b.node)));
        alerts
    }

    /// Every tracked state, including those whose rule was removed by a reload
    pub fn alert_states(&self) -> Vec<AlertStateView> {
        let rules = self.rules.load_full();
        let mut states: Vec<AlertStateView> = self
            .states
            .iter()
            .map(|s| AlertStateView {
                orphaned: !rules.contains(&s.rule),
                state: s.value().clone(),
            })
            .collect();
        states.sort_by(|a, b| {
            a.state
                .rule
                .cmp(&b.state.rule)
                .then_with(|| a.state.node.cmp(&b.state.node))
        });
        states
    }

    pub fn state(&self, rule: &str, node: &str) -> Option<AlertState> {
        self.states
            .get(&(rule.to_string(), node.to_string()))
            .map(|s| s.value().clone())
    }

    /// Forget nodes silent past the TTL and states of removed rules
    pub fn maintain(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let ttl = ChronoDuration::from_std(self.config.node_ttl).unwrap_or(ChronoDuration::hours(1));
        let cutoff = now - ttl;

        let before = self.latest.len();
        self.latest.retain(|_, latest| latest.timestamp >= cutoff);
        let stale_values = before.saturating_sub(self.latest.len());

        let rules = self.rules.load_full();
        let before = self.states.len();
        self.states.retain(|(rule, _), state| {
            rules.contains(rule)
                && state
                    .last_evaluated_at
                    .map_or(state.since >= cutoff, |t| t >= cutoff)
        });
        let removed_states = before.saturating_sub(self.states.len());

        if stale_values + removed_states > 0 {
            debug!(stale_values, removed_states, "Rule engine maintenance complete");
        }
        MaintenanceReport {
            stale_values,
            removed_states,
        }
    }
}

impl Default for AlertRuleEngine {
    fn default() -> Self {
        Self::new(RuleEngineConfig::default())
    }
}

fn notification(
    rule: &AlertRule,
    node: &str,
    severity: NotificationSeverity,
    value: f64,
    now: DateTime<Utc>,
) -> NotificationRequest {
    let context: BTreeMap<String, String> = [
        ("rule", rule.name.clone()),
        ("node", node.to_string()),
        ("metric", rule.metric.clone()),
        ("value", format_value(value)),
        ("threshold", format_value(rule.threshold)),
        ("condition", rule.condition.to_string()),
        ("state", severity.to_string()),
        ("timestamp", now.to_rfc3339()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    NotificationRequest {
        rule_name: rule.name.clone(),
        node: node.to_string(),
        metric: rule.metric.clone(),
        severity,
        value,
        threshold: rule.threshold,
        message_template: rule.message_template.clone(),
        context,
        event_time: now,
        dedupe_key: NotificationRequest::dedupe_key_for(&rule.name, node, severity),
    }
}
