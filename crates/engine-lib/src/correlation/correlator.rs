//! Cross-node traffic flow correlation
//!
//! Pairs the transmit counter delta of one node with the receive counter
//! delta of another over a trailing window. Pairs whose volumes match are
//! reported as inferred flows, ranked by `tx * magnitude`.

use crate::history::SampleHistory;
use crate::models::{SeriesKey, TrafficFlowCorrelation};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration for the flow correlator
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Monotonic transmit byte counter metric
    pub transmit_metric: String,
    /// Monotonic receive byte counter metric
    pub receive_metric: String,
    /// Trailing window each cycle correlates over
    pub window: Duration,
    /// How often the correlation loop runs
    pub interval: Duration,
    /// Number of flows retained per cycle
    pub top_k: usize,
    /// Pairs whose match ratio falls below this are dropped
    pub min_magnitude: f64,
    /// Pairs where both deltas are below this are dropped
    pub min_delta: f64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            transmit_metric: "network_transmit_bytes".to_string(),
            receive_metric: "network_receive_bytes".to_string(),
            window: Duration::from_secs(60),
            interval: Duration::from_secs(30),
            top_k: 20,
            min_magnitude: 0.1,
            min_delta: 1.0,
        }
    }
}

impl CorrelatorConfig {
    pub fn with_counter_metrics(
        mut self,
        transmit: impl Into<String>,
        receive: impl Into<String>,
    ) -> Self {
        self.transmit_metric = transmit.into();
        self.receive_metric = receive.into();
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

/// Result set of one correlation cycle
#[derive(Debug, Clone, Default)]
pub struct FlowSnapshot {
    pub flows: Vec<TrafficFlowCorrelation>,
    pub computed_at: Option<DateTime<Utc>>,
}

/// Delta of a monotonic counter across consecutive values.
///
/// A value lower than its predecessor means the counter reset (wrap or
/// restart); that step contributes the new absolute value, never a negative.
pub fn counter_delta(values: &[f64]) -> f64 {
    values
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (pair[0], pair[1]);
            if cur < prev {
                cur.max(0.0)
            } else {
                cur - prev
            }
        })
        .sum()
}

/// Normalized match ratio of two volumes, in `[0, 1]`
pub fn correlation_magnitude(transmit: f64, receive: f64) -> f64 {
    transmit.min(receive) / transmit.max(receive).max(1.0)
}

/// Correlates per-node counter deltas and publishes the latest result set
pub struct TrafficFlowCorrelator {
    config: CorrelatorConfig,
    history: Arc<SampleHistory>,
    latest: ArcSwap<FlowSnapshot>,
}

impl TrafficFlowCorrelator {
    pub fn new(config: CorrelatorConfig, history: Arc<SampleHistory>) -> Self {
        Self {
            config,
            history,
            latest: ArcSwap::from_pointee(FlowSnapshot::default()),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Run one cycle over the window ending at `now`, replacing the previous
    /// result set
    pub fn correlate(&self, window: Duration, now: DateTime<Utc>) -> Vec<TrafficFlowCorrelation> {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::seconds(60));
        let window_start = now - window;

        let transmit = self.deltas(&self.config.transmit_metric, window_start, now);
        let receive = self.deltas(&self.config.receive_metric, window_start, now);

        let flows = rank_flows(&transmit, &receive, window_start, now, &self.config);

        debug!(
            transmit_nodes = transmit.len(),
            receive_nodes = receive.len(),
            flows = flows.len(),
            "Correlation cycle complete"
        );

        self.latest.store(Arc::new(FlowSnapshot {
            flows: flows.clone(),
            computed_at: Some(now),
        }));
        flows
    }

    /// Flows of the most recent cycle
    pub fn latest(&self) -> Vec<TrafficFlowCorrelation> {
        self.latest.load().flows.clone()
    }

    pub fn snapshot(&self) -> Arc<FlowSnapshot> {
        self.latest.load_full()
    }

    fn deltas(
        &self,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BTreeMap<String, f64> {
        self.history
            .nodes_for_metric(metric)
            .into_iter()
            .filter_map(|node| {
                let values = self
                    .history
                    .window_with_anchor(&SeriesKey::new(&node, metric), start, end);
                (values.len() >= 2).then(|| (node, counter_delta(&values)))
            })
            .collect()
    }
}

/// Pair every transmitting node with every other receiving node, filter weak
/// matches, rank and truncate to top-K
pub fn rank_flows(
    transmit: &BTreeMap<String, f64>,
    receive: &BTreeMap<String, f64>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    config: &CorrelatorConfig,
) -> Vec<TrafficFlowCorrelation> {
    let mut flows: Vec<TrafficFlowCorrelation> = transmit
        .iter()
        .flat_map(|(source, tx)| {
            receive
                .iter()
                .filter(move |(dest, _)| *dest != source)
                .map(move |(dest, rx)| (source, dest, *tx, *rx))
        })
        .filter(|&(_, _, tx, rx)| tx.max(rx) >= config.min_delta)
        .filter_map(|(source, dest, tx, rx)| {
            let magnitude = correlation_magnitude(tx, rx);
            (magnitude >= config.min_magnitude).then(|| TrafficFlowCorrelation {
                source_node: source.clone(),
                dest_node: dest.clone(),
                transmit_bytes: tx,
                receive_bytes: rx,
                correlation_magnitude: magnitude,
                window_start,
                window_end,
            })
        })
        .collect();

    // Descending weight; node names break ties so equal inputs rank identically
    flows.sort_by(|a, b| {
        b.weight()
            .partial_cmp(&a.weight())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_node.cmp(&b.source_node))
            .then_with(|| a.dest_node.cmp(&b.dest_node))
    });
    flows.truncate(config.top_k);
    flows
}
