//! On-demand aggregation over sample history

use crate::correlation::counter_delta;
use crate::error::{EngineError, Result};
use crate::history::SampleHistory;
use crate::models::SeriesKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Avg,
    Min,
    Max,
    Sum,
    Count,
    P50,
    P95,
    P99,
    /// Reset-aware counter delta
    Delta,
}

impl fmt::Display for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateFn::Avg => "avg",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Sum => "sum",
            AggregateFn::Count => "count",
            AggregateFn::P50 => "p50",
            AggregateFn::P95 => "p95",
            AggregateFn::P99 => "p99",
            AggregateFn::Delta => "delta",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AggregateFn {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avg" | "mean" => Ok(AggregateFn::Avg),
            "min" => Ok(AggregateFn::Min),
            "max" => Ok(AggregateFn::Max),
            "sum" => Ok(AggregateFn::Sum),
            "count" => Ok(AggregateFn::Count),
            "p50" | "median" => Ok(AggregateFn::P50),
            "p95" => Ok(AggregateFn::P95),
            "p99" => Ok(AggregateFn::P99),
            "delta" => Ok(AggregateFn::Delta),
            other => Err(format!("unknown aggregate function: {other}")),
        }
    }
}

fn default_function() -> AggregateFn {
    AggregateFn::Avg
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub metric: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_function")]
    pub function: AggregateFn,
    #[serde(default)]
    pub group_by_node: bool,
}

impl AggregationRequest {
    pub fn new(metric: impl Into<String>, function: AggregateFn) -> Self {
        Self {
            metric: metric.into(),
            node: None,
            from: None,
            to: None,
            function,
            group_by_node: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationBucket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Absent when the bucket holds no samples
    pub value: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub metric: String,
    pub function: AggregateFn,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub buckets: Vec<AggregationBucket>,
}

/// Nearest-rank percentile over a copy of `values`
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Apply `function` to time-ordered values; `None` for an empty input
pub fn apply(function: AggregateFn, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return match function {
            AggregateFn::Count => Some(0.0),
            _ => None,
        };
    }

    let value = match function {
        AggregateFn::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggregateFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Sum => values.iter().sum(),
        AggregateFn::Count => values.len() as f64,
        AggregateFn::P50 => percentile(values, 50.0),
        AggregateFn::P95 => percentile(values, 95.0),
        AggregateFn::P99 => percentile(values, 99.0),
        AggregateFn::Delta => counter_delta(values),
    };
    Some(value)
}

/// Compute an aggregation against the retained history
pub fn compute(history: &SampleHistory, request: &AggregationRequest) -> Result<AggregationResult> {
    if request.metric.trim().is_empty() {
        return Err(EngineError::InvalidAggregation(
            "metric must not be empty".to_string(),
        ));
    }
    if let (Some(from), Some(to)) = (request.from, request.to) {
        if from > to {
            return Err(EngineError::InvalidAggregation(format!(
                "from ({from}) is after to ({to})"
            )));
        }
    }

    let nodes = match &request.node {
        Some(node) => vec![node.clone()],
        None => history.nodes_for_metric(&request.metric),
    };

    let series: Vec<(String, Vec<f64>)> = nodes
        .into_iter()
        .map(|node| {
            let key = SeriesKey::new(&node, &request.metric);
            let values = history
                .range(&key, request.from, request.to)
                .into_iter()
                .map(|(_, v)| v)
                .collect();
            (node, values)
        })
        .collect();

    let buckets = if request.group_by_node {
        series
            .into_iter()
            .map(|(node, values)| AggregationBucket {
                node: Some(node),
                value: apply(request.function, &values),
                samples: values.len(),
            })
            .collect()
    } else {
        let combined = match request.function {
            // Deltas are per counter; summing them keeps resets local to a node
            AggregateFn::Delta => {
                let samples = series.iter().map(|(_, v)| v.len()).sum();
                let value = series
                    .iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(_, v)| counter_delta(v))
                    .fold(None, |acc: Option<f64>, d| Some(acc.unwrap_or(0.0) + d));
                AggregationBucket {
                    node: None,
                    value,
                    samples,
                }
            }
            function => {
                let values: Vec<f64> = series.into_iter().flat_map(|(_, v)| v).collect();
                AggregationBucket {
                    node: None,
                    value: apply(function, &values),
                    samples: values.len(),
                }
            }
        };
        vec![combined]
    };

    Ok(AggregationResult {
        metric: request.metric.clone(),
        function: request.function,
        from: request.from,
        to: request.to,
        buckets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricSample;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn history() -> SampleHistory {
        let history = SampleHistory::default();
        for i in 0..10 {
            history.record(&MetricSample::new("n1", "rx", (i + 1) as f64, ts(i)));
            history.record(&MetricSample::new("n2", "rx", 100.0, ts(i)));
        }
        history
    }

    #[test]
    fn test_apply_functions() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(apply(AggregateFn::Avg, &values), Some(3.0));
        assert_eq!(apply(AggregateFn::Min, &values), Some(1.0));
        assert_eq!(apply(AggregateFn::Max, &values), Some(5.0));
        assert_eq!(apply(AggregateFn::Sum, &values), Some(15.0));
        assert_eq!(apply(AggregateFn::Count, &values), Some(5.0));
        assert_eq!(apply(AggregateFn::P50, &values), Some(3.0));
        assert_eq!(apply(AggregateFn::P99, &values), Some(5.0));
        assert_eq!(apply(AggregateFn::Delta, &[10.0, 20.0, 5.0]), Some(15.0));
        assert_eq!(apply(AggregateFn::Avg, &[]), None);
        assert_eq!(apply(AggregateFn::Count, &[]), Some(0.0));
    }

    #[test]
    fn test_single_node_time_range() {
        let request = AggregationRequest {
            node: Some("n1".to_string()),
            from: Some(ts(2)),
            to: Some(ts(5)),
            ..AggregationRequest::new("rx", AggregateFn::Sum)
        };
        let result = compute(&history(), &request).unwrap();

        assert_eq!(result.buckets.len(), 1);
        // values 3, 4, 5, 6
        assert_eq!(result.buckets[0].value, Some(18.0));
        assert_eq!(result.buckets[0].samples, 4);
    }

    #[test]
    fn test_group_by_node() {
        let request = AggregationRequest {
            group_by_node: true,
            ..AggregationRequest::new("rx", AggregateFn::Max)
        };
        let result = compute(&history(), &request).unwrap();

        assert_eq!(result.buckets.len(), 2);
        assert_eq!(result.buckets[0].node.as_deref(), Some("n1"));
        assert_eq!(result.buckets[0].value, Some(10.0));
        assert_eq!(result.buckets[1].value, Some(100.0));
    }

    #[test]
    fn test_combined_delta_sums_per_node_deltas() {
        let result = compute(&history(), &AggregationRequest::new("rx", AggregateFn::Delta)).unwrap();
        // n1 grows 1..=10 (delta 9), n2 is flat
        assert_eq!(result.buckets[0].value, Some(9.0));
        assert_eq!(result.buckets[0].samples, 20);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let request = AggregationRequest {
            from: Some(ts(10)),
            to: Some(ts(0)),
            ..AggregationRequest::new("rx", AggregateFn::Avg)
        };
        assert!(matches!(
            compute(&history(), &request),
            Err(EngineError::InvalidAggregation(_))
        ));
    }

    #[test]
    fn test_unknown_series_is_empty_not_error() {
        let by_node = AggregationRequest {
            node: Some("ghost".to_string()),
            ..AggregationRequest::new("rx", AggregateFn::Avg)
        };
        let result = compute(&history(), &by_node).unwrap();
        assert_eq!(result.buckets[0].samples, 0);
        assert_eq!(result.buckets[0].value, None);

        let grouped = AggregationRequest {
            group_by_node: true,
            ..AggregationRequest::new("nope", AggregateFn::Avg)
        };
        assert!(compute(&history(), &grouped).unwrap().buckets.is_empty());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: AggregationRequest =
            serde_json::from_str(r#"{"metric":"rx","function":"p95"}"#).unwrap();
        assert_eq!(request.function, AggregateFn::P95);
        assert!(!request.group_by_node);
        assert!(request.node.is_none());
    }
}
