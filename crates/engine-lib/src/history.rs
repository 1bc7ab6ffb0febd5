//! Short-term raw sample history
//!
//! Keeps recent raw values per (node, metric) for the flow correlator and
//! ad hoc aggregations:
//! - Retention-bounded (default 1 hour) with FIFO eviction
//! - Per-series cap on the number of retained values
//! - Values kept in timestamp order even if samples arrive late

use crate::models::{MetricSample, SeriesKey};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;

/// Default retention period (1 hour)
const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Default maximum values per series (1 hour at 1s resolution)
const DEFAULT_MAX_PER_SERIES: usize = 3600;

/// Configuration for the sample history
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum age of retained values, relative to the newest value of a series
    pub retention: Duration,
    /// Maximum number of values per series
    pub max_per_series: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            max_per_series: DEFAULT_MAX_PER_SERIES,
        }
    }
}

impl HistoryConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_per_series(mut self, max_per_series: usize) -> Self {
        self.max_per_series = max_per_series;
        self
    }
}

/// A timestamped value
pub type Point = (DateTime<Utc>, f64);

/// Concurrent per-series history of raw values
pub struct SampleHistory {
    series: DashMap<SeriesKey, VecDeque<Point>>,
    config: HistoryConfig,
}

impl SampleHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            series: DashMap::new(),
            config,
        }
    }

    fn retention(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.retention).unwrap_or(ChronoDuration::hours(1))
    }

    /// Append a sample to its series
    pub fn record(&self, sample: &MetricSample) {
        let retention = self.retention();
        let mut entry = self.series.entry(sample.key()).or_default();
        let points = entry.value_mut();

        let point = (sample.timestamp, sample.value);
        match points.back() {
            Some((last, _)) if *last > sample.timestamp => {
                let idx = points.partition_point(|(ts, _)| *ts <= sample.timestamp);
                points.insert(idx, point);
            }
            _ => points.push_back(point),
        }

        while points.len() > self.config.max_per_series.max(1) {
            points.pop_front();
        }

        if let Some((newest, _)) = points.back().copied() {
            let cutoff = newest - retention;
            while let Some((ts, _)) = points.front() {
                if *ts < cutoff {
                    points.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Values of a series with `from <= ts <= to`
    pub fn range(
        &self,
        key: &SeriesKey,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<Point> {
        let Some(points) = self.series.get(key) else {
            return Vec::new();
        };
        points
            .iter()
            .filter(|(ts, _)| from.map_or(true, |f| *ts >= f) && to.map_or(true, |t| *ts <= t))
            .copied()
            .collect()
    }

    /// Values inside `[start, end]`, preceded by the last value before
    /// `start` when one exists. Used for counter deltas over a window.
    pub fn window_with_anchor(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<f64> {
        let Some(points) = self.series.get(key) else {
            return Vec::new();
        };

        let first_inside = points.partition_point(|(ts, _)| *ts < start);
        let anchor = first_inside.checked_sub(1);

        anchor
            .into_iter()
            .chain(first_inside..points.len())
            .map(|i| points[i])
            .take_while(|(ts, _)| *ts <= end)
            .map(|(_, v)| v)
            .collect()
    }

    /// Nodes that reported `metric`, sorted
    pub fn nodes_for_metric(&self, metric: &str) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .series
            .iter()
            .filter(|entry| entry.key().metric == metric)
            .map(|entry| entry.key().node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Remove values older than retention relative to `now`; drops empty series
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention();
        let mut removed = 0;
        self.series.retain(|_, points| {
            while let Some((ts, _)) = points.front() {
                if *ts < cutoff {
                    points.pop_front();
                    removed += 1;
                } else {
                    break;
                }
            }
            !points.is_empty()
        });
        removed
    }

    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats {
            series: self.series.len(),
            ..Default::default()
        };
        for entry in self.series.iter() {
            stats.samples += entry.len();
            if let Some((ts, _)) = entry.front() {
                stats.oldest = Some(stats.oldest.map_or(*ts, |o: DateTime<Utc>| o.min(*ts)));
            }
            if let Some((ts, _)) = entry.back() {
                stats.newest = Some(stats.newest.map_or(*ts, |n: DateTime<Utc>| n.max(*ts)));
            }
        }
        stats
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

/// History statistics
#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    /// Number of tracked series
    pub series: usize,
    /// Total retained values
    pub samples: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}
