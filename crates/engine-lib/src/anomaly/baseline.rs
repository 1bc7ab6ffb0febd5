//! Rolling baselines per (node, metric)
//!
//! Each series keeps a bounded window of recent values. Mean and standard
//! deviation are recomputed two-pass over the window on every update, so the
//! result depends only on the window contents and never drifts.

use crate::models::SeriesKey;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Default number of values retained per series
pub const DEFAULT_WINDOW_CAPACITY: usize = 60;

/// Minimum samples required before a window yields verdicts
pub const DEFAULT_WARMUP_COUNT: usize = 10;

/// Rolling statistics for one series
#[derive(Debug, Clone)]
pub struct BaselineWindow {
    /// Current mean value
    pub mean: f64,
    /// Current (sample) standard deviation, never negative
    pub std_dev: f64,
    /// Number of values in the window
    pub count: usize,
    samples: VecDeque<(DateTime<Utc>, f64)>,
    capacity: usize,
    max_age: Option<ChronoDuration>,
}

impl BaselineWindow {
    /// Create a window bounded by `capacity` values
    pub fn new(capacity: usize) -> Self {
        Self {
            mean: 0.0,
            std_dev: 0.0,
            count: 0,
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            max_age: None,
        }
    }

    /// Additionally bound the window to values younger than `max_age`
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = ChronoDuration::from_std(max_age).ok();
        self
    }

    /// Add a new value with its timestamp
    pub fn add_sample(&mut self, timestamp: DateTime<Utc>, value: f64) {
        self.expire_old_samples(timestamp);

        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((timestamp, value));

        self.recalculate_stats();
    }

    /// Drop values that fell out of the trailing age bound
    fn expire_old_samples(&mut self, now: DateTime<Utc>) {
        let Some(max_age) = self.max_age else {
            return;
        };
        let cutoff = now - max_age;
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn recalculate_stats(&mut self) {
        self.count = self.samples.len();

        if self.count == 0 {
            self.mean = 0.0;
            self.std_dev = 0.0;
            return;
        }

        let sum: f64 = self.samples.iter().map(|(_, v)| v).sum();
        self.mean = sum / self.count as f64;

        if self.count > 1 {
            // Bessel's correction
            let variance: f64 = self
                .samples
                .iter()
                .map(|(_, v)| (v - self.mean).powi(2))
                .sum::<f64>()
                / (self.count - 1) as f64;
            self.std_dev = variance.max(0.0).sqrt();
        } else {
            self.std_dev = 0.0;
        }
    }

    /// Whether the window holds at least `warmup` values
    pub fn is_ready(&self, warmup: usize) -> bool {
        self.count >= warmup
    }

    /// Timestamp of the newest value
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|(ts, _)| *ts)
    }

    pub fn min(&self) -> Option<f64> {
        self.samples
            .iter()
            .map(|(_, v)| *v)
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn max(&self) -> Option<f64> {
        self.samples
            .iter()
            .map(|(_, v)| *v)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Read-only view of the current statistics
    pub fn snapshot(&self) -> BaselineSnapshot {
        BaselineSnapshot {
            count: self.count,
            mean: self.mean,
            std_dev: self.std_dev,
            min: self.min(),
            max: self.max(),
            last_seen: self.last_seen(),
        }
    }
}

/// Point-in-time copy of a window's statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineSnapshot {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Concurrent map of baselines, sharded by series key
///
/// Updates to different series never contend on a shared lock; readers get
/// either the pre- or post-update statistics of a series.
pub struct BaselineStore {
    windows: DashMap<SeriesKey, BaselineWindow>,
    capacity: usize,
    max_age: Option<Duration>,
}

impl BaselineStore {
    pub fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        Self {
            windows: DashMap::new(),
            capacity,
            max_age,
        }
    }

    /// Run `f` against the series window while holding only that series' shard
    pub fn with_window<R>(&self, key: &SeriesKey, f: impl FnOnce(&mut BaselineWindow) -> R) -> R {
        let mut entry = self.windows.entry(key.clone()).or_insert_with(|| {
            let window = BaselineWindow::new(self.capacity);
            match self.max_age {
                Some(age) => window.with_max_age(age),
                None => window,
            }
        });
        f(entry.value_mut())
    }

    pub fn snapshot(&self, key: &SeriesKey) -> Option<BaselineSnapshot> {
        self.windows.get(key).map(|w| w.snapshot())
    }

    /// Remove windows that have not seen a value since `cutoff`
    pub fn evict_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.last_seen().map(|ts| ts >= cutoff).unwrap_or(false));
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY, None)
    }
}
