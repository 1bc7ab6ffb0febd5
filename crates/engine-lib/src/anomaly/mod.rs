//! Anomaly detection for network metric series
//!
//! This module provides:
//! - Rolling per-(node, metric) baselines with bounded windows
//! - Z-score scoring of incoming samples against those baselines
//! - A bounded buffer of recent anomaly events for queries

mod baseline;
mod detector;

pub use baseline::{
    BaselineSnapshot, BaselineStore, BaselineWindow, DEFAULT_WARMUP_COUNT,
    DEFAULT_WINDOW_CAPACITY,
};
pub use detector::{AnomalyDetector, AnomalyQuery, DetectorConfig};
