//! Network metrics aggregation and alerting engine
//!
//! This crate provides the core functionality for:
//! - Rolling baselines and z-score anomaly detection per (node, metric)
//! - Inferring traffic flows between nodes from counter growth
//! - Threshold rules with hysteresis and hot reload
//! - Notification delivery with retry, dedupe and a bounded queue
//! - On-demand aggregation over retained samples
//! - Health checks and observability

pub mod aggregation;
pub mod alerting;
pub mod anomaly;
pub mod correlation;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod history;
pub mod models;
pub mod observability;
pub mod runtime;

pub use aggregation::{AggregateFn, AggregationRequest, AggregationResult};
pub use engine::{EngineConfig, EngineStatus, MetricsEngine};
pub use error::{EngineError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, Lifecycle, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use runtime::{EngineHandle, SampleSender};
