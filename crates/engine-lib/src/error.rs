//! Error types for the engine

use crate::alerting::RuleSetError;

/// Errors surfaced by the engine's public operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Loading or validating a rule set failed
    #[error(transparent)]
    Rules(#[from] RuleSetError),

    /// An aggregation request was malformed (e.g. inverted time range)
    #[error("invalid aggregation request: {0}")]
    InvalidAggregation(String),

    /// The sample could not be accepted (empty identifiers, non-finite value)
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// The ingest queue is full; the caller should retry later
    #[error("ingest queue is full")]
    IngestBackpressure,
}

/// Convenience `Result` alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
