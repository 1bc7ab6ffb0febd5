//! Traffic flow correlation between nodes
//!
//! Infers source -> destination flows by matching transmit counter growth on
//! one node with receive counter growth on another over the same window.

mod correlator;

pub use correlator::{
    correlation_magnitude, counter_delta, rank_flows, CorrelatorConfig, FlowSnapshot,
    TrafficFlowCorrelator,
};
