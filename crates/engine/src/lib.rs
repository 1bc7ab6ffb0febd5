//! Netpulse daemon: configuration and HTTP API over the engine library

pub mod api;
pub mod config;
