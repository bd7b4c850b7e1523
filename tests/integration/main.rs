//! Integration Tests
//!
//! Cross-layer tests run through the public `txcoord` surface:
//! - Scenarios: the protocol paths end to end, logged through a service
//! - Crash recovery: decisions and log-early descriptors across restarts
//! - Heuristics: divergent participants surfacing as errors and metrics
//! - Tracing: what operators see in the logs

#[path = "../common/mod.rs"]
mod common;

mod crash_recovery;
mod heuristics;
mod scenarios;
mod tracing_output;
