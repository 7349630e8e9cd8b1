//! The cadence workload driver.
//!
//! Loads a [`Config`](config::Config), turns its operation mix into a paced run on top of
//! [`cadence_core`], executes it against a simulated backend with *LogNormal* latencies and
//! reports per-operation latency distributions, throughput and schedule lag.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod observability;
pub mod report;
pub mod run;
pub mod simulated;
