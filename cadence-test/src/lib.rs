//! Test utilities for cadence.
//!
//! This crate provides utilities to facilitate testing of the scheduling engine and the driver.
//! See the modules for all available utilities.

pub mod backend;
pub mod tracing;
