//! The scheduling and sampling engine of the cadence workload driver.
//!
//! A run is described by a [`MixSpec`](mix::MixSpec): how often each operation kind executes,
//! either relative to a reference ("update") cadence or as explicit pacing intervals. The
//! engine turns that description into a single time-ordered stream of due operations and
//! executes them against a pluggable backend:
//!
//! ```text
//! MixSpec ──resolve──▶ ResolvedMix ──▶ StreamSchedule (one per kind)
//!                                            │
//!                                            ▼
//!                                      GlobalMerger (k-way merge)
//!                                            │ producer: pacing gate, lag policy, params
//!                                            ▼
//!                                   bounded channel ──▶ workers ──▶ Backend
//!                                                                    │
//!                                                  LatencyRecorder ◀─┘
//! ```
//!
//! Backends that need skewed keys share a [`ZipfianSampler`](sampler::ZipfianSampler), whose
//! normalization constant is extended incrementally as the key domain grows.
//!
//! Parameter parsing, concrete backends, configuration loading and report rendering are not
//! part of this crate. They plug in through [`ParamSource`](dispatch::ParamSource),
//! [`Backend`](dispatch::Backend) and the read-only query types.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod dispatch;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod mix;
pub mod sampler;
pub mod schedule;

pub use crate::error::{BackendError, ConfigError, MetricError, OperationError, ParamsError};

/// Identifier of one operation type.
///
/// Every kind has its own cadence and its own latency histogram. The set of kinds is fixed when
/// a run is constructed, and the numeric id doubles as the tie-breaker when two kinds are due at
/// the same instant: the lower id goes first.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OperationKind(u16);

impl OperationKind {
    /// Creates a kind from its numeric id.
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the numeric id.
    pub const fn id(self) -> u16 {
        self.0
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u16> for OperationKind {
    fn from(id: u16) -> Self {
        Self(id)
    }
}
