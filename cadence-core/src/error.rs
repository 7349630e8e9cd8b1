use std::time::Duration;

use thiserror::Error;

use crate::OperationKind;

/// Errors detected while validating configuration, before any scheduling starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A declared operation kind has no frequency or interleave entry.
    #[error("operation kind {0} has no mix entry")]
    MissingEntry(OperationKind),

    /// A mix entry names a kind that was never declared.
    #[error("operation kind {0} is not declared")]
    UndeclaredKind(OperationKind),

    /// The mix combines frequency and interleave entries.
    #[error("mix combines frequency and interleave entries")]
    MixedForms,

    /// A frequency, interleave or reference interval is zero.
    #[error("operation kind {kind} has a non-positive {what}")]
    NonPositive {
        /// The offending kind.
        kind: OperationKind,
        /// Which value was zero.
        what: &'static str,
    },

    /// A frequency mix without a reference kind or reference interval.
    #[error("frequency mix requires a reference kind and interval")]
    MissingReference,

    /// The reference kind is not part of the mix.
    #[error("reference kind {0} has no mix entry")]
    ReferenceNotInMix(OperationKind),

    /// The resolved interval of a kind does not fit into a [`Duration`].
    #[error("interval of operation kind {0} overflows")]
    IntervalOverflow(OperationKind),

    /// The mix declares no operation kinds at all.
    #[error("mix declares no operation kinds")]
    EmptyMix,

    /// The sampler domain must contain at least one item.
    #[error("sampler domain must contain at least one item, got {0}")]
    InvalidDomain(u64),

    /// The zipfian constant must lie strictly between 0 and 1.
    #[error("zipfian constant must be in (0, 1), got {0}")]
    InvalidZipfianConstant(f64),

    /// The time compression ratio must be positive and finite.
    #[error("time compression ratio must be positive and finite, got {0}")]
    InvalidCompressionRatio(f64),

    /// The worker pool or its queue was configured with zero capacity.
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),

    /// The histogram bounds are unusable.
    #[error("invalid histogram bounds (max {max:?}, {significant_digits} significant digits): {reason}")]
    Histogram {
        /// The configured maximum trackable latency.
        max: Duration,
        /// The configured precision.
        significant_digits: u8,
        /// Why the histogram could not be created.
        reason: String,
    },
}

/// Errors surfaced to callers of [`LatencyRecorder::record`](crate::metrics::LatencyRecorder::record).
#[derive(Debug, Error, PartialEq)]
pub enum MetricError {
    /// The value exceeds the largest value the histogram was configured to track.
    #[error("latency {value} exceeds trackable maximum {max}")]
    OutOfRange {
        /// The rejected value, in recorder units.
        value: u64,
        /// The largest trackable value, in recorder units.
        max: u64,
    },

    /// No histogram exists for the kind.
    #[error("no histogram for operation kind {0}")]
    UnknownKind(OperationKind),
}

/// Failure reported by a [`Backend`](crate::dispatch::Backend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// A failure that may succeed when attempted again, such as a timeout or a conflict.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// A failure that will not go away by retrying.
    #[error("backend error: {0}")]
    Failed(String),
}

/// Failure reported by a [`ParamSource`](crate::dispatch::ParamSource).
#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    /// The source has no more parameters for this kind.
    #[error("parameters for operation kind {0} are exhausted")]
    Exhausted(OperationKind),

    /// The source could not produce parameters.
    #[error("failed to produce parameters: {0}")]
    Invalid(String),
}

/// Why a single scheduled operation did not complete.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Parameters could not be fetched, so the operation never ran.
    #[error(transparent)]
    Params(#[from] ParamsError),

    /// The backend failed and the retry policy gave up.
    #[error("gave up after {attempts} attempt(s): {source}")]
    Backend {
        /// Number of backend invocations, including the first one.
        attempts: u32,
        /// The error returned by the last attempt.
        #[source]
        source: BackendError,
    },

    /// The operation succeeded but its latency could not be recorded.
    #[error("latency not recorded: {0}")]
    Metric(#[from] MetricError),

    /// A forced shutdown cancelled the operation while it was running.
    #[error("cancelled by forced shutdown")]
    Cancelled,
}
