//! Latency histograms and schedule-lag gauges.
//!
//! [`LatencyRecorder`] keeps one fixed-precision [`Histogram`] per operation kind for the whole
//! run. Nothing is evicted: reports want the full distribution, not a sliding window.
//!
//! [`ScheduleLag`] tracks how far behind its logical schedule each kind is being dispatched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::OperationKind;
use crate::error::{ConfigError, MetricError};

/// The unit latencies are stored in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyUnit {
    /// Nanoseconds.
    Nanos,
    /// Microseconds.
    #[default]
    Micros,
    /// Milliseconds.
    Millis,
}

impl LatencyUnit {
    /// Converts `duration` into this unit, truncating and saturating at `u64::MAX`.
    pub fn from_duration(self, duration: Duration) -> u64 {
        let value = match self {
            Self::Nanos => duration.as_nanos(),
            Self::Micros => duration.as_micros(),
            Self::Millis => duration.as_millis(),
        };
        u64::try_from(value).unwrap_or(u64::MAX)
    }

    /// Converts a value in this unit back into a [`Duration`].
    pub fn to_duration(self, value: u64) -> Duration {
        match self {
            Self::Nanos => Duration::from_nanos(value),
            Self::Micros => Duration::from_micros(value),
            Self::Millis => Duration::from_millis(value),
        }
    }

    /// Short suffix for rendering values.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Nanos => "ns",
            Self::Micros => "µs",
            Self::Millis => "ms",
        }
    }
}

/// Thread-safe latency histograms, one per operation kind.
#[derive(Debug)]
pub struct LatencyRecorder {
    unit: LatencyUnit,
    max_value: u64,
    histograms: BTreeMap<OperationKind, Mutex<Histogram<u64>>>,
}

impl LatencyRecorder {
    /// Creates a recorder for `kinds` that tracks latencies up to `max` with the given number of
    /// significant decimal digits (1 to 5).
    pub fn new(
        kinds: impl IntoIterator<Item = OperationKind>,
        unit: LatencyUnit,
        max: Duration,
        significant_digits: u8,
    ) -> Result<Self, ConfigError> {
        let max_value = unit.from_duration(max);
        let histogram_error = |reason: String| ConfigError::Histogram {
            max,
            significant_digits,
            reason,
        };

        // hdrhistogram needs a highest trackable value of at least twice the lowest.
        if max_value < 2 {
            return Err(histogram_error(format!(
                "maximum must be at least 2{}",
                unit.suffix()
            )));
        }

        let template = Histogram::<u64>::new_with_bounds(1, max_value, significant_digits)
            .map_err(|err| histogram_error(format!("{err:?}")))?;

        let histograms = kinds
            .into_iter()
            .map(|kind| (kind, Mutex::new(template.clone())))
            .collect();

        Ok(Self {
            unit,
            max_value,
            histograms,
        })
    }

    /// Returns the unit recorded values are expressed in.
    pub fn unit(&self) -> LatencyUnit {
        self.unit
    }

    /// Returns the largest value that can be recorded.
    pub fn max_value(&self) -> u64 {
        self.max_value
    }

    /// Records one observation of `value`, in recorder units, for `kind`.
    ///
    /// Values above the configured maximum are rejected instead of being clamped, so that a
    /// misconfigured bound shows up rather than silently distorting the tail.
    pub fn record(&self, kind: OperationKind, value: u64) -> Result<(), MetricError> {
        if value > self.max_value {
            return Err(MetricError::OutOfRange {
                value,
                max: self.max_value,
            });
        }

        self.lock(kind)?
            .record(value)
            .map_err(|_| MetricError::OutOfRange {
                value,
                max: self.max_value,
            })
    }

    /// Records one observation of `duration` for `kind`.
    pub fn record_duration(&self, kind: OperationKind, duration: Duration) -> Result<(), MetricError> {
        self.record(kind, self.unit.from_duration(duration))
    }

    /// Returns a point-in-time copy of the histogram for `kind`.
    pub fn snapshot(&self, kind: OperationKind) -> Option<LatencySnapshot> {
        let histogram = self.lock(kind).ok()?.clone();
        Some(LatencySnapshot {
            unit: self.unit,
            histogram,
        })
    }

    /// Returns snapshots for all kinds in id order.
    pub fn snapshots(&self) -> Vec<(OperationKind, LatencySnapshot)> {
        self.histograms
            .keys()
            .filter_map(|kind| Some((*kind, self.snapshot(*kind)?)))
            .collect()
    }

    /// Returns the number of observations recorded for `kind`.
    pub fn count(&self, kind: OperationKind) -> u64 {
        self.lock(kind).map(|h| h.len()).unwrap_or(0)
    }

    fn lock(&self, kind: OperationKind) -> Result<MutexGuard<'_, Histogram<u64>>, MetricError> {
        let histogram = self
            .histograms
            .get(&kind)
            .ok_or(MetricError::UnknownKind(kind))?;
        Ok(histogram.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A read-only copy of one kind's latency distribution.
#[derive(Clone, Debug)]
pub struct LatencySnapshot {
    unit: LatencyUnit,
    histogram: Histogram<u64>,
}

impl LatencySnapshot {
    /// Returns the unit of all values in this snapshot.
    pub fn unit(&self) -> LatencyUnit {
        self.unit
    }

    /// Returns the number of observations.
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Returns the arithmetic mean, or `0.0` if empty.
    pub fn mean(&self) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        self.histogram.mean()
    }

    /// Returns the smallest observation, if any.
    pub fn min(&self) -> Option<u64> {
        (!self.histogram.is_empty()).then(|| self.histogram.min())
    }

    /// Returns the largest observation, if any.
    pub fn max(&self) -> Option<u64> {
        (!self.histogram.is_empty()).then(|| self.histogram.max())
    }

    /// Returns the nearest-rank value at `percentile` (0 to 100), if any.
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        if self.histogram.is_empty() {
            return None;
        }
        Some(
            self.histogram
                .value_at_percentile(percentile.clamp(0.0, 100.0)),
        )
    }

    /// Returns the number of observations less than or equal to `value`.
    pub fn count_at_or_below(&self, value: u64) -> u64 {
        self.histogram.count_between(0, value)
    }

    /// Returns the mean as a [`Duration`].
    pub fn mean_duration(&self) -> Duration {
        let nanos_per_unit = self.unit.to_duration(1).as_nanos() as f64;
        Duration::from_nanos((self.mean() * nanos_per_unit).round() as u64)
    }
}

/// Per-kind gauges for how far dispatch trails the logical schedule.
///
/// Lag is only tracked under strict pacing, where it is the difference between the time an
/// operation was released and the time it was scheduled for. A growing lag means the
/// dispatcher cannot keep up with the configured rate.
#[derive(Debug)]
pub struct ScheduleLag {
    threshold: Duration,
    gauges: BTreeMap<OperationKind, LagGauge>,
}

#[derive(Debug, Default)]
struct LagGauge {
    current_nanos: AtomicU64,
    max_nanos: AtomicU64,
    late: AtomicU64,
    lagging: AtomicBool,
}

/// Point-in-time view of one kind's [`ScheduleLag`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LagSnapshot {
    /// Lag of the most recently released operation.
    #[serde(serialize_with = "serialize_nanos")]
    pub current: Duration,
    /// Largest lag seen during the run.
    #[serde(serialize_with = "serialize_nanos")]
    pub max: Duration,
    /// Number of operations released after their scheduled time.
    pub late: u64,
}

impl ScheduleLag {
    /// Creates gauges for `kinds`. Crossing `threshold` emits a warning once per episode.
    pub fn new(kinds: impl IntoIterator<Item = OperationKind>, threshold: Duration) -> Self {
        Self {
            threshold,
            gauges: kinds
                .into_iter()
                .map(|kind| (kind, LagGauge::default()))
                .collect(),
        }
    }

    /// Records the lag of one released operation of `kind`.
    pub fn observe(&self, kind: OperationKind, lag: Duration) {
        let Some(gauge) = self.gauges.get(&kind) else {
            return;
        };

        let nanos = u64::try_from(lag.as_nanos()).unwrap_or(u64::MAX);
        gauge.current_nanos.store(nanos, Ordering::Relaxed);
        gauge.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        if !lag.is_zero() {
            gauge.late.fetch_add(1, Ordering::Relaxed);
        }

        let lagging = lag > self.threshold;
        if gauge.lagging.swap(lagging, Ordering::Relaxed) != lagging {
            if lagging {
                tracing::warn!(%kind, ?lag, "operation stream fell behind schedule");
            } else {
                tracing::info!(%kind, ?lag, "operation stream caught up with schedule");
            }
        }
    }

    /// Returns the gauges of `kind`.
    pub fn snapshot(&self, kind: OperationKind) -> Option<LagSnapshot> {
        let gauge = self.gauges.get(&kind)?;
        Some(LagSnapshot {
            current: Duration::from_nanos(gauge.current_nanos.load(Ordering::Relaxed)),
            max: Duration::from_nanos(gauge.max_nanos.load(Ordering::Relaxed)),
            late: gauge.late.load(Ordering::Relaxed),
        })
    }
}

fn serialize_nanos<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX))
}
