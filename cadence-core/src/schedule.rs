//! Per-kind operation streams.
//!
//! A [`StreamSchedule`] describes the logical start times of one operation kind: the `i`-th
//! operation starts at `offset + i * interval * ratio`, plus an optional jitter. Times are
//! [`Duration`]s relative to the start of the run; mapping them onto the wall clock is the job of
//! the dispatcher and its [`PacingPolicy`].
//!
//! The compression ratio scales the whole timeline while keeping relative spacing intact:
//! `ratio < 1` runs the schedule faster than real time, `ratio > 1` slower.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::OperationKind;
use crate::error::ConfigError;

/// Mixes the sequence index into the jitter seed so neighbouring indices decorrelate.
const JITTER_SEED_MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;

/// One scheduled start of an operation, before parameters are attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    /// The operation kind.
    pub kind: OperationKind,
    /// Position within the kind's stream, starting at `0`.
    pub index: u64,
    /// Logical start time relative to the start of the run.
    pub at: Duration,
}

/// How scheduled start times relate to the wall clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingPolicy {
    /// An operation is not released before real time reaches its scheduled start.
    #[default]
    Strict,
    /// Scheduled starts are advisory and operations are released as fast as workers accept
    /// them, for measuring maximum throughput.
    Unthrottled,
}

/// What to do when strict pacing falls behind the schedule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LagPolicy {
    /// Release late operations immediately and let the lag grow. Nothing is skipped.
    #[default]
    CatchUp,
    /// Shift the remainder of the schedule so that lag never exceeds `max_lag`.
    ///
    /// Relative spacing after the shift is preserved, the run just ends later.
    Cap {
        /// Largest tolerated lag.
        max_lag: Duration,
    },
    /// Drop operations that are more than `tolerance` late.
    Skip {
        /// Largest lag at which operations still run.
        tolerance: Duration,
    },
}

/// The logical start times of one operation kind.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSchedule {
    kind: OperationKind,
    interval: Duration,
    ratio: f64,
    step_nanos: f64,
    offset: Duration,
    jitter_nanos: u64,
    seed: u64,
    limit: Option<u64>,
    horizon: Option<Duration>,
}

impl StreamSchedule {
    /// Creates an unbounded schedule of `kind` every `interval`, scaled by the compression
    /// `ratio`.
    pub fn new(kind: OperationKind, interval: Duration, ratio: f64) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::NonPositive {
                kind,
                what: "interval",
            });
        }
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(ConfigError::InvalidCompressionRatio(ratio));
        }

        Ok(Self {
            kind,
            interval,
            ratio,
            step_nanos: interval.as_nanos() as f64 * ratio,
            offset: Duration::ZERO,
            jitter_nanos: 0,
            seed: 0,
            limit: None,
            horizon: None,
        })
    }

    /// Shifts every start time by `offset`.
    pub fn offset(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    /// Adds a pseudo-random delay in `[0, jitter)` to every start time.
    ///
    /// The jitter is capped at one scaled interval so that start times never overtake each
    /// other, and it is derived from `seed` and the index so that restarting a stream reproduces
    /// the same times.
    pub fn jitter(mut self, jitter: Duration, seed: u64) -> Self {
        let max = self.step_nanos.floor() as u64;
        self.jitter_nanos = u64::try_from(jitter.as_nanos()).unwrap_or(u64::MAX).min(max);
        self.seed = seed;
        self
    }

    /// Ends the stream after `limit` operations.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Ends the stream before the first start time at or after `horizon`.
    pub fn horizon(mut self, horizon: Duration) -> Self {
        self.horizon = Some(horizon);
        self
    }

    /// Returns the kind of this stream.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Returns the unscaled pacing interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the compression ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Returns the start time of operation `index`, or `None` past the end of the stream.
    pub fn at(&self, index: u64) -> Option<Duration> {
        if self.limit.is_some_and(|limit| index >= limit) {
            return None;
        }

        let scaled = Duration::from_nanos((self.step_nanos * index as f64).round() as u64);
        let at = self.offset + scaled + self.jitter_at(index);

        if self.horizon.is_some_and(|horizon| at >= horizon) {
            return None;
        }
        Some(at)
    }

    fn jitter_at(&self, index: u64) -> Duration {
        if self.jitter_nanos == 0 {
            return Duration::ZERO;
        }
        let seed = self.seed ^ index.wrapping_mul(JITTER_SEED_MULTIPLIER);
        let mut rng = SmallRng::seed_from_u64(seed);
        Duration::from_nanos(rng.random_range(0..self.jitter_nanos))
    }
}

/// A lazy iterator over the [`Slot`]s of one [`StreamSchedule`].
///
/// The cursor holds nothing but the schedule and the next index, so streams of any length cost
/// constant memory, and [`restart_from`](Self::restart_from) can reposition it anywhere.
#[derive(Clone, Debug)]
pub struct StreamCursor {
    schedule: StreamSchedule,
    next: u64,
}

impl StreamCursor {
    /// Creates a cursor positioned at the first operation.
    pub fn new(schedule: StreamSchedule) -> Self {
        Self { schedule, next: 0 }
    }

    /// Repositions the cursor so the next slot has sequence index `index`.
    pub fn restart_from(&mut self, index: u64) {
        self.next = index;
    }

    /// Returns the sequence index of the next slot.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Returns the underlying schedule.
    pub fn schedule(&self) -> &StreamSchedule {
        &self.schedule
    }
}

impl Iterator for StreamCursor {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let at = self.schedule.at(self.next)?;
        let slot = Slot {
            kind: self.schedule.kind,
            index: self.next,
            at,
        };
        self.next += 1;
        Some(slot)
    }
}

/// Settings shared by all streams of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleOptions {
    /// Scale factor applied to every interval. Defaults to `1.0` (real time).
    pub compression_ratio: f64,
    /// Maximum jitter added to each start time. Defaults to none.
    pub jitter: Duration,
    /// Seed for the jitter.
    pub seed: u64,
    /// Start offset per kind. Kinds without an entry start at zero.
    pub offsets: BTreeMap<OperationKind, Duration>,
    /// Number of operations per kind. Kinds without an entry are unbounded.
    pub limits: BTreeMap<OperationKind, u64>,
    /// Logical end of the run. Defaults to none.
    pub horizon: Option<Duration>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            compression_ratio: 1.0,
            jitter: Duration::ZERO,
            seed: 0,
            offsets: BTreeMap::new(),
            limits: BTreeMap::new(),
            horizon: None,
        }
    }
}

impl ScheduleOptions {
    /// Builds the schedule for `kind` with the given resolved `interval`.
    pub fn stream(&self, kind: OperationKind, interval: Duration) -> Result<StreamSchedule, ConfigError> {
        let mut schedule = StreamSchedule::new(kind, interval, self.compression_ratio)?
            .offset(self.offsets.get(&kind).copied().unwrap_or_default());

        if !self.jitter.is_zero() {
            schedule = schedule.jitter(self.jitter, self.seed.wrapping_add(u64::from(kind.id())));
        }
        if let Some(limit) = self.limits.get(&kind) {
            schedule = schedule.limit(*limit);
        }
        if let Some(horizon) = self.horizon {
            schedule = schedule.horizon(horizon);
        }

        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIND: OperationKind = OperationKind::new(1);

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn times(cursor: StreamCursor) -> Vec<Duration> {
        cursor.map(|slot| slot.at).collect()
    }

    #[test]
    fn spaces_operations_by_interval() {
        let schedule = StreamSchedule::new(KIND, ms(100), 1.0)
            .unwrap()
            .offset(ms(5))
            .limit(4);

        assert_eq!(
            times(StreamCursor::new(schedule)),
            [ms(5), ms(105), ms(205), ms(305)]
        );
    }

    #[test]
    fn compression_scales_spacing() {
        let fast = StreamSchedule::new(KIND, ms(100), 0.25).unwrap().limit(3);
        assert_eq!(times(StreamCursor::new(fast)), [ms(0), ms(25), ms(50)]);

        let slow = StreamSchedule::new(KIND, ms(100), 2.0).unwrap().limit(3);
        assert_eq!(times(StreamCursor::new(slow)), [ms(0), ms(200), ms(400)]);
    }

    #[test]
    fn horizon_is_exclusive() {
        let schedule = StreamSchedule::new(KIND, ms(300), 1.0)
            .unwrap()
            .horizon(ms(1000));

        assert_eq!(
            times(StreamCursor::new(schedule)),
            [ms(0), ms(300), ms(600), ms(900)]
        );

        let schedule = StreamSchedule::new(KIND, ms(250), 1.0)
            .unwrap()
            .horizon(ms(1000));
        assert_eq!(StreamCursor::new(schedule).count(), 4);
    }

    #[test]
    fn cursor_restarts_from_index() {
        let schedule = StreamSchedule::new(KIND, ms(10), 1.0).unwrap().limit(6);
        let mut cursor = StreamCursor::new(schedule);

        assert_eq!(cursor.by_ref().take(4).count(), 4);
        assert_eq!(cursor.position(), 4);

        cursor.restart_from(1);
        let slot = cursor.next().unwrap();
        assert_eq!((slot.index, slot.at), (1, ms(10)));
        assert_eq!(cursor.count(), 4);
    }

    #[test]
    fn jitter_is_bounded_and_reproducible() {
        let schedule = StreamSchedule::new(KIND, ms(10), 1.0)
            .unwrap()
            .jitter(ms(50), 1234)
            .limit(1000);

        let first = times(StreamCursor::new(schedule.clone()));
        let second = times(StreamCursor::new(schedule));
        assert_eq!(first, second);

        for (index, at) in first.iter().enumerate() {
            let base = ms(10) * index as u32;
            assert!(*at >= base && *at < base + ms(10), "{at:?} vs {base:?}");
        }
        assert!(first.windows(2).all(|w| w[0] <= w[1]));
        assert!(first.iter().enumerate().any(|(i, at)| *at != ms(10) * i as u32));
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            StreamSchedule::new(KIND, Duration::ZERO, 1.0),
            Err(ConfigError::NonPositive {
                kind: KIND,
                what: "interval"
            })
        );
        for ratio in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                StreamSchedule::new(KIND, ms(1), ratio),
                Err(ConfigError::InvalidCompressionRatio(_))
            ));
        }
    }

    #[test]
    fn options_apply_per_kind_settings() {
        let other = OperationKind::new(2);
        let options = ScheduleOptions {
            compression_ratio: 0.5,
            offsets: [(other, ms(7))].into(),
            limits: [(KIND, 2)].into(),
            horizon: Some(ms(100)),
            ..Default::default()
        };

        let limited = options.stream(KIND, ms(10)).unwrap();
        assert_eq!(times(StreamCursor::new(limited)), [ms(0), ms(5)]);

        let shifted = options.stream(other, ms(40)).unwrap();
        assert_eq!(
            times(StreamCursor::new(shifted)),
            [ms(7), ms(27), ms(47), ms(67), ms(87)]
        );
    }
}
