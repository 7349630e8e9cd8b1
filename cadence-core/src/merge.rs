//! K-way merge of per-kind streams into one time-ordered sequence.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use crate::OperationKind;
use crate::error::ConfigError;
use crate::mix::ResolvedMix;
use crate::schedule::{ScheduleOptions, Slot, StreamCursor, StreamSchedule};

/// Heap entry ordered by time, then kind id, then sequence index.
///
/// The last field points into the cursor arena and never decides the order, since no two heads
/// share both kind and index.
type Head = Reverse<(Duration, OperationKind, u64, usize)>;

/// Merges the streams of all kinds into one globally ordered sequence of [`Slot`]s.
///
/// The merger holds exactly one pending slot per live stream, so its memory does not depend on
/// the length of the run. Slots come out in non-decreasing time order. Equal times are broken by
/// the lower kind id first and then the lower sequence index, so a kind's own slots are never
/// reordered.
///
/// As an [`Iterator`], the merger returns `None` once every stream is exhausted. Unbounded
/// streams never exhaust.
#[derive(Debug)]
pub struct GlobalMerger {
    cursors: Vec<StreamCursor>,
    heap: BinaryHeap<Head>,
}

impl GlobalMerger {
    /// Creates a merger over the given schedules.
    pub fn from_schedules(schedules: impl IntoIterator<Item = StreamSchedule>) -> Self {
        let cursors: Vec<_> = schedules.into_iter().map(StreamCursor::new).collect();
        let mut merger = Self {
            heap: BinaryHeap::with_capacity(cursors.len()),
            cursors,
        };

        for position in 0..merger.cursors.len() {
            merger.advance(position);
        }
        merger
    }

    /// Creates a merger with one stream per kind in `mix`.
    pub fn for_mix(mix: &ResolvedMix, options: &ScheduleOptions) -> Result<Self, ConfigError> {
        let schedules = mix
            .iter()
            .map(|(kind, interval)| options.stream(kind, interval))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            kinds = schedules.len(),
            ratio = options.compression_ratio,
            "merging operation streams"
        );
        Ok(Self::from_schedules(schedules))
    }

    /// Returns the time of the next slot without consuming it.
    pub fn peek_time(&self) -> Option<Duration> {
        self.heap.peek().map(|Reverse((at, ..))| *at)
    }

    /// Iterates over the kinds of all streams, including exhausted ones.
    pub fn kinds(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.cursors.iter().map(|cursor| cursor.schedule().kind())
    }

    /// Returns the number of streams that have not been exhausted.
    pub fn live_streams(&self) -> usize {
        self.heap.len()
    }

    /// Pulls the next slot of the cursor at `position` into the heap.
    fn advance(&mut self, position: usize) {
        if let Some(slot) = self.cursors[position].next() {
            self.heap
                .push(Reverse((slot.at, slot.kind, slot.index, position)));
        }
    }
}

impl Iterator for GlobalMerger {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let Reverse((at, kind, index, position)) = self.heap.pop()?;
        self.advance(position);
        Some(Slot { kind, index, at })
    }
}
