//! Operation mix resolution.
//!
//! A [`MixSpec`] says how often each operation kind runs, in one of two forms:
//!
//! - **Frequency**: every kind carries a positive integer meaning "this many reference units per
//!   execution". The reference kind (usually the update stream) supplies the length of one unit,
//!   so a larger frequency means a larger interval and a rarer operation.
//! - **Interleave**: every kind carries its absolute pacing interval directly.
//!
//! [`resolve`] validates the spec and turns it into a [`ResolvedMix`] of absolute intervals.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::OperationKind;
use crate::error::ConfigError;

/// How often one operation kind executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixEntry {
    /// Number of reference units between two executions of this kind.
    Frequency(u64),
    /// Absolute interval between two executions of this kind.
    Interleave(Duration),
}

/// The mechanism a mix was specified with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixForm {
    /// All kinds were given as frequencies relative to the reference kind.
    Frequency,
    /// All kinds were given as absolute interleaves.
    Interleave,
}

/// Declarative description of an operation mix.
///
/// Build it with the chained setters and pass it to [`resolve`]. Nothing is validated until
/// then, so the builder never fails.
#[derive(Clone, Debug, Default)]
pub struct MixSpec {
    kinds: BTreeSet<OperationKind>,
    reference: Option<(OperationKind, Duration)>,
    entries: BTreeMap<OperationKind, MixEntry>,
}

impl MixSpec {
    /// Creates an empty spec for the given set of kinds.
    pub fn new(kinds: impl IntoIterator<Item = OperationKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Sets the reference kind and the length of one reference unit.
    ///
    /// Only used by the frequency form.
    pub fn reference(mut self, kind: OperationKind, interval: Duration) -> Self {
        self.reference = Some((kind, interval));
        self
    }

    /// Specifies `kind` by frequency.
    pub fn frequency(self, kind: OperationKind, frequency: u64) -> Self {
        self.entry(kind, MixEntry::Frequency(frequency))
    }

    /// Specifies `kind` by absolute interleave.
    pub fn interleave(self, kind: OperationKind, interval: Duration) -> Self {
        self.entry(kind, MixEntry::Interleave(interval))
    }

    /// Specifies `kind` with an explicit entry, replacing any previous one.
    pub fn entry(mut self, kind: OperationKind, entry: MixEntry) -> Self {
        self.entries.insert(kind, entry);
        self
    }

    /// Returns the declared kinds in id order.
    pub fn kinds(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.kinds.iter().copied()
    }
}

/// Absolute pacing intervals per operation kind.
///
/// Produced by [`resolve`] and immutable afterwards. Every interval is strictly positive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMix {
    form: MixForm,
    reference: Option<OperationKind>,
    intervals: BTreeMap<OperationKind, Duration>,
}

impl ResolvedMix {
    /// Returns the pacing interval of `kind`, if it is part of the mix.
    pub fn interval(&self, kind: OperationKind) -> Option<Duration> {
        self.intervals.get(&kind).copied()
    }

    /// Returns the form the mix was specified in.
    pub fn form(&self) -> MixForm {
        self.form
    }

    /// Returns the reference kind of a frequency mix.
    pub fn reference(&self) -> Option<OperationKind> {
        self.reference
    }

    /// Iterates over all kinds and their intervals in id order.
    pub fn iter(&self) -> impl Iterator<Item = (OperationKind, Duration)> + '_ {
        self.intervals.iter().map(|(kind, interval)| (*kind, *interval))
    }

    /// Iterates over all kinds in id order.
    pub fn kinds(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.intervals.keys().copied()
    }

    /// Returns the number of kinds in the mix.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Returns `true` if the mix contains no kinds.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Returns a copy of the mix restricted to the kinds for which `keep` returns `true`.
    ///
    /// Intervals are not recomputed, so a disabled reference kind still defines the unit of the
    /// remaining kinds.
    pub fn select(&self, mut keep: impl FnMut(OperationKind) -> bool) -> Self {
        Self {
            form: self.form,
            reference: self.reference,
            intervals: self
                .intervals
                .iter()
                .filter(|(kind, _)| keep(**kind))
                .map(|(kind, interval)| (*kind, *interval))
                .collect(),
        }
    }
}

/// Validates `spec` and converts it into absolute intervals.
///
/// In frequency form the interval of every kind, the reference included, is
/// `frequency(kind) * unit`, where `unit` is the reference interval.
pub fn resolve(spec: &MixSpec) -> Result<ResolvedMix, ConfigError> {
    if spec.kinds.is_empty() {
        return Err(ConfigError::EmptyMix);
    }
    if let Some(kind) = spec.entries.keys().find(|k| !spec.kinds.contains(k)) {
        return Err(ConfigError::UndeclaredKind(*kind));
    }
    if let Some(kind) = spec.kinds.iter().find(|k| !spec.entries.contains_key(k)) {
        return Err(ConfigError::MissingEntry(*kind));
    }

    let form = form_of(spec)?;

    for (kind, entry) in &spec.entries {
        let (positive, what) = match entry {
            MixEntry::Frequency(frequency) => (*frequency > 0, "frequency"),
            MixEntry::Interleave(interval) => (!interval.is_zero(), "interleave"),
        };
        if !positive {
            return Err(ConfigError::NonPositive { kind: *kind, what });
        }
    }

    match form {
        MixForm::Interleave => {
            let intervals = spec
                .entries
                .iter()
                .filter_map(|(kind, entry)| match entry {
                    MixEntry::Interleave(interval) => Some((*kind, *interval)),
                    MixEntry::Frequency(_) => None,
                })
                .collect();

            Ok(ResolvedMix {
                form,
                reference: None,
                intervals,
            })
        }
        MixForm::Frequency => resolve_frequencies(spec),
    }
}

fn form_of(spec: &MixSpec) -> Result<MixForm, ConfigError> {
    let mut forms = spec.entries.values().map(|entry| match entry {
        MixEntry::Frequency(_) => MixForm::Frequency,
        MixEntry::Interleave(_) => MixForm::Interleave,
    });

    let first = forms.next().ok_or(ConfigError::EmptyMix)?;
    if forms.any(|form| form != first) {
        return Err(ConfigError::MixedForms);
    }

    Ok(first)
}

fn resolve_frequencies(spec: &MixSpec) -> Result<ResolvedMix, ConfigError> {
    let (reference, unit) = spec.reference.ok_or(ConfigError::MissingReference)?;
    if unit.is_zero() {
        return Err(ConfigError::NonPositive {
            kind: reference,
            what: "reference interval",
        });
    }
    if !spec.entries.contains_key(&reference) {
        return Err(ConfigError::ReferenceNotInMix(reference));
    }

    let unit_nanos = unit.as_nanos();
    let mut intervals = BTreeMap::new();
    for (kind, entry) in &spec.entries {
        let MixEntry::Frequency(frequency) = entry else {
            return Err(ConfigError::MixedForms);
        };

        let nanos = unit_nanos * u128::from(*frequency);
        let nanos = u64::try_from(nanos).map_err(|_| ConfigError::IntervalOverflow(*kind))?;

        intervals.insert(*kind, Duration::from_nanos(nanos));
    }

    Ok(ResolvedMix {
        form: MixForm::Frequency,
        reference: Some(reference),
        intervals,
    })
}
