//! Scripted collaborators for dispatcher tests.
//!
//! [`SequenceParams`] hands every operation its own identity as parameters, and
//! [`RecordingBackend`] remembers every call it receives and fails the calls it was told to.
//!
//! ```
//! use cadence_core::OperationKind;
//! use cadence_test::backend::{RecordingBackend, SequenceParams};
//!
//! let read = OperationKind::new(1);
//! let params = SequenceParams::new().limit(read, 10);
//! let backend = RecordingBackend::new().flaky(read, 3, 2).fail(read, 7);
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::dispatch::{Backend, ParamSource};
use cadence_core::{BackendError, OperationKind, ParamsError};
use tokio::time::Instant;

/// Identifies one scheduled operation. Used as parameters by [`SequenceParams`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId {
    /// The operation kind.
    pub kind: OperationKind,
    /// The sequence index within the kind.
    pub index: u64,
}

/// A [`ParamSource`] that passes the operation's own [`OperationId`].
#[derive(Debug, Default)]
pub struct SequenceParams {
    limits: BTreeMap<OperationKind, u64>,
}

impl SequenceParams {
    /// Creates a source without limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports [`ParamsError::Exhausted`] for `kind` from index `limit` on.
    pub fn limit(mut self, kind: OperationKind, limit: u64) -> Self {
        self.limits.insert(kind, limit);
        self
    }
}

impl ParamSource for SequenceParams {
    type Params = OperationId;

    fn fetch(&mut self, kind: OperationKind, index: u64) -> Result<OperationId, ParamsError> {
        match self.limits.get(&kind) {
            Some(limit) if index >= *limit => Err(ParamsError::Exhausted(kind)),
            _ => Ok(OperationId { kind, index }),
        }
    }
}

/// A call received by a [`RecordingBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Call {
    /// The operation that was executed.
    pub id: OperationId,
    /// Which attempt this was, starting at `1`.
    pub attempt: u32,
    /// When the call started, relative to the creation of the backend.
    pub at: Duration,
}

#[derive(Clone, Copy, Debug)]
enum Fault {
    Transient { attempts: u32 },
    Fatal,
}

/// A [`Backend`] that records its calls and fails on request.
///
/// Every call sleeps for the configured latency on the tokio clock, so tests running with paused
/// time observe exact latencies.
#[derive(Debug)]
pub struct RecordingBackend {
    started: Instant,
    latency: Duration,
    faults: BTreeMap<OperationId, Fault>,
    attempts: Mutex<BTreeMap<OperationId, u32>>,
    calls: Mutex<Vec<Call>>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    /// Creates a backend that succeeds immediately.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            latency: Duration::ZERO,
            faults: BTreeMap::new(),
            attempts: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    /// Lets every call take `latency`.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails operation `index` of `kind` with [`BackendError::Failed`] on every attempt.
    pub fn fail(mut self, kind: OperationKind, index: u64) -> Self {
        self.faults.insert(OperationId { kind, index }, Fault::Fatal);
        self
    }

    /// Fails the first `attempts` attempts of operation `index` of `kind` with
    /// [`BackendError::Transient`].
    pub fn flaky(mut self, kind: OperationKind, index: u64, attempts: u32) -> Self {
        self.faults
            .insert(OperationId { kind, index }, Fault::Transient { attempts });
        self
    }

    /// Returns all calls received so far, in the order they started.
    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the operations that ran at least once, in the order they first started.
    pub fn executed(&self) -> Vec<OperationId> {
        self.calls()
            .into_iter()
            .filter(|call| call.attempt == 1)
            .map(|call| call.id)
            .collect()
    }
}

#[async_trait]
impl Backend<OperationId> for RecordingBackend {
    async fn execute(&self, kind: OperationKind, id: &OperationId) -> Result<(), BackendError> {
        debug_assert_eq!(kind, id.kind);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let attempt = attempts.entry(*id).or_default();
            *attempt += 1;
            *attempt
        };
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Call {
                id: *id,
                attempt,
                at: self.started.elapsed(),
            });

        tokio::time::sleep(self.latency).await;

        match self.faults.get(id) {
            Some(Fault::Transient { attempts }) if attempt <= *attempts => Err(
                BackendError::Transient(format!("{kind} #{} attempt {attempt}", id.index)),
            ),
            Some(Fault::Fatal) => Err(BackendError::Failed(format!(
                "{kind} #{} rejected",
                id.index
            ))),
            _ => Ok(()),
        }
    }
}
