//! Bounded-concurrency execution of the merged operation sequence.
//!
//! A [`Dispatcher`] runs one producer task and a fixed pool of worker tasks connected by a bounded
//! channel. The producer pulls due slots from the [`GlobalMerger`], waits for their scheduled
//! time under [`PacingPolicy::Strict`], applies the [`LagPolicy`], fetches parameters from the
//! [`ParamSource`] and hands the resulting [`ScheduledOperation`] to the workers. Workers execute
//! operations against the [`Backend`], time the backend call and record it in the
//! [`LatencyRecorder`] unless the operation belongs to the warmup window.
//!
//! Failed operations never stop the run. They are counted in the [`RunSummary`] and, if the caller
//! subscribed with [`Dispatcher::failures`] before spawning, reported on the failure channel.

use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::OperationKind;
use crate::error::{BackendError, ConfigError, OperationError, ParamsError};
use crate::merge::GlobalMerger;
use crate::metrics::{LatencyRecorder, ScheduleLag};
use crate::schedule::{LagPolicy, PacingPolicy, Slot};

/// Supplies the arguments of scheduled operations.
///
/// The source is owned by the producer task and called in dispatch order, so it may keep
/// per-kind cursors over parameter files without any locking.
pub trait ParamSource: Send + 'static {
    /// The arguments passed to the [`Backend`].
    type Params: Send + Sync + 'static;

    /// Returns the parameters for operation `index` of `kind`.
    ///
    /// [`ParamsError::Exhausted`] fails this one operation. The run continues.
    fn fetch(&mut self, kind: OperationKind, index: u64) -> Result<Self::Params, ParamsError>;
}

/// The system under test.
#[async_trait]
pub trait Backend<P: Sync>: Send + Sync + 'static {
    /// Executes one operation of `kind`.
    ///
    /// Only the time spent in this call is recorded as latency.
    async fn execute(&self, kind: OperationKind, params: &P) -> Result<(), BackendError>;
}

/// How a backend failure is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// The operation is attempted again, up to the configured number of retries.
    Retryable,
    /// The operation fails immediately.
    Fatal,
}

type Classifier = dyn Fn(&BackendError) -> FailureClass + Send + Sync;

/// Classifies [`BackendError::Transient`] as retryable and everything else as fatal.
pub fn classify_transient(error: &BackendError) -> FailureClass {
    match error {
        BackendError::Transient(_) => FailureClass::Retryable,
        _ => FailureClass::Fatal,
    }
}

/// Decides whether and how often failed operations are attempted again.
///
/// Latency is only recorded for the attempt that succeeds.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
    classifier: Arc<Classifier>,
}

impl RetryPolicy {
    /// Creates a policy that retries retryable failures up to `max_retries` times.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::ZERO,
            classifier: Arc::new(classify_transient),
        }
    }

    /// Waits `backoff` before every retry.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the default [`classify_transient`] classifier.
    pub fn classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&BackendError) -> FailureClass + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Returns the maximum number of retries per operation.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Classifies a backend failure.
    pub fn classify(&self, error: &BackendError) -> FailureClass {
        (self.classifier)(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// The initial part of a run that is executed but not measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Warmup {
    /// Every operation is measured.
    #[default]
    None,
    /// The first `n` operations in dispatch order are not measured.
    Operations(u64),
    /// Operations scheduled before this logical time are not measured.
    Window(Duration),
}

impl Warmup {
    /// Returns whether the operation at global position `ordinal`, scheduled at `at`, is part of
    /// the warmup.
    pub fn contains(self, ordinal: u64, at: Duration) -> bool {
        match self {
            Self::None => false,
            Self::Operations(count) => ordinal < count,
            Self::Window(window) => at < window,
        }
    }
}

/// Settings of a [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Capacity of the channel between producer and workers.
    pub queue_capacity: usize,
    /// Whether the producer waits for scheduled times.
    pub pacing: PacingPolicy,
    /// What to do when strict pacing falls behind.
    pub lag: LagPolicy,
    /// Lag above which a kind is reported as falling behind.
    pub lag_warning: Duration,
    /// Operations excluded from measurement.
    pub warmup: Warmup,
    /// Retry behavior for failed backend calls.
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 256,
            pacing: PacingPolicy::Strict,
            lag: LagPolicy::CatchUp,
            lag_warning: Duration::from_secs(1),
            warmup: Warmup::None,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroCapacity("worker count"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("queue capacity"));
        }
        Ok(())
    }
}

/// An operation ready for execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledOperation<P> {
    /// The operation kind.
    pub kind: OperationKind,
    /// Position within the kind's stream.
    pub index: u64,
    /// Logical start time relative to the start of the run.
    pub scheduled_at: Duration,
    /// Whether the operation belongs to the warmup and is excluded from measurement.
    pub warmup: bool,
    /// Arguments for the backend.
    pub params: P,
}

/// A scheduled operation that did not complete.
#[derive(Debug)]
pub struct OperationFailure {
    /// The operation kind.
    pub kind: OperationKind,
    /// Position within the kind's stream.
    pub index: u64,
    /// Why the operation failed.
    pub error: OperationError,
}

/// Operation counts of one kind after a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    /// Operations handed to the workers.
    pub dispatched: u64,
    /// Successful operations whose latency was recorded.
    pub recorded: u64,
    /// Successful operations inside the warmup.
    pub warmup: u64,
    /// Operations that failed, including parameter failures.
    pub failed: u64,
    /// Retry attempts.
    pub retried: u64,
    /// Operations dropped by [`LagPolicy::Skip`].
    pub skipped: u64,
    /// Operations that were never completed because of a shutdown.
    pub abandoned: u64,
    /// Successful operations whose latency the recorder rejected, for example because it
    /// exceeded the trackable maximum.
    pub unrecorded: u64,
}

impl KindSummary {
    fn merge(mut self, other: &Self) -> Self {
        self.dispatched += other.dispatched;
        self.recorded += other.recorded;
        self.warmup += other.warmup;
        self.failed += other.failed;
        self.retried += other.retried;
        self.skipped += other.skipped;
        self.abandoned += other.abandoned;
        self.unrecorded += other.unrecorded;
        self
    }
}

/// Why a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Every stream was exhausted and all operations finished.
    Completed,
    /// A cooperative shutdown was requested.
    Shutdown,
    /// A forced shutdown cancelled in-flight operations.
    Aborted,
}

/// Outcome of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Counts per kind, in id order.
    pub kinds: BTreeMap<OperationKind, KindSummary>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Why the run ended.
    pub stop: StopReason,
}

impl RunSummary {
    /// Returns the counts of `kind`, or zeros if the kind was not part of the run.
    pub fn kind(&self, kind: OperationKind) -> KindSummary {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }

    /// Returns the counts summed over all kinds.
    pub fn total(&self) -> KindSummary {
        self.kinds
            .values()
            .fold(KindSummary::default(), KindSummary::merge)
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    dispatched: AtomicU64,
    recorded: AtomicU64,
    warmup: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
    abandoned: AtomicU64,
    unrecorded: AtomicU64,
}

impl KindCounters {
    fn summary(&self) -> KindSummary {
        KindSummary {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            warmup: self.warmup.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            unrecorded: self.unrecorded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Counters(BTreeMap<OperationKind, KindCounters>);

impl Counters {
    fn new(kinds: impl IntoIterator<Item = OperationKind>) -> Self {
        Self(
            kinds
                .into_iter()
                .map(|kind| (kind, KindCounters::default()))
                .collect(),
        )
    }

    fn incr(&self, kind: OperationKind, counter: fn(&KindCounters) -> &AtomicU64) {
        if let Some(counters) = self.0.get(&kind) {
            counter(counters).fetch_add(1, Ordering::Relaxed);
        }
    }

    fn summary(&self) -> BTreeMap<OperationKind, KindSummary> {
        self.0
            .iter()
            .map(|(kind, counters)| (*kind, counters.summary()))
            .collect()
    }
}

/// Requests the end of a run.
///
/// Cheap to clone and safe to use from any task or thread.
#[derive(Clone, Debug, Default)]
pub struct Stopper {
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl Stopper {
    /// Stops dispatching new operations and lets in-flight operations finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stops dispatching and cancels in-flight operations.
    pub fn abort(&self) {
        self.abort.cancel();
        self.shutdown.cancel();
    }

    /// Returns `true` once a shutdown of either kind was requested.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn reason(&self) -> StopReason {
        if self.abort.is_cancelled() {
            StopReason::Aborted
        } else if self.shutdown.is_cancelled() {
            StopReason::Shutdown
        } else {
            StopReason::Completed
        }
    }
}

/// Executes the merged operation sequence against a backend.
pub struct Dispatcher<S, B> {
    merger: GlobalMerger,
    params: S,
    backend: Arc<B>,
    recorder: Arc<LatencyRecorder>,
    lag: Arc<ScheduleLag>,
    config: DispatchConfig,
    failures: Option<mpsc::UnboundedSender<OperationFailure>>,
}

impl<S, B> fmt::Debug for Dispatcher<S, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("merger", &self.merger)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, B> Dispatcher<S, B>
where
    S: ParamSource,
    B: Backend<S::Params>,
{
    /// Creates a dispatcher for the streams of `merger`.
    ///
    /// Fails if the worker count or queue capacity is zero.
    pub fn new(
        merger: GlobalMerger,
        params: S,
        backend: Arc<B>,
        recorder: Arc<LatencyRecorder>,
        config: DispatchConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let lag = Arc::new(ScheduleLag::new(merger.kinds(), config.lag_warning));

        Ok(Self {
            merger,
            params,
            backend,
            recorder,
            lag,
            config,
            failures: None,
        })
    }

    /// Subscribes to the failure of individual operations.
    ///
    /// Every failed, abandoned or unrecorded operation is sent to the returned channel. Without a
    /// subscription failures are only counted. Calling this again replaces the previous channel.
    pub fn failures(&mut self) -> mpsc::UnboundedReceiver<OperationFailure> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.failures = Some(tx);
        rx
    }

    /// Returns the per-kind schedule lag gauges of this run.
    pub fn schedule_lag(&self) -> Arc<ScheduleLag> {
        Arc::clone(&self.lag)
    }

    /// Starts the producer and the workers on the current tokio runtime.
    pub fn spawn(self) -> DispatchHandle<S::Params> {
        let Self {
            merger,
            params,
            backend,
            recorder,
            lag,
            config,
            failures,
        } = self;

        let started = Instant::now();
        let stopper = Stopper::default();
        let counters = Arc::new(Counters::new(merger.kinds()));
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        tracing::info!(
            workers = config.workers,
            pacing = ?config.pacing,
            lag = ?config.lag,
            "starting dispatch"
        );

        let producer = Producer {
            merger,
            params,
            queue: queue_tx,
            failures: failures.clone(),
            counters: Arc::clone(&counters),
            lag: Arc::clone(&lag),
            stopper: stopper.clone(),
            pacing: config.pacing,
            lag_policy: config.lag,
            warmup: config.warmup,
            started,
        };
        let producer = tokio::spawn(producer.run());

        let worker = Arc::new(Worker {
            backend,
            recorder,
            counters: Arc::clone(&counters),
            failures,
            retry: config.retry,
            stopper: stopper.clone(),
        });
        let mut workers = JoinSet::new();
        for _ in 0..config.workers {
            workers.spawn(Arc::clone(&worker).run(Arc::clone(&queue_rx)));
        }

        DispatchHandle {
            producer,
            workers,
            queue: queue_rx,
            counters,
            lag,
            stopper,
            started,
        }
    }

    /// Runs to completion and returns the summary.
    pub async fn run(self) -> RunSummary {
        self.spawn().join().await
    }
}

/// A running dispatch.
pub struct DispatchHandle<P> {
    producer: JoinHandle<()>,
    workers: JoinSet<()>,
    queue: Arc<Mutex<mpsc::Receiver<ScheduledOperation<P>>>>,
    counters: Arc<Counters>,
    lag: Arc<ScheduleLag>,
    stopper: Stopper,
    started: Instant,
}

impl<P> fmt::Debug for DispatchHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("stopper", &self.stopper)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl<P: Send + 'static> DispatchHandle<P> {
    /// Returns a handle to stop the run.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// Returns the per-kind schedule lag gauges.
    pub fn schedule_lag(&self) -> &Arc<ScheduleLag> {
        &self.lag
    }

    /// Waits for the producer and all workers to finish and returns the summary.
    pub async fn join(self) -> RunSummary {
        let Self {
            producer,
            mut workers,
            queue,
            counters,
            stopper,
            started,
            ..
        } = self;

        if let Err(error) = producer.await {
            tracing::error!(error = &error as &dyn Error, "dispatch producer failed");
        }
        while let Some(result) = workers.join_next().await {
            if let Err(error) = result {
                tracing::error!(error = &error as &dyn Error, "dispatch worker failed");
            }
        }

        let mut queue = queue.lock().await;
        queue.close();
        while let Ok(operation) = queue.try_recv() {
            counters.incr(operation.kind, |c| &c.abandoned);
        }

        let summary = RunSummary {
            kinds: counters.summary(),
            elapsed: started.elapsed(),
            stop: stopper.reason(),
        };
        tracing::info!(
            stop = ?summary.stop,
            elapsed = ?summary.elapsed,
            "dispatch finished"
        );
        summary
    }
}

struct Producer<S: ParamSource> {
    merger: GlobalMerger,
    params: S,
    queue: mpsc::Sender<ScheduledOperation<S::Params>>,
    failures: Option<mpsc::UnboundedSender<OperationFailure>>,
    counters: Arc<Counters>,
    lag: Arc<ScheduleLag>,
    stopper: Stopper,
    pacing: PacingPolicy,
    lag_policy: LagPolicy,
    warmup: Warmup,
    started: Instant,
}

impl<S: ParamSource> Producer<S> {
    async fn run(mut self) {
        // Accumulated delay of the schedule under `LagPolicy::Cap`.
        let mut shift = Duration::ZERO;
        let mut ordinal = 0;

        while !self.stopper.is_stopping() {
            let Some(slot) = self.merger.next() else {
                tracing::debug!("all operation streams exhausted");
                break;
            };
            let position = ordinal;
            ordinal += 1;

            if self.pacing == PacingPolicy::Strict {
                let deadline = self.started + slot.at + shift;
                tokio::select! {
                    biased;
                    _ = self.stopper.shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                let mut lag = Instant::now().saturating_duration_since(deadline);
                match self.lag_policy {
                    LagPolicy::CatchUp => {}
                    LagPolicy::Cap { max_lag } => {
                        if lag > max_lag {
                            shift += lag - max_lag;
                            lag = max_lag;
                        }
                    }
                    LagPolicy::Skip { tolerance } => {
                        if lag > tolerance {
                            tracing::debug!(
                                kind = %slot.kind,
                                index = slot.index,
                                ?lag,
                                "skipping late operation"
                            );
                            self.counters.incr(slot.kind, |c| &c.skipped);
                            continue;
                        }
                    }
                }
                self.lag.observe(slot.kind, lag);
            }

            let params = match self.params.fetch(slot.kind, slot.index) {
                Ok(params) => params,
                Err(error) => {
                    self.fail(slot, error);
                    continue;
                }
            };

            let operation = ScheduledOperation {
                kind: slot.kind,
                index: slot.index,
                scheduled_at: slot.at,
                warmup: self.warmup.contains(position, slot.at),
                params,
            };

            tokio::select! {
                biased;
                _ = self.stopper.shutdown.cancelled() => {
                    self.counters.incr(slot.kind, |c| &c.abandoned);
                    break;
                }
                sent = self.queue.send(operation) => {
                    if sent.is_err() {
                        break;
                    }
                    self.counters.incr(slot.kind, |c| &c.dispatched);
                }
            }
        }
    }

    fn fail(&self, slot: Slot, error: ParamsError) {
        tracing::debug!(
            kind = %slot.kind,
            index = slot.index,
            error = &error as &dyn Error,
            "failed to fetch operation parameters"
        );
        self.counters.incr(slot.kind, |c| &c.failed);
        report(
            self.failures.as_ref(),
            OperationFailure {
                kind: slot.kind,
                index: slot.index,
                error: error.into(),
            },
        );
    }
}

struct Worker<B> {
    backend: Arc<B>,
    recorder: Arc<LatencyRecorder>,
    counters: Arc<Counters>,
    failures: Option<mpsc::UnboundedSender<OperationFailure>>,
    retry: RetryPolicy,
    stopper: Stopper,
}

impl<B> Worker<B> {
    async fn run<P>(self: Arc<Self>, queue: Arc<Mutex<mpsc::Receiver<ScheduledOperation<P>>>>)
    where
        P: Send + Sync + 'static,
        B: Backend<P>,
    {
        loop {
            let next = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = self.stopper.shutdown.cancelled() => None,
                    operation = queue.recv() => operation,
                }
            };
            let Some(operation) = next else {
                break;
            };

            self.process(operation).await;
        }
    }

    async fn process<P>(&self, operation: ScheduledOperation<P>)
    where
        P: Send + Sync + 'static,
        B: Backend<P>,
    {
        let kind = operation.kind;

        let error = match self.execute(&operation).await {
            Ok(_) if operation.warmup => {
                self.counters.incr(kind, |c| &c.warmup);
                return;
            }
            Ok(latency) => match self.recorder.record_duration(kind, latency) {
                Ok(()) => {
                    self.counters.incr(kind, |c| &c.recorded);
                    return;
                }
                Err(error) => OperationError::from(error),
            },
            Err(error) => error,
        };

        match &error {
            OperationError::Cancelled => self.counters.incr(kind, |c| &c.abandoned),
            OperationError::Metric(metric) => {
                tracing::warn!(
                    %kind,
                    index = operation.index,
                    error = metric as &dyn Error,
                    "failed to record latency"
                );
                self.counters.incr(kind, |c| &c.unrecorded);
            }
            _ => {
                tracing::debug!(
                    %kind,
                    index = operation.index,
                    error = &error as &dyn Error,
                    "operation failed"
                );
                self.counters.incr(kind, |c| &c.failed);
            }
        }

        report(
            self.failures.as_ref(),
            OperationFailure {
                kind,
                index: operation.index,
                error,
            },
        );
    }

    /// Runs the backend call with retries and returns the latency of the successful attempt.
    async fn execute<P>(&self, operation: &ScheduledOperation<P>) -> Result<Duration, OperationError>
    where
        P: Send + Sync + 'static,
        B: Backend<P>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let started = Instant::now();
            let call = AssertUnwindSafe(self.backend.execute(operation.kind, &operation.params))
                .catch_unwind();
            let result = tokio::select! {
                biased;
                _ = self.stopper.abort.cancelled() => return Err(OperationError::Cancelled),
                result = call => result.unwrap_or_else(|panic| Err(panicked(panic))),
            };
            let latency = started.elapsed();

            let error = match result {
                Ok(()) => return Ok(latency),
                Err(error) => error,
            };

            let retryable = self.retry.classify(&error) == FailureClass::Retryable;
            if !retryable || attempts > self.retry.max_retries {
                return Err(OperationError::Backend {
                    attempts,
                    source: error,
                });
            }

            tracing::debug!(
                kind = %operation.kind,
                index = operation.index,
                attempts,
                error = &error as &dyn Error,
                "retrying operation"
            );
            self.counters.incr(operation.kind, |c| &c.retried);

            if !self.retry.backoff.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.stopper.abort.cancelled() => return Err(OperationError::Cancelled),
                    _ = tokio::time::sleep(self.retry.backoff) => {}
                }
            }
        }
    }
}

fn report(failures: Option<&mpsc::UnboundedSender<OperationFailure>>, failure: OperationFailure) {
    if let Some(failures) = failures {
        // The receiver may have been dropped by the caller, which just discards the report.
        let _ = failures.send(failure);
    }
}

fn panicked(panic: Box<dyn Any + Send + 'static>) -> BackendError {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "no error details".to_owned()
    };

    tracing::error!("panic in backend: {detail}");
    BackendError::Failed(format!("backend panicked: {detail}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as SyncMutex;

    use super::*;
    use crate::error::MetricError;
    use crate::metrics::LatencyUnit;
    use crate::schedule::StreamSchedule;

    const READ: OperationKind = OperationKind::new(1);
    const WRITE: OperationKind = OperationKind::new(2);

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    /// Passes the sequence index as the only parameter.
    struct Indexes;

    impl ParamSource for Indexes {
        type Params = u64;

        fn fetch(&mut self, _kind: OperationKind, index: u64) -> Result<u64, ParamsError> {
            Ok(index)
        }
    }

    #[derive(Default)]
    struct Script {
        latency: Duration,
        transient_attempts: u32,
        transient_latency: Duration,
        fatal: Option<u64>,
        panic: Option<u64>,
    }

    struct TestBackend {
        script: Script,
        started: Instant,
        attempts: SyncMutex<BTreeMap<u64, u32>>,
        calls: SyncMutex<Vec<(OperationKind, u64, Duration)>>,
    }

    impl TestBackend {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                started: Instant::now(),
                attempts: Default::default(),
                calls: Default::default(),
            })
        }

        fn calls(&self) -> Vec<(OperationKind, u64, Duration)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend<u64> for TestBackend {
        async fn execute(&self, kind: OperationKind, index: &u64) -> Result<(), BackendError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let attempt = attempts.entry(*index).or_default();
                *attempt += 1;
                *attempt
            };
            self.calls
                .lock()
                .unwrap()
                .push((kind, *index, self.started.elapsed()));

            if self.script.panic == Some(*index) {
                panic!("backend blew up");
            }
            if attempt <= self.script.transient_attempts {
                tokio::time::sleep(self.script.transient_latency).await;
                return Err(BackendError::Transient("conflict".into()));
            }

            tokio::time::sleep(self.script.latency).await;
            if self.script.fatal == Some(*index) {
                return Err(BackendError::Failed("rejected".into()));
            }
            Ok(())
        }
    }

    fn recorder() -> Arc<LatencyRecorder> {
        Arc::new(
            LatencyRecorder::new([READ, WRITE], LatencyUnit::Micros, Duration::from_secs(60), 3)
                .unwrap(),
        )
    }

    fn reads(interval: Duration, limit: u64) -> GlobalMerger {
        GlobalMerger::from_schedules([StreamSchedule::new(READ, interval, 1.0)
            .unwrap()
            .limit(limit)])
    }

    fn dispatcher(
        merger: GlobalMerger,
        backend: &Arc<TestBackend>,
        recorder: &Arc<LatencyRecorder>,
        config: DispatchConfig,
    ) -> Dispatcher<Indexes, TestBackend> {
        Dispatcher::new(
            merger,
            Indexes,
            Arc::clone(backend),
            Arc::clone(recorder),
            config,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn strict_pacing_follows_schedule() {
        let backend = TestBackend::new(Script::default());
        let recorder = recorder();
        let merger = GlobalMerger::from_schedules([
            StreamSchedule::new(READ, ms(100), 1.0).unwrap().limit(4),
            StreamSchedule::new(WRITE, ms(150), 1.0).unwrap().limit(3),
        ]);

        let summary = dispatcher(merger, &backend, &recorder, DispatchConfig::default())
            .run()
            .await;

        assert_eq!(summary.stop, StopReason::Completed);
        assert_eq!(
            backend.calls(),
            [
                (READ, 0, ms(0)),
                (WRITE, 0, ms(0)),
                (READ, 1, ms(100)),
                (WRITE, 1, ms(150)),
                (READ, 2, ms(200)),
                (READ, 3, ms(300)),
                (WRITE, 2, ms(300)),
            ]
        );
        assert_eq!(summary.kind(READ).recorded, 4);
        assert_eq!(summary.kind(WRITE).recorded, 3);
        assert_eq!(recorder.count(READ), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unthrottled_ignores_schedule() {
        let backend = TestBackend::new(Script::default());
        let recorder = recorder();
        let config = DispatchConfig {
            pacing: PacingPolicy::Unthrottled,
            ..Default::default()
        };

        let summary = dispatcher(reads(Duration::from_secs(10), 20), &backend, &recorder, config)
            .run()
            .await;

        assert_eq!(summary.kind(READ).recorded, 20);
        assert!(summary.elapsed < Duration::from_secs(1));
        assert!(backend.calls().iter().all(|(.., at)| at.is_zero()));
    }

    #[tokio::test(start_paused = true)]
    async fn warmup_operations_are_not_recorded() {
        let backend = TestBackend::new(Script::default());
        let recorder = recorder();
        let config = DispatchConfig {
            warmup: Warmup::Operations(3),
            ..Default::default()
        };

        let summary = dispatcher(reads(ms(10), 10), &backend, &recorder, config)
            .run()
            .await;

        assert_eq!(summary.kind(READ).warmup, 3);
        assert_eq!(summary.kind(READ).recorded, 7);
        assert_eq!(recorder.count(READ), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn warmup_window_uses_scheduled_time() {
        let backend = TestBackend::new(Script::default());
        let recorder = recorder();
        let config = DispatchConfig {
            warmup: Warmup::Window(ms(45)),
            ..Default::default()
        };

        let summary = dispatcher(reads(ms(10), 10), &backend, &recorder, config)
            .run()
            .await;

        // Scheduled at 0, 10, 20, 30 and 40ms.
        assert_eq!(summary.kind(READ).warmup, 5);
        assert_eq!(recorder.count(READ), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_record_only_successful_attempt() {
        let backend = TestBackend::new(Script {
            latency: ms(5),
            transient_attempts: 2,
            transient_latency: ms(40),
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            retry: RetryPolicy::new(3),
            ..Default::default()
        };

        let summary = dispatcher(reads(ms(100), 2), &backend, &recorder, config)
            .run()
            .await;

        assert_eq!(summary.kind(READ).retried, 4);
        assert_eq!(summary.kind(READ).recorded, 2);
        assert_eq!(summary.kind(READ).failed, 0);

        // Only the 5ms successful attempts end up in the histogram.
        let max = recorder.snapshot(READ).unwrap().max().unwrap();
        assert!((5000..5010).contains(&max), "{max}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_reported() {
        let backend = TestBackend::new(Script {
            transient_attempts: 10,
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            retry: RetryPolicy::new(2),
            ..Default::default()
        };

        let mut dispatcher = dispatcher(reads(ms(10), 1), &backend, &recorder, config);
        let mut failures = dispatcher.failures();
        let summary = dispatcher.run().await;

        assert_eq!(summary.kind(READ).failed, 1);
        assert_eq!(summary.kind(READ).retried, 2);

        let failure = failures.recv().await.unwrap();
        assert!(matches!(
            failure.error,
            OperationError::Backend {
                attempts: 3,
                source: BackendError::Transient(_)
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_disables_retries() {
        let backend = TestBackend::new(Script {
            transient_attempts: 1,
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            retry: RetryPolicy::new(5).classifier(|_| FailureClass::Fatal),
            ..Default::default()
        };

        let summary = dispatcher(reads(ms(10), 3), &backend, &recorder, config)
            .run()
            .await;

        assert_eq!(summary.kind(READ).failed, 3);
        assert_eq!(summary.kind(READ).retried, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latencies_beyond_the_recorder_are_reported() {
        let backend = TestBackend::new(Script {
            latency: Duration::from_secs(2),
            ..Default::default()
        });
        let recorder = Arc::new(
            LatencyRecorder::new([READ], LatencyUnit::Micros, Duration::from_secs(1), 3).unwrap(),
        );
        let config = DispatchConfig {
            workers: 3,
            ..Default::default()
        };

        let mut dispatcher = dispatcher(reads(ms(10), 3), &backend, &recorder, config);
        let mut failures = dispatcher.failures();
        let summary = dispatcher.run().await;

        let read = summary.kind(READ);
        assert_eq!(read.dispatched, 3);
        assert_eq!(read.unrecorded, 3);
        assert_eq!(read.recorded + read.warmup + read.failed + read.abandoned, 0);
        assert_eq!(recorder.count(READ), 0);

        let mut reported = 0;
        while let Ok(failure) = failures.try_recv() {
            assert!(matches!(
                failure.error,
                OperationError::Metric(MetricError::OutOfRange { .. })
            ));
            reported += 1;
        }
        assert_eq!(reported, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_without_subscriber() {
        let backend = TestBackend::new(Script {
            fatal: Some(1),
            ..Default::default()
        });
        let recorder = recorder();

        let summary = dispatcher(reads(ms(10), 3), &backend, &recorder, DispatchConfig::default())
            .run()
            .await;

        assert_eq!(summary.stop, StopReason::Completed);
        assert_eq!(summary.kind(READ).recorded, 2);
        assert_eq!(summary.kind(READ).failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_are_isolated() {
        let backend = TestBackend::new(Script {
            latency: ms(1),
            fatal: Some(2),
            panic: Some(4),
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            retry: RetryPolicy::new(3),
            workers: 2,
            ..Default::default()
        };

        let mut dispatcher = dispatcher(reads(ms(10), 6), &backend, &recorder, config);
        let mut failures = dispatcher.failures();
        let summary = dispatcher.run().await;

        assert_eq!(summary.stop, StopReason::Completed);
        assert_eq!(summary.kind(READ).recorded, 4);
        assert_eq!(summary.kind(READ).failed, 2);
        assert_eq!(summary.kind(READ).retried, 0);

        let mut failed = Vec::new();
        while let Ok(failure) = failures.try_recv() {
            assert!(matches!(
                failure.error,
                OperationError::Backend { attempts: 1, .. }
            ));
            failed.push(failure.index);
        }
        failed.sort();
        assert_eq!(failed, [2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_params_fail_the_operation() {
        struct Limited(u64);

        impl ParamSource for Limited {
            type Params = u64;

            fn fetch(&mut self, kind: OperationKind, index: u64) -> Result<u64, ParamsError> {
                if index < self.0 {
                    Ok(index)
                } else {
                    Err(ParamsError::Exhausted(kind))
                }
            }
        }

        let backend = TestBackend::new(Script::default());
        let recorder = recorder();
        let mut dispatcher = Dispatcher::new(
            reads(ms(10), 5),
            Limited(3),
            Arc::clone(&backend),
            Arc::clone(&recorder),
            DispatchConfig::default(),
        )
        .unwrap();

        let mut failures = dispatcher.failures();
        let summary = dispatcher.run().await;

        assert_eq!(summary.kind(READ).recorded, 3);
        assert_eq!(summary.kind(READ).failed, 2);
        assert_eq!(summary.kind(READ).dispatched, 3);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.index, 3);
        assert!(matches!(
            failure.error,
            OperationError::Params(ParamsError::Exhausted(READ))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_in_flight_operations_finish() {
        let backend = TestBackend::new(Script {
            latency: Duration::from_secs(1),
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            workers: 2,
            queue_capacity: 1,
            ..Default::default()
        };

        let merger = GlobalMerger::from_schedules([StreamSchedule::new(READ, ms(10), 1.0).unwrap()]);
        let handle = dispatcher(merger, &backend, &recorder, config).spawn();

        tokio::time::sleep(ms(55)).await;
        handle.stopper().shutdown();
        let summary = handle.join().await;

        assert_eq!(summary.stop, StopReason::Shutdown);
        assert_eq!(summary.kind(READ).recorded, 2);
        assert!(summary.kind(READ).abandoned >= 1);
        assert!(summary.elapsed >= Duration::from_secs(1));
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_in_flight_operations() {
        let backend = TestBackend::new(Script {
            latency: Duration::from_secs(60),
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            workers: 2,
            queue_capacity: 1,
            ..Default::default()
        };

        let merger = GlobalMerger::from_schedules([StreamSchedule::new(READ, ms(10), 1.0).unwrap()]);
        let mut dispatcher = dispatcher(merger, &backend, &recorder, config);
        let mut failures = dispatcher.failures();
        let handle = dispatcher.spawn();

        tokio::time::sleep(ms(55)).await;
        handle.stopper().abort();
        let summary = handle.join().await;

        assert_eq!(summary.stop, StopReason::Aborted);
        assert_eq!(summary.kind(READ).recorded, 0);
        assert!(summary.elapsed < Duration::from_secs(1));
        assert_eq!(recorder.count(READ), 0);

        let mut cancelled = 0;
        while let Ok(failure) = failures.try_recv() {
            assert!(matches!(failure.error, OperationError::Cancelled));
            cancelled += 1;
        }
        assert_eq!(cancelled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_never_skips() {
        let backend = TestBackend::new(Script {
            latency: ms(50),
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            workers: 1,
            queue_capacity: 1,
            ..Default::default()
        };

        let handle = dispatcher(reads(ms(10), 20), &backend, &recorder, config).spawn();
        let lag = Arc::clone(handle.schedule_lag());
        let summary = handle.join().await;

        assert_eq!(summary.kind(READ).recorded, 20);
        assert_eq!(summary.kind(READ).skipped, 0);

        let lag = lag.snapshot(READ).unwrap();
        assert!(lag.max > ms(500), "{lag:?}");
        assert!(lag.late > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_bounds_lag() {
        let backend = TestBackend::new(Script {
            latency: ms(50),
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            workers: 1,
            queue_capacity: 1,
            lag: LagPolicy::Cap { max_lag: ms(20) },
            ..Default::default()
        };

        let handle = dispatcher(reads(ms(10), 20), &backend, &recorder, config).spawn();
        let lag = Arc::clone(handle.schedule_lag());
        let summary = handle.join().await;

        assert_eq!(summary.kind(READ).recorded, 20);
        assert_eq!(summary.kind(READ).skipped, 0);
        assert!(lag.snapshot(READ).unwrap().max <= ms(20));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_drops_late_operations() {
        let backend = TestBackend::new(Script {
            latency: ms(50),
            ..Default::default()
        });
        let recorder = recorder();
        let config = DispatchConfig {
            workers: 1,
            queue_capacity: 1,
            lag: LagPolicy::Skip { tolerance: ms(5) },
            ..Default::default()
        };

        let summary = dispatcher(reads(ms(10), 20), &backend, &recorder, config)
            .run()
            .await;

        let read = summary.kind(READ);
        assert!(read.skipped > 0);
        assert_eq!(read.recorded + read.skipped, 20);
        assert_eq!(summary.total(), read);
    }

    #[tokio::test]
    async fn rejects_zero_capacity() {
        let backend = TestBackend::new(Script::default());
        let recorder = recorder();

        for (workers, queue_capacity, what) in [(0, 1, "worker count"), (1, 0, "queue capacity")] {
            let config = DispatchConfig {
                workers,
                queue_capacity,
                ..Default::default()
            };
            let result = Dispatcher::new(
                reads(ms(1), 1),
                Indexes,
                Arc::clone(&backend),
                Arc::clone(&recorder),
                config,
            );
            assert_eq!(result.unwrap_err(), ConfigError::ZeroCapacity(what));
        }
    }

    #[test]
    fn warmup_boundaries() {
        assert!(!Warmup::None.contains(0, Duration::ZERO));
        assert!(Warmup::Operations(2).contains(1, ms(500)));
        assert!(!Warmup::Operations(2).contains(2, Duration::ZERO));
        assert!(Warmup::Window(ms(10)).contains(99, ms(9)));
        assert!(!Warmup::Window(ms(10)).contains(0, ms(10)));
    }
}
