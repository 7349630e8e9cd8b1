//! Builds a run from the configuration and drives it to completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_core::OperationKind;
use cadence_core::dispatch::{DispatchHandle, Dispatcher, OperationFailure, Stopper};
use cadence_core::merge::GlobalMerger;
use cadence_core::metrics::LatencyRecorder;
use cadence_core::mix::ResolvedMix;
use cadence_core::sampler::ZipfianSampler;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::report::Report;
use crate::simulated::{KeyOp, KeyParams, SimulatedBackend};

/// A fully constructed run that has not started yet.
#[derive(Debug)]
pub struct Workload {
    names: BTreeMap<OperationKind, String>,
    mix: ResolvedMix,
    recorder: Arc<LatencyRecorder>,
    backend: Arc<SimulatedBackend>,
    dispatcher: Dispatcher<KeyParams, SimulatedBackend>,
}

impl Workload {
    /// Validates `config` and builds all components of the run.
    pub fn new(config: &Config) -> Result<Self> {
        let mix = config.mix.resolve()?;
        let options = config.mix.schedule_options(&config.run);
        let merger = GlobalMerger::for_mix(&mix, &options).context("invalid schedule")?;

        let recorder = LatencyRecorder::new(
            mix.kinds(),
            config.measurement.unit,
            config.measurement.max_latency,
            config.measurement.significant_digits,
        )
        .context("invalid measurement configuration")?;

        let sampler = ZipfianSampler::builder(config.keys.initial_items)
            .zipfian_constant(config.keys.zipfian_constant)
            .build()
            .context("invalid key space")?;
        let sampler = Arc::new(sampler);

        let seed = config.run.seed;
        let params = KeyParams::new(Arc::clone(&sampler), config.mix.access(), seed)
            .available(config.mix.parameters())
            .scrambled(config.keys.scrambled);
        let backend = SimulatedBackend::new(&config.backend, sampler, seed.wrapping_add(1))?;
        let backend = Arc::new(backend);
        let recorder = Arc::new(recorder);

        let dispatcher = Dispatcher::new(
            merger,
            params,
            Arc::clone(&backend),
            Arc::clone(&recorder),
            config.run.dispatch_config(),
        )
        .context("invalid run configuration")?;

        Ok(Self {
            names: config.mix.names(),
            mix,
            recorder,
            backend,
            dispatcher,
        })
    }

    /// Returns the resolved intervals of all operations in the run.
    pub fn mix(&self) -> &ResolvedMix {
        &self.mix
    }

    /// Starts dispatching on the current tokio runtime.
    pub fn start(self) -> RunningWorkload {
        let mut dispatcher = self.dispatcher;
        let failures = tokio::spawn(log_failures(dispatcher.failures(), self.names.clone()));
        let handle = dispatcher.spawn();

        RunningWorkload {
            names: self.names,
            mix: self.mix,
            recorder: self.recorder,
            backend: self.backend,
            handle,
            failures,
        }
    }
}

/// A run in progress.
#[derive(Debug)]
pub struct RunningWorkload {
    names: BTreeMap<OperationKind, String>,
    mix: ResolvedMix,
    recorder: Arc<LatencyRecorder>,
    backend: Arc<SimulatedBackend>,
    handle: DispatchHandle<KeyOp>,
    failures: JoinHandle<()>,
}

impl RunningWorkload {
    /// Returns a handle to stop the run early.
    pub fn stopper(&self) -> Stopper {
        self.handle.stopper()
    }

    /// Waits for the run to end and collects its report.
    pub async fn finish(self) -> Report {
        let lag = Arc::clone(self.handle.schedule_lag());
        let summary = self.handle.join().await;

        if let Err(error) = self.failures.await {
            tracing::error!(error = &error as &dyn std::error::Error, "failure log panicked");
        }

        let total = summary.total();
        tracing::info!(
            stop = ?summary.stop,
            elapsed = ?summary.elapsed,
            recorded = total.recorded,
            failed = total.failed,
            unrecorded = total.unrecorded,
            skipped = total.skipped,
            "run finished"
        );

        Report::new(&summary, &self.mix, &self.names, &self.recorder, &lag)
            .with_keys(self.backend.stats())
    }
}

/// Runs the configured workload until it completes or is interrupted.
///
/// The first interrupt (Ctrl-C) stops scheduling and lets running operations finish, a second
/// one cancels them.
pub async fn run(config: &Config) -> Result<Report> {
    let running = Workload::new(config)?.start();
    let signals = tokio::spawn(handle_signals(running.stopper()));

    let report = running.finish().await;
    signals.abort();

    Ok(report)
}

async fn handle_signals(stopper: Stopper) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to listen for interrupts");
        return;
    }
    tracing::info!("interrupted, waiting for running operations (interrupt again to abort)");
    stopper.shutdown();

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupted again, aborting running operations");
        stopper.abort();
    }
}

async fn log_failures(
    mut failures: mpsc::UnboundedReceiver<OperationFailure>,
    names: BTreeMap<OperationKind, String>,
) {
    let mut reported = BTreeMap::<OperationKind, u64>::new();

    while let Some(failure) = failures.recv().await {
        let name = names.get(&failure.kind).map_or("unknown", String::as_str);
        let error = &failure.error as &dyn std::error::Error;

        let count = reported.entry(failure.kind).or_default();
        *count += 1;
        if *count == 1 {
            tracing::warn!(
                operation = name,
                index = failure.index,
                error,
                "operation failed (further failures of this operation are logged at debug level)"
            );
        } else {
            tracing::debug!(operation = name, index = failure.index, error, "operation failed");
        }
    }
}
