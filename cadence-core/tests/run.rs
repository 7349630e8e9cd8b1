use std::sync::Arc;
use std::time::Duration;

use cadence_core::dispatch::{DispatchConfig, Dispatcher, RetryPolicy, StopReason, Warmup};
use cadence_core::merge::GlobalMerger;
use cadence_core::metrics::{LatencyRecorder, LatencyUnit};
use cadence_core::mix::{MixSpec, resolve};
use cadence_core::schedule::{PacingPolicy, ScheduleOptions};
use cadence_core::{OperationError, OperationKind};
use cadence_test::backend::{OperationId, RecordingBackend, SequenceParams};

const UPDATE: OperationKind = OperationKind::new(0);
const READ_A: OperationKind = OperationKind::new(1);
const READ_B: OperationKind = OperationKind::new(2);

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn recorder(kinds: &[OperationKind]) -> Arc<LatencyRecorder> {
    Arc::new(
        LatencyRecorder::new(
            kinds.iter().copied(),
            LatencyUnit::Micros,
            Duration::from_secs(10),
            3,
        )
        .unwrap(),
    )
}

fn id(kind: OperationKind, index: u64) -> OperationId {
    OperationId { kind, index }
}

#[tokio::test(start_paused = true)]
async fn frequency_mix_runs_in_merged_order() {
    cadence_test::tracing::init();

    let spec = MixSpec::new([UPDATE, READ_A, READ_B])
        .reference(UPDATE, ms(10))
        .frequency(UPDATE, 1)
        .frequency(READ_A, 10)
        .frequency(READ_B, 30);
    let mix = resolve(&spec).unwrap().select(|kind| kind != UPDATE);
    let options = ScheduleOptions {
        horizon: Some(ms(1000)),
        ..Default::default()
    };

    let backend = Arc::new(RecordingBackend::new());
    let recorder = recorder(&[READ_A, READ_B]);
    let config = DispatchConfig {
        workers: 1,
        pacing: PacingPolicy::Unthrottled,
        ..Default::default()
    };

    let dispatcher = Dispatcher::new(
        GlobalMerger::for_mix(&mix, &options).unwrap(),
        SequenceParams::new(),
        Arc::clone(&backend),
        Arc::clone(&recorder),
        config,
    )
    .unwrap();
    let summary = dispatcher.run().await;

    let kinds: Vec<_> = backend.executed().iter().map(|id| id.kind).collect();
    let (a, b) = (READ_A, READ_B);
    assert_eq!(kinds, [a, b, a, a, a, b, a, a, a, b, a, a, a, b]);

    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.kind(READ_A).recorded, 10);
    assert_eq!(summary.kind(READ_B).recorded, 4);
    assert_eq!(recorder.count(READ_B), 4);
}

#[tokio::test(start_paused = true)]
async fn strict_pacing_preserves_compressed_spacing() {
    let spec = MixSpec::new([READ_A, READ_B])
        .interleave(READ_A, ms(100))
        .interleave(READ_B, ms(250));
    let options = ScheduleOptions {
        compression_ratio: 0.1,
        limits: [(READ_A, 5), (READ_B, 2)].into(),
        ..Default::default()
    };

    let backend = Arc::new(RecordingBackend::new());
    let dispatcher = Dispatcher::new(
        GlobalMerger::for_mix(&resolve(&spec).unwrap(), &options).unwrap(),
        SequenceParams::new(),
        Arc::clone(&backend),
        recorder(&[READ_A, READ_B]),
        DispatchConfig::default(),
    )
    .unwrap();
    dispatcher.run().await;

    let starts: Vec<_> = backend
        .calls()
        .iter()
        .map(|call| (call.id, call.at))
        .collect();
    assert_eq!(
        starts,
        [
            (id(READ_A, 0), ms(0)),
            (id(READ_B, 0), ms(0)),
            (id(READ_A, 1), ms(10)),
            (id(READ_A, 2), ms(20)),
            (id(READ_B, 1), ms(25)),
            (id(READ_A, 3), ms(30)),
            (id(READ_A, 4), ms(40)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn warmup_and_failures_are_kept_out_of_histograms() {
    let spec = MixSpec::new([READ_A]).interleave(READ_A, ms(10));
    let options = ScheduleOptions {
        limits: [(READ_A, 20)].into(),
        ..Default::default()
    };

    let backend = Arc::new(
        RecordingBackend::new()
            .latency(ms(2))
            .flaky(READ_A, 6, 1)
            .fail(READ_A, 8)
            .fail(READ_A, 1),
    );
    let recorder = recorder(&[READ_A]);
    let config = DispatchConfig {
        warmup: Warmup::Window(ms(50)),
        retry: RetryPolicy::new(1),
        ..Default::default()
    };

    let mut dispatcher = Dispatcher::new(
        GlobalMerger::for_mix(&resolve(&spec).unwrap(), &options).unwrap(),
        SequenceParams::new().limit(READ_A, 18),
        Arc::clone(&backend),
        Arc::clone(&recorder),
        config,
    )
    .unwrap();
    let mut failures = dispatcher.failures();
    let summary = dispatcher.run().await;

    let read = summary.kind(READ_A);
    // 0..5 are warmup, 1 of which fails. 8 fails, 18 and 19 have no parameters.
    assert_eq!(read.warmup, 4);
    assert_eq!(read.recorded, 12);
    assert_eq!(read.failed, 4);
    assert_eq!(read.retried, 1);
    assert_eq!(recorder.count(READ_A), 12);

    let snapshot = recorder.snapshot(READ_A).unwrap();
    assert_eq!(snapshot.min(), Some(2000));
    assert!(snapshot.max().unwrap() < 2010);

    let mut failed = Vec::new();
    while let Some(failure) = failures.recv().await {
        if let OperationError::Backend { attempts, .. } = failure.error {
            assert_eq!(attempts, 1);
        }
        failed.push(failure.index);
    }
    failed.sort();
    assert_eq!(failed, [1, 8, 18, 19]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_keeps_per_kind_order() {
    let spec = MixSpec::new([READ_A, READ_B])
        .interleave(READ_A, ms(3))
        .interleave(READ_B, ms(5));

    let backend = Arc::new(RecordingBackend::new().latency(ms(7)));
    let config = DispatchConfig {
        workers: 4,
        queue_capacity: 4,
        ..Default::default()
    };
    let handle = Dispatcher::new(
        GlobalMerger::for_mix(&resolve(&spec).unwrap(), &ScheduleOptions::default()).unwrap(),
        SequenceParams::new(),
        Arc::clone(&backend),
        recorder(&[READ_A, READ_B]),
        config,
    )
    .unwrap()
    .spawn();

    tokio::time::sleep(ms(500)).await;
    handle.stopper().shutdown();
    let summary = handle.join().await;
    assert_eq!(summary.stop, StopReason::Shutdown);

    for kind in [READ_A, READ_B] {
        let indexes: Vec<_> = backend
            .executed()
            .iter()
            .filter(|id| id.kind == kind)
            .map(|id| id.index)
            .collect();
        assert!(!indexes.is_empty());
        assert!(indexes.iter().enumerate().all(|(i, index)| i as u64 == *index));

        let counts = summary.kind(kind);
        assert_eq!(counts.recorded, indexes.len() as u64);
        assert_eq!(counts.failed, 0);
    }
}
