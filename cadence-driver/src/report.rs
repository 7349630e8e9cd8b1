//! Run reports, printed to the terminal and optionally written as JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_core::OperationKind;
use cadence_core::dispatch::{KindSummary, RunSummary, StopReason};
use cadence_core::metrics::{LagSnapshot, LatencyRecorder, LatencyUnit, ScheduleLag};
use cadence_core::mix::ResolvedMix;
use serde::Serialize;
use yansi::Paint;

use crate::simulated::KeyStats;

/// Latency distribution of one kind, in the unit of the report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Latencies {
    /// Arithmetic mean.
    pub mean: f64,
    /// Median.
    pub p50: u64,
    /// 90th percentile.
    pub p90: u64,
    /// 99th percentile.
    pub p99: u64,
    /// Largest recorded latency.
    pub max: u64,
}

/// Results of one operation kind.
#[derive(Clone, Debug, Serialize)]
pub struct KindReport {
    /// Numeric id of the kind.
    pub id: u16,
    /// Configured name of the kind.
    pub name: String,
    /// Interval between two scheduled operations, before compression.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Operation counts.
    #[serde(flatten)]
    pub counts: KindSummary,
    /// Measured operations per second of wall-clock time.
    pub throughput: f64,
    /// Latencies of measured operations. Absent if nothing was measured.
    pub latency: Option<Latencies>,
    /// How far dispatch trailed the schedule, in nanoseconds.
    pub lag: Option<LagSnapshot>,
}

/// Results of a whole run.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    /// Why the run ended.
    pub stop: StopReason,
    /// Wall-clock duration of the run.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Unit of all latency values.
    pub unit: LatencyUnit,
    /// Results per kind, in id order.
    pub kinds: Vec<KindReport>,
    /// Key space statistics of the simulated backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeyStats>,
}

impl Report {
    /// Collects the results of a finished run.
    pub fn new(
        summary: &RunSummary,
        mix: &ResolvedMix,
        names: &BTreeMap<OperationKind, String>,
        recorder: &LatencyRecorder,
        lag: &ScheduleLag,
    ) -> Self {
        let elapsed = summary.elapsed;
        let kinds = mix
            .iter()
            .map(|(kind, interval)| {
                let counts = summary.kind(kind);
                let latency = recorder
                    .snapshot(kind)
                    .filter(|snapshot| snapshot.count() > 0)
                    .map(|snapshot| Latencies {
                        mean: snapshot.mean(),
                        p50: snapshot.percentile(50.0).unwrap_or_default(),
                        p90: snapshot.percentile(90.0).unwrap_or_default(),
                        p99: snapshot.percentile(99.0).unwrap_or_default(),
                        max: snapshot.max().unwrap_or_default(),
                    });

                KindReport {
                    id: kind.id(),
                    name: names
                        .get(&kind)
                        .cloned()
                        .unwrap_or_else(|| kind.to_string()),
                    interval,
                    counts,
                    throughput: per_second(counts.recorded, elapsed),
                    latency,
                    lag: lag.snapshot(kind),
                }
            })
            .collect();

        Self {
            stop: summary.stop,
            elapsed,
            unit: recorder.unit(),
            kinds,
            keys: None,
        }
    }

    /// Attaches key space statistics.
    pub fn with_keys(mut self, keys: KeyStats) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Prints the report to stdout.
    pub fn print(&self) {
        let suffix = self.unit.suffix();

        println!();
        println!(
            "{} {:.2?} ({})",
            "## Run".bold(),
            self.elapsed.bold(),
            stop_label(self.stop)
        );

        for kind in &self.kinds {
            let counts = &kind.counts;
            print!(
                "{} ({} ops",
                format!("{}:", kind.name.to_uppercase()).bold().green(),
                counts.recorded.bold()
            );
            if counts.warmup > 0 {
                print!(", {} warmup", counts.warmup);
            }
            if counts.retried > 0 {
                print!(", {} retries", counts.retried);
            }
            if counts.failed > 0 {
                print!(", {}", format!("{} FAILURES", counts.failed).bold().red());
            }
            if counts.unrecorded > 0 {
                print!(", {}", format!("{} UNRECORDED", counts.unrecorded).bold().yellow());
            }
            if counts.skipped > 0 {
                print!(", {}", format!("{} SKIPPED", counts.skipped).bold().yellow());
            }
            if counts.abandoned > 0 {
                print!(", {} abandoned", counts.abandoned);
            }
            println!(")");

            println!(
                "  {:.2} operations/s, every {:?}",
                kind.throughput.bold(),
                kind.interval
            );
            if let Some(latency) = &kind.latency {
                println!(
                    "  avg: {}; p50: {}{suffix}; p90: {}{suffix}; p99: {}{suffix}; max: {}{suffix}",
                    format!("{:.2}{suffix}", latency.mean).bold(),
                    latency.p50,
                    latency.p90,
                    latency.p99,
                    latency.max,
                );
            }
            if let Some(lag) = kind.lag.filter(|lag| lag.late > 0) {
                println!(
                    "  {} late, max lag {:.2?}",
                    lag.late.bold().yellow(),
                    lag.max
                );
            }
        }

        if let Some(keys) = &self.keys {
            let share = if keys.reads > 0 {
                keys.hot_reads as f64 / keys.reads as f64 * 100.0
            } else {
                0.0
            };
            println!();
            println!(
                "{} {} items, {} inserts, {:.1}% of reads on the hottest 1%",
                "KEYS:".bold().green(),
                keys.items.bold(),
                keys.inserts,
                share
            );
        }
        println!();
    }

    /// Writes the report as pretty-printed JSON to `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create report file {}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)
            .context("failed to write report")?;
        Ok(())
    }
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    count as f64 / elapsed.as_secs_f64()
}

fn stop_label(stop: StopReason) -> String {
    match stop {
        StopReason::Completed => "completed".green().to_string(),
        StopReason::Shutdown => "shut down".yellow().to_string(),
        StopReason::Aborted => "aborted".red().to_string(),
    }
}
