//! Configuration for the cadence driver.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `CADENCE__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `CADENCE__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `CADENCE__RUN__WORKERS=32` sets the number of workers
//! - `CADENCE__RUN__LAG__POLICY=skip` selects the lag policy
//! - `CADENCE__MEASUREMENT__UNIT=nanos` records latencies in nanoseconds
//!
//! # YAML Configuration File
//!
//! Configuration can also be provided via a YAML file:
//!
//! ```yaml
//! run:
//!   workers: 32
//!   duration: 5m
//!   warmup:
//!     window: 30s
//!   lag:
//!     policy: skip
//!     tolerance: 50ms
//!
//! mix:
//!   reference: update
//!   unit: 10ms
//!   operations:
//!     - { name: update, id: 0, frequency: 1, access: insert }
//!     - { name: lookup, id: 1, frequency: 10 }
//!     - { name: scan, id: 2, frequency: 30, offset: 1s }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cadence_core::OperationKind;
use cadence_core::dispatch::{DispatchConfig, RetryPolicy, Warmup as CoreWarmup};
use cadence_core::metrics::LatencyUnit;
use cadence_core::mix::{MixEntry, MixSpec, ResolvedMix, resolve};
use cadence_core::schedule::{LagPolicy, PacingPolicy, ScheduleOptions};
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "CADENCE__";

/// How a run is paced and measured.
///
/// Used in: [`Config::run`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Run {
    /// Number of concurrent workers executing operations.
    ///
    /// # Default
    ///
    /// `8`
    ///
    /// # Environment Variable
    ///
    /// `CADENCE__RUN__WORKERS`
    pub workers: usize,

    /// Number of operations that may wait between the scheduler and the workers.
    ///
    /// # Default
    ///
    /// `256`
    pub queue_capacity: usize,

    /// Whether operations wait for their scheduled time.
    ///
    /// `strict` releases an operation only once its scheduled time has come, `unthrottled`
    /// releases operations as fast as the workers accept them.
    ///
    /// # Default
    ///
    /// `strict`
    pub pacing: PacingPolicy,

    /// What to do when the run falls behind its schedule. See [`Lag`].
    pub lag: Lag,

    /// Lag above which a warning is logged for an operation kind.
    ///
    /// # Default
    ///
    /// `1s`
    #[serde(with = "humantime_serde")]
    pub lag_warning: Duration,

    /// Initial part of the run that is executed but not measured. See [`Warmup`].
    pub warmup: Warmup,

    /// Number of times an operation failing with a transient error is attempted again.
    ///
    /// # Default
    ///
    /// `0`
    pub retries: u32,

    /// Delay before each retry.
    ///
    /// # Default
    ///
    /// `0s`
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Scale factor applied to all intervals.
    ///
    /// Values below `1` run the schedule faster than real time, values above `1` slower.
    ///
    /// # Default
    ///
    /// `1.0`
    pub compression_ratio: f64,

    /// Logical length of the run. Operations scheduled at or after this time are not executed.
    ///
    /// Set to `null` and configure per-operation limits to run a fixed number of operations.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Maximum random delay added to every scheduled time.
    ///
    /// # Default
    ///
    /// `0s`
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,

    /// Seed for jitter, key sampling and the simulated backend.
    ///
    /// # Default
    ///
    /// `0`
    pub seed: u64,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 256,
            pacing: PacingPolicy::Strict,
            lag: Lag::CatchUp,
            lag_warning: Duration::from_secs(1),
            warmup: Warmup::None,
            retries: 0,
            retry_backoff: Duration::ZERO,
            compression_ratio: 1.0,
            duration: Some(Duration::from_secs(10)),
            jitter: Duration::ZERO,
            seed: 0,
        }
    }
}

impl Run {
    /// Returns the dispatcher settings.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            pacing: self.pacing,
            lag: self.lag.into(),
            lag_warning: self.lag_warning,
            warmup: self.warmup.into(),
            retry: RetryPolicy::new(self.retries).backoff(self.retry_backoff),
        }
    }
}

/// Lag policy.
///
/// The `policy` field in YAML or `__POLICY` in environment variables selects the variant.
///
/// # Example
///
/// ```yaml
/// lag:
///   policy: cap
///   max_lag: 100ms
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Lag {
    /// Run late operations immediately. Nothing is skipped (policy `"catch_up"`).
    #[default]
    CatchUp,
    /// Delay the rest of the schedule so lag never exceeds `max_lag` (policy `"cap"`).
    Cap {
        /// Largest tolerated lag.
        #[serde(with = "humantime_serde")]
        max_lag: Duration,
    },
    /// Drop operations later than `tolerance` (policy `"skip"`).
    Skip {
        /// Largest lag at which operations still run.
        #[serde(with = "humantime_serde")]
        tolerance: Duration,
    },
}

impl From<Lag> for LagPolicy {
    fn from(lag: Lag) -> Self {
        match lag {
            Lag::CatchUp => LagPolicy::CatchUp,
            Lag::Cap { max_lag } => LagPolicy::Cap { max_lag },
            Lag::Skip { tolerance } => LagPolicy::Skip { tolerance },
        }
    }
}

/// Warmup configuration.
///
/// # Example
///
/// ```yaml
/// warmup:
///   operations: 10000
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Warmup {
    /// Measure every operation.
    #[default]
    None,
    /// Do not measure the first `n` operations.
    Operations(u64),
    /// Do not measure operations scheduled within this initial window.
    Window(#[serde(with = "humantime_serde")] Duration),
}

impl From<Warmup> for CoreWarmup {
    fn from(warmup: Warmup) -> Self {
        match warmup {
            Warmup::None => CoreWarmup::None,
            Warmup::Operations(count) => CoreWarmup::Operations(count),
            Warmup::Window(window) => CoreWarmup::Window(window),
        }
    }
}

/// How an operation picks its key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Sample an existing key from the skewed distribution.
    #[default]
    Read,
    /// Create a new key, growing the key domain.
    Insert,
}

/// One operation kind of the mix.
///
/// Exactly one of `frequency` and `interleave` must be set, and all operations must use the same
/// one.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    /// Name used in logs and reports.
    pub name: String,

    /// Numeric id. Lower ids win when two operations are due at the same time.
    pub id: u16,

    /// Reference units between two executions of this operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u64>,

    /// Absolute interval between two executions of this operation.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub interleave: Option<Duration>,

    /// How the operation picks its key.
    #[serde(default)]
    pub access: Access,

    /// Whether the operation runs at all.
    ///
    /// A disabled reference operation still defines the unit of the others.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay of the first execution.
    #[serde(default, with = "humantime_serde")]
    pub offset: Duration,

    /// Number of operations to schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Number of parameter sets available. Operations beyond fail as exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl Operation {
    /// Returns the kind identifier of this operation.
    pub fn kind(&self) -> OperationKind {
        OperationKind::new(self.id)
    }

    fn entry(&self) -> Result<MixEntry> {
        match (self.frequency, self.interleave) {
            (Some(frequency), None) => Ok(MixEntry::Frequency(frequency)),
            (None, Some(interleave)) => Ok(MixEntry::Interleave(interleave)),
            (Some(_), Some(_)) => bail!(
                "operation `{}` sets both frequency and interleave",
                self.name
            ),
            (None, None) => bail!(
                "operation `{}` sets neither frequency nor interleave",
                self.name
            ),
        }
    }
}

/// The operation mix.
///
/// Used in: [`Config::mix`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Mix {
    /// Name of the operation whose cadence is the unit of all frequencies.
    ///
    /// Only used when the operations are given as frequencies.
    ///
    /// # Default
    ///
    /// `"update"`
    pub reference: Option<String>,

    /// Interval of the reference operation.
    ///
    /// # Default
    ///
    /// `10ms`
    #[serde(with = "humantime_serde")]
    pub unit: Duration,

    /// All operations of the mix.
    pub operations: Vec<Operation>,
}

impl Default for Mix {
    fn default() -> Self {
        let operation = |name: &str, id, frequency, access| Operation {
            name: name.to_owned(),
            id,
            frequency: Some(frequency),
            interleave: None,
            access,
            enabled: true,
            offset: Duration::ZERO,
            limit: None,
            parameters: None,
        };

        Self {
            reference: Some("update".to_owned()),
            unit: Duration::from_millis(10),
            operations: vec![
                operation("update", 0, 1, Access::Insert),
                operation("lookup", 1, 10, Access::Read),
                operation("scan", 2, 30, Access::Read),
            ],
        }
    }
}

impl Mix {
    /// Returns the display names of all kinds.
    pub fn names(&self) -> BTreeMap<OperationKind, String> {
        self.operations
            .iter()
            .map(|operation| (operation.kind(), operation.name.clone()))
            .collect()
    }

    /// Returns how each kind picks its key.
    pub fn access(&self) -> BTreeMap<OperationKind, Access> {
        self.operations
            .iter()
            .map(|operation| (operation.kind(), operation.access))
            .collect()
    }

    /// Returns the number of parameter sets per kind, for kinds that have a limit.
    pub fn parameters(&self) -> BTreeMap<OperationKind, u64> {
        self.operations
            .iter()
            .filter_map(|operation| Some((operation.kind(), operation.parameters?)))
            .collect()
    }

    /// Validates the mix and resolves the intervals of all enabled operations.
    pub fn resolve(&self) -> Result<ResolvedMix> {
        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for operation in &self.operations {
            if !ids.insert(operation.id) {
                bail!("duplicate operation id {}", operation.id);
            }
            if !names.insert(operation.name.as_str()) {
                bail!("duplicate operation name `{}`", operation.name);
            }
        }

        let mut spec = MixSpec::new(self.operations.iter().map(Operation::kind));
        for operation in &self.operations {
            spec = spec.entry(operation.kind(), operation.entry()?);
        }

        let frequencies = self
            .operations
            .iter()
            .any(|operation| operation.frequency.is_some());
        if let (true, Some(reference)) = (frequencies, &self.reference) {
            let operation = self
                .operations
                .iter()
                .find(|operation| &operation.name == reference)
                .with_context(|| format!("reference operation `{reference}` is not in the mix"))?;
            spec = spec.reference(operation.kind(), self.unit);
        }

        let resolved = resolve(&spec).context("invalid operation mix")?;

        let enabled: BTreeSet<_> = self
            .operations
            .iter()
            .filter(|operation| operation.enabled)
            .map(Operation::kind)
            .collect();
        let resolved = resolved.select(|kind| enabled.contains(&kind));
        if resolved.is_empty() {
            bail!("all operations are disabled");
        }

        Ok(resolved)
    }

    /// Returns the per-stream schedule settings.
    pub fn schedule_options(&self, run: &Run) -> ScheduleOptions {
        ScheduleOptions {
            compression_ratio: run.compression_ratio,
            jitter: run.jitter,
            seed: run.seed,
            offsets: self
                .operations
                .iter()
                .filter(|operation| !operation.offset.is_zero())
                .map(|operation| (operation.kind(), operation.offset))
                .collect(),
            limits: self
                .operations
                .iter()
                .filter_map(|operation| Some((operation.kind(), operation.limit?)))
                .collect(),
            horizon: run.duration,
        }
    }
}

/// Latency measurement settings.
///
/// Used in: [`Config::measurement`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Measurement {
    /// Unit of recorded latencies: `nanos`, `micros` or `millis`.
    ///
    /// # Default
    ///
    /// `micros`
    pub unit: LatencyUnit,

    /// Largest latency the histograms can hold. Longer operations are counted as unrecorded.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,

    /// Precision of the histograms in significant decimal digits, from 1 to 5.
    ///
    /// # Default
    ///
    /// `3`
    pub significant_digits: u8,
}

impl Default for Measurement {
    fn default() -> Self {
        Self {
            unit: LatencyUnit::Micros,
            max_latency: Duration::from_secs(60),
            significant_digits: 3,
        }
    }
}

/// Key space of the simulated workload.
///
/// Used in: [`Config::keys`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Keys {
    /// Number of keys that exist before the run starts.
    ///
    /// # Default
    ///
    /// `10000`
    pub initial_items: u64,

    /// Skew of the key distribution, between 0 and 1 exclusive. Higher is more skewed.
    ///
    /// # Default
    ///
    /// `0.99`
    pub zipfian_constant: f64,

    /// Spread the popular keys over the whole key space instead of clustering them at the
    /// lowest keys.
    ///
    /// # Default
    ///
    /// `false`
    pub scrambled: bool,
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            initial_items: 10_000,
            zipfian_constant: cadence_core::sampler::ZIPFIAN_CONSTANT,
            scrambled: false,
        }
    }
}

/// Behavior of the simulated backend.
///
/// Used in: [`Config::backend`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Backend {
    /// Median latency of an operation.
    ///
    /// # Default
    ///
    /// `1ms`
    #[serde(with = "humantime_serde")]
    pub latency_p50: Duration,

    /// 99th percentile latency of an operation.
    ///
    /// # Default
    ///
    /// `20ms`
    #[serde(with = "humantime_serde")]
    pub latency_p99: Duration,

    /// Probability that an operation fails permanently.
    ///
    /// # Default
    ///
    /// `0.0`
    pub failure_rate: f64,

    /// Probability that an attempt fails with a retryable error.
    ///
    /// # Default
    ///
    /// `0.0`
    pub transient_failure_rate: f64,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            latency_p50: Duration::from_millis(1),
            latency_p99: Duration::from_millis(20),
            failure_rate: 0.0,
            transient_failure_rate: 0.0,
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  cadence_core::dispatch > starting dispatch
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2020-12-04T12:10:32Z [cadence_core::dispatch] INFO: starting dispatch
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2020-12-04T12:11:08.729716Z","level":"INFO","fields":{"message":"starting dispatch"},"target":"cadence_core::dispatch"}
    /// ```
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Controls the verbosity and format of log output. Logs are always written to stderr, the
/// report goes to stdout.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// Valid levels in increasing severity: TRACE, DEBUG, INFO, WARN, ERROR, OFF. The `RUST_LOG`
    /// environment variable provides more granular control per module if needed.
    ///
    /// **Important**: `DEBUG` and `TRACE` log every dispatch decision and distort the measured
    /// latencies of fast backends.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `CADENCE__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options and examples.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    ///
    /// # Environment Variable
    ///
    /// `CADENCE__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for the cadence driver.
///
/// Configuration is loaded with the following precedence (highest to lowest):
/// 1. Environment variables (prefixed with `CADENCE__`)
/// 2. YAML configuration file (if provided via `-c` flag)
/// 3. Default values
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Pacing, concurrency and warmup of the run.
    pub run: Run,

    /// The operation mix.
    pub mix: Mix,

    /// Latency histogram settings.
    pub measurement: Measurement,

    /// Key space of the simulated workload.
    pub keys: Keys,

    /// Latency and failure behavior of the simulated backend.
    pub backend: Backend,

    /// Log level and format.
    pub logging: Logging,
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `CADENCE__`)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The YAML configuration file cannot be read or parsed
    /// - Environment variables contain invalid values
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}
