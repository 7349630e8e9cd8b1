//! Simulated collaborators for running the driver without a system under test.
//!
//! [`KeyParams`] picks a key for every operation from a shared [`ZipfianSampler`]: insert-style
//! operations append a new key and grow the sampler, read-style operations draw an existing key.
//! [`SimulatedBackend`] then pretends to execute the operation with a latency drawn from a
//! *LogNormal* distribution, defined by its `p50` and `p99`. This models the common shape of
//! real-world latencies: most operations are fast, with a long tail of slow ones.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cadence_core::dispatch::{Backend, ParamSource};
use cadence_core::sampler::ZipfianSampler;
use cadence_core::{BackendError, OperationKind, ParamsError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};

use crate::config::{self, Access};

/// z-score of the 99th percentile of the standard normal distribution.
const P99_Z_SCORE: f64 = 2.3263;

/// Parameters of one simulated operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyOp {
    /// The key the operation accesses.
    pub key: u64,
    /// How the key was chosen.
    pub access: Access,
    /// Popularity rank of a read key, `0` being the hottest. Inserted keys have none.
    pub rank: Option<u64>,
}

/// Produces keys for operations from a shared skewed key space.
#[derive(Debug)]
pub struct KeyParams {
    sampler: Arc<ZipfianSampler>,
    access: BTreeMap<OperationKind, Access>,
    available: BTreeMap<OperationKind, u64>,
    scrambled: bool,
    rng: SmallRng,
}

impl KeyParams {
    /// Creates a source drawing keys from `sampler`.
    pub fn new(sampler: Arc<ZipfianSampler>, access: BTreeMap<OperationKind, Access>, seed: u64) -> Self {
        Self {
            sampler,
            access,
            available: BTreeMap::new(),
            scrambled: false,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Limits the number of parameter sets per kind.
    pub fn available(mut self, available: BTreeMap<OperationKind, u64>) -> Self {
        self.available = available;
        self
    }

    /// Spreads popular keys over the whole key space.
    pub fn scrambled(mut self, scrambled: bool) -> Self {
        self.scrambled = scrambled;
        self
    }
}

impl ParamSource for KeyParams {
    type Params = KeyOp;

    fn fetch(&mut self, kind: OperationKind, index: u64) -> Result<KeyOp, ParamsError> {
        if self.available.get(&kind).is_some_and(|available| index >= *available) {
            return Err(ParamsError::Exhausted(kind));
        }

        let access = self
            .access
            .get(&kind)
            .copied()
            .ok_or_else(|| ParamsError::Invalid(format!("no key access configured for {kind}")))?;

        let (key, rank) = match access {
            Access::Insert => {
                let items = self.sampler.items();
                self.sampler
                    .grow(items + 1)
                    .map_err(|error| ParamsError::Invalid(error.to_string()))?;
                (self.sampler.min() + items, None)
            }
            Access::Read => {
                let rank = self.sampler.rank(&mut self.rng);
                let key = if self.scrambled {
                    self.sampler.scramble(rank)
                } else {
                    self.sampler.min() + rank
                };
                (key, Some(rank))
            }
        };

        Ok(KeyOp { key, access, rank })
    }
}

/// Access counters of a [`SimulatedBackend`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct KeyStats {
    /// Number of executed reads.
    pub reads: u64,
    /// Number of reads that hit the hottest percent of the keys, wherever scrambling put them.
    pub hot_reads: u64,
    /// Number of executed inserts.
    pub inserts: u64,
    /// Size of the key space at the end of the run.
    pub items: u64,
}

/// A backend that sleeps instead of doing work.
#[derive(Debug)]
pub struct SimulatedBackend {
    sampler: Arc<ZipfianSampler>,
    latency: LogNormal<f64>,
    failure_rate: f64,
    transient_failure_rate: f64,
    rng: Mutex<SmallRng>,
    reads: AtomicU64,
    hot_reads: AtomicU64,
    inserts: AtomicU64,
}

impl SimulatedBackend {
    /// Creates a backend from its configuration, sharing the key space of `sampler`.
    pub fn new(config: &config::Backend, sampler: Arc<ZipfianSampler>, seed: u64) -> Result<Self> {
        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = config.latency_p50.as_nanos() as f64;
        let p99 = config.latency_p99.as_nanos() as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / P99_Z_SCORE;
        let latency = LogNormal::new(mu, sigma).with_context(|| {
            format!(
                "invalid latency distribution (p50 {:?}, p99 {:?})",
                config.latency_p50, config.latency_p99
            )
        })?;

        for (name, rate) in [
            ("failure_rate", config.failure_rate),
            ("transient_failure_rate", config.transient_failure_rate),
        ] {
            anyhow::ensure!((0.0..=1.0).contains(&rate), "{name} must be within [0, 1], got {rate}");
        }

        Ok(Self {
            sampler,
            latency,
            failure_rate: config.failure_rate,
            transient_failure_rate: config.transient_failure_rate,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            reads: AtomicU64::new(0),
            hot_reads: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        })
    }

    /// Returns the access counters.
    pub fn stats(&self) -> KeyStats {
        KeyStats {
            reads: self.reads.load(Ordering::Relaxed),
            hot_reads: self.hot_reads.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            items: self.sampler.items(),
        }
    }

    fn is_hot(&self, rank: u64) -> bool {
        rank < (self.sampler.items() / 100).max(1)
    }
}

#[async_trait]
impl Backend<KeyOp> for SimulatedBackend {
    async fn execute(&self, kind: OperationKind, op: &KeyOp) -> Result<(), BackendError> {
        let (latency, fail, transient) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let nanos = self.latency.sample(&mut *rng);
            (
                Duration::from_nanos(nanos as u64),
                rng.random_bool(self.failure_rate),
                rng.random_bool(self.transient_failure_rate),
            )
        };

        tokio::time::sleep(latency).await;

        if transient {
            return Err(BackendError::Transient(format!(
                "simulated conflict on key {}",
                op.key
            )));
        }
        if fail {
            return Err(BackendError::Failed(format!(
                "simulated {kind} failure on key {}",
                op.key
            )));
        }

        match op.access {
            Access::Insert => {
                self.inserts.fetch_add(1, Ordering::Relaxed);
            }
            Access::Read => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                if op.rank.is_some_and(|rank| self.is_hot(rank)) {
                    self.hot_reads.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}
