//! Skewed key sampling.
//!
//! [`ZipfianSampler`] draws item offsets from a Zipfian distribution using the closed-form
//! inverse transform from "Quickly Generating Billion-Record Synthetic Databases" (Gray et al.,
//! SIGMOD 1994). The smallest value is the most popular one, the next value the second most
//! popular, and so on.
//!
//! The expensive part is the normalization constant `ζ(N, θ) = Σ 1/(i+1)^θ` over the whole item
//! domain, which costs O(N) to compute. Real workloads only ever add items, so
//! [`ZipfianSampler::grow`] extends the existing partial sum by just the new terms. Shrinking the
//! domain requires a full recomputation and is either done with a warning or ignored, depending
//! on [`ZipfianSamplerBuilder::monotonic`].

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;

use crate::error::ConfigError;

/// The zipfian constant used by YCSB and LDBC workloads.
pub const ZIPFIAN_CONSTANT: f64 = 0.99;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A builder for creating a [`ZipfianSampler`].
#[derive(Debug)]
pub struct ZipfianSamplerBuilder {
    items: u64,
    min: u64,
    theta: f64,
    monotonic: bool,
}

impl ZipfianSamplerBuilder {
    /// The smallest value produced, which is also the most popular one. Defaults to `0`.
    pub fn min(mut self, min: u64) -> Self {
        self.min = min;
        self
    }

    /// The skew constant θ. Higher values concentrate more draws on the smallest values.
    ///
    /// Must lie strictly between `0` and `1`. Defaults to [`ZIPFIAN_CONSTANT`].
    pub fn zipfian_constant(mut self, theta: f64) -> Self {
        self.theta = theta;
        self
    }

    /// Whether the item domain is assumed to only ever grow. Defaults to `true`.
    ///
    /// When set, [`ZipfianSampler::grow`] ignores requests for a smaller domain. Otherwise, a
    /// smaller domain triggers a full O(N) recomputation of the normalization constant. A
    /// smaller count usually means a caller read a stale item count, which is why ignoring it is
    /// the default.
    pub fn monotonic(mut self, monotonic: bool) -> Self {
        self.monotonic = monotonic;
        self
    }

    /// Creates the sampler, computing the normalization constant from scratch.
    pub fn build(self) -> Result<ZipfianSampler, ConfigError> {
        if self.items == 0 {
            return Err(ConfigError::InvalidDomain(self.items));
        }
        if !(self.theta > 0.0 && self.theta < 1.0) {
            return Err(ConfigError::InvalidZipfianConstant(self.theta));
        }

        let constants = Constants {
            min: self.min,
            theta: self.theta,
            alpha: 1.0 / (1.0 - self.theta),
            zeta2theta: zeta(0, 2, self.theta, 0.0),
            half_pow_theta: 0.5f64.powf(self.theta),
        };
        let zetan = zeta(0, self.items, self.theta, 0.0);
        let state = constants.state(self.items, zetan);

        Ok(ZipfianSampler {
            constants,
            monotonic: self.monotonic,
            state: RwLock::new(state),
        })
    }
}

/// Parameters that never change after construction.
#[derive(Clone, Copy, Debug)]
struct Constants {
    min: u64,
    theta: f64,
    alpha: f64,
    zeta2theta: f64,
    half_pow_theta: f64,
}

impl Constants {
    fn state(&self, items: u64, zetan: f64) -> ZetaState {
        let eta = (1.0 - (2.0 / items as f64).powf(1.0 - self.theta))
            / (1.0 - self.zeta2theta / zetan);
        ZetaState { items, zetan, eta }
    }
}

/// Parameters derived from the item count, replaced as a whole when the domain changes.
#[derive(Clone, Copy, Debug)]
struct ZetaState {
    /// The number of items `zetan` was computed for.
    items: u64,
    zetan: f64,
    eta: f64,
}

/// A generator of Zipfian-distributed values in `[min, min + items)`.
///
/// The sampler is shared between threads: draws take a shared lock to read a consistent
/// snapshot of the derived constants, while [`grow`](Self::grow) takes the exclusive lock only
/// for the duration of a domain change. Randomness comes from the caller, so each worker can use
/// its own RNG.
#[derive(Debug)]
pub struct ZipfianSampler {
    constants: Constants,
    monotonic: bool,
    state: RwLock<ZetaState>,
}

impl ZipfianSampler {
    /// Constructs a builder for a sampler over `items` values.
    pub fn builder(items: u64) -> ZipfianSamplerBuilder {
        ZipfianSamplerBuilder {
            items,
            min: 0,
            theta: ZIPFIAN_CONSTANT,
            monotonic: true,
        }
    }

    /// Returns the smallest value this sampler produces.
    pub fn min(&self) -> u64 {
        self.constants.min
    }

    /// Returns the current number of items in the domain.
    pub fn items(&self) -> u64 {
        self.read_state().items
    }

    /// Draws the next value. `min` is the most popular value, `min + 1` the next one, and so on.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> u64 {
        let state = *self.read_state();
        self.constants.min + self.sample_offset(&state, rng)
    }

    /// Draws the next value with the popular items spread across the whole domain.
    ///
    /// The Zipfian rank is hashed with FNV-1a before it is mapped back into the domain, so hot
    /// items no longer cluster at the low end.
    pub fn sample_scrambled<R: Rng>(&self, rng: &mut R) -> u64 {
        let state = *self.read_state();
        let rank = self.sample_offset(&state, rng);
        self.constants.min + fnv1a(rank) % state.items
    }

    /// Draws the next popularity rank, `0` being the most popular item.
    ///
    /// [`scramble`](Self::scramble) maps a rank to the value [`sample_scrambled`] would return.
    ///
    /// [`sample_scrambled`]: Self::sample_scrambled
    pub fn rank<R: Rng>(&self, rng: &mut R) -> u64 {
        let state = *self.read_state();
        self.sample_offset(&state, rng)
    }

    /// Maps a popularity rank to its scrambled value in the current domain.
    pub fn scramble(&self, rank: u64) -> u64 {
        self.constants.min + fnv1a(rank) % self.items()
    }

    /// Changes the number of items in the domain.
    ///
    /// A larger domain extends the normalization constant incrementally, in
    /// O(`items` − current). A smaller domain is ignored for monotonic samplers and recomputed
    /// from scratch otherwise.
    pub fn grow(&self, items: u64) -> Result<(), ConfigError> {
        if items == 0 {
            return Err(ConfigError::InvalidDomain(items));
        }
        if self.read_state().items == items {
            return Ok(());
        }

        let mut state = self.write_state();
        let current = state.items;
        let theta = self.constants.theta;

        if items > current {
            let zetan = zeta(current, items, theta, state.zetan);
            *state = self.constants.state(items, zetan);
            tracing::trace!(from = current, to = items, "extended zipfian domain");
        } else if items < current {
            if self.monotonic {
                tracing::debug!(
                    current,
                    requested = items,
                    "ignoring request to shrink monotonic zipfian domain"
                );
                return Ok(());
            }

            tracing::warn!(
                current,
                requested = items,
                "recomputing zipfian distribution from scratch, this is slow for large domains"
            );
            let zetan = zeta(0, items, theta, 0.0);
            *state = self.constants.state(items, zetan);
        }

        Ok(())
    }

    fn sample_offset<R: Rng>(&self, state: &ZetaState, rng: &mut R) -> u64 {
        let u: f64 = rng.random();
        let uz = u * state.zetan;

        if uz < 1.0 {
            return 0;
        }
        if uz < 1.0 + self.constants.half_pow_theta || state.items <= 2 {
            return 1;
        }

        // `eta` is chosen so that this branch starts exactly at offset 2; truncation keeps the
        // offsets contiguous with the two special cases above.
        let base = state.eta * u - state.eta + 1.0;
        let offset = (state.items as f64 * base.powf(self.constants.alpha)) as u64;
        offset.clamp(2, state.items - 1)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ZetaState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ZetaState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Extends `initial`, the normalization constant over `from` items, to `to` items.
fn zeta(from: u64, to: u64, theta: f64, initial: f64) -> f64 {
    (from..to).fold(initial, |sum, i| sum + 1.0 / ((i + 1) as f64).powf(theta))
}

fn fnv1a(value: u64) -> u64 {
    value.to_le_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
