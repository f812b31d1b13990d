//! Jitter strategies that spread retry delays so clients do not retry in lockstep.
//!
//! - `None`: exact delays, for tests and tightly controlled workflows.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`, keeping a floor.
//!
//! Uses `rand`'s thread-local RNG; pass your own through [`Jitter::apply_with_rng`] for
//! deterministic tests.

use rand::{rng, Rng};
use serde::Deserialize;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the backoff delay unchanged.
    None,
    /// Random between 0 and delay.
    #[default]
    Full,
    /// Random between delay/2 and delay.
    Equal,
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-provided RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let factor: f64 = match self {
            Jitter::None => return delay,
            Jitter::Full => rng.random_range(0.0..=1.0),
            Jitter::Equal => rng.random_range(0.5..=1.0),
        };
        // Float rounding on very large delays may overshoot by a few nanoseconds.
        delay.mul_f64(factor).min(delay)
    }
}
