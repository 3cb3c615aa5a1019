//! Randomization source for jitter
//!
//! Retry jitter perturbs computed delays to avoid thundering-herd retries.
//! The source is a trait so tests can pin the perturbation.

use rand::Rng;

/// Source of uniform randomness for jitter calculations.
pub trait Randomizer: Send + Sync {
    /// Return a uniformly distributed value in `[0.0, 1.0)`.
    fn next_f64(&self) -> f64;
}

/// Production randomizer backed by the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngRandomizer;

impl Randomizer for ThreadRngRandomizer {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Deterministic randomizer returning a fixed value, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandomizer(pub f64);

impl Randomizer for FixedRandomizer {
    fn next_f64(&self) -> f64 {
        self.0
    }
}
