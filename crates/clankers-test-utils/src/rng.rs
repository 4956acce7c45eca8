//! Seeded randomness for solver fixtures.

use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// `ChaCha8Rng` seeded from `seed`. Fixtures draw all randomness from here.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Initial state of length `dim` with entries uniform in `[-1, 1)`.
pub fn deterministic_state(dim: usize, seed: u64) -> DVector<f64> {
    let mut rng = seeded_rng(seed);
    DVector::from_fn(dim, |_, _| rng.gen_range(-1.0..1.0))
}
