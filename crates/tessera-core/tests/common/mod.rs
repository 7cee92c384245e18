//! Shared utilities for integration tests

#![allow(dead_code)]

pub use approx::assert_relative_eq;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera_core::Tile;

pub const EPSILON: f64 = 1e-10;

/// Matrix shapes that exercise full, edge and single-element tiles
pub fn edge_case_shapes() -> Vec<(usize, usize, usize)> {
    vec![
        // (m, n, tile size)
        (1, 1, 1),
        (4, 4, 4),
        (5, 5, 4),
        (7, 3, 2),
        (3, 7, 2),
        (16, 16, 4),
        (17, 13, 5),
    ]
}

/// Seeded random tile with entries in [-1, 1)
pub fn random_tile(rows: usize, cols: usize, seed: u64) -> Tile<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Tile::from_fn(rows, cols, |_, _| rng.gen_range(-1.0..1.0))
}

/// Assert two tiles are equal within tolerance
pub fn assert_tiles_close(actual: &Tile<f64>, expected: &Tile<f64>, tol: f64, context: &str) {
    assert_eq!(
        (actual.rows(), actual.cols()),
        (expected.rows(), expected.cols()),
        "shape mismatch for {context}"
    );
    for j in 0..actual.cols() {
        for i in 0..actual.rows() {
            let (a, e) = (actual.get(i, j), expected.get(i, j));
            assert!(
                (a - e).abs() <= tol * (1.0 + e.abs()),
                "{context}: entry ({i}, {j}) is {a}, expected {e}"
            );
        }
    }
}
