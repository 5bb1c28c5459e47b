//! Golden conformance testing infrastructure.
//!
//! Compares op outputs against recorded reference values, with a
//! deterministic seeded RNG for inputs and configurable tolerances.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use tangram_core::{Engine, Result, Tensor};

/// A recorded reference case: one op, its inputs, and the expected output.
#[derive(Deserialize)]
pub struct GoldenCase {
    pub op: String,
    pub inputs: Vec<GoldenTensor>,
    pub expected: GoldenTensor,
}

/// Tensor data as stored in golden files.
#[derive(Deserialize)]
pub struct GoldenTensor {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// Parse a JSON golden file into cases.
pub fn load_golden(json: &str) -> serde_json::Result<Vec<GoldenCase>> {
    serde_json::from_str(json)
}

/// Assert two f32 slices are element-wise close.
pub fn assert_allclose(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: actual={} expected={}",
        actual.len(),
        expected.len()
    );
    for (i, (x, y)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "mismatch at [{i}]: actual={x} expected={y} diff={diff} tol={tol}"
        );
    }
}

/// Assert a tensor's contents are element-wise close to `expected`.
pub fn assert_tensor_allclose(actual: &Tensor, expected: &[f32], atol: f32, rtol: f32) {
    let data = actual
        .to_vec_f32()
        .unwrap_or_else(|e| panic!("could not read tensor: {e}"));
    assert_allclose(&data, expected, atol, rtol);
}

/// Deterministic uniform values in `[lo, hi)`.
pub fn seeded_uniform(seed: u64, lo: f32, hi: f32, numel: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..numel).map(|_| rng.gen_range(lo..hi)).collect()
}

/// A tensor of deterministic uniform values in `[lo, hi)`.
pub fn seeded_tensor(
    engine: &std::sync::Arc<Engine>,
    seed: u64,
    lo: f32,
    hi: f32,
    dims: &[i64],
) -> Result<Tensor> {
    let numel: i64 = dims.iter().product();
    let data = seeded_uniform(seed, lo, hi, numel as usize);
    engine.tensor(&data, dims)
}
