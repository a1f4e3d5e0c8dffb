//! Testing helpers shared across the workspace: slice assertions and deterministic
//! synthetic angular-separation samplers.

use assert_float_eq::*;
use tinyrand::{Rand, Seeded, StdRand};

pub fn assert_slice_f64_relative(expected: &[f64], actual: &[f64], epsilon: f64) {
    assert_eq!(
        expected.len(),
        actual.len(),
        "lengths do not match: {} ≠ {}",
        expected.len(),
        actual.len()
    );
    for (index, &expected) in expected.iter().enumerate() {
        let actual = actual[index];
        if actual != expected {
            assert_float_relative_eq!(expected, actual, epsilon);
        }
    }
}

pub fn assert_slice_f64_absolute(expected: &[f64], actual: &[f64], epsilon: f64) {
    assert_eq!(
        expected.len(),
        actual.len(),
        "lengths do not match: {} ≠ {}",
        expected.len(),
        actual.len()
    );
    for (index, &expected) in expected.iter().enumerate() {
        let actual = actual[index];
        if actual != expected {
            assert_float_absolute_eq!(expected, actual, epsilon);
        }
    }
}

/// Asserts that `values` is strictly increasing.
pub fn assert_strictly_increasing(values: &[f64]) {
    for pair in values.windows(2) {
        assert!(pair[0] < pair[1], "{} ≥ {} in {values:?}", pair[0], pair[1]);
    }
}

/// Seeded sampler of angular separations (radians). The same seed always yields the
/// same sample sequence.
pub struct Sampler {
    rand: StdRand,
}
impl Sampler {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rand: StdRand::seed(seed),
        }
    }

    /// Uniform deviate in the open interval (0, 1).
    pub fn uniform(&mut self) -> f64 {
        loop {
            let value = (self.rand.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
            if value > 0.0 {
                return value;
            }
        }
    }

    /// Separations drawn from a King profile with scale `sigma` and tail index `gamma`,
    /// truncated at `max_roi`.
    pub fn king(&mut self, samples: usize, sigma: f64, gamma: f64, max_roi: f64) -> Vec<f64> {
        assert!(gamma > 1.0, "tail index must exceed 1");
        let mut separations = Vec::with_capacity(samples);
        while separations.len() < samples {
            let survival = self.uniform();
            let u = gamma * (survival.powf(1.0 / (1.0 - gamma)) - 1.0);
            let separation = sigma * (2.0 * u).sqrt();
            if separation <= max_roi {
                separations.push(separation);
            }
        }
        separations
    }

    /// Separations uniform in solid angle (flat in θ²) out to `max_roi`.
    pub fn isotropic(&mut self, samples: usize, max_roi: f64) -> Vec<f64> {
        (0..samples)
            .map(|_| max_roi * self.uniform().sqrt())
            .collect()
    }
}
