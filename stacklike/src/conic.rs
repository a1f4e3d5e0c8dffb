//! Quadratic surface fitted to likelihood rises around a minimum, and the profile of that
//! surface along one axis.

use std::f64::consts::FRAC_1_SQRT_2;

use linregress::fit_low_level_regression_model;
use thiserror::Error;

use crate::linear::Matrix;

/// Unit-radius octagon around the origin, starting on the positive x-axis and running
/// anticlockwise.
pub const OCTAGON: [(f64, f64); 8] = [
    (1.0, 0.0),
    (FRAC_1_SQRT_2, FRAC_1_SQRT_2),
    (0.0, 1.0),
    (-FRAC_1_SQRT_2, FRAC_1_SQRT_2),
    (-1.0, 0.0),
    (-FRAC_1_SQRT_2, -FRAC_1_SQRT_2),
    (0.0, -1.0),
    (FRAC_1_SQRT_2, -FRAC_1_SQRT_2),
];

#[derive(Debug, Error, PartialEq)]
pub enum ConicError {
    #[error("regression failed: {0}")]
    Regression(String),

    #[error("surface is not convex in y (y² coefficient {0})")]
    NotConvexInY(f64),

    #[error("profile is not convex (x² coefficient {0})")]
    NotConvexProfile(f64),

    #[error("profile never reaches the level (discriminant {0})")]
    NegativeDiscriminant(f64),

    #[error("crossing is not finite")]
    NonFinite,
}

/// `f(x, y) = p0·x² + p1·x + p2·y² + p3·y + p4·x·y`, anchored at `f(0, 0) = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conic {
    pub coefficients: [f64; 5],
}
impl Conic {
    /// Least-squares fit to `(x, y, f)` samples. No constant term is fitted, so that samples
    /// on a circle (where `x² + y²` is constant) do not make the design degenerate.
    pub fn fit(samples: &[(f64, f64, f64)]) -> Result<Self, ConicError> {
        let rows = samples.iter().map(|&(x, y, f)| vec![f, x * x, x, y * y, y, x * y]);
        let data = Matrix::from_rows(6, rows);
        let model = fit_low_level_regression_model(data.flatten(), data.rows(), data.cols())
            .map_err(|err| ConicError::Regression(err.to_string()))?;
        let parameters = model.parameters();
        if parameters.len() != 5 {
            return Err(ConicError::Regression(format!(
                "expected 5 coefficients, got {}",
                parameters.len()
            )));
        }
        let mut coefficients = [0.0; 5];
        coefficients.copy_from_slice(parameters);
        Ok(Self { coefficients })
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        let [p0, p1, p2, p3, p4] = self.coefficients;
        p0 * x * x + p1 * x + p2 * y * y + p3 * y + p4 * x * y
    }

    /// Positive `x` at which `min_y f(x, y)` reaches `level`.
    pub fn profile_crossing(&self, level: f64) -> Result<f64, ConicError> {
        let [p0, p1, p2, p3, p4] = self.coefficients;
        if p2 <= 0.0 || p2.is_nan() {
            return Err(ConicError::NotConvexInY(p2));
        }
        // min over y at y = −(p3 + p4·x) / 2p2 leaves A·x² + B·x + C = 0
        let a = p0 - p4 * p4 / (4.0 * p2);
        let b = p1 - p3 * p4 / (2.0 * p2);
        let c = -level - p3 * p3 / (4.0 * p2);
        if a <= 0.0 || a.is_nan() {
            return Err(ConicError::NotConvexProfile(a));
        }
        let discriminant = b * b - 4.0 * a * c;
        if discriminant < 0.0 {
            return Err(ConicError::NegativeDiscriminant(discriminant));
        }
        let crossing = (-b + discriminant.sqrt()) / (2.0 * a);
        if crossing.is_finite() {
            Ok(crossing)
        } else {
            Err(ConicError::NonFinite)
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_float_eq::*;
    use stacklike_testing::assert_slice_f64_absolute;

    use super::*;

    fn sample(f: impl Fn(f64, f64) -> f64) -> Vec<(f64, f64, f64)> {
        OCTAGON.iter().map(|&(x, y)| (x, y, f(x, y))).collect()
    }

    #[test]
    fn octagon_on_unit_circle() {
        for (x, y) in OCTAGON {
            assert_float_absolute_eq!(1.0, x.hypot(y), 1e-15);
        }
    }

    #[test]
    fn recovers_exact_quadratic() {
        let conic = Conic::fit(&sample(|x, y| {
            0.7 * x * x - 0.1 * x + 0.4 * y * y + 0.05 * y + 0.2 * x * y
        }))
        .unwrap();
        assert_slice_f64_absolute(&[0.7, -0.1, 0.4, 0.05, 0.2], &conic.coefficients, 1e-9);
        assert_float_absolute_eq!(0.7 - 0.1 + 0.4 + 0.05 + 0.2, conic.evaluate(1.0, 1.0), 1e-9);
    }

    #[test]
    fn correlated_gaussian_profile() {
        // x and y in units of their conditional errors; the marginal error of x is 1/sqrt(1 − ρ²)
        // conditional units, which is where the profile crosses 1/2
        let rho: f64 = 0.6;
        let conditional = (1.0 - rho * rho).sqrt();
        let conic = Conic::fit(&sample(|x, y| {
            let (x, y) = (x * conditional, y * conditional);
            0.5 * (x * x + y * y - 2.0 * rho * x * y) / (1.0 - rho * rho)
        }))
        .unwrap();
        let crossing = conic.profile_crossing(0.5).unwrap();
        assert_float_relative_eq!(1.0 / conditional, crossing, 1e-9);
    }

    #[test]
    fn uncorrelated_profile_with_linear_term() {
        let conic = Conic::fit(&sample(|x, y| 0.5 * x * x + 0.1 * x + 0.5 * y * y)).unwrap();
        let crossing = conic.profile_crossing(0.5).unwrap();
        assert_float_relative_eq!(-0.1 + 1.01f64.sqrt(), crossing, 1e-9);
    }

    #[test]
    fn rejects_concave_y() {
        let conic = Conic {
            coefficients: [0.5, 0.0, -0.5, 0.0, 0.0],
        };
        assert_eq!(Err(ConicError::NotConvexInY(-0.5)), conic.profile_crossing(0.5));
    }

    #[test]
    fn rejects_non_convex_profile() {
        // the cross term dominates, so the surface is a saddle
        let conic = Conic {
            coefficients: [0.5, 0.0, 0.5, 0.0, 2.0],
        };
        assert_eq!(Err(ConicError::NotConvexProfile(-1.5)), conic.profile_crossing(0.5));
    }
}
