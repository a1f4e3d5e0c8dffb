//! Parameter uncertainties from the shape of the likelihood around its minimum.
//!
//! Errors are estimated in two stages. First, each free parameter is stepped away from the
//! minimum in either direction, holding all others fixed, until the likelihood rises by one
//! half. These profile errors ignore correlations. Second, for each pair of free parameters,
//! the likelihood is sampled on an octagon spanned by their profile errors and a quadratic
//! surface is fitted; profiling the partner out of that surface gives the correlated error.
//! The largest correction over all partners is kept.

use std::time::Instant;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conic::{Conic, ConicError, OCTAGON};
use crate::layout::ParamSpec;
use crate::likelihood::Score;
use crate::opt::{crossing_search, Crossing, RootSearchConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Whether to apply the pairwise correlation correction.
    pub correlated: bool,
    /// Rise in the negative log-likelihood that defines one standard error.
    pub level: f64,
    pub search: RootSearchConfig,
}
impl ErrorConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.level <= 0.0 {
            bail!("likelihood rise level must be positive");
        }
        self.search.validate()
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            correlated: true,
            level: 0.5,
            search: RootSearchConfig::default(),
        }
    }
}

/// One-dimensional profile error. A direction is `None` if a rejected point was met before
/// the crossing, or if the crossing was never bracketed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileError {
    pub plus: Option<f64>,
    pub minus: Option<f64>,
    pub variance: f64,
}
impl ProfileError {
    fn fixed() -> Self {
        Self {
            plus: Some(0.0),
            minus: Some(0.0),
            variance: 0.0,
        }
    }

    pub fn is_determined(&self) -> bool {
        self.variance.is_finite() && self.variance > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    RejectedSample,
    Regression(String),
    NotConvexInY,
    NotConvexProfile,
    NegativeDiscriminant,
    NonFinite,
}

impl From<ConicError> for SkipReason {
    fn from(err: ConicError) -> Self {
        match err {
            ConicError::Regression(message) => SkipReason::Regression(message),
            ConicError::NotConvexInY(_) => SkipReason::NotConvexInY,
            ConicError::NotConvexProfile(_) => SkipReason::NotConvexProfile,
            ConicError::NegativeDiscriminant(_) => SkipReason::NegativeDiscriminant,
            ConicError::NonFinite => SkipReason::NonFinite,
        }
    }
}

/// A correlation fit of `param` against `partner` that was abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPair {
    pub param: usize,
    pub partner: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uncertainties {
    pub profiles: Vec<ProfileError>,
    /// Final variances: correlation-corrected where at least one pair succeeded, otherwise the
    /// profile variance.
    pub variances: Vec<f64>,
    pub skipped: Vec<SkippedPair>,
    pub evaluations: u64,
}

/// Profile errors followed, if configured, by the correlation correction.
pub fn estimate(
    config: &ErrorConfig,
    specs: &[ParamSpec],
    optimum: &[f64],
    minimum: f64,
    mut value_f: impl FnMut(&[f64]) -> Score,
) -> Uncertainties {
    let start_time = Instant::now();
    let mut evaluations = 0;
    let mut counted = |values: &[f64]| {
        evaluations += 1;
        value_f(values)
    };
    let profiles = profile_errors(config, specs, optimum, minimum, &mut counted);
    let (variances, skipped) = if config.correlated {
        correlated_variances(config, specs, optimum, minimum, &profiles, &mut counted)
    } else {
        (profiles.iter().map(|profile| profile.variance).collect(), vec![])
    };
    debug!(
        "estimated {} uncertainties with {evaluations} evaluations, {} pair(s) skipped, took {:?}",
        profiles.len(),
        skipped.len(),
        start_time.elapsed()
    );
    Uncertainties {
        profiles,
        variances,
        skipped,
        evaluations,
    }
}

/// Stage one: per-parameter crossings of `minimum + level` in either direction.
pub fn profile_errors(
    config: &ErrorConfig,
    specs: &[ParamSpec],
    optimum: &[f64],
    minimum: f64,
    mut value_f: impl FnMut(&[f64]) -> Score,
) -> Vec<ProfileError> {
    let mut point = optimum.to_vec();
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            if spec.fixed {
                return ProfileError::fixed();
            }
            let init_step = config.search.init_step(optimum[index]);
            let mut crossing = |sign: f64| {
                let found = crossing_search(&config.search, init_step, config.level, |offset| {
                    point[index] = optimum[index] + sign * offset;
                    rise(value_f(&point), minimum)
                });
                point[index] = optimum[index];
                match found {
                    Crossing::Found(offset) => Some(offset),
                    Crossing::Rejected | Crossing::NotBracketed => None,
                }
            };
            let (plus, minus) = (crossing(1.0), crossing(-1.0));
            let variance = match (plus, minus) {
                (Some(plus), Some(minus)) => plus * minus,
                (Some(only), None) | (None, Some(only)) => {
                    debug!("parameter {index} has one degenerate direction");
                    only * only
                }
                (None, None) => {
                    warn!("parameter {index} is undetermined in both directions");
                    f64::NAN
                }
            };
            ProfileError {
                plus,
                minus,
                variance,
            }
        })
        .collect()
}

/// Stage two: correlation-corrected variances and the pairs that could not be fitted.
pub fn correlated_variances(
    config: &ErrorConfig,
    specs: &[ParamSpec],
    optimum: &[f64],
    minimum: f64,
    profiles: &[ProfileError],
    mut value_f: impl FnMut(&[f64]) -> Score,
) -> (Vec<f64>, Vec<SkippedPair>) {
    let partners = specs
        .iter()
        .zip(profiles)
        .enumerate()
        .filter(|(_, (spec, profile))| !spec.fixed && profile.is_determined())
        .map(|(index, _)| index)
        .collect::<Vec<_>>();

    let mut skipped = vec![];
    let mut point = optimum.to_vec();
    let variances = profiles
        .iter()
        .enumerate()
        .map(|(param, profile)| {
            if !partners.contains(&param) {
                return profile.variance;
            }
            let err = profile.variance.sqrt();
            let mut largest: Option<f64> = None;
            for &partner in partners.iter().filter(|&&partner| partner != param) {
                let partner_err = profiles[partner].variance.sqrt();
                let correction = pair_correction(
                    config.level,
                    &mut point,
                    optimum,
                    minimum,
                    (param, err),
                    (partner, partner_err),
                    &mut value_f,
                );
                match correction {
                    Ok(correction) => {
                        largest = Some(largest.map_or(correction, |largest| largest.max(correction)));
                    }
                    Err(reason) => {
                        warn!("skipped correlation of parameter {param} with {partner}: {reason:?}");
                        skipped.push(SkippedPair {
                            param,
                            partner,
                            reason,
                        });
                    }
                }
            }
            match largest {
                Some(largest) => (largest * err).powi(2),
                None => profile.variance,
            }
        })
        .collect();
    (variances, skipped)
}

fn pair_correction(
    level: f64,
    point: &mut [f64],
    optimum: &[f64],
    minimum: f64,
    (param, err): (usize, f64),
    (partner, partner_err): (usize, f64),
    value_f: &mut impl FnMut(&[f64]) -> Score,
) -> Result<f64, SkipReason> {
    let mut samples = Vec::with_capacity(OCTAGON.len());
    for (x, y) in OCTAGON {
        point[param] = optimum[param] + x * err;
        point[partner] = optimum[partner] + y * partner_err;
        let sampled = rise(value_f(point), minimum);
        point[param] = optimum[param];
        point[partner] = optimum[partner];
        match sampled {
            Score::Valid(rise) => samples.push((x, y, rise)),
            Score::Rejected => return Err(SkipReason::RejectedSample),
        }
    }
    let conic = Conic::fit(&samples)?;
    conic.profile_crossing(level).map_err(SkipReason::from)
}

#[inline]
fn rise(score: Score, minimum: f64) -> Score {
    match score {
        Score::Valid(value) => Score::Valid(value - minimum),
        Score::Rejected => Score::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use assert_float_eq::*;

    use super::*;

    const SIGMA_X: f64 = 2.0;
    const SIGMA_Y: f64 = 0.5;
    const RHO: f64 = 0.6;

    /// Negative log-likelihood of a correlated bivariate normal centred on (3, −1).
    fn gaussian(values: &[f64]) -> Score {
        let x = (values[0] - 3.0) / SIGMA_X;
        let y = (values[1] + 1.0) / SIGMA_Y;
        Score::Valid(0.5 * (x * x + y * y - 2.0 * RHO * x * y) / (1.0 - RHO * RHO))
    }

    fn free_specs(len: usize) -> Vec<ParamSpec> {
        (0..len).map(|_| ParamSpec::free(0.0, -100.0, 100.0)).collect()
    }

    #[test]
    fn profile_errors_are_conditional() {
        let config = ErrorConfig::default();
        let profiles = profile_errors(&config, &free_specs(2), &[3.0, -1.0], 0.0, gaussian);
        let conditional = (1.0 - RHO * RHO).sqrt();
        assert_float_relative_eq!(SIGMA_X * conditional, profiles[0].plus.unwrap(), 1e-9);
        assert_float_relative_eq!(SIGMA_X * conditional, profiles[0].minus.unwrap(), 1e-9);
        assert_float_relative_eq!((SIGMA_Y * conditional).powi(2), profiles[1].variance, 1e-9);
    }

    #[test]
    fn profile_crossing_rises_by_level() {
        let config = ErrorConfig::default();
        let optimum = [3.0, -1.0];
        let profiles = profile_errors(&config, &free_specs(2), &optimum, 0.0, gaussian);
        let plus = [optimum[0] + profiles[0].plus.unwrap(), optimum[1]];
        let minus = [optimum[0], optimum[1] - profiles[1].minus.unwrap()];
        assert_float_absolute_eq!(0.5, gaussian(&plus).valid().unwrap(), 1e-9);
        assert_float_absolute_eq!(0.5, gaussian(&minus).valid().unwrap(), 1e-9);
    }

    #[test]
    fn correlated_errors_are_marginal() {
        let config = ErrorConfig::default();
        let uncertainties = estimate(&config, &free_specs(2), &[3.0, -1.0], 0.0, gaussian);
        assert!(uncertainties.skipped.is_empty(), "{:?}", uncertainties.skipped);
        assert_float_relative_eq!(SIGMA_X.powi(2), uncertainties.variances[0], 1e-6);
        assert_float_relative_eq!(SIGMA_Y.powi(2), uncertainties.variances[1], 1e-6);
        assert!(uncertainties.evaluations > 16);
    }

    #[test]
    fn uncorrelated_estimate_keeps_profiles() {
        let config = ErrorConfig {
            correlated: false,
            ..ErrorConfig::default()
        };
        let uncertainties = estimate(&config, &free_specs(2), &[3.0, -1.0], 0.0, gaussian);
        let profile_variances = uncertainties
            .profiles
            .iter()
            .map(|profile| profile.variance)
            .collect::<Vec<_>>();
        assert_eq!(profile_variances, uncertainties.variances);
    }

    #[test]
    fn degenerate_direction_mirrors_other() {
        let config = ErrorConfig::default();
        let value_f = |values: &[f64]| {
            if values[0] > 0.1 {
                Score::Rejected
            } else {
                Score::Valid(values[0] * values[0] / 2.0)
            }
        };
        let profiles = profile_errors(&config, &free_specs(1), &[0.0], 0.0, value_f);
        assert_eq!(None, profiles[0].plus);
        assert_float_relative_eq!(1.0, profiles[0].minus.unwrap(), 1e-9);
        assert_float_relative_eq!(1.0, profiles[0].variance, 1e-9);
    }

    #[test]
    fn both_directions_degenerate() {
        let config = ErrorConfig::default();
        let profiles = profile_errors(&config, &free_specs(1), &[0.0], 0.0, |_| Score::Valid(0.0));
        assert_eq!((None, None), (profiles[0].plus, profiles[0].minus));
        assert!(profiles[0].variance.is_nan());
        assert!(!profiles[0].is_determined());
    }

    #[test]
    fn fixed_parameters_have_no_error() {
        let config = ErrorConfig::default();
        let mut specs = free_specs(3);
        specs[1] = ParamSpec::fixed(-1.0);
        let value_f = |values: &[f64]| {
            // a third, independent parameter centred on zero
            gaussian(&values[..2]).valid().map_or(Score::Rejected, |value| {
                Score::Valid(value + values[2] * values[2] / 2.0)
            })
        };
        let uncertainties = estimate(&config, &specs, &[3.0, -1.0, 0.0], 0.0, value_f);
        assert_eq!(0.0, uncertainties.variances[1]);
        assert_eq!(ProfileError::fixed(), uncertainties.profiles[1]);
        // with y pinned, x and z are uncorrelated, so the conditional error stands
        let conditional = SIGMA_X * (1.0 - RHO * RHO).sqrt();
        assert_float_relative_eq!(conditional.powi(2), uncertainties.variances[0], 1e-6);
        assert_float_relative_eq!(1.0, uncertainties.variances[2], 1e-6);
    }

    #[test]
    fn rejected_samples_skip_pairs() {
        let config = ErrorConfig::default();
        // axes are valid, but any point off both axes is rejected
        let value_f = |values: &[f64]| {
            if values[0].abs() > 1e-12 && values[1].abs() > 1e-12 {
                Score::Rejected
            } else {
                Score::Valid(values[0] * values[0] / 2.0 + values[1] * values[1] / 2.0)
            }
        };
        let uncertainties = estimate(&config, &free_specs(2), &[0.0, 0.0], 0.0, value_f);
        assert_eq!(
            vec![
                SkippedPair {
                    param: 0,
                    partner: 1,
                    reason: SkipReason::RejectedSample
                },
                SkippedPair {
                    param: 1,
                    partner: 0,
                    reason: SkipReason::RejectedSample
                },
            ],
            uncertainties.skipped
        );
        assert_float_relative_eq!(1.0, uncertainties.variances[0], 1e-9);
        assert_float_relative_eq!(1.0, uncertainties.variances[1], 1e-9);
    }
}
