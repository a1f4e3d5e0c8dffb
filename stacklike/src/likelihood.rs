//! Combined negative log-likelihood of pulsar on/off histograms and background-source
//! histograms, with its analytic gradient.

use serde::{Deserialize, Serialize};

use crate::background::{Background, OnOff};
use crate::layout::Layout;
use crate::linear::Matrix;


/// Outcome of evaluating the likelihood (or one gradient component) at a parameter vector.
/// A `Rejected` point lies outside the physical domain and is worse than any valid one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Valid(f64),
    Rejected,
}
impl Score {
    #[inline]
    pub fn valid(self) -> Option<f64> {
        match self {
            Score::Valid(value) => Some(value),
            Score::Rejected => None,
        }
    }

    #[inline]
    pub fn is_rejected(self) -> bool {
        matches!(self, Score::Rejected)
    }

    fn from_finite(value: f64) -> Self {
        if value.is_finite() {
            Score::Valid(value)
        } else {
            Score::Rejected
        }
    }
}

/// Binned observations and templates that the parameter vector is scored against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Likelihood {
    /// On/off exposure ratio per pulsar.
    alphas: Vec<f64>,
    /// Pulsars × bins.
    on: Matrix<f64>,
    off: Matrix<f64>,
    /// Background sources × bins.
    background: Matrix<f64>,
    iso: Vec<f64>,
    halo: Option<Vec<f64>>,
}
impl Likelihood {
    /// Assembles the model. The shapes must agree: one alpha per on/off row, every row as long
    /// as `iso`, and the halo template (if any) as long as `iso`.
    pub(crate) fn new(
        alphas: Vec<f64>,
        on: Matrix<f64>,
        off: Matrix<f64>,
        background: Matrix<f64>,
        iso: Vec<f64>,
        halo: Option<Vec<f64>>,
    ) -> Self {
        let bins = iso.len();
        assert_eq!(alphas.len(), on.rows(), "one alpha per pulsar is required");
        assert_eq!(on.rows(), off.rows(), "on/off pulsar counts differ");
        for matrix in [&on, &off, &background] {
            assert!(matrix.rows() == 0 || matrix.cols() == bins, "{} columns ≠ {bins} bins", matrix.cols());
        }
        if let Some(halo) = &halo {
            assert_eq!(bins, halo.len(), "halo template length");
        }
        Self {
            alphas,
            on,
            off,
            background,
            iso,
            halo,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.iso.len(), self.on.rows(), self.background.rows())
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn on(&self) -> &Matrix<f64> {
        &self.on
    }

    pub fn off(&self) -> &Matrix<f64> {
        &self.off
    }

    pub fn background(&self) -> &Matrix<f64> {
        &self.background
    }

    pub fn iso(&self) -> &[f64] {
        &self.iso
    }

    pub fn halo(&self) -> Option<&[f64]> {
        self.halo.as_deref()
    }

    #[inline]
    pub fn on_off(&self, pulsar: usize, bin: usize) -> OnOff {
        OnOff {
            alpha: self.alphas[pulsar],
            on: self.on[(pulsar, bin)],
            off: self.off[(pulsar, bin)],
        }
    }

    /// Expected count of background source `source` in `bin`.
    #[inline]
    pub fn background_rate(&self, params: &[f64], source: usize, bin: usize) -> f64 {
        let layout = self.layout();
        let rate = params[layout.background_psf(source)] * params[layout.psf(bin)]
            + params[layout.isotropic(source)] * self.iso[bin];
        match &self.halo {
            Some(halo) => rate + params[layout.halo()] * halo[bin],
            None => rate,
        }
    }

    /// Negative log-likelihood, up to a parameter-independent constant.
    pub fn value(&self, params: &[f64]) -> Score {
        let layout = self.layout();
        debug_assert_eq!(layout.len(), params.len());
        let mut acc = 0.0;

        for pulsar in 0..layout.pulsars {
            let strength = params[layout.pulsar(pulsar)];
            for bin in 0..layout.bins {
                let m = params[layout.psf(bin)];
                let counts = self.on_off(pulsar, bin);
                let Some(v) = counts.value(m, strength) else {
                    return Score::Rejected;
                };
                let lambda = strength * m + counts.alpha * v;
                let (Some(on), Some(off)) = (poisson(counts.on, lambda), poisson(counts.off, v)) else {
                    return Score::Rejected;
                };
                acc += on + off;
            }
        }

        for source in 0..layout.backgrounds {
            for bin in 0..layout.bins {
                let rate = self.background_rate(params, source, bin);
                let Some(term) = poisson(self.background[(source, bin)], rate) else {
                    return Score::Rejected;
                };
                acc += term;
            }
        }

        Score::from_finite(acc)
    }

    /// Partial derivatives of [`Likelihood::value`]. A component is `Rejected` if any term
    /// contributing to it meets an invalid denominator or turns out non-finite.
    pub fn gradient(&self, params: &[f64]) -> Vec<Score> {
        let layout = self.layout();
        debug_assert_eq!(layout.len(), params.len());
        let mut grad = vec![0.0; layout.len()];
        let mut rejected = vec![false; layout.len()];

        for pulsar in 0..layout.pulsars {
            let strength_index = layout.pulsar(pulsar);
            let strength = params[strength_index];
            for bin in 0..layout.bins {
                let m_index = layout.psf(bin);
                let m = params[m_index];
                let counts = self.on_off(pulsar, bin);
                let estimate = match counts.estimate(m, strength) {
                    Background::Physical(estimate) => estimate,
                    Background::Unphysical { .. } => {
                        rejected[m_index] = true;
                        rejected[strength_index] = true;
                        continue;
                    }
                };
                let lambda = strength * m + counts.alpha * estimate.v;
                let (Some(d_on), Some(d_off)) = (
                    rate_factor(counts.on, lambda),
                    rate_factor(counts.off, estimate.v),
                ) else {
                    rejected[m_index] = true;
                    rejected[strength_index] = true;
                    continue;
                };
                grad[m_index] += d_on * (strength + counts.alpha * estimate.dv_dm)
                    + d_off * estimate.dv_dm;
                grad[strength_index] +=
                    d_on * (m + counts.alpha * estimate.dv_dn) + d_off * estimate.dv_dn;
            }
        }

        for source in 0..layout.backgrounds {
            let psf_strength_index = layout.background_psf(source);
            let iso_index = layout.isotropic(source);
            for bin in 0..layout.bins {
                let m_index = layout.psf(bin);
                let rate = self.background_rate(params, source, bin);
                let Some(factor) = rate_factor(self.background[(source, bin)], rate) else {
                    rejected[m_index] = true;
                    rejected[psf_strength_index] = true;
                    rejected[iso_index] = true;
                    if self.halo.is_some() {
                        rejected[layout.halo()] = true;
                    }
                    continue;
                };
                grad[m_index] += factor * params[psf_strength_index];
                grad[psf_strength_index] += factor * params[m_index];
                grad[iso_index] += factor * self.iso[bin];
                if let Some(halo) = &self.halo {
                    grad[layout.halo()] += factor * halo[bin];
                }
            }
        }

        grad.into_iter()
            .zip(rejected)
            .map(|(component, rejected)| {
                if rejected {
                    Score::Rejected
                } else {
                    Score::from_finite(component)
                }
            })
            .collect()
    }
}

/// `rate − count·ln(rate)`, or `None` if the rate cannot produce the count.
#[inline]
fn poisson(count: f64, rate: f64) -> Option<f64> {
    if rate < 0.0 {
        None
    } else if count > 0.0 {
        if rate == 0.0 {
            None
        } else {
            Some(rate - count * rate.ln())
        }
    } else {
        Some(rate)
    }
}

/// `∂/∂rate` of [`poisson`]: `1 − count/rate`, which is exactly `1` for an empty bin.
#[inline]
fn rate_factor(count: f64, rate: f64) -> Option<f64> {
    if rate < 0.0 {
        None
    } else if count == 0.0 {
        Some(1.0)
    } else if rate > 0.0 {
        Some(1.0 - count / rate)
    } else {
        None
    }
}
