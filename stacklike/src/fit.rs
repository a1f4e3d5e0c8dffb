//! The combined fit: binned inputs and templates in, fitted PSF and source strengths with
//! their uncertainties out.

use std::error::Error;
use std::time::Instant;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::binning::{
    bin_edges, AngularBins, BackgroundSamples, BinCount, BinningError, DataInsufficient,
    PulsarSamples,
};
use crate::halo::{halo_template, HaloError, HaloRegistry, HaloSpec};
use crate::layout::{Layout, ParamOverride, ParamSpec, Segment};
use crate::likelihood::Likelihood;
use crate::linear::Matrix;
use crate::opt::{bounded_descent, DescentConfig, FitDidNotConverge, Termination};
use crate::psf::{default_max_roi, psf_template, Conversion, PsfIntegral};
use crate::uncertainty::{self, ErrorConfig, ProfileError, SkippedPair, Uncertainties};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(#[from] pub Box<dyn Error>);

impl From<anyhow::Error> for ValidationError {
    fn from(value: anyhow::Error) -> Self {
        ValidationError(value.into())
    }
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Binning(#[from] BinningError),

    #[error("{0}")]
    Halo(#[from] HaloError),

    #[error("{0}")]
    DidNotConverge(#[from] FitDidNotConverge),

    #[error("fitted PSF fractions sum to {0}")]
    DegeneratePsf(f64),
}

impl From<DataInsufficient> for FitError {
    fn from(value: DataInsufficient) -> Self {
        FitError::Binning(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub bins: BinCount,
    /// Outer edge of the region of interest in degrees. Derived from the PSF if absent.
    pub max_roi: Option<f64>,
    /// Characteristic energy in MeV at which the PSF is evaluated.
    pub energy: f64,
    pub conversion: Conversion,
    pub halo: HaloSpec,
    pub overrides: Vec<ParamOverride>,
    pub descent: DescentConfig,
    pub errors: ErrorConfig,
}
impl FitConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.energy <= 0.0 || !self.energy.is_finite() {
            return Err(anyhow!("energy must be positive and finite, got {}", self.energy).into());
        }
        if let Some(max_roi) = self.max_roi {
            if max_roi <= 0.0 || max_roi > 180.0 {
                return Err(anyhow!("max_roi must lie in (0, 180] degrees, got {max_roi}").into());
            }
        }
        self.descent.validate()?;
        self.errors.validate()?;
        Ok(())
    }

    /// Outer edge of the fit in degrees.
    pub fn max_roi<P: PsfIntegral + ?Sized>(&self, provider: &P) -> f64 {
        self.max_roi
            .unwrap_or_else(|| default_max_roi(provider, self.energy, self.conversion))
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            bins: BinCount::default(),
            max_roi: None,
            energy: 1000.0,
            conversion: Conversion::default(),
            halo: HaloSpec::none(),
            overrides: vec![],
            descent: DescentConfig::default(),
            errors: ErrorConfig::default(),
        }
    }
}

/// Binned on- and off-pulse counts of one pulsar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsarHistogram {
    pub name: String,
    pub alpha: f64,
    pub on: Vec<f64>,
    pub off: Vec<f64>,
}

/// Binned counts of one background-dominated source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundHistogram {
    pub name: String,
    pub counts: Vec<f64>,
}

/// Everything a fit reads: the bins, the observed counts and templates (held by the
/// likelihood), the reference PSF and the parameter specs.
#[derive(Debug, Clone, PartialEq)]
pub struct FitInput {
    pub bins: AngularBins,
    pub pulsar_names: Vec<String>,
    pub background_names: Vec<String>,
    pub likelihood: Likelihood,
    /// Reference PSF fractions from the provider.
    pub psfm: Vec<f64>,
    pub specs: Vec<ParamSpec>,
}
impl FitInput {
    /// Bins raw separations (radians) and builds the input from the resulting histograms.
    pub fn from_separations<P: PsfIntegral + ?Sized>(
        pulsars: &[PulsarSamples],
        backgrounds: &[BackgroundSamples],
        provider: &P,
        config: &FitConfig,
    ) -> Result<Self, FitError> {
        let start_time = Instant::now();
        let max_roi = config.max_roi(provider).to_radians();
        let edges = bin_edges(pulsars, backgrounds, &config.bins, max_roi)?;
        let bins = AngularBins::from_radians(edges)?;
        let counts = |separations: &[f64]| {
            bins.histogram(separations)
                .into_iter()
                .map(|count| count as f64)
                .collect::<Vec<_>>()
        };
        let pulsars = pulsars
            .iter()
            .map(|pulsar| PulsarHistogram {
                name: pulsar.name.clone(),
                alpha: pulsar.alpha,
                on: counts(&pulsar.on),
                off: counts(&pulsar.off),
            })
            .collect();
        let backgrounds = backgrounds
            .iter()
            .map(|background| BackgroundHistogram {
                name: background.name.clone(),
                counts: counts(&background.separations),
            })
            .collect();
        debug!(
            "binned separations into {} bins out to {:.3}°, took {:?}",
            bins.len(),
            max_roi.to_degrees(),
            start_time.elapsed()
        );
        Self::from_histograms(bins, pulsars, backgrounds, provider, config)
    }

    pub fn from_histograms<P: PsfIntegral + ?Sized>(
        bins: AngularBins,
        pulsars: Vec<PulsarHistogram>,
        backgrounds: Vec<BackgroundHistogram>,
        provider: &P,
        config: &FitConfig,
    ) -> Result<Self, FitError> {
        Self::from_histograms_with(&HaloRegistry::default(), bins, pulsars, backgrounds, provider, config)
    }

    /// As [`FitInput::from_histograms`], looking the halo model up in `registry`.
    pub fn from_histograms_with<P: PsfIntegral + ?Sized>(
        registry: &HaloRegistry,
        bins: AngularBins,
        pulsars: Vec<PulsarHistogram>,
        backgrounds: Vec<BackgroundHistogram>,
        provider: &P,
        config: &FitConfig,
    ) -> Result<Self, FitError> {
        if pulsars.is_empty() && backgrounds.is_empty() {
            return Err(DataInsufficient::NoSamples.into());
        }
        validate_histograms(bins.len(), &pulsars, &backgrounds).map_err(ValidationError::from)?;

        let psfm = psf_template(provider, config.energy, config.conversion, bins.edges_rad());
        let halo = match registry.construct(&config.halo)? {
            Some(model) => Some(halo_template(model.as_ref(), bins.edges_rad())?),
            None => None,
        };

        let alphas = pulsars.iter().map(|pulsar| pulsar.alpha).collect();
        let pulsar_totals = pulsars.iter().map(|pulsar| pulsar.on.iter().sum()).collect::<Vec<f64>>();
        let background_totals = backgrounds
            .iter()
            .map(|background| background.counts.iter().sum())
            .collect::<Vec<f64>>();
        let pulsar_names = pulsars.iter().map(|pulsar| pulsar.name.clone()).collect();
        let background_names = backgrounds.iter().map(|background| background.name.clone()).collect();
        let (on, off): (Vec<_>, Vec<_>) = pulsars
            .into_iter()
            .map(|pulsar| (pulsar.on, pulsar.off))
            .unzip();
        let likelihood = Likelihood::new(
            alphas,
            Matrix::from_rows(bins.len(), on),
            Matrix::from_rows(bins.len(), off),
            Matrix::from_rows(
                bins.len(),
                backgrounds.into_iter().map(|background| background.counts),
            ),
            bins.iso().to_vec(),
            halo,
        );

        let layout = likelihood.layout();
        let mut specs = layout.default_specs(
            &psfm,
            &pulsar_totals,
            &background_totals,
            likelihood.halo().is_some(),
        );
        layout
            .apply_overrides(&mut specs, &config.overrides)
            .map_err(ValidationError::from)?;
        pin_degenerate(&layout, &mut specs);

        Ok(Self {
            bins,
            pulsar_names,
            background_names,
            likelihood,
            psfm,
            specs,
        })
    }

    pub fn layout(&self) -> Layout {
        self.likelihood.layout()
    }

    /// Restarts the fit from `values`, keeping bounds and fixed flags.
    pub fn with_start(mut self, values: &[f64]) -> Result<Self, ValidationError> {
        if values.len() != self.specs.len() {
            return Err(anyhow!(
                "start vector has {} values, expected {}",
                values.len(),
                self.specs.len()
            )
            .into());
        }
        for (spec, &value) in self.specs.iter_mut().zip(values) {
            spec.init = value.clamp(spec.lower, spec.upper);
        }
        Ok(self)
    }
}

fn validate_histograms(
    bins: usize,
    pulsars: &[PulsarHistogram],
    backgrounds: &[BackgroundHistogram],
) -> Result<(), anyhow::Error> {
    let check_counts = |name: &str, kind: &str, counts: &[f64]| {
        if counts.len() != bins {
            bail!("{kind} counts of '{name}' span {} bins, expected {bins}", counts.len());
        }
        if let Some(count) = counts.iter().find(|count| **count < 0.0 || !count.is_finite()) {
            bail!("{kind} counts of '{name}' contain invalid count {count}");
        }
        Ok(())
    };
    for pulsar in pulsars {
        if pulsar.alpha <= 0.0 || !pulsar.alpha.is_finite() {
            bail!("on/off ratio of '{}' must be positive, got {}", pulsar.name, pulsar.alpha);
        }
        check_counts(&pulsar.name, "on-pulse", &pulsar.on)?;
        check_counts(&pulsar.name, "off-pulse", &pulsar.off)?;
    }
    for background in backgrounds {
        check_counts(&background.name, "background", &background.counts)?;
    }
    Ok(())
}

/// A parameter whose bounds coincide has nothing to fit; it is fixed at that value.
fn pin_degenerate(layout: &Layout, specs: &mut [ParamSpec]) {
    for (index, spec) in specs.iter_mut().enumerate() {
        if !spec.fixed && spec.lower == spec.upper {
            debug!("pinning {} at {}", layout.label(index), spec.lower);
            *spec = ParamSpec::fixed(spec.lower);
        }
    }
}

/// The parameter vector at the minimum, and what it took to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct FitState {
    pub params: Vec<f64>,
    pub value: f64,
    pub iterations: u64,
    pub evaluations: u64,
    pub termination: Termination,
}

/// Profile error in either direction. `None` where the direction was degenerate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AsymmetricError {
    pub plus: Option<f64>,
    pub minus: Option<f64>,
}
impl AsymmetricError {
    fn scaled(profile: &ProfileError, factor: f64) -> Self {
        Self {
            plus: profile.plus.map(|plus| plus * factor),
            minus: profile.minus.map(|minus| minus * factor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsarEstimate {
    pub name: String,
    pub alpha: f64,
    pub strength: f64,
    pub strength_err: f64,
    /// Background estimate per bin, in on-pulse exposure units of the off-pulse window.
    pub background: Vec<f64>,
    pub background_err: Vec<f64>,
    /// Expected on-pulse counts per bin.
    pub model: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundEstimate {
    pub name: String,
    pub psf_strength: f64,
    pub psf_strength_err: f64,
    pub iso_strength: f64,
    pub iso_strength_err: f64,
    /// Expected counts per bin from all components.
    pub model: Vec<f64>,
    /// Expected counts per bin from the isotropic component alone.
    pub isotropic: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HaloEstimate {
    pub strength: f64,
    pub strength_err: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChiSquare {
    pub value: f64,
    pub dof: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Bin edges in degrees.
    pub edges: Vec<f64>,
    /// `hi² − lo²` per bin, in square degrees.
    pub areas: Vec<f64>,
    /// Fitted PSF fractions, normalised to sum to one.
    pub psf: Vec<f64>,
    pub psf_err: Vec<f64>,
    pub psf_profile: Vec<AsymmetricError>,
    /// Reference PSF fractions from the provider.
    pub psfm: Vec<f64>,
    /// Sum of the raw PSF fractions, by which the PSF was normalised.
    pub scale: f64,
    pub pulsars: Vec<PulsarEstimate>,
    pub backgrounds: Vec<BackgroundEstimate>,
    pub halo: Option<HaloEstimate>,
    /// Negative log-likelihood at the minimum, up to a constant.
    pub likelihood: f64,
    /// Raw parameter vector at the minimum.
    pub params: Vec<f64>,
    pub profiles: Vec<ProfileError>,
    pub variances: Vec<f64>,
    pub skipped: Vec<SkippedPair>,
    pub iterations: u64,
    pub evaluations: u64,
    pub termination: Termination,
}
impl FitResult {
    fn assemble(
        input: &FitInput,
        state: FitState,
        uncertainties: Uncertainties,
    ) -> Result<Self, FitError> {
        let layout = input.layout();
        let likelihood = &input.likelihood;
        let params = &state.params;
        let variances = &uncertainties.variances;
        let err = |index: usize| variances[index].sqrt();

        let scale = layout.range(Segment::Psf).map(|index| params[index]).sum::<f64>();
        if scale <= 0.0 || !scale.is_finite() {
            return Err(FitError::DegeneratePsf(scale));
        }
        let psf = (0..layout.bins)
            .map(|bin| params[layout.psf(bin)] / scale)
            .collect::<Vec<_>>();
        let psf_err = (0..layout.bins)
            .map(|bin| err(layout.psf(bin)) / scale)
            .collect::<Vec<_>>();
        let psf_profile = (0..layout.bins)
            .map(|bin| AsymmetricError::scaled(&uncertainties.profiles[layout.psf(bin)], 1.0 / scale))
            .collect();

        let pulsars = (0..layout.pulsars)
            .map(|pulsar| {
                let index = layout.pulsar(pulsar);
                let strength = params[index] * scale;
                let strength_err = err(index) * scale;
                let alpha = likelihood.alphas()[pulsar];
                let mut background = Vec::with_capacity(layout.bins);
                let mut background_err = Vec::with_capacity(layout.bins);
                let mut model = Vec::with_capacity(layout.bins);
                for bin in 0..layout.bins {
                    let on_off = likelihood.on_off(pulsar, bin);
                    let (v, ve) = match on_off.estimate(psf[bin], strength).physical() {
                        Some(estimate) => (
                            estimate.v,
                            (estimate.dv_dm * psf_err[bin]).hypot(estimate.dv_dn * strength_err),
                        ),
                        None => {
                            warn!(
                                "no physical background estimate for {} in bin {bin}",
                                input.pulsar_names[pulsar]
                            );
                            (f64::NAN, f64::NAN)
                        }
                    };
                    background.push(v);
                    background_err.push(ve);
                    model.push(strength * psf[bin] + alpha * v);
                }
                PulsarEstimate {
                    name: input.pulsar_names[pulsar].clone(),
                    alpha,
                    strength,
                    strength_err,
                    background,
                    background_err,
                    model,
                }
            })
            .collect();

        let halo_strength = params[layout.halo()];
        let backgrounds = (0..layout.backgrounds)
            .map(|source| {
                let (psf_index, iso_index) = (layout.background_psf(source), layout.isotropic(source));
                let psf_strength = params[psf_index] * scale;
                let iso_strength = params[iso_index];
                let isotropic = likelihood
                    .iso()
                    .iter()
                    .map(|iso| iso_strength * iso)
                    .collect::<Vec<_>>();
                let model = (0..layout.bins)
                    .map(|bin| {
                        let halo = likelihood.halo().map_or(0.0, |halo| halo_strength * halo[bin]);
                        psf_strength * psf[bin] + isotropic[bin] + halo
                    })
                    .collect();
                BackgroundEstimate {
                    name: input.background_names[source].clone(),
                    psf_strength,
                    psf_strength_err: err(psf_index) * scale,
                    iso_strength,
                    iso_strength_err: err(iso_index),
                    model,
                    isotropic,
                }
            })
            .collect();

        let halo = likelihood.halo().map(|_| HaloEstimate {
            strength: halo_strength,
            strength_err: err(layout.halo()),
        });

        Ok(Self {
            edges: input.bins.edges().to_vec(),
            areas: input.bins.areas().to_vec(),
            psf,
            psf_err,
            psf_profile,
            psfm: input.psfm.clone(),
            scale,
            pulsars,
            backgrounds,
            halo,
            likelihood: state.value,
            profiles: uncertainties.profiles,
            variances: uncertainties.variances,
            skipped: uncertainties.skipped,
            iterations: state.iterations,
            evaluations: state.evaluations + uncertainties.evaluations,
            termination: state.termination,
            params: state.params,
        })
    }

    /// Per-bin values divided by the bin areas, for densities per square degree.
    pub fn densities(&self, values: &[f64]) -> Vec<f64> {
        values.iter().zip(&self.areas).map(|(value, area)| value / area).collect()
    }

    /// Chi-square of the fitted PSF against the reference PSF over the bins with a positive
    /// error.
    pub fn psf_chi_square(&self) -> ChiSquare {
        let value = self
            .psf
            .iter()
            .zip(&self.psfm)
            .zip(&self.psf_err)
            .filter(|(_, err)| **err > 0.0)
            .map(|((psf, psfm), err)| ((psf - psfm) / err).powi(2))
            .sum();
        ChiSquare {
            value,
            dof: self.psf.len(),
        }
    }
}

/// Test statistic of the alternative (halo) fit against the null fit.
pub fn halo_ts(null: &FitResult, alternative: &FitResult) -> f64 {
    2.0 * (null.likelihood - alternative.likelihood)
}

#[derive(Debug)]
pub struct Fitter {
    config: FitConfig,
}
impl Fitter {
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Minimises the likelihood and estimates the uncertainties of every parameter.
    pub fn fit(&self, input: &FitInput) -> Result<FitResult, FitError> {
        let start_time = Instant::now();
        let state = self.minimise(input)?;
        let uncertainties = uncertainty::estimate(
            &self.config.errors,
            &input.specs,
            &state.params,
            state.value,
            |values| input.likelihood.value(values),
        );
        let result = FitResult::assemble(input, state, uncertainties)?;
        debug!(
            "fitted {} parameter(s) to likelihood {:.3}, took {:?}",
            result.params.len(),
            result.likelihood,
            start_time.elapsed()
        );
        Ok(result)
    }

    pub fn minimise(&self, input: &FitInput) -> Result<FitState, FitError> {
        let outcome = bounded_descent(
            &self.config.descent,
            &input.specs,
            |values| input.likelihood.value(values),
            |values| input.likelihood.gradient(values),
        )?;
        Ok(FitState {
            params: outcome.optimal_values,
            value: outcome.optimal_value,
            iterations: outcome.iterations,
            evaluations: outcome.evaluations,
            termination: outcome.termination,
        })
    }
}

impl TryFrom<FitConfig> for Fitter {
    type Error = ValidationError;

    fn try_from(config: FitConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        Ok(Self { config })
    }
}
