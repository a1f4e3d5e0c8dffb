//! Instrument PSF providers.
//!
//! A provider answers a single question: what fraction of the PSF lies between two angular
//! separations, for photons of a given energy and conversion type. Everything else (the
//! reference PSF template of a fit, the default region of interest) is derived from that.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Tracker conversion type of the photons being stacked.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Conversion {
    Front,
    Back,
    All,
}

impl Default for Conversion {
    fn default() -> Self {
        Self::Front
    }
}

pub trait PsfIntegral {
    /// Fraction of the PSF contained between `low` and `high` radians at `energy` MeV.
    fn integral(&self, energy: f64, conversion: Conversion, low: f64, high: f64) -> f64;
}

/// Parameters of a King profile whose scale narrows with energy as
/// `σ(E) = sqrt((c0·(E/100)^-β)² + c1²)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KingParams {
    /// Scale at 100 MeV, radians.
    pub c0: f64,
    /// High-energy floor of the scale, radians.
    pub c1: f64,
    pub beta: f64,
    /// Tail index; must exceed 1.
    pub gamma: f64,
}
impl KingParams {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.c0.is_nan() || self.c0 <= 0.0 || self.c1 < 0.0 {
            bail!("King scale coefficients must satisfy c0 > 0 and c1 ≥ 0");
        }
        if !self.beta.is_finite() {
            bail!("King energy index must be finite");
        }
        if self.gamma.is_nan() || self.gamma <= 1.0 {
            bail!("King tail index must exceed 1");
        }
        Ok(())
    }

    pub fn sigma(&self, energy: f64) -> f64 {
        let scaled = self.c0 * (energy / 100.0).powf(-self.beta);
        (scaled.powi(2) + self.c1.powi(2)).sqrt()
    }

    /// Containment within `theta` radians at `energy`.
    pub fn cdf(&self, energy: f64, theta: f64) -> f64 {
        let u = theta.powi(2) / (2.0 * self.sigma(energy).powi(2));
        1.0 - (1.0 + u / self.gamma).powf(1.0 - self.gamma)
    }
}

/// King-function PSF with separate front and back parameters. The `All` conversion type is
/// an equal mixture of the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KingPsf {
    pub front: KingParams,
    pub back: KingParams,
}
impl KingPsf {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.front.validate()?;
        self.back.validate()
    }

    fn cdf(&self, energy: f64, conversion: Conversion, theta: f64) -> f64 {
        match conversion {
            Conversion::Front => self.front.cdf(energy, theta),
            Conversion::Back => self.back.cdf(energy, theta),
            Conversion::All => {
                (self.front.cdf(energy, theta) + self.back.cdf(energy, theta)) / 2.0
            }
        }
    }
}

impl PsfIntegral for KingPsf {
    fn integral(&self, energy: f64, conversion: Conversion, low: f64, high: f64) -> f64 {
        self.cdf(energy, conversion, high) - self.cdf(energy, conversion, low)
    }
}

/// Energy-independent PSF given as a tabulated cumulative containment curve, linearly
/// interpolated between knots and clamped outside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabulatedPsf {
    radii: Vec<f64>,
    cumulative: Vec<f64>,
}
impl TabulatedPsf {
    pub fn try_new(radii: Vec<f64>, cumulative: Vec<f64>) -> Result<Self, anyhow::Error> {
        if radii.len() != cumulative.len() {
            bail!(
                "{} radii supplied with {} cumulative fractions",
                radii.len(),
                cumulative.len()
            );
        }
        if radii.len() < 2 {
            bail!("at least two knots are required");
        }
        if radii.windows(2).any(|pair| pair[1] <= pair[0]) {
            bail!("radii must be strictly increasing");
        }
        if cumulative.windows(2).any(|pair| pair[1] < pair[0]) {
            bail!("cumulative fractions must be non-decreasing");
        }
        Ok(Self { radii, cumulative })
    }

    fn cdf(&self, theta: f64) -> f64 {
        let last = self.radii.len() - 1;
        if theta <= self.radii[0] {
            return self.cumulative[0];
        }
        if theta >= self.radii[last] {
            return self.cumulative[last];
        }
        let upper = self.radii.partition_point(|&radius| radius <= theta);
        let (r0, r1) = (self.radii[upper - 1], self.radii[upper]);
        let (c0, c1) = (self.cumulative[upper - 1], self.cumulative[upper]);
        c0 + (c1 - c0) * (theta - r0) / (r1 - r0)
    }
}

impl PsfIntegral for TabulatedPsf {
    fn integral(&self, _energy: f64, _conversion: Conversion, low: f64, high: f64) -> f64 {
        self.cdf(high) - self.cdf(low)
    }
}

/// Per-bin PSF fractions over `edges` (radians), normalised to the fraction within the
/// outermost edges so that they sum to one.
pub fn psf_template<P: PsfIntegral + ?Sized>(
    provider: &P,
    energy: f64,
    conversion: Conversion,
    edges: &[f64],
) -> Vec<f64> {
    let total = provider.integral(energy, conversion, edges[0], edges[edges.len() - 1]);
    edges
        .windows(2)
        .map(|pair| provider.integral(energy, conversion, pair[0], pair[1]) / total)
        .collect()
}

/// Radius (radians) containing `fraction` of the PSF, found by bisection.
pub fn containment_radius<P: PsfIntegral + ?Sized>(
    provider: &P,
    energy: f64,
    conversion: Conversion,
    fraction: f64,
) -> f64 {
    const ITERATIONS: usize = 200;
    let contained = |theta: f64| provider.integral(energy, conversion, 0.0, theta);
    let mut high = 1e-3;
    while contained(high) < fraction && high < std::f64::consts::PI {
        high *= 2.0;
    }
    let mut low = 0.0;
    for _ in 0..ITERATIONS {
        let mid = (low + high) / 2.0;
        if contained(mid) < fraction {
            low = mid;
        } else {
            high = mid;
        }
        if high - low <= f64::EPSILON * high {
            break;
        }
    }
    (low + high) / 2.0
}

/// Default outer edge of the fit, in degrees: half as much again as the 99.5% containment.
pub fn default_max_roi<P: PsfIntegral + ?Sized>(
    provider: &P,
    energy: f64,
    conversion: Conversion,
) -> f64 {
    1.5 * containment_radius(provider, energy, conversion, 0.995).to_degrees()
}
