//! Partitioning of the flat parameter vector into its named segments.

use std::ops::Range;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Parameter segments, in the order in which they appear in the vector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    /// Per-bin PSF fractions `m`.
    #[strum(serialize = "m")]
    Psf,
    /// Pulsar strengths `Npj`.
    #[strum(serialize = "Npj")]
    Pulsar,
    /// PSF-shaped strengths of background sources `Naj`.
    #[strum(serialize = "Naj")]
    BackgroundPsf,
    /// Isotropic strengths of background sources `Ni`.
    #[strum(serialize = "Ni")]
    Isotropic,
    /// Shared halo strength `Nh`.
    #[strum(serialize = "Nh")]
    Halo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub init: f64,
    pub lower: f64,
    pub upper: f64,
    pub fixed: bool,
}
impl ParamSpec {
    pub fn free(init: f64, lower: f64, upper: f64) -> Self {
        Self {
            init,
            lower,
            upper,
            fixed: false,
        }
    }

    pub fn fixed(init: f64) -> Self {
        Self {
            init,
            lower: init,
            upper: init,
            fixed: true,
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.init.is_finite() {
            bail!("initial value must be finite");
        }
        if self.lower.is_nan() || self.upper.is_nan() || self.lower > self.upper {
            bail!("bounds [{}, {}] are not ordered", self.lower, self.upper);
        }
        if !self.fixed && (self.init < self.lower || self.init > self.upper) {
            bail!(
                "initial value {} lies outside [{}, {}]",
                self.init,
                self.lower,
                self.upper
            );
        }
        Ok(())
    }
}

/// Caller adjustment of a single parameter; fields left as `None` keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamOverride {
    pub segment: Segment,
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub init: Option<f64>,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub fixed: Option<bool>,
}
impl ParamOverride {
    pub fn fix(segment: Segment, index: usize, value: f64) -> Self {
        Self {
            segment,
            index,
            init: Some(value),
            lower: None,
            upper: None,
            fixed: Some(true),
        }
    }

    fn apply(&self, spec: &mut ParamSpec) {
        if let Some(init) = self.init {
            spec.init = init;
        }
        if let Some(lower) = self.lower {
            spec.lower = lower;
        }
        if let Some(upper) = self.upper {
            spec.upper = upper;
        }
        if let Some(fixed) = self.fixed {
            spec.fixed = fixed;
        }
    }
}

/// Segment boundaries for a fit of `bins` bins, `pulsars` pulsars and `backgrounds`
/// background sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub bins: usize,
    pub pulsars: usize,
    pub backgrounds: usize,
}
impl Layout {
    pub fn new(bins: usize, pulsars: usize, backgrounds: usize) -> Self {
        Self {
            bins,
            pulsars,
            backgrounds,
        }
    }

    pub fn len(&self) -> usize {
        self.bins + self.pulsars + 2 * self.backgrounds + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn range(&self, segment: Segment) -> Range<usize> {
        let start = match segment {
            Segment::Psf => 0,
            Segment::Pulsar => self.bins,
            Segment::BackgroundPsf => self.bins + self.pulsars,
            Segment::Isotropic => self.bins + self.pulsars + self.backgrounds,
            Segment::Halo => self.bins + self.pulsars + 2 * self.backgrounds,
        };
        start..start + self.segment_len(segment)
    }

    pub fn segment_len(&self, segment: Segment) -> usize {
        match segment {
            Segment::Psf => self.bins,
            Segment::Pulsar => self.pulsars,
            Segment::BackgroundPsf | Segment::Isotropic => self.backgrounds,
            Segment::Halo => 1,
        }
    }

    #[inline]
    pub fn psf(&self, bin: usize) -> usize {
        bin
    }

    #[inline]
    pub fn pulsar(&self, pulsar: usize) -> usize {
        self.bins + pulsar
    }

    #[inline]
    pub fn background_psf(&self, background: usize) -> usize {
        self.bins + self.pulsars + background
    }

    #[inline]
    pub fn isotropic(&self, background: usize) -> usize {
        self.bins + self.pulsars + self.backgrounds + background
    }

    #[inline]
    pub fn halo(&self) -> usize {
        self.bins + self.pulsars + 2 * self.backgrounds
    }

    pub fn index(&self, segment: Segment, offset: usize) -> usize {
        self.range(segment).start + offset
    }

    /// Segment and offset within the segment of a flat index.
    pub fn locate(&self, index: usize) -> (Segment, usize) {
        assert!(index < self.len(), "index {index} outside a layout of {}", self.len());
        [
            Segment::Psf,
            Segment::Pulsar,
            Segment::BackgroundPsf,
            Segment::Isotropic,
            Segment::Halo,
        ]
        .into_iter()
        .map(|segment| (segment, self.range(segment)))
        .find(|(_, range)| range.contains(&index))
        .map(|(segment, range)| (segment, index - range.start))
        .unwrap_or((Segment::Halo, 0))
    }

    /// Human-readable name of a flat index, such as `m[3]` or `Nh`.
    pub fn label(&self, index: usize) -> String {
        match self.locate(index) {
            (Segment::Halo, _) => Segment::Halo.to_string(),
            (segment, offset) => format!("{segment}[{offset}]"),
        }
    }

    /// Initial values, bounds and fixed flags before caller overrides. `psfm` seeds the PSF
    /// fractions; strengths start at half of each source's total count and may range to a
    /// hundredfold of it either side. The halo strength is bounded by the first background
    /// source's total count and is fixed at zero when no halo is fitted.
    pub fn default_specs(
        &self,
        psfm: &[f64],
        pulsar_totals: &[f64],
        background_totals: &[f64],
        halo_active: bool,
    ) -> Vec<ParamSpec> {
        assert_eq!(self.bins, psfm.len());
        assert_eq!(self.pulsars, pulsar_totals.len());
        assert_eq!(self.backgrounds, background_totals.len());
        let strength = |total: f64| ParamSpec::free(total / 2.0, -100.0 * total, 100.0 * total);

        let mut specs = Vec::with_capacity(self.len());
        specs.extend(psfm.iter().map(|&m| ParamSpec::free(m, -1.0, 1.0)));
        specs.extend(pulsar_totals.iter().copied().map(strength));
        specs.extend(background_totals.iter().copied().map(strength));
        specs.extend(background_totals.iter().copied().map(strength));
        let halo_limit = background_totals.first().copied().unwrap_or(0.0);
        specs.push(ParamSpec {
            init: 0.0,
            lower: 0.0,
            upper: halo_limit,
            fixed: !halo_active,
        });
        specs
    }

    /// Applies caller overrides to `specs`, validating every resulting spec.
    pub fn apply_overrides(
        &self,
        specs: &mut [ParamSpec],
        overrides: &[ParamOverride],
    ) -> Result<(), anyhow::Error> {
        for param_override in overrides {
            let len = self.segment_len(param_override.segment);
            if param_override.index >= len {
                bail!(
                    "override index {} exceeds the {} parameter(s) of segment {}",
                    param_override.index,
                    len,
                    param_override.segment
                );
            }
            let index = self.index(param_override.segment, param_override.index);
            param_override.apply(&mut specs[index]);
        }
        for (index, spec) in specs.iter().enumerate() {
            if let Err(err) = spec.validate() {
                bail!("parameter {}: {err}", self.label(index));
            }
        }
        Ok(())
    }
}
