//! Adaptive angular binning of stacked separations.
//!
//! On-pulse samples are pooled with weight `+1` and off-pulse samples with weight `-alpha`,
//! so that the cumulative weighted sum approximates the distribution of background-subtracted
//! pulsar signal. Bin edges are placed at equal quantiles of that distribution, so each bin
//! holds roughly the same amount of genuine signal.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Pooled sample count below which adaptive binning is not attempted.
pub const MIN_ADAPTIVE_SAMPLES: usize = 20;

#[derive(Debug, Error, PartialEq)]
pub enum BinningError {
    #[error("{0}")]
    DataInsufficient(#[from] DataInsufficient),

    #[error("bin edges must be strictly increasing, but edge {index} is {edge} after {previous}")]
    NonIncreasingEdges { index: usize, previous: f64, edge: f64 },

    #[error("bin edges must be non-negative, got {0}")]
    NegativeEdge(f64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataInsufficient {
    #[error("no angular separations to bin")]
    NoSamples,

    #[error("only {edges} bin edge(s) could be formed, at least 2 are required")]
    TooFewEdges { edges: usize },
}

/// Requested binning strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinCount {
    /// Equal-signal bins; a count of zero falls back to [`BinCount::SqrtN`].
    Adaptive(usize),
    /// `sqrt(N)` equal-width bins.
    SqrtN,
}

impl Default for BinCount {
    fn default() -> Self {
        Self::Adaptive(8)
    }
}

/// On- and off-pulse separations (radians) of one stacked pulsar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsarSamples {
    pub name: String,
    pub alpha: f64,
    pub on: Vec<f64>,
    pub off: Vec<f64>,
}

/// Separations (radians) of one stacked background-dominated source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSamples {
    pub name: String,
    pub separations: Vec<f64>,
}

/// Determines bin edges (radians) covering the region of interest.
pub fn bin_edges(
    pulsars: &[PulsarSamples],
    backgrounds: &[BackgroundSamples],
    count: &BinCount,
    max_roi: f64,
) -> Result<Vec<f64>, DataInsufficient> {
    let mut pooled = Vec::with_capacity(
        pulsars
            .iter()
            .map(|pulsar| pulsar.on.len() + pulsar.off.len())
            .sum(),
    );
    for pulsar in pulsars {
        pooled.extend(within(&pulsar.on, max_roi).map(|sep| (sep, 1.0)));
        pooled.extend(within(&pulsar.off, max_roi).map(|sep| (sep, -pulsar.alpha)));
    }
    pooled.sort_by(|a, b| a.0.total_cmp(&b.0));

    let adaptive = match count {
        BinCount::Adaptive(bins) if *bins > 0 && pooled.len() >= MIN_ADAPTIVE_SAMPLES => {
            let edges = quantile_edges(&pooled, *bins, max_roi);
            if edges.is_none() {
                warn!("weighted pulsar signal is not positive; reverting to sqrt(N) bins");
            }
            edges
        }
        _ => None,
    };

    let mut edges = match adaptive {
        Some(edges) => {
            debug!("adaptive binning of {} pooled samples", pooled.len());
            edges
        }
        None => {
            let min_separation = pulsars
                .iter()
                .flat_map(|pulsar| within(&pulsar.on, max_roi).chain(within(&pulsar.off, max_roi)))
                .chain(
                    backgrounds
                        .iter()
                        .flat_map(|background| within(&background.separations, max_roi)),
                )
                .fold(f64::INFINITY, f64::min);
            if !min_separation.is_finite() {
                return Err(DataInsufficient::NoSamples);
            }
            let samples = if pooled.len() >= MIN_ADAPTIVE_SAMPLES {
                pooled.len()
            } else {
                pulsars
                    .iter()
                    .map(|pulsar| pulsar.on.len() + pulsar.off.len())
                    .chain(backgrounds.iter().map(|background| background.separations.len()))
                    .sum()
            };
            let bins = usize::max(1, (samples as f64).sqrt() as usize);
            debug!("sqrt(N) binning of {samples} samples into {bins} bins");
            (0..=bins)
                .map(|bin| min_separation + (max_roi - min_separation) * bin as f64 / bins as f64)
                .collect()
        }
    };

    let formed = edges.len();
    edges.dedup_by(|later, earlier| *later <= *earlier);
    if edges.len() != formed {
        warn!(
            "discarded {} coincident bin edge(s); {} bins remain",
            formed - edges.len(),
            edges.len().saturating_sub(1)
        );
    }
    if edges.len() < 2 {
        return Err(DataInsufficient::TooFewEdges { edges: edges.len() });
    }
    Ok(edges)
}

fn within(separations: &[f64], max_roi: f64) -> impl Iterator<Item = f64> + '_ {
    separations.iter().copied().filter(move |&sep| sep <= max_roi)
}

/// Picks, for each quantile `{0, 1/bins, …, (bins-1)/bins}`, the first sample whose normalised
/// cumulative weight reaches it. Returns `None` if the cumulative weight never turns positive.
fn quantile_edges(pooled: &[(f64, f64)], bins: usize, max_roi: f64) -> Option<Vec<f64>> {
    let mut cumulative = Vec::with_capacity(pooled.len());
    let mut sum = 0.0;
    for &(_, weight) in pooled {
        sum += weight;
        cumulative.push(sum);
    }
    let peak = cumulative.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if peak <= 0.0 {
        return None;
    }

    let mut edges = Vec::with_capacity(bins + 1);
    let mut cursor = 0;
    for bin in 0..bins {
        let quantile = bin as f64 / bins as f64;
        while cumulative[cursor] / peak < quantile {
            cursor += 1;
        }
        edges.push(pooled[cursor].0);
    }
    edges.push(max_roi);
    Some(edges)
}

/// Bin edges shared by every source in a fit, with the per-bin geometry derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngularBins {
    edges_rad: Vec<f64>,
    edges: Vec<f64>,
    iso: Vec<f64>,
    midpoints: Vec<f64>,
    half_widths: Vec<f64>,
    areas: Vec<f64>,
}
impl AngularBins {
    pub fn from_radians(edges_rad: Vec<f64>) -> Result<Self, BinningError> {
        if edges_rad.len() < 2 {
            return Err(DataInsufficient::TooFewEdges {
                edges: edges_rad.len(),
            }
            .into());
        }
        if edges_rad[0] < 0.0 {
            return Err(BinningError::NegativeEdge(edges_rad[0]));
        }
        for (index, pair) in edges_rad.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(BinningError::NonIncreasingEdges {
                    index: index + 1,
                    previous: pair[0],
                    edge: pair[1],
                });
            }
        }

        let edges = edges_rad.iter().map(|edge| edge.to_degrees()).collect::<Vec<_>>();
        let (min, max) = (edges[0], edges[edges.len() - 1]);
        let total_area = max.powi(2) - min.powi(2);
        let areas = edges
            .windows(2)
            .map(|pair| pair[1].powi(2) - pair[0].powi(2))
            .collect::<Vec<_>>();
        let iso = areas.iter().map(|area| area / total_area).collect();
        let midpoints = edges.windows(2).map(|pair| (pair[1] + pair[0]) / 2.0).collect();
        let half_widths = edges.windows(2).map(|pair| (pair[1] - pair[0]) / 2.0).collect();
        Ok(Self {
            edges_rad,
            edges,
            iso,
            midpoints,
            half_widths,
            areas,
        })
    }

    pub fn from_degrees(edges: &[f64]) -> Result<Self, BinningError> {
        Self::from_radians(edges.iter().map(|edge| edge.to_radians()).collect())
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Edges in degrees.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn edges_rad(&self) -> &[f64] {
        &self.edges_rad
    }

    /// Fraction of the full annulus area occupied by each bin.
    pub fn iso(&self) -> &[f64] {
        &self.iso
    }

    pub fn midpoints(&self) -> &[f64] {
        &self.midpoints
    }

    pub fn half_widths(&self) -> &[f64] {
        &self.half_widths
    }

    /// `hi² − lo²` per bin, in square degrees.
    pub fn areas(&self) -> &[f64] {
        &self.areas
    }

    /// Counts separations (radians) per bin. Bins are half-open except for the last, which
    /// includes its upper edge; separations outside the edges are ignored.
    pub fn histogram(&self, separations: &[f64]) -> Vec<u64> {
        let mut counts = vec![0; self.len()];
        let (lower, upper) = (self.edges_rad[0], self.edges_rad[self.len()]);
        for &sep in separations {
            if sep < lower || sep > upper {
                continue;
            }
            let bin = if sep == upper {
                self.len() - 1
            } else {
                self.edges_rad.partition_point(|&edge| edge <= sep) - 1
            };
            counts[bin] += 1;
        }
        counts
    }
}
