//! Extended halo models and the registry through which they are looked up by name.

use std::fmt::Debug;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HaloError {
    #[error("unknown halo model '{0}'")]
    UnknownModel(String),

    #[error("invalid parameters for halo model '{model}': {reason}")]
    InvalidParameters { model: String, reason: String },

    #[error("halo model '{0}' has no support within the fitted region")]
    NoSupport(String),
}

/// Radial profile of an extended component, integrated over annuli.
pub trait HaloModel: Debug {
    fn name(&self) -> &str;

    /// Unnormalised integral over the annulus `[low, high]` radians.
    fn integral(&self, low: f64, high: f64) -> f64;
}

/// Name and parameters of the halo model to fit. An empty name fits no halo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaloSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: Vec<f64>,
}
impl HaloSpec {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(name: impl Into<String>, params: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn is_none(&self) -> bool {
        self.name.is_empty()
    }
}

/// Gaussian surface brightness of width `sigma` radians.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianHalo {
    sigma: f64,
}
impl GaussianHalo {
    pub fn construct(params: &[f64]) -> Result<Box<dyn HaloModel>, HaloError> {
        let sigma = single_size("gaussian", params)?;
        Ok(Box::new(Self { sigma }))
    }
}

impl HaloModel for GaussianHalo {
    fn name(&self) -> &str {
        "gaussian"
    }

    fn integral(&self, low: f64, high: f64) -> f64 {
        let var2 = 2.0 * self.sigma.powi(2);
        (-low.powi(2) / var2).exp() - (-high.powi(2) / var2).exp()
    }
}

/// Uniform disk of angular `radius` radians.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskHalo {
    radius: f64,
}
impl DiskHalo {
    pub fn construct(params: &[f64]) -> Result<Box<dyn HaloModel>, HaloError> {
        let radius = single_size("disk", params)?;
        Ok(Box::new(Self { radius }))
    }
}

impl HaloModel for DiskHalo {
    fn name(&self) -> &str {
        "disk"
    }

    fn integral(&self, low: f64, high: f64) -> f64 {
        let (low, high) = (low.min(self.radius), high.min(self.radius));
        (high.powi(2) - low.powi(2)) / self.radius.powi(2)
    }
}

fn single_size(model: &str, params: &[f64]) -> Result<f64, HaloError> {
    match params {
        [size] if *size > 0.0 && size.is_finite() => Ok(*size),
        [size] => Err(HaloError::InvalidParameters {
            model: model.into(),
            reason: format!("size must be positive, got {size}"),
        }),
        _ => Err(HaloError::InvalidParameters {
            model: model.into(),
            reason: format!("expected 1 parameter, got {}", params.len()),
        }),
    }
}

pub type HaloConstructor = fn(&[f64]) -> Result<Box<dyn HaloModel>, HaloError>;

/// Maps model names to their constructors. The default registry holds the built-in
/// `gaussian` (also registered as `halo`) and `disk` models.
#[derive(Clone)]
pub struct HaloRegistry {
    constructors: FxHashMap<String, HaloConstructor>,
}
impl HaloRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: HaloConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names = self.constructors.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// Builds the model named in `spec`, or `None` if the spec names no model.
    pub fn construct(&self, spec: &HaloSpec) -> Result<Option<Box<dyn HaloModel>>, HaloError> {
        if spec.is_none() {
            return Ok(None);
        }
        let constructor = self
            .constructors
            .get(&spec.name)
            .ok_or_else(|| HaloError::UnknownModel(spec.name.clone()))?;
        constructor(&spec.params).map(Some)
    }
}

impl Debug for HaloRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaloRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl Default for HaloRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("gaussian", GaussianHalo::construct);
        registry.register("halo", GaussianHalo::construct);
        registry.register("disk", DiskHalo::construct);
        registry
    }
}

/// Per-bin halo fractions over `edges` (radians), normalised over the outermost edges.
pub fn halo_template(model: &dyn HaloModel, edges: &[f64]) -> Result<Vec<f64>, HaloError> {
    let total = model.integral(edges[0], edges[edges.len() - 1]);
    if total <= 0.0 || !total.is_finite() {
        return Err(HaloError::NoSupport(model.name().into()));
    }
    Ok(edges
        .windows(2)
        .map(|pair| model.integral(pair[0], pair[1]) / total)
        .collect())
}

#[cfg(test)]
mod tests {
    use assert_float_eq::*;
    use stacklike_testing::assert_slice_f64_absolute;

    use super::*;

    #[test]
    fn gaussian_template() {
        let registry = HaloRegistry::default();
        let model = registry
            .construct(&HaloSpec::new("gaussian", vec![0.01]))
            .unwrap()
            .unwrap();
        let edges = [0.0, 0.01, 0.02, 1.0];
        let template = halo_template(model.as_ref(), &edges).unwrap();
        let half = (-0.5f64).exp();
        let two = (-2.0f64).exp();
        assert_slice_f64_absolute(&[1.0 - half, half - two, two], &template, 1e-12);
        assert_float_absolute_eq!(1.0, template.iter().sum::<f64>(), 1e-12);
    }

    #[test]
    fn alias_matches_gaussian() {
        let registry = HaloRegistry::default();
        let edges = [0.001, 0.01, 0.05];
        let gaussian = registry.construct(&HaloSpec::new("gaussian", vec![0.02])).unwrap().unwrap();
        let alias = registry.construct(&HaloSpec::new("halo", vec![0.02])).unwrap().unwrap();
        assert_eq!(
            halo_template(gaussian.as_ref(), &edges).unwrap(),
            halo_template(alias.as_ref(), &edges).unwrap()
        );
    }

    #[test]
    fn disk_template() {
        let model = DiskHalo::construct(&[0.02]).unwrap();
        let template = halo_template(model.as_ref(), &[0.0, 0.01, 0.02, 0.03]).unwrap();
        assert_slice_f64_absolute(&[0.25, 0.75, 0.0], &template, 1e-12);
    }

    #[test]
    fn disk_inside_inner_edge_has_no_support() {
        let model = DiskHalo::construct(&[0.01]).unwrap();
        assert_eq!(
            Err(HaloError::NoSupport("disk".into())),
            halo_template(model.as_ref(), &[0.02, 0.03])
        );
    }

    #[test]
    fn empty_name_is_no_halo() {
        let registry = HaloRegistry::default();
        assert!(registry.construct(&HaloSpec::none()).unwrap().is_none());
    }

    #[test]
    fn unknown_model() {
        let registry = HaloRegistry::default();
        assert_eq!(
            "unknown halo model 'nfw'",
            registry
                .construct(&HaloSpec::new("nfw", vec![0.1]))
                .unwrap_err()
                .to_string()
        );
    }

    #[test]
    fn invalid_parameters() {
        let registry = HaloRegistry::default();
        assert_eq!(
            "invalid parameters for halo model 'gaussian': size must be positive, got -0.1",
            registry
                .construct(&HaloSpec::new("halo", vec![-0.1]))
                .unwrap_err()
                .to_string()
        );
        assert_eq!(
            "invalid parameters for halo model 'disk': expected 1 parameter, got 2",
            registry
                .construct(&HaloSpec::new("disk", vec![0.1, 0.2]))
                .unwrap_err()
                .to_string()
        );
    }

    #[test]
    fn custom_registration() {
        let mut registry = HaloRegistry::empty();
        assert!(registry.names().is_empty());
        registry.register("wide", DiskHalo::construct);
        assert_eq!(vec!["wide"], registry.names());
        assert!(registry.construct(&HaloSpec::new("wide", vec![1.0])).unwrap().is_some());
        assert_eq!(vec!["disk", "gaussian", "halo"], HaloRegistry::default().names());
    }
}
