//! JSON persistence of fit requests and results.

use std::fs::File;
use std::io::Error;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{from_reader, to_writer_pretty};

use crate::binning::{BackgroundSamples, PulsarSamples};
use crate::fit::FitConfig;
use crate::psf::KingPsf;

/// Reads a JSON-encoded type from a given file `path`.
pub fn read_json<D: DeserializeOwned>(path: impl AsRef<Path>) -> Result<D, Error> {
    let file = File::open(path)?;
    Ok(from_reader(file)?)
}

// JSON-encodes the `value` in pretty-printed form and writes it to a given `path`.
pub fn write_json(path: impl AsRef<Path>, value: &impl Serialize) -> Result<(), Error> {
    let file = File::create(path)?;
    Ok(to_writer_pretty(file, value)?)
}

pub trait ReadJsonFile<D> {
    fn read_json_file(path: impl AsRef<Path>) -> Result<D, Error>;
}

impl<D: DeserializeOwned> ReadJsonFile<D> for D {
    fn read_json_file(path: impl AsRef<Path>) -> Result<D, Error> {
        read_json(path)
    }
}

pub trait WriteJsonFile<S: Serialize> {
    fn write_json_file(&self, path: impl AsRef<Path>) -> Result<(), Error>;
}

impl<S: Serialize> WriteJsonFile<S> for S {
    fn write_json_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        write_json(path, self)
    }
}

/// Everything needed to run a fit from the command line: the separations of every stacked
/// source (radians), the instrument PSF and the fit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRequest {
    #[serde(default)]
    pub pulsars: Vec<PulsarSamples>,
    #[serde(default)]
    pub backgrounds: Vec<BackgroundSamples>,
    pub psf: KingPsf,
    #[serde(default)]
    pub config: FitConfig,
}

#[cfg(test)]
mod tests {
    use std::env;

    use crate::binning::BinCount;
    use crate::psf::Conversion;

    use super::*;

    const REQUEST: &str = r#"{
        "pulsars": [{"name": "vela", "alpha": 0.5, "on": [0.001, 0.002], "off": [0.003]}],
        "psf": {
            "front": {"c0": 0.058, "c1": 0.000377, "beta": 0.8, "gamma": 2.2},
            "back": {"c0": 0.096, "c1": 0.0013, "beta": 0.8, "gamma": 2.2}
        },
        "config": {"bins": "sqrt_n", "conversion": "back", "energy": 1333.0}
    }"#;

    #[test]
    fn request_with_defaults() {
        let request: FitRequest = serde_json::from_str(REQUEST).unwrap();
        assert_eq!(1, request.pulsars.len());
        assert_eq!(0.5, request.pulsars[0].alpha);
        assert!(request.backgrounds.is_empty());
        assert_eq!(BinCount::SqrtN, request.config.bins);
        assert_eq!(Conversion::Back, request.config.conversion);
        assert_eq!(None, request.config.max_roi);
        request.psf.validate().unwrap();
    }

    #[test]
    fn write_then_read_file() {
        let request: FitRequest = serde_json::from_str(REQUEST).unwrap();
        let path = env::temp_dir().join(format!("stacklike-request-{}.json", std::process::id()));
        request.write_json_file(&path).unwrap();
        let read = FitRequest::read_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(request, read);
    }
}
