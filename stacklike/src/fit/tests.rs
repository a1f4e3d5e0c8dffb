use assert_float_eq::*;
use stacklike_testing::{assert_slice_f64_absolute, assert_slice_f64_relative, Sampler};

use crate::halo::HaloSpec;
use crate::psf::TabulatedPsf;

use super::*;

fn edges() -> Vec<f64> {
    vec![0.0, 0.01, 0.02, 0.04]
}

/// Tabulated PSF placing 0.5, 0.3 and 0.2 of its weight in the three test bins.
fn mock_psf() -> TabulatedPsf {
    TabulatedPsf::try_new(edges(), vec![0.0, 0.5, 0.8, 1.0]).unwrap()
}

fn bins() -> AngularBins {
    AngularBins::from_radians(edges()).unwrap()
}

fn pulsar(name: &str) -> PulsarHistogram {
    PulsarHistogram {
        name: name.into(),
        alpha: 1.0,
        on: vec![100.0, 50.0, 10.0],
        off: vec![20.0, 15.0, 8.0],
    }
}

fn agn(counts: Vec<f64>) -> BackgroundHistogram {
    BackgroundHistogram {
        name: "agn".into(),
        counts,
    }
}

fn input(backgrounds: Vec<BackgroundHistogram>, config: &FitConfig) -> FitInput {
    FitInput::from_histograms(
        bins(),
        vec![pulsar("vela"), pulsar("geminga")],
        backgrounds,
        &mock_psf(),
        config,
    )
    .unwrap()
}

fn fit(input: &FitInput, config: FitConfig) -> FitResult {
    Fitter::try_from(config).unwrap().fit(input).unwrap()
}

#[test]
fn reference_template_from_provider() {
    let input = input(vec![], &FitConfig::default());
    assert_slice_f64_absolute(&[0.5, 0.3, 0.2], &input.psfm, 1e-15);
    assert_eq!(Layout::new(3, 2, 0), input.layout());
    assert_eq!(vec!["vela", "geminga"], input.pulsar_names);
    // halo fixed at zero without a model
    assert_eq!(ParamSpec::fixed(0.0), input.specs[input.layout().halo()]);
}

#[test]
fn recovers_pulsar_strength_and_background() {
    let input = input(vec![], &FitConfig::default());
    let result = fit(&input, FitConfig::default());
    assert_float_absolute_eq!(1.0, result.psf.iter().sum::<f64>(), 1e-12);
    assert_slice_f64_relative(&[80.0 / 117.0, 35.0 / 117.0, 2.0 / 117.0], &result.psf, 1e-4);
    for pulsar in &result.pulsars {
        assert_float_relative_eq!(117.0, pulsar.strength, 1e-4);
        assert_slice_f64_absolute(&[20.0, 15.0, 8.0], &pulsar.background, 1e-2);
        assert_slice_f64_absolute(&[100.0, 50.0, 10.0], &pulsar.model, 1e-2);
        assert!(pulsar.strength_err > 0.0, "{pulsar:?}");
        assert!(pulsar.background_err.iter().all(|err| err.is_finite()), "{pulsar:?}");
    }
    assert!(result.halo.is_none());
    assert!(result.psf_err.iter().all(|err| *err > 0.0), "{:?}", result.psf_err);
}

#[test]
fn profile_errors_raise_likelihood_by_half() {
    let input = input(vec![], &FitConfig::default());
    let result = fit(&input, FitConfig::default());
    let index = input.layout().pulsar(0);
    let profile = &result.profiles[index];
    for offset in [profile.plus.unwrap(), -profile.minus.unwrap()] {
        let mut params = result.params.clone();
        params[index] += offset;
        let rise = input.likelihood.value(&params).valid().unwrap() - result.likelihood;
        assert_float_absolute_eq!(0.5, rise, 1e-6);
    }
}

#[test]
fn refit_from_optimum_is_a_fixed_point() {
    let input = input(vec![agn(vec![30.0, 20.0, 40.0])], &FitConfig::default());
    let first = fit(&input, FitConfig::default());
    let second = fit(&input.clone().with_start(&first.params).unwrap(), FitConfig::default());
    assert_slice_f64_absolute(&first.psf, &second.psf, 1e-6);
    assert_float_relative_eq!(first.pulsars[0].strength, second.pulsars[0].strength, 1e-6);
    assert_float_relative_eq!(
        first.backgrounds[0].iso_strength,
        second.backgrounds[0].iso_strength,
        1e-6
    );
    assert!(second.likelihood <= first.likelihood + 1e-9);
}

#[test]
fn halo_held_at_zero_matches_no_halo() {
    let backgrounds = vec![agn(vec![30.0, 20.0, 40.0])];
    let without = FitConfig::default();
    let held = FitConfig {
        halo: HaloSpec::new("gaussian", vec![0.01]),
        overrides: vec![ParamOverride::fix(Segment::Halo, 0, 0.0)],
        ..FitConfig::default()
    };
    let without = fit(&input(backgrounds.clone(), &without), without);
    let held = fit(&input(backgrounds, &held), held);
    assert_eq!(without.likelihood, held.likelihood);
    assert_eq!(without.params, held.params);
    assert_eq!(without.psf, held.psf);
    assert_eq!(without.pulsars, held.pulsars);
    assert_eq!(without.backgrounds, held.backgrounds);
    assert_eq!(None, without.halo);
    assert_eq!(
        Some(HaloEstimate {
            strength: 0.0,
            strength_err: 0.0
        }),
        held.halo
    );
}

#[test]
fn empty_background_source_contributes_nothing() {
    let config = FitConfig::default();
    let with_empty = input(vec![agn(vec![0.0; 3])], &config);
    let layout = with_empty.layout();
    assert!(with_empty.specs[layout.background_psf(0)].fixed);
    assert!(with_empty.specs[layout.isotropic(0)].fixed);

    let with_empty = fit(&with_empty, config.clone());
    let pulsars_only = fit(&input(vec![], &config), config);
    let background = &with_empty.backgrounds[0];
    assert_eq!(0.0, background.psf_strength);
    assert_eq!(0.0, background.iso_strength);
    assert_eq!(0.0, background.psf_strength_err);
    assert_eq!(vec![0.0; 3], background.model);
    assert_float_relative_eq!(pulsars_only.likelihood, with_empty.likelihood, 1e-9);
}

#[test]
fn free_halo_cannot_worsen_the_fit() {
    let backgrounds = vec![agn(vec![30.0, 20.0, 40.0])];
    let null = FitConfig::default();
    let alternative = FitConfig {
        halo: HaloSpec::new("disk", vec![0.03]),
        ..FitConfig::default()
    };
    let null = fit(&input(backgrounds.clone(), &null), null);
    let alternative = fit(&input(backgrounds, &alternative), alternative);
    assert!(halo_ts(&null, &alternative) > -1e-6);
    assert!(alternative.halo.unwrap().strength >= 0.0);
}

#[test]
fn chi_square_against_reference() {
    let result = fit(&input(vec![], &FitConfig::default()), FitConfig::default());
    let chi_square = result.psf_chi_square();
    assert_eq!(3, chi_square.dof);
    let expected = (0..3)
        .map(|bin| ((result.psf[bin] - result.psfm[bin]) / result.psf_err[bin]).powi(2))
        .sum::<f64>();
    assert_float_relative_eq!(expected, chi_square.value, 1e-12);
}

#[test]
fn densities_per_square_degree() {
    let result = fit(&input(vec![], &FitConfig::default()), FitConfig::default());
    let model = &result.pulsars[0].model;
    let densities = result.densities(model);
    for bin in 0..3 {
        assert_float_relative_eq!(model[bin] / result.areas[bin], densities[bin], 1e-15);
    }
}

#[test]
fn from_separations_bins_every_source() {
    let max_roi = 0.05;
    let mut sampler = Sampler::seeded(7);
    let mut on = sampler.king(400, 0.004, 2.5, max_roi);
    on.extend(sampler.isotropic(200, max_roi));
    let off = sampler.isotropic(200, max_roi);
    let separations = sampler.isotropic(300, max_roi);
    let config = FitConfig {
        max_roi: Some(max_roi.to_degrees()),
        bins: BinCount::Adaptive(6),
        ..FitConfig::default()
    };
    let input = FitInput::from_separations(
        &[PulsarSamples {
            name: "vela".into(),
            alpha: 1.0,
            on,
            off,
        }],
        &[BackgroundSamples {
            name: "agn".into(),
            separations,
        }],
        &mock_psf(),
        &config,
    )
    .unwrap();
    assert_eq!(6, input.bins.len());
    assert_eq!(Layout::new(6, 1, 1), input.layout());
    let on_total = input.likelihood.on().row_slice(0).iter().sum::<f64>();
    assert!((595.0..=600.0).contains(&on_total), "{on_total}");
    assert_float_absolute_eq!(1.0, input.psfm.iter().sum::<f64>(), 1e-12);
}

#[test]
fn no_sources() {
    let result = FitInput::from_histograms(bins(), vec![], vec![], &mock_psf(), &FitConfig::default());
    assert!(matches!(
        result,
        Err(FitError::Binning(BinningError::DataInsufficient(
            DataInsufficient::NoSamples
        )))
    ));
}

#[test]
fn invalid_histograms() {
    let mut short = pulsar("vela");
    short.off.pop();
    let err = FitInput::from_histograms(bins(), vec![short], vec![], &mock_psf(), &FitConfig::default())
        .unwrap_err();
    assert_eq!("off-pulse counts of 'vela' span 2 bins, expected 3", err.to_string());

    let mut negative = pulsar("vela");
    negative.alpha = -1.0;
    let err =
        FitInput::from_histograms(bins(), vec![negative], vec![], &mock_psf(), &FitConfig::default())
            .unwrap_err();
    assert_eq!("on/off ratio of 'vela' must be positive, got -1", err.to_string());
}

#[test]
fn start_vector_of_wrong_length() {
    let input = input(vec![], &FitConfig::default());
    let err = input.with_start(&[0.5, 0.5]).unwrap_err();
    assert_eq!("start vector has 2 values, expected 6", err.to_string());
}

#[test]
fn unknown_halo_model() {
    let config = FitConfig {
        halo: HaloSpec::new("nfw", vec![1.0]),
        ..FitConfig::default()
    };
    let err = FitInput::from_histograms(bins(), vec![pulsar("vela")], vec![], &mock_psf(), &config)
        .unwrap_err();
    assert!(matches!(err, FitError::Halo(HaloError::UnknownModel(_))), "{err:?}");
}

#[test]
fn override_out_of_range() {
    let config = FitConfig {
        overrides: vec![ParamOverride::fix(Segment::Pulsar, 2, 1.0)],
        ..FitConfig::default()
    };
    let err = FitInput::from_histograms(bins(), vec![pulsar("vela")], vec![], &mock_psf(), &config)
        .unwrap_err();
    assert_eq!(
        "override index 2 exceeds the 1 parameter(s) of segment Npj",
        err.to_string()
    );
}

#[test]
fn config_validation() {
    let config = FitConfig {
        energy: 0.0,
        ..FitConfig::default()
    };
    assert_eq!(
        "energy must be positive and finite, got 0",
        Fitter::try_from(config).unwrap_err().to_string()
    );
    let config = FitConfig {
        max_roi: Some(200.0),
        ..FitConfig::default()
    };
    assert!(Fitter::try_from(config).is_err());
    assert!(Fitter::try_from(FitConfig::default()).is_ok());
}

#[test]
fn config_from_sparse_json() {
    let config: FitConfig = serde_json::from_str(r#"{"energy": 1333.0, "max_roi": 2.5}"#).unwrap();
    assert_eq!(1333.0, config.energy);
    assert_eq!(Some(2.5), config.max_roi);
    assert_eq!(BinCount::default(), config.bins);
    assert!(config.halo.is_none());
}
