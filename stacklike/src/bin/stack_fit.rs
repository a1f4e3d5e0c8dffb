use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail};
use clap::Parser;
use stanza::renderer::console::Console;
use stanza::renderer::Renderer;
use tracing::{debug, info};

use stacklike::binning::BinCount;
use stacklike::file::{FitRequest, ReadJsonFile, WriteJsonFile};
use stacklike::fit::{halo_ts, FitConfig, FitInput, Fitter};
use stacklike::halo::{HaloRegistry, HaloSpec};
use stacklike::print;

#[derive(Debug, clap::Parser, Clone)]
struct Args {
    /// JSON fit request: source separations, PSF and fit configuration
    request: Option<PathBuf>,

    /// write the fit result as JSON to this file
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,

    /// number of adaptive bins (0 for sqrt(N) binning)
    #[clap(short = 'b', long)]
    bins: Option<usize>,

    /// outer edge of the region of interest, in degrees
    #[clap(long)]
    max_roi: Option<f64>,

    /// halo model to fit
    #[clap(long)]
    halo: Option<String>,

    /// comma-separated halo model parameters, in radians
    #[clap(long, value_delimiter = ',')]
    halo_params: Vec<f64>,

    /// also fit without the halo and report the halo test statistic
    #[clap(long)]
    ts: bool,
}
impl Args {
    fn validate(&self) -> anyhow::Result<()> {
        self.request
            .as_ref()
            .ok_or(anyhow!("fit request file must be specified"))?;
        if self.ts && self.halo.is_none() {
            bail!("--ts requires a halo model");
        }
        if let Some(halo) = &self.halo {
            let registry = HaloRegistry::default();
            if !registry.names().contains(&halo.as_str()) {
                bail!(
                    "unknown halo model '{halo}', expected one of {:?}",
                    registry.names()
                );
            }
        }
        Ok(())
    }

    fn apply(&self, config: &mut FitConfig) {
        if let Some(bins) = self.bins {
            config.bins = match bins {
                0 => BinCount::SqrtN,
                bins => BinCount::Adaptive(bins),
            };
        }
        if self.max_roi.is_some() {
            config.max_roi = self.max_roi;
        }
        if let Some(halo) = &self.halo {
            config.halo = HaloSpec::new(halo.clone(), self.halo_params.clone());
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    if env::var("RUST_BACKTRACE").is_err() {
        env::set_var("RUST_BACKTRACE", "full")
    }
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info")
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    args.validate()?;
    debug!("args: {args:?}");

    let mut request = FitRequest::read_json_file(args.request.as_ref().unwrap())?;
    args.apply(&mut request.config);
    request.psf.validate()?;
    info!(
        "read {} pulsar(s) and {} background source(s); halo model: '{}'",
        request.pulsars.len(),
        request.backgrounds.len(),
        request.config.halo.name
    );

    let start_time = Instant::now();
    let input = FitInput::from_separations(
        &request.pulsars,
        &request.backgrounds,
        &request.psf,
        &request.config,
    )?;
    let fitter = Fitter::try_from(request.config.clone())?;
    let result = fitter.fit(&input)?;
    info!(
        "fitted {} bins in {:?}: likelihood {:.3}, {} iterations, {} evaluations, {} correlation pair(s) skipped",
        input.bins.len(),
        start_time.elapsed(),
        result.likelihood,
        result.iterations,
        result.evaluations,
        result.skipped.len()
    );

    info!("psf:\n{}", Console::default().render(&print::tabulate_psf(&result)));
    let chi_square = result.psf_chi_square();
    info!("chi-square against model: {:.1} ({} dof)", chi_square.value, chi_square.dof);
    info!("sources:\n{}", Console::default().render(&print::tabulate_sources(&result)));
    if !result.pulsars.is_empty() {
        info!(
            "pulsar backgrounds:\n{}",
            Console::default().render(&print::tabulate_backgrounds(&result))
        );
    }

    if args.ts {
        let null_config = FitConfig {
            halo: HaloSpec::none(),
            ..request.config.clone()
        };
        let null_input = FitInput::from_separations(
            &request.pulsars,
            &request.backgrounds,
            &request.psf,
            &null_config,
        )?;
        let null = Fitter::try_from(null_config)?.fit(&null_input)?;
        info!("halo TS: {:.2}", halo_ts(&null, &result));
    }

    if let Some(output) = &args.output {
        result.write_json_file(output)?;
        info!("wrote result to {}", output.display());
    }
    Ok(())
}
