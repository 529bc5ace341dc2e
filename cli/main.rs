#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use astrolabe::data::{load_catalog, load_prediction_table, write_estimates, write_pdfs, write_weights};
use astrolabe::pipeline::{ExternalReference, combine_external};
use astrolabe::progress::{ProgressObserver, RunStage};
use astrolabe::weights::{DensityEstimator, WeightFlag, compute_density_weights_observed};
use astrolabe::{CatalogRole, ObjectFlag, RunOptions};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

#[derive(Clone, Copy, ValueEnum)]
pub enum EstimatorCli {
    /// Ratio of the k-th neighbour volumes
    Volume,
    /// Application count inside the labeled k-th neighbour radius
    Count,
}

#[derive(Args)]
pub struct WeightsArgs {
    /// Labeled catalog (TSV with feature columns and a `target` column)
    pub labeled: PathBuf,

    /// Application catalog whose distribution the weights should reproduce
    pub application: PathBuf,

    /// Run options file (.toml); its `density_weights` section supplies the defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Comma-separated feature columns; all non-reserved columns when omitted
    #[arg(long, value_delimiter = ',')]
    pub features: Option<Vec<String>>,

    /// Number of neighbours defining the local volume
    #[arg(long)]
    pub k: Option<usize>,

    /// Density-ratio estimator
    #[arg(long, value_enum)]
    pub estimator: Option<EstimatorCli>,

    /// Number of reweighting passes
    #[arg(long)]
    pub passes: Option<usize>,

    /// Output path
    #[arg(long, default_value = "weights.tsv")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct CombineArgs {
    /// Application catalog (TSV)
    pub application: PathBuf,

    /// Member predictions for the application catalog (TSV: `id` + one column per member)
    pub predictions: PathBuf,

    /// Run options file (.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Comma-separated feature columns; all non-reserved columns when omitted
    #[arg(long, value_delimiter = ',')]
    pub features: Option<Vec<String>>,

    /// Labeled reference catalog for neighbour-scatter errors and member weighting
    #[arg(long)]
    pub reference: Option<PathBuf>,

    /// Member predictions for the reference catalog, same member columns
    #[arg(long, requires = "reference")]
    pub reference_predictions: Option<PathBuf>,

    /// Minimum number of valid member predictions for a PDF
    #[arg(long)]
    pub min_valid: Option<usize>,

    /// Turn on neighbour-scatter errors with default settings
    #[arg(long, requires = "reference")]
    pub neighbor_errors: bool,

    /// Flag objects outside the coverage of the reference catalog
    #[arg(long, requires = "reference")]
    pub coverage_flag: bool,

    /// Output path for point estimates and errors
    #[arg(long, default_value = "estimates.tsv")]
    pub out: PathBuf,

    /// Output path for the binned PDFs
    #[arg(long)]
    pub pdf_out: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "astrolabe",
    about = "Randomized-ensemble estimation with nearest-neighbour weights and errors",
    long_about = "Combines the predictions of a randomized model ensemble into per-object PDFs \
                 and errors, and computes density-ratio weights that make a labeled catalog \
                 resemble an application catalog."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Density-ratio weights of a labeled catalog against an application catalog
    #[command(about = "Compute density-ratio weights (outputs: weights.tsv)")]
    Weights(WeightsArgs),

    /// Combine member predictions into PDFs, point estimates and errors
    #[command(about = "Combine ensemble predictions (outputs: estimates.tsv)")]
    Combine(CombineArgs),

    /// Write a run options file with every default spelled out
    #[command(about = "Write default run options (outputs: run.toml)")]
    InitConfig {
        #[arg(default_value = "run.toml")]
        path: PathBuf,
    },

    /// Display version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Weights(args)) => run_weights(args),
        Some(Commands::Combine(args)) => run_combine(args),
        Some(Commands::InitConfig { path }) => init_config(path),
        Some(Commands::Version) => {
            println!("astrolabe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command().print_help().map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Renders run stages as terminal progress bars.
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

impl ProgressObserver for BarProgress {
    fn on_stage_start(&self, stage: RunStage, total_items: usize) {
        if let Ok(mut bar) = self.bar.lock() {
            *bar = Some(create_progress_bar(total_items as u64, stage.describe()));
        }
    }

    fn on_stage_advance(&self, _stage: RunStage, processed_items: usize) {
        if let Ok(bar) = self.bar.lock() {
            if let Some(bar) = bar.as_ref() {
                bar.set_position(processed_items as u64);
            }
        }
    }

    fn on_stage_finish(&self, _stage: RunStage) {
        if let Ok(mut bar) = self.bar.lock() {
            if let Some(bar) = bar.take() {
                bar.finish_and_clear();
            }
        }
    }
}

fn load_options(path: Option<&PathBuf>) -> Result<RunOptions, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading run options from: {}", path.display());
            Ok(RunOptions::load(path)?)
        }
        None => Ok(RunOptions::default()),
    }
}

fn run_weights(args: WeightsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = load_options(args.config.as_ref())?;
    let mut weight_options = options.density_weights.clone().unwrap_or_default();
    if let Some(k) = args.k {
        weight_options.k = k;
    }
    if let Some(passes) = args.passes {
        weight_options.passes = passes;
    }
    if let Some(estimator) = args.estimator {
        weight_options.estimator = match estimator {
            EstimatorCli::Volume => DensityEstimator::KthNeighborVolume,
            EstimatorCli::Count => DensityEstimator::EqualVolumeCount,
        };
    }

    let features = args.features.as_deref();
    let labeled = load_catalog(&args.labeled, "labeled", CatalogRole::Training, features)?;
    let application = load_catalog(&args.application, "application", CatalogRole::Application, features)?;
    println!(
        "Loaded {} labeled and {} application objects with {} features",
        labeled.len(),
        application.len(),
        labeled.n_features()
    );

    let control = options.execution.to_control();
    let weights = compute_density_weights_observed(
        &labeled,
        &application,
        &weight_options,
        &control,
        &BarProgress::new(),
    )?;
    println!(
        "Weights: {} clamped, {} zero-distance, {} excluded after {} pass(es)",
        weights.count(WeightFlag::Clamped),
        weights.count(WeightFlag::ZeroDistance),
        weights.count(WeightFlag::Excluded),
        weights.passes
    );

    write_weights(&args.out, &labeled, &weights)?;
    println!("Weights saved to: {}", args.out.display());
    Ok(())
}

fn run_combine(args: CombineArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = load_options(args.config.as_ref())?;
    if let Some(min_valid) = args.min_valid {
        options.combine.min_valid_predictions = min_valid;
    }
    if args.neighbor_errors && options.errors.neighbor_scatter.is_none() {
        options.errors.neighbor_scatter = Some(Default::default());
    }
    if args.coverage_flag && options.training_coverage.is_none() {
        options.training_coverage = Some(Default::default());
    }

    let features = args.features.as_deref();
    let application = load_catalog(&args.application, "application", CatalogRole::Application, features)?;
    let predictions = load_prediction_table(&args.predictions, &application)?;
    println!(
        "Loaded {} members for {} application objects",
        predictions.n_members(),
        predictions.n_objects()
    );

    let reference = match &args.reference {
        Some(path) => Some(load_catalog(path, "reference", CatalogRole::Validation, features)?),
        None => None,
    };
    let reference_predictions = match (&args.reference_predictions, &reference) {
        (Some(path), Some(catalog)) => Some(load_prediction_table(path, catalog)?),
        _ => None,
    };
    let external = reference.as_ref().map(|catalog| ExternalReference {
        catalog,
        predictions: reference_predictions.as_ref(),
    });

    let output = combine_external(&application, &predictions, external, &options, &BarProgress::new())?;
    let invalid = output
        .objects
        .iter()
        .filter(|o| o.has_flag(ObjectFlag::InvalidPdf))
        .count();
    let outside = output
        .objects
        .iter()
        .filter(|o| o.has_flag(ObjectFlag::OutsideTraining))
        .count();
    println!(
        "Combined {} objects ({} without a valid PDF, {} outside the reference coverage)",
        output.objects.len(),
        invalid,
        outside
    );
    if let Some(power) = output.member_weights.power {
        println!("Member weights: metric power {power}");
    }

    write_estimates(&args.out, &output)?;
    println!("Estimates saved to: {}", args.out.display());
    if let Some(path) = &args.pdf_out {
        write_pdfs(path, &output)?;
        println!("PDFs saved to: {}", path.display());
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    RunOptions::default().save(&path)?;
    println!("Default run options saved to: {}", path.display());
    Ok(())
}
