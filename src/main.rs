#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::process;

use voxsurv::combined::{CombineFiles, combine_files};
use voxsurv::config::ConfigOverrides;
use voxsurv::pipeline::Pipeline;
use voxsurv::progress::ConsoleProgress;
use voxsurv::store::ResidentGauge;
use voxsurv::types::{CovariateMode, InteractionVariable};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum InteractionCli {
    Treatment,
    Volume,
}

impl From<InteractionCli> for InteractionVariable {
    fn from(value: InteractionCli) -> Self {
        match value {
            InteractionCli::Treatment => InteractionVariable::Treatment,
            InteractionCli::Volume => InteractionVariable::Volume,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// TOML file with run settings; command-line flags override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Clinical covariate table (TSV, or Parquet by extension)
    #[arg(long, value_name = "PATH")]
    pub clinical: Option<PathBuf>,

    /// Directory holding one binary mask per patient
    #[arg(long, value_name = "DIR")]
    pub mask_dir: Option<PathBuf>,

    /// Mask filename with an {id} or {id:0N} placeholder (default "{id}.nii.gz")
    #[arg(long, value_name = "TEMPLATE")]
    pub mask_template: Option<String>,

    /// Volume whose header provides the output geometry (default: first patient mask)
    #[arg(long, value_name = "PATH")]
    pub reference: Option<PathBuf>,

    /// Output directory for slice stores, results and maps
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Number of covariates per location: 5, or 6 to add the indicator interaction
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(5..=6))]
    pub covariates: Option<u8>,

    /// Clinical variable paired with the location indicator
    #[arg(long, value_enum)]
    pub interaction: Option<InteractionCli>,

    /// Minimum number of patients with pathology at a location for it to be fitted
    #[arg(long, value_name = "N")]
    pub threshold: Option<usize>,

    /// Discard existing slice stores and results before running
    #[arg(long)]
    pub rebuild: bool,

    /// Process slices on a worker pool
    #[arg(long)]
    pub parallel: bool,

    /// Worker count for --parallel (default: number of CPUs)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}

impl RunArgs {
    fn into_overrides(self) -> Result<ConfigOverrides, Box<dyn Error>> {
        let file = match &self.config {
            Some(path) => ConfigOverrides::from_toml_file(path)?,
            None => ConfigOverrides::default(),
        };
        let covariates = self
            .covariates
            .map(CovariateMode::try_from)
            .transpose()?;
        let cli = ConfigOverrides {
            clinical: self.clinical,
            mask_dir: self.mask_dir,
            mask_template: self.mask_template,
            reference: self.reference,
            output: self.output,
            covariates,
            interaction: self.interaction.map(InteractionVariable::from),
            threshold: self.threshold,
            rebuild: self.rebuild.then_some(true),
            parallel: self.parallel.then_some(true),
            workers: self.workers,
            cox: None,
        };
        Ok(file.merge(cli))
    }

    fn open(self) -> Result<Pipeline, Box<dyn Error>> {
        let config = self.into_overrides()?.resolve()?;
        Ok(Pipeline::open(config)?)
    }
}

#[derive(Args, Debug)]
pub struct CombineArgs {
    /// Coefficient map of covariate 4
    #[arg(long, value_name = "PATH")]
    pub beta4: PathBuf,

    /// Coefficient map of covariate 6 (the interaction)
    #[arg(long, value_name = "PATH")]
    pub beta6: PathBuf,

    /// Variance map of covariate 4
    #[arg(long, value_name = "PATH")]
    pub var4: PathBuf,

    /// Variance map of covariate 6
    #[arg(long, value_name = "PATH")]
    pub var6: PathBuf,

    /// Covariance map of covariates 4 and 6
    #[arg(long, value_name = "PATH")]
    pub cov46: PathBuf,

    /// Number of patients in the regression
    #[arg(long, value_name = "N")]
    pub n_obs: usize,

    /// Number of predictors including the intercept (7 for the six-covariate model)
    #[arg(long, value_name = "N")]
    pub n_predictors: usize,

    /// Output map path
    #[arg(long, value_name = "PATH")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "voxsurv",
    version,
    about = "Voxel-wise Cox regression of survival on lesion location",
    long_about = "Builds per-slice stores from patient masks, fits a Cox model at every \
                 location of the common grid, and reconstructs coefficient, p-value and \
                 variance maps."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build slice stores, regress every slice, and reconstruct the maps
    #[command(about = "Run the full pipeline")]
    Run(RunArgs),

    /// Build or extend the slice stores from the patient masks
    #[command(about = "Build slice stores only")]
    Build(RunArgs),

    /// Regress every slice that has no results yet
    #[command(about = "Regress slices only (resumable)")]
    Regress(RunArgs),

    /// Stack per-slice results into NIfTI maps
    #[command(about = "Reconstruct output maps from slice results")]
    Reconstruct(RunArgs),

    /// P-value map for the sum of covariates 4 and 6
    #[command(about = "Combine beta4 and beta6 maps into a p-value map")]
    Combine(CombineArgs),
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let pipeline = args.open()?;
    let maps = pipeline.run(&ConsoleProgress::new())?;
    println!(
        "Wrote {} maps to {}",
        maps.len(),
        pipeline.paths().maps().display()
    );
    Ok(())
}

fn build(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let pipeline = args.open()?;
    let report = pipeline.build_stores(&ConsoleProgress::new())?;
    println!(
        "Slice stores ready: {} patients written, {} without masks",
        report.patients_written,
        report.missing_masks.len()
    );
    Ok(())
}

fn regress(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let pipeline = args.open()?;
    let gauge = ResidentGauge::new();
    let report = pipeline.regress(&ConsoleProgress::new(), &gauge)?;
    let failed = report.failed_slices();
    if failed.is_empty() {
        println!("Regression complete; report at {}", pipeline.paths().report().display());
        Ok(())
    } else {
        Err(format!(
            "{} slices failed ({failed:?}); rerun `voxsurv regress` to retry them",
            failed.len()
        )
        .into())
    }
}

fn reconstruct(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let pipeline = args.open()?;
    let maps = pipeline.reconstruct(&ConsoleProgress::new())?;
    println!(
        "Wrote {} maps to {}",
        maps.len(),
        pipeline.paths().maps().display()
    );
    Ok(())
}

fn combine(args: CombineArgs) -> Result<(), Box<dyn Error>> {
    let files = CombineFiles {
        beta4: args.beta4,
        beta6: args.beta6,
        var4: args.var4,
        var6: args.var6,
        cov46: args.cov46,
    };
    combine_files(&files, args.n_obs, args.n_predictors, &args.output)?;
    println!("Wrote {}", args.output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Build(args)) => build(args),
        Some(Commands::Regress(args)) => regress(args),
        Some(Commands::Reconstruct(args)) => reconstruct(args),
        Some(Commands::Combine(args)) => combine(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
