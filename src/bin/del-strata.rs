use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use del_strata::config::PipelineConfig;
use del_strata::manifest::RunStatus;
use del_strata::pipeline::{FingerprintRequest, Pipeline};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "del-strata")]
#[command(about = "DEL screen preparation: merge, hit filtering, binding-site stratification", long_about = None)]
struct Cli {
    /// Pipeline config (YAML)
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge raw libraries, samples and enrichment tables into preprocessed/
    Preprocess,
    /// Filter hits and write Orthosteric / Cryptic / Allosteric sets to stratified/
    Stratify,
    /// Quantile and per-sublibrary tables under lib_stat/
    Stats,
    /// Circular fingerprints of a table's structures into a Parquet feature store
    Fingerprint {
        /// CSV table with a structure column
        #[arg(short, long)]
        input: PathBuf,

        /// Structure column
        #[arg(long, default_value = "SMILES")]
        smiles_column: String,

        /// Feature file name (defaults to the input file stem)
        #[arg(short, long)]
        experiment: Option<String>,

        /// Output directory (defaults to <output_path>/features)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// preprocess, stratify, stats, then fingerprint every positive set
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = PipelineConfig::from_path(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let mut pipeline = Pipeline::new(config);

    let result = match cli.command {
        Command::Preprocess => pipeline.preprocess().map(drop),
        Command::Stratify => pipeline.stratify().map(drop),
        Command::Stats => pipeline.stats(),
        Command::Fingerprint {
            input,
            smiles_column,
            experiment,
            output,
        } => {
            let experiment = experiment
                .or_else(|| {
                    input
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                })
                .context("cannot derive an experiment name; pass --experiment")?;
            let request = FingerprintRequest {
                input,
                smiles_column,
                experiment,
                output_dir: output,
            };
            pipeline.fingerprint(&request).map(drop)
        }
        Command::Run => pipeline.run(),
    };

    let status = if result.is_ok() {
        RunStatus::Success
    } else {
        RunStatus::Failed
    };
    let manifest_path = pipeline.manifest_path();
    pipeline
        .finish(status)
        .with_context(|| format!("writing manifest {}", manifest_path.display()))?;
    result.context("pipeline failed")
}
