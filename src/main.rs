//! CXR Toolkit CLI
//!
//! Entry point for classifier training, evaluation, diffusion training and
//! dataset inspection. Every run is driven by a JSON configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use cxr_toolkit::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use cxr_toolkit::config::Configuration;
use cxr_toolkit::dataset::instantiate_image_dataset;
use cxr_toolkit::dataset::loader::get_target_breakdown;
use cxr_toolkit::utils::logging::{init_logging, LogConfig};

/// Chest X-ray classification and diffusion experiments with Burn
#[derive(Parser, Debug)]
#[command(name = "cxr")]
#[command(version = "0.1.0")]
#[command(about = "Chest X-ray classification and diffusion experiments with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to the JSON run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Override a configuration value, e.g. `--set job.max_epochs=5`
    #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a classifier
    Train(RunArgs),

    /// Evaluate a trained classifier on the test split
    Evaluate(RunArgs),

    /// Train a diffusion model on the positive class
    Diffusion(RunArgs),

    /// Print per-split class counts
    Breakdown(RunArgs),

    /// Write a default configuration file
    InitConfig {
        /// Output path for the configuration
        path: PathBuf,
    },
}

impl Cli {
    fn start_logging(&self, base: &LogConfig) {
        let config = LogConfig::from_flags(base, self.verbose, self.quiet, self.log_level.as_deref());
        if let Err(e) = init_logging(&config) {
            tracing::debug!("Keeping the existing subscriber: {}", e);
        }
    }
}

/// Load the configuration with overrides applied and start logging
fn setup(cli: &Cli, args: &RunArgs) -> Result<Configuration> {
    let config = Configuration::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?
        .apply_overrides(&args.overrides)?;
    cli.start_logging(&config.logging);
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::InitConfig { path } => {
            cli.start_logging(&LogConfig::default());
            cmd_init_config(path)?;
        }
        Commands::Train(args) => {
            let mut config = setup(&cli, args)?;
            config.job.mode = "train".to_string();
            cmd_train(&config)?;
        }
        Commands::Evaluate(args) => {
            let mut config = setup(&cli, args)?;
            config.job.mode = "evaluate".to_string();
            cmd_evaluate(&config)?;
        }
        Commands::Diffusion(args) => {
            let config = setup(&cli, args)?;
            cmd_diffusion(&config)?;
        }
        Commands::Breakdown(args) => {
            let config = setup(&cli, args)?;
            cmd_breakdown(&config)?;
        }
    }

    Ok(())
}

fn print_header(title: &str, config: &Configuration) {
    println!("{}", format!("== {} ==", title).green().bold());
    println!("  {:<10} {}", "dataset".cyan(), config.datasets.name);
    println!("  {:<10} {}", "model".cyan(), config.model.name);
    println!("  {:<10} {}", "backend".cyan(), backend_name());
    println!("  {:<10} {}", "output".cyan(), config.job.output_dir.display());
    println!();
}

fn cmd_train(config: &Configuration) -> Result<()> {
    print_header("Training", config);
    let summary = cxr_toolkit::training::train::<TrainingBackend>(config, &default_device())?;

    println!();
    println!("{}", "Training complete".green().bold());
    println!("  {:<16} {}", "run".cyan(), summary.run_id);
    println!("  {:<16} {}", "epochs".cyan(), summary.epochs_run);
    if let Some(best) = &summary.best_checkpoint {
        println!("  {:<16} {}", "best checkpoint".cyan(), best.display());
    }
    for (name, value) in &summary.test_metrics {
        println!("  {:<16} {:.4}", format!("test {}", name).cyan(), value);
    }
    if let Some(report) = &summary.report_path {
        println!("  {:<16} {}", "report".cyan(), report.display());
    }
    Ok(())
}

fn cmd_evaluate(config: &Configuration) -> Result<()> {
    print_header("Evaluation", config);
    let metrics = cxr_toolkit::training::evaluate::<DefaultBackend>(config, &default_device())?;

    println!();
    println!("{}", "Test metrics".green().bold());
    for (name, value) in &metrics {
        println!("  {:<16} {:.4}", name.cyan(), value);
    }
    Ok(())
}

fn cmd_diffusion(config: &Configuration) -> Result<()> {
    print_header("Diffusion training", config);
    let summary = cxr_toolkit::training::train_diffusion::<TrainingBackend>(config, &default_device())?;

    println!();
    println!("{}", "Diffusion training complete".green().bold());
    println!("  {:<12} {}", "run".cyan(), summary.run_id);
    println!("  {:<12} {}", "epochs".cyan(), summary.epochs_run);
    println!("  {:<12} {:.6}", "final loss".cyan(), summary.final_loss);
    for grid in &summary.sample_grids {
        println!("  {:<12} {}", "samples".cyan(), grid.display());
    }
    if let Some(model) = &summary.model_path {
        println!("  {:<12} {}", "model".cyan(), model.display());
    }
    Ok(())
}

fn cmd_breakdown(config: &Configuration) -> Result<()> {
    info!("Computing target breakdown for '{}'", config.datasets.name);
    config.validate()?;
    let splits = instantiate_image_dataset(config, false)?;
    let breakdown = get_target_breakdown(&splits, &config.datasets.encoding);

    println!("{}", format!("== {} target breakdown ==", config.datasets.name).green().bold());
    print!("{}", breakdown);
    Ok(())
}

fn cmd_init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    Configuration::default().save(path)?;
    println!("{} {}", "Wrote default configuration to".green(), path.display());
    Ok(())
}
