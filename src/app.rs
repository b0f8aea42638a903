//! Top-level application orchestration.
//!
//! `src/main.rs` only sets up logging and the exit code; this module:
//! - parses CLI arguments
//! - resolves the backend configuration from the environment
//! - runs the requested command
//! - prints the summary and writes optional exports

use clap::Parser;
use log::info;

use crate::artifacts::{download_model_files, missing_files};
use crate::cli::{Cli, Command, FitArgs, SampleArgs};
use crate::config::BackendConfig;
use crate::error::AppError;
use crate::report::{RunKind, format_run_header, format_summary_table};

pub mod pipeline;

/// Entry point for the `prophet-stan` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = BackendConfig::from_env();

    match cli.command {
        Command::Fit(args) => handle_fit(args, &config),
        Command::Sample(args) => handle_sample(args, &config),
        Command::Download => handle_download(&config),
    }
}

fn handle_fit(args: FitArgs, config: &BackendConfig) -> Result<(), AppError> {
    let run = pipeline::run_fit(&args, config)?;

    let details = args
        .algorithm
        .as_deref()
        .map(|a| format!("algorithm={a}"))
        .unwrap_or_default();
    println!("{}", format_run_header(run.backend, RunKind::Fit, &details));
    println!("{}", format_summary_table(&run.summary));

    if let Some(path) = &args.run.output {
        crate::io::write_params_json(path, &run.params)?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn handle_sample(args: SampleArgs, config: &BackendConfig) -> Result<(), AppError> {
    let run = pipeline::run_sample(&args, config)?;

    let details = format!("samples={}", args.samples);
    println!("{}", format_run_header(run.backend, RunKind::Sample, &details));
    println!("{}", format_summary_table(&run.summary));

    if let Some(path) = &args.run.output {
        crate::io::write_params_json(path, &run.params)?;
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn handle_download(config: &BackendConfig) -> Result<(), AppError> {
    download_model_files(&config.model_dir)?;

    let missing = missing_files(&config.model_dir);
    if missing.is_empty() {
        println!("Model files ready in {}", config.model_dir.display());
    } else {
        let names: Vec<&str> = missing.iter().map(|(name, _)| *name).collect();
        println!(
            "Missing in {}: {}",
            config.model_dir.display(),
            names.join(", ")
        );
    }
    Ok(())
}
