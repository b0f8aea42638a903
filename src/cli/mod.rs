//! Command-line parsing for the Prophet Stan backend runner.
//!
//! Parsing stays separate from dispatch (`crate::app`); values that need
//! domain validation (backend names, algorithms, `key=value` pairs) are kept as
//! strings here and checked by the app so errors get the right exit code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "prophet-stan", version, about = "Run the Prophet Stan model on a pluggable backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// MAP point estimate (optimizer).
    Fit(FitArgs),
    /// Posterior draws (NUTS sampler).
    Sample(SampleArgs),
    /// Fetch the precompiled CmdStan model into the model directory.
    Download,
}

/// Options shared by `fit` and `sample`.
#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Backend name (PYSTAN or CMDSTANPY).
    #[arg(short = 'b', long, default_value = "CMDSTANPY")]
    pub backend: String,

    /// Model data JSON (T, S, K, tau, trend_indicator, y, t, cap, t_change, s_a, s_m, X, sigmas).
    #[arg(long, value_name = "JSON")]
    pub data: PathBuf,

    /// Initial values JSON (k, m, delta, beta, sigma_obs).
    #[arg(long, value_name = "JSON")]
    pub init: PathBuf,

    /// Backend option as key=value (repeatable).
    #[arg(long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    /// Disable the Newton retry after a failed L-BFGS/BFGS run.
    #[arg(long)]
    pub no_newton_fallback: bool,

    /// Random seed.
    #[arg(long)]
    pub seed: Option<u32>,

    /// Engine-specific argument as key=value, passed through (repeatable).
    #[arg(long = "extra", value_name = "KEY=VALUE")]
    pub extra: Vec<String>,

    /// Write the result to JSON.
    #[arg(short = 'o', long, value_name = "JSON")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Optimizer (newton, lbfgs, bfgs). Defaults to newton below 100 time points, lbfgs otherwise.
    #[arg(long)]
    pub algorithm: Option<String>,

    /// Optimizer iteration cap.
    #[arg(long)]
    pub iter: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct SampleArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Total iterations per chain, split evenly between warmup and saved draws.
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub samples: usize,

    /// Number of chains.
    #[arg(long)]
    pub chains: Option<usize>,

    /// Saved draws per chain.
    #[arg(long)]
    pub iter_sampling: Option<usize>,

    /// Warmup iterations per chain.
    #[arg(long)]
    pub iter_warmup: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fit_command() {
        let cli = Cli::parse_from([
            "prophet-stan",
            "fit",
            "--data",
            "d.json",
            "--init",
            "i.json",
            "--algorithm",
            "lbfgs",
            "--option",
            "newton_fallback=false",
            "--extra",
            "jacobian=0",
        ]);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.run.backend, "CMDSTANPY");
        assert_eq!(args.algorithm.as_deref(), Some("lbfgs"));
        assert_eq!(args.run.options, vec!["newton_fallback=false"]);
        assert_eq!(args.run.extra, vec!["jacobian=0"]);
        assert!(args.iter.is_none());
    }

    #[test]
    fn parses_sample_command() {
        let cli = Cli::parse_from([
            "prophet-stan",
            "sample",
            "-b",
            "PYSTAN",
            "--data",
            "d.json",
            "--init",
            "i.json",
            "-n",
            "400",
            "--chains",
            "2",
        ]);
        let Command::Sample(args) = cli.command else {
            panic!("expected sample");
        };
        assert_eq!(args.run.backend, "PYSTAN");
        assert_eq!(args.samples, 400);
        assert_eq!(args.chains, Some(2));
    }

    #[test]
    fn requires_data_and_init() {
        assert!(Cli::try_parse_from(["prophet-stan", "fit", "--data", "d.json"]).is_err());
    }
}
