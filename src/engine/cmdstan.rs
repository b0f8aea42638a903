//! CmdStan executable runner.
//!
//! Every call gets a scratch directory holding `data.json`, `init.json` and the
//! Stan CSV output. Sampling launches one process per chain (in parallel) and
//! returns the chains in order.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};
use rayon::prelude::*;
use tempfile::TempDir;

use crate::engine::{CmdStanModel, OptimizeArgs, SampleArgs, StanInput};
use crate::error::EngineError;
use crate::io::{StanCsv, read_stan_csv};

/// Lines of process output kept in error messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// A compiled CmdStan model executable.
#[derive(Debug, Clone)]
pub struct CmdStanExecutable {
    exe_file: PathBuf,
    /// Directory added to the dynamic-library search path of child processes.
    library_dir: Option<PathBuf>,
}

/// Input/output file locations for one run.
#[derive(Debug, Clone)]
pub struct RunFiles {
    pub data: PathBuf,
    pub init: PathBuf,
    pub output: PathBuf,
}

impl RunFiles {
    pub fn with_output(&self, output: PathBuf) -> RunFiles {
        RunFiles {
            output,
            ..self.clone()
        }
    }
}

impl CmdStanExecutable {
    /// Open an existing executable.
    pub fn open(exe_file: impl Into<PathBuf>, library_dir: Option<PathBuf>) -> Result<Self, EngineError> {
        let exe_file = exe_file.into();
        if !exe_file.is_file() {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("model executable '{}' not found", exe_file.display()),
            )));
        }
        Ok(Self { exe_file, library_dir })
    }

    fn command(&self) -> Result<Command, EngineError> {
        let mut cmd = Command::new(&self.exe_file);
        if let Some(dir) = &self.library_dir {
            let var = library_path_var();
            let current = std::env::var_os(var);
            cmd.env(var, extend_search_path(current.as_deref(), dir)?);
        }
        Ok(cmd)
    }

    fn run(&self, args: &[String], workdir: &Path) -> Result<(), EngineError> {
        debug!("running {} {}", self.exe_file.display(), args.join(" "));
        let output = self.command()?.args(args).current_dir(workdir).output()?;

        if output.status.success() {
            return Ok(());
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(EngineError::Runtime(format!(
            "{} {} failed ({}): {}",
            self.exe_file.display(),
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            output_tail(&text, OUTPUT_TAIL_LINES)
        )))
    }
}

impl CmdStanModel for CmdStanExecutable {
    fn optimize(&self, input: &StanInput, args: &OptimizeArgs) -> Result<StanCsv, EngineError> {
        let dir = TempDir::new()?;
        let files = write_inputs(dir.path(), input)?;

        self.run(&optimize_args(args, &files), dir.path())?;

        let csv = read_stan_csv(&files.output)?;
        if csv.num_draws() == 0 {
            return Err(EngineError::Output("optimizer wrote no estimates".into()));
        }
        Ok(csv)
    }

    fn sample(&self, input: &StanInput, args: &SampleArgs) -> Result<Vec<StanCsv>, EngineError> {
        let dir = TempDir::new()?;
        let inputs = write_inputs(dir.path(), input)?;
        info!(
            "sampling {} chains ({} warmup + {} draws each)",
            args.chains, args.iter_warmup, args.iter_sampling
        );

        (1..=args.chains)
            .into_par_iter()
            .map(|chain| {
                let files = inputs.with_output(dir.path().join(format!("sample-{chain}.csv")));
                self.run(&sample_args(args, chain, &files), dir.path())?;
                read_stan_csv(&files.output)
            })
            .collect()
    }
}

fn write_inputs(dir: &Path, input: &StanInput) -> Result<RunFiles, EngineError> {
    let files = RunFiles {
        data: dir.join("data.json"),
        init: dir.join("init.json"),
        output: dir.join("output.csv"),
    };
    write_json(&files.data, &input.data)?;
    write_json(&files.init, &input.init)?;
    Ok(files)
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), EngineError> {
    let file = File::create(path)?;
    serde_json::to_writer(file, value)
        .map_err(|e| EngineError::Io(std::io::Error::other(format!("Failed to write '{}': {e}", path.display()))))
}

/// Command line for `optimize`.
pub fn optimize_args(args: &OptimizeArgs, files: &RunFiles) -> Vec<String> {
    let mut out = vec![
        "optimize".to_string(),
        format!("algorithm={}", args.algorithm.engine_name()),
        format!("iter={}", args.iter),
    ];
    out.extend(args.extra.iter().map(|(k, v)| format!("{k}={v}")));
    push_io_args(&mut out, files, args.seed);
    out
}

/// Command line for one `sample` chain (`chain` starts at 1).
pub fn sample_args(args: &SampleArgs, chain: usize, files: &RunFiles) -> Vec<String> {
    let mut out = vec![
        "sample".to_string(),
        format!("num_samples={}", args.iter_sampling),
        format!("num_warmup={}", args.iter_warmup),
    ];
    out.extend(args.extra.iter().map(|(k, v)| format!("{k}={v}")));
    out.push(format!("id={chain}"));
    push_io_args(&mut out, files, Some(args.seed));
    out
}

fn push_io_args(out: &mut Vec<String>, files: &RunFiles, seed: Option<u32>) {
    out.push("data".into());
    out.push(format!("file={}", files.data.display()));
    out.push(format!("init={}", files.init.display()));
    if let Some(seed) = seed {
        out.push("random".into());
        out.push(format!("seed={seed}"));
    }
    out.push("output".into());
    out.push(format!("file={}", files.output.display()));
}

/// Environment variable the platform's loader searches for shared libraries.
pub fn library_path_var() -> &'static str {
    if cfg!(windows) { "PATH" } else { "LD_LIBRARY_PATH" }
}

/// Add `dir` to a search path value, without duplicates.
///
/// Windows puts the directory first so the bundled TBB wins; elsewhere it is
/// appended.
pub fn extend_search_path(current: Option<&OsStr>, dir: &Path) -> Result<OsString, EngineError> {
    let existing: Vec<PathBuf> = current
        .map(|v| std::env::split_paths(v).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default();

    let mut paths: Vec<PathBuf> = Vec::with_capacity(existing.len() + 1);
    if cfg!(windows) {
        paths.push(dir.to_path_buf());
    }
    for p in existing {
        if !paths.contains(&p) {
            paths.push(p);
        }
    }
    if !paths.iter().any(|p| p == dir) {
        paths.push(dir.to_path_buf());
    }

    std::env::join_paths(paths).map_err(|e| EngineError::Io(std::io::Error::other(e)))
}

fn output_tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
