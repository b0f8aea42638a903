//! Shared run logic for the `fit` and `sample` commands.
//!
//! Both commands follow the same flow:
//! read inputs -> resolve the backend -> apply options -> run -> summarize
//!
//! The app layer (`crate::app`) only prints and exports.

use log::info;

use crate::cli::{FitArgs, RunArgs, SampleArgs};
use crate::config::BackendConfig;
use crate::domain::{Algorithm, InitParams, ModelData, ParamMap};
use crate::error::AppError;
use crate::io::{read_init_params, read_model_data};
use crate::models::backend::pairs_to_map;
use crate::models::{BackendOptions, FitOverrides, SampleOverrides, StanBackend, StanBackendKind, get_backend_class};
use crate::report::{ParamSummary, summarize};
use serde_json::{Map, Value};

/// Everything computed by one `fit`/`sample` run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub backend: StanBackendKind,
    pub params: ParamMap,
    pub summary: Vec<ParamSummary>,
}

/// Run the optimizer as configured by `args`.
pub fn run_fit(args: &FitArgs, config: &BackendConfig) -> Result<RunOutput, AppError> {
    let overrides = fit_overrides(args)?;
    let (data, init) = read_inputs(&args.run)?;
    let mut backend = open_backend(&args.run, config)?;

    info!("fitting T={} with {}", data.num_timepoints, backend.backend_type());
    let params = backend.fit(&init, &data, &overrides)?;
    Ok(output(backend.as_ref(), params))
}

/// Run the sampler as configured by `args`.
pub fn run_sample(args: &SampleArgs, config: &BackendConfig) -> Result<RunOutput, AppError> {
    let overrides = sample_overrides(args)?;
    let (data, init) = read_inputs(&args.run)?;
    let mut backend = open_backend(&args.run, config)?;

    info!("sampling T={} with {}", data.num_timepoints, backend.backend_type());
    let params = backend.sampling(&init, &data, args.samples, &overrides)?;
    Ok(output(backend.as_ref(), params))
}

fn output(backend: &dyn StanBackend, params: ParamMap) -> RunOutput {
    RunOutput {
        backend: backend.backend_type(),
        summary: summarize(&params),
        params,
    }
}

fn read_inputs(run: &RunArgs) -> Result<(ModelData, InitParams), AppError> {
    let data = read_model_data(&run.data)?;
    let init = read_init_params(&run.init)?;
    Ok((data, init))
}

/// Resolve and load the backend, then apply the CLI options.
///
/// Names and options are checked before the (possibly slow) model load.
pub fn open_backend(run: &RunArgs, config: &BackendConfig) -> Result<Box<dyn StanBackend>, AppError> {
    let kind = get_backend_class(&run.backend)?;
    let options = backend_options(run)?;
    BackendOptions::from_map(&options)?;

    let mut backend = kind.build(config)?;
    backend.set_options(&options)?;
    Ok(backend)
}

/// `--option` pairs plus `--no-newton-fallback`.
pub fn backend_options(run: &RunArgs) -> Result<Map<String, Value>, AppError> {
    let mut options = pairs_to_map(run.options.iter().map(String::as_str))?;
    if run.no_newton_fallback {
        options.insert("newton_fallback".into(), Value::Bool(false));
    }
    Ok(options)
}

pub fn fit_overrides(args: &FitArgs) -> Result<FitOverrides, AppError> {
    let algorithm = args
        .algorithm
        .as_deref()
        .map(str::parse::<Algorithm>)
        .transpose()
        .map_err(|e| AppError::new(2, e))?;

    Ok(FitOverrides {
        algorithm,
        iter: args.iter,
        init: None,
        seed: args.run.seed,
        extra: parse_extra(&args.run.extra)?,
    })
}

pub fn sample_overrides(args: &SampleArgs) -> Result<SampleOverrides, AppError> {
    Ok(SampleOverrides {
        chains: args.chains,
        iter_sampling: args.iter_sampling,
        iter_warmup: args.iter_warmup,
        init: None,
        seed: args.run.seed,
        extra: parse_extra(&args.run.extra)?,
    })
}

fn parse_extra(pairs: &[String]) -> Result<Vec<(String, String)>, AppError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| AppError::new(2, format!("Invalid --extra '{pair}': expected key=value")))
        })
        .collect()
}
