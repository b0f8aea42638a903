//! The backend contract and the policy both backends share.
//!
//! A backend adapts one external Stan engine to two calls:
//!
//! - `fit`: a single MAP point estimate (every parameter has one row)
//! - `sampling`: posterior draws from all chains, concatenated chain by chain
//!
//! Shared rules:
//!
//! - Newton below `NEWTON_MAX_TIMEPOINTS` time points, L-BFGS otherwise
//! - a failed non-Newton optimization is retried once with Newton when
//!   `newton_fallback` is on
//! - width-1 sampled parameters are flattened, except `delta` and `beta`, which
//!   always stay 2-D

use log::{debug, warn};
use nalgebra::DMatrix;
use serde_json::{Map, Value};

use crate::domain::{Algorithm, FitResult, InitParams, ModelData, ParamArray, ParamMap, SampleResult};
use crate::engine::{OptimizeArgs, SampleArgs, StanInput};
use crate::error::{BackendError, EngineError};
use crate::models::registry::StanBackendKind;

/// Default optimizer iteration cap.
pub const DEFAULT_ITER: usize = 10_000;

/// Default number of sampler chains.
pub const DEFAULT_CHAINS: usize = 4;

/// Parameters kept 2-D in sampling output whatever their width.
pub const MATRIX_PARAMS: [&str; 2] = ["delta", "beta"];

/// A Stan execution backend.
pub trait StanBackend {
    /// Registry key of this backend.
    fn backend_type(&self) -> StanBackendKind;

    /// Whether a failed L-BFGS/BFGS optimization is retried with Newton.
    fn newton_fallback(&self) -> bool;

    fn apply_options(&mut self, options: BackendOptions);

    /// Apply options given as a key/value mapping.
    ///
    /// Unknown keys are rejected; nothing is applied if any key is invalid.
    fn set_options(&mut self, options: &Map<String, Value>) -> Result<(), BackendError> {
        let parsed = BackendOptions::from_map(options)?;
        self.apply_options(parsed);
        Ok(())
    }

    /// MAP point estimate.
    fn fit(&mut self, init: &InitParams, data: &ModelData, overrides: &FitOverrides) -> Result<FitResult, BackendError>;

    /// Posterior draws; `samples` is split evenly between warmup and saved
    /// iterations unless overridden.
    fn sampling(
        &mut self,
        init: &InitParams,
        data: &ModelData,
        samples: usize,
        overrides: &SampleOverrides,
    ) -> Result<SampleResult, BackendError>;
}

/// Recognized backend options. `None` leaves the current setting alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendOptions {
    pub newton_fallback: Option<bool>,
}

impl BackendOptions {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, BackendError> {
        let mut out = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "newton_fallback" => {
                    let flag = value.as_bool().ok_or_else(|| BackendError::InvalidOption {
                        key: key.clone(),
                        reason: format!("expected a boolean, got {value}"),
                    })?;
                    out.newton_fallback = Some(flag);
                }
                other => return Err(BackendError::UnknownOption(other.to_string())),
            }
        }
        Ok(out)
    }

    /// Parse `key=value` pairs (values are read as JSON, falling back to a
    /// plain string).
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self, BackendError> {
        Self::from_map(&pairs_to_map(pairs)?)
    }
}

/// Turn `key=value` strings into a JSON object.
pub fn pairs_to_map<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Map<String, Value>, BackendError> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| BackendError::InvalidOption {
            key: pair.to_string(),
            reason: "expected key=value".into(),
        })?;
        let value = serde_json::from_str::<Value>(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

/// Caller overrides for `fit`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitOverrides {
    pub algorithm: Option<Algorithm>,
    /// Iteration cap (default `DEFAULT_ITER`).
    pub iter: Option<usize>,
    /// Replaces the init values passed to `fit`.
    pub init: Option<InitParams>,
    pub seed: Option<u32>,
    /// Engine-specific `key=value` arguments.
    pub extra: Vec<(String, String)>,
}

impl FitOverrides {
    pub fn resolve(&self, data: &ModelData) -> OptimizeArgs {
        OptimizeArgs {
            algorithm: self.algorithm.unwrap_or_else(|| data.default_algorithm()),
            iter: self.iter.unwrap_or(DEFAULT_ITER),
            seed: self.seed,
            extra: self.extra.clone(),
        }
    }
}

/// Caller overrides for `sampling`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleOverrides {
    /// Number of chains (default `DEFAULT_CHAINS`).
    pub chains: Option<usize>,
    /// Saved draws per chain (default `samples / 2`).
    pub iter_sampling: Option<usize>,
    /// Warmup iterations per chain (default `samples / 2`).
    pub iter_warmup: Option<usize>,
    pub init: Option<InitParams>,
    /// Random seed; drawn at random when absent.
    pub seed: Option<u32>,
    pub extra: Vec<(String, String)>,
}

impl SampleOverrides {
    pub fn resolve(&self, samples: usize) -> SampleArgs {
        let half = samples / 2;
        SampleArgs {
            chains: self.chains.unwrap_or(DEFAULT_CHAINS),
            iter_sampling: self.iter_sampling.unwrap_or(half),
            iter_warmup: self.iter_warmup.unwrap_or(half),
            seed: self.seed.unwrap_or_else(rand::random),
            extra: self.extra.clone(),
        }
    }
}

/// Most recent raw engine result kept by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StanFit<T> {
    Optimize(T),
    /// One entry per chain.
    Sample(Vec<T>),
}

/// Validate inputs and convert them to the engines' JSON shape.
///
/// `init_override` (from the caller's overrides) replaces `init`.
pub fn prepare_input(
    init: &InitParams,
    data: &ModelData,
    init_override: Option<&InitParams>,
) -> Result<StanInput, BackendError> {
    let init = init_override.unwrap_or(init);
    data.validate()?;
    init.validate(data)?;

    let data = serde_json::to_value(data).map_err(|e| BackendError::InvalidData(e.to_string()))?;
    let init = serde_json::to_value(init).map_err(|e| BackendError::InvalidData(e.to_string()))?;
    Ok(StanInput { data, init })
}

/// Run an optimization, retrying once with Newton on an optimizer failure.
///
/// The retry happens only when `newton_fallback` is set, the failure is a
/// runtime failure of the engine, and the first attempt was not Newton.
pub fn optimize_with_fallback<T>(
    newton_fallback: bool,
    mut args: OptimizeArgs,
    mut run: impl FnMut(&OptimizeArgs) -> Result<T, EngineError>,
) -> Result<T, BackendError> {
    match run(&args) {
        Ok(out) => Ok(out),
        Err(e) if newton_fallback && e.is_runtime() && args.algorithm != Algorithm::Newton => {
            warn!("Optimization terminated abnormally. Falling back to Newton.");
            debug!("{} failure: {e}", args.algorithm);
            args.algorithm = Algorithm::Newton;
            run(&args).map_err(BackendError::Fit)
        }
        Err(e) => Err(BackendError::Fit(e)),
    }
}

/// Reshape every parameter to one row and fill in zero-width `delta`/`beta`.
pub fn normalize_fit(params: ParamMap, data: &ModelData) -> FitResult {
    let mut out = params.map_values(|_, arr| arr.into_single_row());
    add_empty_matrix_params(&mut out, data, 1);
    out
}

/// Flatten width-1 parameters, keeping `delta` and `beta` 2-D.
pub fn normalize_sample(params: ParamMap, data: &ModelData) -> SampleResult {
    let draws = params.iter().next().map_or(0, |(_, arr)| arr.leading_dim());
    let mut out = params.map_values(|name, arr| {
        let arr = arr.squeeze_last();
        if MATRIX_PARAMS.contains(&name) { arr.into_column() } else { arr }
    });
    add_empty_matrix_params(&mut out, data, draws);
    out
}

/// Engines emit no columns for a zero-length vector; record it as `rows × 0`.
fn add_empty_matrix_params(params: &mut ParamMap, data: &ModelData, rows: usize) {
    let declared = [("delta", data.num_changepoints), ("beta", data.num_regressors)];
    for (name, size) in declared {
        if size == 0 && !params.contains_key(name) {
            params.insert(name, ParamArray::Matrix(DMatrix::zeros(rows, 0)));
        }
    }
}

/// Stack matrices with equal widths on top of each other.
pub fn stack_rows<'a>(blocks: impl IntoIterator<Item = &'a DMatrix<f64>>, width: usize) -> DMatrix<f64> {
    let blocks: Vec<&DMatrix<f64>> = blocks.into_iter().collect();
    let total: usize = blocks.iter().map(|b| b.nrows()).sum();
    let mut out = DMatrix::zeros(total, width);
    let mut row = 0;
    for block in blocks {
        out.rows_mut(row, block.nrows()).copy_from(block);
        row += block.nrows();
    }
    out
}

/// Concatenate per-chain structured draws, chain by chain.
pub fn concat_chains(chains: &[ParamMap]) -> Result<ParamMap, BackendError> {
    let Some(first) = chains.first() else {
        return Err(BackendError::InvalidOutput("sampler returned no chains".into()));
    };

    let mut out = ParamMap::new();
    for (name, arr) in first.iter() {
        let width = arr.last_dim();
        let mut blocks = Vec::with_capacity(chains.len());
        for (i, chain) in chains.iter().enumerate() {
            match chain.get(name) {
                Some(ParamArray::Matrix(m)) if m.ncols() == width => blocks.push(m),
                _ => {
                    return Err(BackendError::InvalidOutput(format!(
                        "chain {i} does not report '{name}' with width {width}"
                    )));
                }
            }
        }
        out.insert(name, ParamArray::Matrix(stack_rows(blocks, width)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::tests::{init_params, model_data};
    use nalgebra::DVector;
    use std::cell::RefCell;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn options_reject_unknown_keys() {
        let ok = BackendOptions::from_map(&map(&[("newton_fallback", Value::Bool(false))])).unwrap();
        assert_eq!(ok.newton_fallback, Some(false));

        let err = BackendOptions::from_map(&map(&[("bogus", Value::from(1))])).unwrap_err();
        assert!(matches!(err, BackendError::UnknownOption(k) if k == "bogus"));

        let err = BackendOptions::from_map(&map(&[("newton_fallback", Value::from("yes"))])).unwrap_err();
        assert!(matches!(err, BackendError::InvalidOption { .. }));
    }

    #[test]
    fn options_parse_from_pairs() {
        let opts = BackendOptions::from_pairs(["newton_fallback=false"]).unwrap();
        assert_eq!(opts.newton_fallback, Some(false));
        assert!(matches!(
            BackendOptions::from_pairs(["newton_fallback"]),
            Err(BackendError::InvalidOption { .. })
        ));
        assert!(matches!(
            BackendOptions::from_pairs(["bogus=1"]),
            Err(BackendError::UnknownOption(_))
        ));
    }

    #[test]
    fn fit_defaults_depend_on_problem_size() {
        let small = FitOverrides::default().resolve(&model_data(50, 2, 1));
        assert_eq!(small.algorithm, Algorithm::Newton);
        assert_eq!(small.iter, 10_000);

        let large = FitOverrides::default().resolve(&model_data(500, 2, 1));
        assert_eq!(large.algorithm, Algorithm::Lbfgs);

        let forced = FitOverrides {
            algorithm: Some(Algorithm::Bfgs),
            iter: Some(200),
            ..Default::default()
        }
        .resolve(&model_data(50, 2, 1));
        assert_eq!(forced.algorithm, Algorithm::Bfgs);
        assert_eq!(forced.iter, 200);
    }

    #[test]
    fn sampling_defaults_split_samples() {
        let args = SampleOverrides::default().resolve(1001);
        assert_eq!(args.chains, 4);
        assert_eq!(args.iter_sampling, 500);
        assert_eq!(args.iter_warmup, 500);

        let args = SampleOverrides {
            chains: Some(2),
            iter_warmup: Some(100),
            seed: Some(7),
            ..Default::default()
        }
        .resolve(1000);
        assert_eq!(args.chains, 2);
        assert_eq!(args.iter_sampling, 500);
        assert_eq!(args.iter_warmup, 100);
        assert_eq!(args.seed, 7);
    }

    fn lbfgs_args() -> OptimizeArgs {
        OptimizeArgs {
            algorithm: Algorithm::Lbfgs,
            iter: 10_000,
            seed: None,
            extra: Vec::new(),
        }
    }

    #[test]
    fn fallback_retries_once_with_newton() {
        let attempts = RefCell::new(Vec::new());
        let out = optimize_with_fallback(true, lbfgs_args(), |a| {
            attempts.borrow_mut().push(a.algorithm);
            if a.algorithm == Algorithm::Newton {
                Ok(1)
            } else {
                Err(EngineError::Runtime("line search failed".into()))
            }
        });
        assert_eq!(out.unwrap(), 1);
        assert_eq!(*attempts.borrow(), vec![Algorithm::Lbfgs, Algorithm::Newton]);
    }

    #[test]
    fn no_second_retry_when_newton_also_fails() {
        let attempts = RefCell::new(0);
        let out: Result<(), _> = optimize_with_fallback(true, lbfgs_args(), |_| {
            *attempts.borrow_mut() += 1;
            Err(EngineError::Runtime("diverged".into()))
        });
        assert!(matches!(out, Err(BackendError::Fit(EngineError::Runtime(m))) if m == "diverged"));
        assert_eq!(*attempts.borrow(), 2);
    }

    fn runtime() -> EngineError {
        EngineError::Runtime("x".into())
    }

    fn spawn_failure() -> EngineError {
        EngineError::Io(std::io::Error::other("spawn failed"))
    }

    fn attempts(fallback: bool, args: OptimizeArgs, err: fn() -> EngineError) -> usize {
        let attempts = RefCell::new(0);
        let out: Result<(), _> = optimize_with_fallback(fallback, args, |_| {
            *attempts.borrow_mut() += 1;
            Err(err())
        });
        assert!(matches!(out, Err(BackendError::Fit(_))));
        attempts.into_inner()
    }

    #[test]
    fn no_retry_when_disabled_newton_or_not_runtime() {
        assert_eq!(attempts(false, lbfgs_args(), runtime), 1);
        let newton = OptimizeArgs {
            algorithm: Algorithm::Newton,
            ..lbfgs_args()
        };
        assert_eq!(attempts(true, newton, runtime), 1);
        assert_eq!(attempts(true, lbfgs_args(), spawn_failure), 1);
    }

    #[test]
    fn init_override_replaces_init() {
        let data = model_data(10, 2, 1);
        let mut other = init_params(2, 1);
        other.k = 9.0;
        let input = prepare_input(&init_params(2, 1), &data, Some(&other)).unwrap();
        assert_eq!(input.init["k"], Value::from(9.0));
        assert_eq!(input.data["T"], Value::from(10));

        let bad = init_params(3, 1);
        assert!(matches!(
            prepare_input(&bad, &data, None),
            Err(BackendError::InvalidData(_))
        ));
    }

    #[test]
    fn sample_shapes_are_normalized() {
        let mut params = ParamMap::new();
        params.insert("k", ParamArray::Matrix(DMatrix::zeros(6, 1)));
        params.insert("delta", ParamArray::Matrix(DMatrix::zeros(6, 1)));
        params.insert("beta", ParamArray::Matrix(DMatrix::zeros(6, 3)));
        params.insert("trend", ParamArray::Matrix(DMatrix::zeros(6, 4)));

        let out = normalize_sample(params, &model_data(4, 1, 3));
        assert_eq!(out.get("k").unwrap().shape(), vec![6]);
        assert_eq!(out.get("delta").unwrap().shape(), vec![6, 1]);
        assert_eq!(out.get("beta").unwrap().shape(), vec![6, 3]);
        assert_eq!(out.get("trend").unwrap().shape(), vec![6, 4]);
    }

    #[test]
    fn zero_changepoints_still_give_2d_delta() {
        let mut params = ParamMap::new();
        params.insert("k", ParamArray::Matrix(DMatrix::zeros(5, 1)));
        params.insert("beta", ParamArray::Matrix(DMatrix::zeros(5, 1)));

        let out = normalize_sample(params, &model_data(4, 0, 1));
        assert_eq!(out.get("delta").unwrap().shape(), vec![5, 0]);
        assert_eq!(out.get("beta").unwrap().shape(), vec![5, 1]);

        let mut fit = ParamMap::new();
        fit.insert("k", ParamArray::Vector(DVector::from_vec(vec![0.3])));
        let out = normalize_fit(fit, &model_data(4, 0, 0));
        assert_eq!(out.get("k").unwrap().shape(), vec![1, 1]);
        assert_eq!(out.get("delta").unwrap().shape(), vec![1, 0]);
        assert_eq!(out.get("beta").unwrap().shape(), vec![1, 0]);
    }

    #[test]
    fn chains_concatenate_chain_major() {
        let chain = |offset: f64| {
            let mut m = ParamMap::new();
            m.insert(
                "k",
                ParamArray::Matrix(DMatrix::from_fn(3, 1, |i, _| offset + i as f64)),
            );
            m
        };
        let out = concat_chains(&[chain(0.0), chain(10.0)]).unwrap();
        assert_eq!(
            out.get("k").unwrap().values(),
            vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]
        );

        assert!(matches!(concat_chains(&[]), Err(BackendError::InvalidOutput(_))));

        let mut odd = ParamMap::new();
        odd.insert("m", ParamArray::Matrix(DMatrix::zeros(3, 1)));
        assert!(matches!(
            concat_chains(&[chain(0.0), odd]),
            Err(BackendError::InvalidOutput(_))
        ));
    }
}
