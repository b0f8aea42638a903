//! Backend running the precompiled CmdStan model executable.

use log::info;
use nalgebra::DVector;

use crate::artifacts::{download_model_files, model_file};
use crate::config::BackendConfig;
use crate::domain::{FitResult, InitParams, ModelData, ParamArray, ParamMap, SampleResult};
use crate::engine::{CmdStanExecutable, CmdStanModel};
use crate::error::BackendError;
use crate::io::{StanCsv, demultiplex};
use crate::models::backend::{
    BackendOptions, FitOverrides, SampleOverrides, StanBackend, StanFit, normalize_fit, normalize_sample,
    optimize_with_fallback, prepare_input, stack_rows,
};
use crate::models::registry::StanBackendKind;

pub struct CmdStanBackend {
    model: Box<dyn CmdStanModel>,
    stan_fit: Option<StanFit<StanCsv>>,
    newton_fallback: bool,
}

impl CmdStanBackend {
    pub const KIND: StanBackendKind = StanBackendKind::CmdStanPy;

    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let model = Self::load_model(config)?;
        Ok(Self::with_model(Box::new(model)))
    }

    pub fn with_model(model: Box<dyn CmdStanModel>) -> Self {
        Self {
            model,
            stan_fit: None,
            newton_fallback: true,
        }
    }

    /// Locate the model executable, downloading it first if enabled.
    ///
    /// The model directory also holds the bundled TBB library, so it is put
    /// on the executable's library search path.
    pub fn load_model(config: &BackendConfig) -> Result<CmdStanExecutable, BackendError> {
        if config.auto_download {
            download_model_files(&config.model_dir)?;
        }
        let exe = model_file(&config.model_dir);
        info!("loading CmdStan model {}", exe.display());
        CmdStanExecutable::open(exe, Some(config.model_dir.clone())).map_err(|e| BackendError::Load(e.to_string()))
    }

    /// Raw output of the most recent run.
    pub fn stan_fit(&self) -> Option<&StanFit<StanCsv>> {
        self.stan_fit.as_ref()
    }
}

impl StanBackend for CmdStanBackend {
    fn backend_type(&self) -> StanBackendKind {
        Self::KIND
    }

    fn newton_fallback(&self) -> bool {
        self.newton_fallback
    }

    fn apply_options(&mut self, options: BackendOptions) {
        if let Some(flag) = options.newton_fallback {
            self.newton_fallback = flag;
        }
    }

    fn fit(&mut self, init: &InitParams, data: &ModelData, overrides: &FitOverrides) -> Result<FitResult, BackendError> {
        let input = prepare_input(init, data, overrides.init.as_ref())?;
        let args = overrides.resolve(data);

        let model = &self.model;
        let csv = optimize_with_fallback(self.newton_fallback, args, |a| model.optimize(&input, a))?;

        let params = optimum_params(&csv);
        self.stan_fit = Some(StanFit::Optimize(csv));
        Ok(normalize_fit(params?, data))
    }

    fn sampling(
        &mut self,
        init: &InitParams,
        data: &ModelData,
        samples: usize,
        overrides: &SampleOverrides,
    ) -> Result<SampleResult, BackendError> {
        let input = prepare_input(init, data, overrides.init.as_ref())?;
        let args = overrides.resolve(samples);

        let chains = self.model.sample(&input, &args).map_err(BackendError::Sample)?;

        let params = chain_params(&chains);
        self.stan_fit = Some(StanFit::Sample(chains));
        Ok(normalize_sample(params?, data))
    }
}

/// Parameters at the optimum (the CSV's last row).
fn optimum_params(csv: &StanCsv) -> Result<ParamMap, BackendError> {
    let optimum = csv
        .last_draw()
        .ok_or_else(|| BackendError::InvalidOutput("optimizer output has no rows".into()))?;
    demultiplex(&csv.columns, &ParamArray::Vector(DVector::from_vec(optimum)))
}

/// Draws of all chains stacked chain by chain, split per parameter.
fn chain_params(chains: &[StanCsv]) -> Result<ParamMap, BackendError> {
    let Some(first) = chains.first() else {
        return Err(BackendError::InvalidOutput("sampler returned no chains".into()));
    };
    if let Some((i, _)) = chains.iter().enumerate().find(|(_, c)| c.columns != first.columns) {
        return Err(BackendError::InvalidOutput(format!(
            "chain {} reports different columns than chain 1",
            i + 1
        )));
    }

    let draws = stack_rows(chains.iter().map(|c| &c.draws), first.columns.len());
    demultiplex(&first.columns, &ParamArray::Matrix(draws))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Algorithm;
    use crate::domain::types::tests::{init_params, model_data};
    use crate::engine::{OptimizeArgs, SampleArgs, StanInput};
    use crate::error::EngineError;
    use crate::io::parse_stan_csv;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Engine double: fails the first `failures` optimizations, then returns
    /// canned output.
    struct FakeModel {
        failures: usize,
        optimize_out: &'static str,
        chain_out: Vec<&'static str>,
        calls: Rc<RefCell<Vec<Algorithm>>>,
    }

    impl CmdStanModel for FakeModel {
        fn optimize(&self, _input: &StanInput, args: &OptimizeArgs) -> Result<StanCsv, EngineError> {
            let mut calls = self.calls.borrow_mut();
            calls.push(args.algorithm);
            if calls.len() <= self.failures {
                return Err(EngineError::Runtime("Line search failed".into()));
            }
            parse_stan_csv(self.optimize_out.as_bytes())
        }

        fn sample(&self, _input: &StanInput, args: &SampleArgs) -> Result<Vec<StanCsv>, EngineError> {
            assert_eq!(args.chains, self.chain_out.len());
            self.chain_out.iter().map(|c| parse_stan_csv(c.as_bytes())).collect()
        }
    }

    const OPTIMUM: &str = "\
# model = prophet_model
lp__,k,m,delta.1,delta.2,sigma_obs,beta.1
0,0.1,0.2,0,0,1,0
12.5,0.3,0.4,0.01,-0.02,0.05,1.5
";

    fn backend(failures: usize, chain_out: Vec<&'static str>) -> (CmdStanBackend, Rc<RefCell<Vec<Algorithm>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let model = FakeModel {
            failures,
            optimize_out: OPTIMUM,
            chain_out,
            calls: Rc::clone(&calls),
        };
        (CmdStanBackend::with_model(Box::new(model)), calls)
    }

    #[test]
    fn fit_returns_one_row_per_parameter() {
        let (mut b, calls) = backend(0, Vec::new());
        let out = b
            .fit(&init_params(2, 1), &model_data(50, 2, 1), &FitOverrides::default())
            .unwrap();

        assert_eq!(*calls.borrow(), vec![Algorithm::Newton]);
        assert_eq!(out.keys().collect::<Vec<_>>(), ["lp__", "k", "m", "delta", "sigma_obs", "beta"]);
        assert_eq!(out.get("k").unwrap().shape(), vec![1, 1]);
        assert_eq!(out.get("delta").unwrap().values(), vec![0.01, -0.02]);
        assert_eq!(out.get("delta").unwrap().shape(), vec![1, 2]);
        assert!(matches!(b.stan_fit(), Some(StanFit::Optimize(_))));
    }

    #[test]
    fn lbfgs_failure_falls_back_to_newton() {
        let (mut b, calls) = backend(1, Vec::new());
        let out = b.fit(&init_params(2, 1), &model_data(150, 2, 1), &FitOverrides::default());
        assert!(out.is_ok());
        assert_eq!(*calls.borrow(), vec![Algorithm::Lbfgs, Algorithm::Newton]);
    }

    #[test]
    fn disabled_fallback_surfaces_the_failure() {
        let (mut b, calls) = backend(1, Vec::new());
        let mut opts = serde_json::Map::new();
        opts.insert("newton_fallback".into(), serde_json::Value::Bool(false));
        b.set_options(&opts).unwrap();
        assert!(!b.newton_fallback());

        let err = b
            .fit(&init_params(2, 1), &model_data(150, 2, 1), &FitOverrides::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::Fit(EngineError::Runtime(_))));
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn unknown_option_leaves_settings_unchanged() {
        let (mut b, _) = backend(0, Vec::new());
        let mut opts = serde_json::Map::new();
        opts.insert("newton_fallback".into(), serde_json::Value::Bool(false));
        opts.insert("verbose".into(), serde_json::Value::Bool(true));
        assert!(matches!(b.set_options(&opts), Err(BackendError::UnknownOption(k)) if k == "verbose"));
        assert!(b.newton_fallback());
    }

    #[test]
    fn sampling_concatenates_chains_and_squeezes_scalars() {
        let chain1 = "lp__,k,delta.1,beta.1,beta.2\n1,0.1,0.5,1,2\n2,0.2,0.6,3,4\n";
        let chain2 = "lp__,k,delta.1,beta.1,beta.2\n3,0.3,0.7,5,6\n4,0.4,0.8,7,8\n";
        let (mut b, _) = backend(0, vec![chain1, chain2]);
        let overrides = SampleOverrides {
            chains: Some(2),
            ..Default::default()
        };

        let out = b
            .sampling(&init_params(1, 2), &model_data(20, 1, 2), 4, &overrides)
            .unwrap();

        assert_eq!(out.get("k").unwrap().shape(), vec![4]);
        assert_eq!(out.get("k").unwrap().values(), vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(out.get("delta").unwrap().shape(), vec![4, 1]);
        assert_eq!(out.get("beta").unwrap().shape(), vec![4, 2]);
        assert_eq!(out.get("beta").unwrap().values(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert!(matches!(b.stan_fit(), Some(StanFit::Sample(chains)) if chains.len() == 2));
    }

    #[test]
    fn sampling_without_changepoints_has_empty_delta() {
        let chain = "lp__,k,beta.1\n1,0.1,2\n";
        let (mut b, _) = backend(0, vec![chain]);
        let overrides = SampleOverrides {
            chains: Some(1),
            ..Default::default()
        };

        let out = b
            .sampling(&init_params(0, 1), &model_data(20, 0, 1), 2, &overrides)
            .unwrap();
        assert_eq!(out.get("delta").unwrap().shape(), vec![1, 0]);
        assert_eq!(out.get("beta").unwrap().shape(), vec![1, 1]);
    }

    #[test]
    fn sampling_without_regressors_has_empty_beta() {
        let chain = "lp__,k,m,sigma_obs\n1,0.1,0.2,0.3\n2,0.4,0.5,0.6\n";
        let (mut b, _) = backend(0, vec![chain, chain]);
        let overrides = SampleOverrides {
            chains: Some(2),
            ..Default::default()
        };

        let out = b
            .sampling(&init_params(0, 0), &model_data(20, 0, 0), 4, &overrides)
            .unwrap();
        assert_eq!(out.get("k").unwrap().shape(), vec![4]);
        assert_eq!(out.get("beta").unwrap().shape(), vec![4, 0]);
        assert_eq!(out.get("delta").unwrap().shape(), vec![4, 0]);
    }

    #[test]
    fn mismatched_chain_columns_are_rejected() {
        let (mut b, _) = backend(0, vec!["lp__,k\n1,2\n", "lp__,m\n1,2\n"]);
        let overrides = SampleOverrides {
            chains: Some(2),
            ..Default::default()
        };
        let err = b
            .sampling(&init_params(0, 0), &model_data(5, 0, 0), 2, &overrides)
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidOutput(_)));
    }

    #[test]
    fn invalid_input_never_reaches_the_engine() {
        let (mut b, calls) = backend(0, Vec::new());
        let err = b
            .fit(&init_params(3, 1), &model_data(50, 2, 1), &FitOverrides::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidData(_)));
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn missing_executable_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig {
            model_dir: dir.path().to_path_buf(),
            resource_dir: dir.path().to_path_buf(),
            httpstan_url: "http://127.0.0.1:1".into(),
            auto_download: false,
        };
        assert!(matches!(CmdStanBackend::new(&config), Err(BackendError::Load(_))));
    }
}
