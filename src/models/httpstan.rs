//! Backend driving an httpstan service.
//!
//! The Stan program is read from the resource directory and compiled by the
//! service when the backend is created.

use std::fs;

use log::info;

use crate::config::BackendConfig;
use crate::domain::{FitResult, InitParams, ModelData, ParamMap, SampleResult};
use crate::engine::{HttpStanClient, HttpStanModel, NativeStanModel};
use crate::error::BackendError;
use crate::models::backend::{
    BackendOptions, FitOverrides, SampleOverrides, StanBackend, StanFit, concat_chains, normalize_fit,
    normalize_sample, optimize_with_fallback, prepare_input,
};
use crate::models::registry::StanBackendKind;

/// Stan program file inside the resource directory.
pub const STAN_PROGRAM: &str = "prophet.stan";

pub struct HttpStanBackend {
    model: Box<dyn NativeStanModel>,
    stan_fit: Option<StanFit<ParamMap>>,
    newton_fallback: bool,
}

impl HttpStanBackend {
    pub const KIND: StanBackendKind = StanBackendKind::PyStan;

    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let model = Self::load_model(config)?;
        Ok(Self::with_model(Box::new(model)))
    }

    pub fn with_model(model: Box<dyn NativeStanModel>) -> Self {
        Self {
            model,
            stan_fit: None,
            newton_fallback: true,
        }
    }

    pub fn load_model(config: &BackendConfig) -> Result<HttpStanModel, BackendError> {
        let path = config.resource_dir.join(STAN_PROGRAM);
        let code = fs::read_to_string(&path)
            .map_err(|e| BackendError::Load(format!("Failed to read '{}': {e}", path.display())))?;

        info!("compiling {} on {}", path.display(), config.httpstan_url);
        let client = HttpStanClient::new(config.httpstan_url.clone()).map_err(|e| BackendError::Load(e.to_string()))?;
        HttpStanModel::compile(client, &code).map_err(|e| BackendError::Load(e.to_string()))
    }

    /// Structured output of the most recent run.
    pub fn stan_fit(&self) -> Option<&StanFit<ParamMap>> {
        self.stan_fit.as_ref()
    }
}

impl StanBackend for HttpStanBackend {
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
        let params = optimize_with_fallback(self.newton_fallback, args, |a| model.optimizing(&input, a))?;

        self.stan_fit = Some(StanFit::Optimize(params.clone()));
        Ok(normalize_fit(params, data))
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

        let chains = self.model.sampling(&input, &args).map_err(BackendError::Sample)?;

        let params = concat_chains(&chains);
        self.stan_fit = Some(StanFit::Sample(chains));
        Ok(normalize_sample(params?, data))
    }
}
