//! httpstan REST client.
//!
//! httpstan compiles a Stan program once (`POST /v1/models`) and then runs
//! optimizer/sampler "fits" against it as long-running operations:
//!
//! 1. `POST /v1/{model}/fits` returns an operation
//! 2. `GET /v1/{operation}` until it is `done`
//! 3. `GET /v1/{fit}` streams newline-delimited JSON messages; every message
//!    with topic `sample` carries one draw as `{constrained name: value}`
//!
//! Parameter structure (`POST /v1/{model}/params`) is used to put the flat
//! names back together.

use std::thread::sleep;
use std::time::Duration;

use log::debug;
use nalgebra::DMatrix;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::domain::{ParamArray, ParamMap};
use crate::engine::{NativeStanModel, OptimizeArgs, SampleArgs, StanInput};
use crate::error::EngineError;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

const SAMPLE_FUNCTION: &str = "stan::services::sample::hmc_nuts_diag_e_adapt";

/// Blocking client for one httpstan service.
#[derive(Debug, Clone)]
pub struct HttpStanClient {
    client: Client,
    base_url: String,
}

/// Structure of one model parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub dims: Vec<usize>,
    /// Flat names of the elements, in the engine's order (`delta.1`, ...).
    pub constrained_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ParamsResponse {
    params: Vec<ParamSpec>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    done: bool,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FitMessage {
    topic: String,
    #[serde(default)]
    values: Value,
}

impl HttpStanClient {
    /// Client without a request timeout: compiling a model or running a fit
    /// can keep a request open for minutes.
    pub fn new(base_url: impl Into<String>) -> Result<Self, EngineError> {
        Self::with_timeout(base_url, None)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Compile (or fetch the cached build of) a Stan program; returns the
    /// model name (`models/<id>`).
    pub fn create_model(&self, program_code: &str) -> Result<String, EngineError> {
        let resp = self
            .client
            .post(self.url("models"))
            .json(&json!({ "program_code": program_code }))
            .send()?;
        let body: ModelResponse = check_status(resp)?
            .json()
            .map_err(|e| EngineError::Output(format!("Failed to parse httpstan model response: {e}")))?;
        Ok(body.name)
    }

    /// Parameter structure of `model` for the given data.
    pub fn model_params(&self, model: &str, data: &Value) -> Result<Vec<ParamSpec>, EngineError> {
        let resp = self
            .client
            .post(self.url(&format!("{model}/params")))
            .json(&json!({ "data": data }))
            .send()?;
        let body: ParamsResponse = check_status(resp)?
            .json()
            .map_err(|e| EngineError::Output(format!("Failed to parse httpstan params response: {e}")))?;
        Ok(body.params)
    }

    /// Run one fit to completion and return its draws.
    pub fn run_fit(&self, model: &str, request: &Value) -> Result<Vec<Map<String, Value>>, EngineError> {
        let resp = self
            .client
            .post(self.url(&format!("{model}/fits")))
            .json(request)
            .send()?;
        let mut operation: Operation = check_status(resp)?
            .json()
            .map_err(|e| EngineError::Output(format!("Failed to parse httpstan operation: {e}")))?;

        while !operation.done {
            sleep(POLL_INTERVAL);
            let resp = self.client.get(self.url(&operation.name)).send()?;
            operation = check_status(resp)?
                .json()
                .map_err(|e| EngineError::Output(format!("Failed to parse httpstan operation: {e}")))?;
        }

        let fit_name = fit_name(operation.result.as_ref())?;
        debug!("httpstan fit {fit_name} finished");

        let body = check_status(self.client.get(self.url(&fit_name)).send()?)?.text()?;
        parse_fit_messages(&body)
    }
}

fn check_status(resp: Response) -> Result<Response, EngineError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<Value>()
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    Err(EngineError::Transport(format!("httpstan responded with status {status}. {message}")))
}

/// Name of the finished fit, or the operation's failure as a runtime error.
fn fit_name(result: Option<&Value>) -> Result<String, EngineError> {
    let result = result.ok_or_else(|| EngineError::Output("finished operation has no result".into()))?;
    if let Some(name) = result.get("name").and_then(Value::as_str) {
        return Ok(name.to_string());
    }
    let message = result
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| result.to_string());
    Err(EngineError::Runtime(message))
}

/// Draws (`values` of `sample` messages) from a newline-delimited fit body.
pub fn parse_fit_messages(body: &str) -> Result<Vec<Map<String, Value>>, EngineError> {
    let mut draws = Vec::new();
    for (i, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let msg: FitMessage = serde_json::from_str(line)
            .map_err(|e| EngineError::Output(format!("Invalid fit message on line {}: {e}", i + 1)))?;
        if msg.topic != "sample" {
            continue;
        }
        if let Value::Object(values) = msg.values {
            draws.push(values);
        }
    }
    Ok(draws)
}

/// Stack draws into one (draws × width) matrix per parameter.
pub fn assemble_draws(specs: &[ParamSpec], draws: &[Map<String, Value>]) -> Result<ParamMap, EngineError> {
    let mut out = ParamMap::new();
    for spec in specs {
        let width = spec.constrained_names.len();
        let mut values = Vec::with_capacity(draws.len() * width);
        for (i, draw) in draws.iter().enumerate() {
            for name in &spec.constrained_names {
                let v = draw.get(name).and_then(Value::as_f64).ok_or_else(|| {
                    EngineError::Output(format!("draw {i} has no numeric value for '{name}'"))
                })?;
                values.push(v);
            }
        }
        out.insert(
            spec.name.clone(),
            ParamArray::Matrix(DMatrix::from_row_slice(draws.len(), width, &values)),
        );
    }
    Ok(out)
}

/// A Stan program compiled by an httpstan service.
#[derive(Debug, Clone)]
pub struct HttpStanModel {
    client: HttpStanClient,
    name: String,
}

impl HttpStanModel {
    /// Post `program_code` to the service and keep the resulting model handle.
    pub fn compile(client: HttpStanClient, program_code: &str) -> Result<Self, EngineError> {
        let name = client.create_model(program_code)?;
        Ok(Self { client, name })
    }
}

impl NativeStanModel for HttpStanModel {
    fn optimizing(&self, input: &StanInput, args: &OptimizeArgs) -> Result<ParamMap, EngineError> {
        let specs = self.client.model_params(&self.name, &input.data)?;

        let mut request = json!({
            "function": format!("stan::services::optimize::{}", args.algorithm.engine_name()),
            "data": input.data,
            "init": input.init,
            "iter": args.iter,
        });
        if let Some(seed) = args.seed {
            request["random_seed"] = json!(seed);
        }
        add_extra(&mut request, &args.extra);

        let draws = self.client.run_fit(&self.name, &request)?;
        let optimum = draws
            .last()
            .ok_or_else(|| EngineError::Output("optimizer returned no estimates".into()))?;
        assemble_draws(&specs, std::slice::from_ref(optimum))
    }

    fn sampling(&self, input: &StanInput, args: &SampleArgs) -> Result<Vec<ParamMap>, EngineError> {
        let specs = self.client.model_params(&self.name, &input.data)?;

        (1..=args.chains)
            .map(|chain| {
                let mut request = json!({
                    "function": SAMPLE_FUNCTION,
                    "data": input.data,
                    "init": input.init,
                    "num_samples": args.iter_sampling,
                    "num_warmup": args.iter_warmup,
                    "chain": chain,
                    "random_seed": args.seed,
                });
                add_extra(&mut request, &args.extra);
                let draws = self.client.run_fit(&self.name, &request)?;
                assemble_draws(&specs, &draws)
            })
            .collect()
    }
}

/// Extra arguments go into the request body; numbers and booleans keep their
/// JSON type.
fn add_extra(request: &mut Value, extra: &[(String, String)]) {
    for (key, raw) in extra {
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        request[key.as_str()] = value;
    }
}
