//! External Stan engines.
//!
//! Each backend drives one engine through a small trait so the engine can be
//! swapped for a test double:
//!
//! - `CmdStanModel`: flat, column-oriented Stan CSV output (`cmdstan`)
//! - `NativeStanModel`: structured per-parameter output (`httpstan`)

use serde_json::Value;

use crate::domain::{Algorithm, ParamMap};
use crate::error::EngineError;
use crate::io::StanCsv;

pub mod cmdstan;
pub mod httpstan;

pub use cmdstan::CmdStanExecutable;
pub use httpstan::{HttpStanClient, HttpStanModel, ParamSpec};

/// Data and init values in the engine's JSON shape.
#[derive(Debug, Clone, PartialEq)]
pub struct StanInput {
    pub data: Value,
    pub init: Value,
}

/// Resolved arguments for one optimizer run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeArgs {
    pub algorithm: Algorithm,
    pub iter: usize,
    pub seed: Option<u32>,
    /// Engine-specific `key=value` arguments passed through verbatim.
    pub extra: Vec<(String, String)>,
}

/// Resolved arguments for one sampler run (all chains).
#[derive(Debug, Clone, PartialEq)]
pub struct SampleArgs {
    pub chains: usize,
    pub iter_sampling: usize,
    pub iter_warmup: usize,
    pub seed: u32,
    pub extra: Vec<(String, String)>,
}

/// A compiled model run through CmdStan's command-line interface.
pub trait CmdStanModel {
    /// Run the optimizer; the returned CSV holds the optimum in its last row.
    fn optimize(&self, input: &StanInput, args: &OptimizeArgs) -> Result<StanCsv, EngineError>;

    /// Run the sampler; one CSV per chain, in chain order.
    fn sample(&self, input: &StanInput, args: &SampleArgs) -> Result<Vec<StanCsv>, EngineError>;
}

/// A model whose engine reports structured, per-parameter results.
pub trait NativeStanModel {
    /// Run the optimizer; every parameter has exactly one row.
    fn optimizing(&self, input: &StanInput, args: &OptimizeArgs) -> Result<ParamMap, EngineError>;

    /// Run the sampler; one map per chain (draws × width per parameter), in
    /// chain order.
    fn sampling(&self, input: &StanInput, args: &SampleArgs) -> Result<Vec<ParamMap>, EngineError>;
}
