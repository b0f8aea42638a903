//! Domain types used throughout the crate.
//!
//! This module defines:
//!
//! - model inputs (`ModelData`, `InitParams`)
//! - the optimizer choice (`Algorithm`)
//! - structured results (`ParamArray`, `ParamMap`)

pub mod types;

pub use types::*;
