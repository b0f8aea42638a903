//! CmdStan model artifacts.
//!
//! The CmdStan backend runs a precompiled `prophet_model.bin` that links
//! against `libtbb.so.2`; both live in the model directory
//! (`PROPHET_MODEL_DIR_PATH`).

use std::path::{Path, PathBuf};

pub mod download;

pub use download::*;

/// Compiled model executable name.
pub const MODEL_BINARY: &str = "prophet_model.bin";

/// Path of the compiled model executable inside `model_dir`.
pub fn model_file(model_dir: &Path) -> PathBuf {
    model_dir.join(MODEL_BINARY)
}
