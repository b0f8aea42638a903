//! Read model inputs and write results as JSON.
//!
//! Input files use the same layout the engines receive: Stan field names,
//! matrices as lists of rows. Results are written as an object of nested lists
//! in parameter order.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::domain::{InitParams, ModelData, ParamMap};
use crate::error::AppError;

/// Read a `ModelData` JSON file.
pub fn read_model_data(path: &Path) -> Result<ModelData, AppError> {
    read_json(path, "model data")
}

/// Read an `InitParams` JSON file.
pub fn read_init_params(path: &Path) -> Result<InitParams, AppError> {
    read_json(path, "init params")
}

/// Write a result map as pretty JSON.
pub fn write_params_json(path: &Path, params: &ParamMap) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create results JSON '{}': {e}", path.display())))?;

    serde_json::to_writer_pretty(file, params)
        .map_err(|e| AppError::new(2, format!("Failed to write results JSON: {e}")))?;

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open {what} '{}': {e}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::new(2, format!("Invalid {what} JSON '{}': {e}", path.display())))
}
