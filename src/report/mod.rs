//! Reporting utilities: per-parameter summaries and terminal output.

use crate::domain::ParamMap;

pub mod format;

pub use format::*;

/// Shape and value range of one result parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSummary {
    pub name: String,
    pub shape: Vec<usize>,
    /// `None` for zero-size arrays.
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Summarize every parameter, in result order.
pub fn summarize(params: &ParamMap) -> Vec<ParamSummary> {
    params
        .iter()
        .map(|(name, arr)| {
            let values = arr.values();
            let (mean, min, max) = if values.is_empty() {
                (None, None, None)
            } else {
                let n = values.len() as f64;
                (
                    Some(values.iter().sum::<f64>() / n),
                    Some(values.iter().copied().fold(f64::INFINITY, f64::min)),
                    Some(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
                )
            };
            ParamSummary {
                name: name.to_string(),
                shape: arr.shape(),
                mean,
                min,
                max,
            }
        })
        .collect()
}
