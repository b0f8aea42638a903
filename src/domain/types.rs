//! Shared domain types.
//!
//! These types are serializable so they can be:
//!
//! - handed to an engine in its native JSON shape (Stan field names, matrices as
//!   lists of rows)
//! - read from / written to files by the CLI

use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::BackendError;

/// Time-point count below which the optimizer defaults to Newton.
pub const NEWTON_MAX_TIMEPOINTS: usize = 100;

/// One fitting problem, as the Stan program declares its `data` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    /// Number of time points.
    #[serde(rename = "T")]
    pub num_timepoints: usize,
    /// Number of changepoints.
    #[serde(rename = "S")]
    pub num_changepoints: usize,
    /// Number of regressors.
    #[serde(rename = "K")]
    pub num_regressors: usize,
    /// Scale on the changepoint prior.
    pub tau: f64,
    /// 0 linear, 1 logistic, 2 flat.
    pub trend_indicator: i32,
    pub y: Vec<f64>,
    pub t: Vec<f64>,
    pub cap: Vec<f64>,
    pub t_change: Vec<f64>,
    /// Additive feature indicators, one per regressor column.
    pub s_a: Vec<f64>,
    /// Multiplicative feature indicators, one per regressor column.
    pub s_m: Vec<f64>,
    /// Regressor matrix (T × K).
    #[serde(rename = "X", with = "matrix_rows")]
    pub x: DMatrix<f64>,
    /// Prior scales on the regressor coefficients.
    pub sigmas: Vec<f64>,
}

impl ModelData {
    /// Check every vector length against T/S/K.
    pub fn validate(&self) -> Result<(), BackendError> {
        let t = self.num_timepoints;
        let s = self.num_changepoints;
        let k = self.num_regressors;

        check_len("y", self.y.len(), t, "T")?;
        check_len("t", self.t.len(), t, "T")?;
        check_len("cap", self.cap.len(), t, "T")?;
        check_len("t_change", self.t_change.len(), s, "S")?;
        check_len("s_a", self.s_a.len(), k, "K")?;
        check_len("s_m", self.s_m.len(), k, "K")?;
        check_len("sigmas", self.sigmas.len(), k, "K")?;

        if self.x.nrows() != t || self.x.ncols() != k {
            return Err(BackendError::InvalidData(format!(
                "X is {}x{}, expected T x K = {t}x{k}",
                self.x.nrows(),
                self.x.ncols()
            )));
        }
        if !(0..=2).contains(&self.trend_indicator) {
            return Err(BackendError::InvalidData(format!(
                "trend_indicator must be 0, 1 or 2 (got {})",
                self.trend_indicator
            )));
        }
        Ok(())
    }

    /// Optimizer used when the caller does not pick one.
    pub fn default_algorithm(&self) -> Algorithm {
        if self.num_timepoints < NEWTON_MAX_TIMEPOINTS {
            Algorithm::Newton
        } else {
            Algorithm::Lbfgs
        }
    }
}

/// Initial values for the optimizer/sampler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    /// Base growth rate.
    pub k: f64,
    /// Trend offset.
    pub m: f64,
    /// Changepoint rate adjustments (length S).
    pub delta: Vec<f64>,
    /// Regressor coefficients (length K).
    pub beta: Vec<f64>,
    /// Observation noise scale.
    pub sigma_obs: f64,
}

impl InitParams {
    /// Check `delta`/`beta` lengths against the model's S and K.
    pub fn validate(&self, data: &ModelData) -> Result<(), BackendError> {
        check_len("delta", self.delta.len(), data.num_changepoints, "S")?;
        check_len("beta", self.beta.len(), data.num_regressors, "K")
    }
}

fn check_len(field: &str, actual: usize, expected: usize, dim: &str) -> Result<(), BackendError> {
    if actual == expected {
        Ok(())
    } else {
        Err(BackendError::InvalidData(format!(
            "{field} has length {actual}, expected {dim} = {expected}"
        )))
    }
}

/// Point-estimate optimization algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Newton,
    #[serde(rename = "LBFGS")]
    Lbfgs,
    #[serde(rename = "BFGS")]
    Bfgs,
}

impl Algorithm {
    /// Lower-case token used on the CmdStan command line and in httpstan
    /// function names.
    pub fn engine_name(self) -> &'static str {
        match self {
            Algorithm::Newton => "newton",
            Algorithm::Lbfgs => "lbfgs",
            Algorithm::Bfgs => "bfgs",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::Newton => "Newton",
            Algorithm::Lbfgs => "LBFGS",
            Algorithm::Bfgs => "BFGS",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newton" => Ok(Algorithm::Newton),
            "lbfgs" => Ok(Algorithm::Lbfgs),
            "bfgs" => Ok(Algorithm::Bfgs),
            other => Err(format!("unknown optimization algorithm '{other}'")),
        }
    }
}

/// A parameter's values: 1-D, or 2-D (rows × columns).
#[derive(Debug, Clone, PartialEq)]
pub enum ParamArray {
    Vector(DVector<f64>),
    Matrix(DMatrix<f64>),
}

impl ParamArray {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ParamArray::Vector(v) => vec![v.len()],
            ParamArray::Matrix(m) => vec![m.nrows(), m.ncols()],
        }
    }

    /// Size of the first axis (draws, for sampling results).
    pub fn leading_dim(&self) -> usize {
        match self {
            ParamArray::Vector(v) => v.len(),
            ParamArray::Matrix(m) => m.nrows(),
        }
    }

    /// Size of the last axis.
    pub fn last_dim(&self) -> usize {
        match self {
            ParamArray::Vector(v) => v.len(),
            ParamArray::Matrix(m) => m.ncols(),
        }
    }

    /// Values in row-major order.
    pub fn values(&self) -> Vec<f64> {
        match self {
            ParamArray::Vector(v) => v.iter().copied().collect(),
            ParamArray::Matrix(m) => m.row_iter().flat_map(|r| r.iter().copied().collect::<Vec<_>>()).collect(),
        }
    }

    /// Reshape to a single row, `(1, n)`.
    pub fn into_single_row(self) -> ParamArray {
        let values = self.values();
        ParamArray::Matrix(DMatrix::from_row_slice(1, values.len(), &values))
    }

    /// Drop a trailing axis of size 1; anything else is returned unchanged.
    pub fn squeeze_last(self) -> ParamArray {
        match self {
            ParamArray::Matrix(m) if m.ncols() == 1 => ParamArray::Vector(m.column(0).into_owned()),
            other => other,
        }
    }

    /// Turn a 1-D array into an `(n, 1)` column; 2-D arrays are unchanged.
    pub fn into_column(self) -> ParamArray {
        match self {
            ParamArray::Vector(v) => {
                let n = v.len();
                ParamArray::Matrix(DMatrix::from_column_slice(n, 1, v.as_slice()))
            }
            other => other,
        }
    }

    pub fn as_matrix(&self) -> Option<&DMatrix<f64>> {
        match self {
            ParamArray::Matrix(m) => Some(m),
            ParamArray::Vector(_) => None,
        }
    }
}

impl Serialize for ParamArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParamArray::Vector(v) => {
                let mut seq = serializer.serialize_seq(Some(v.len()))?;
                for x in v.iter() {
                    seq.serialize_element(x)?;
                }
                seq.end()
            }
            ParamArray::Matrix(m) => {
                let mut seq = serializer.serialize_seq(Some(m.nrows()))?;
                for row in m.row_iter() {
                    let row: Vec<f64> = row.iter().copied().collect();
                    seq.serialize_element(&row)?;
                }
                seq.end()
            }
        }
    }
}

/// Insertion-ordered mapping from parameter name to values.
///
/// Fit and sampling results are both `ParamMap`s; the order is the order in
/// which the engine reported the parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap {
    entries: Vec<(String, ParamArray)>,
}

pub type FitResult = ParamMap;
pub type SampleResult = ParamMap;

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`, keeping its original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamArray) {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamArray> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamArray)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `f` to every array, keeping names and order.
    pub fn map_values(self, mut f: impl FnMut(&str, ParamArray) -> ParamArray) -> ParamMap {
        let entries = self
            .entries
            .into_iter()
            .map(|(k, v)| {
                let v = f(&k, v);
                (k, v)
            })
            .collect();
        ParamMap { entries }
    }
}

impl IntoIterator for ParamMap {
    type Item = (String, ParamArray);
    type IntoIter = std::vec::IntoIter<(String, ParamArray)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for ParamMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Build a matrix from equally long rows.
pub fn matrix_from_rows(rows: &[Vec<f64>]) -> Result<DMatrix<f64>, String> {
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        return Err(format!("row {i} has {} values, expected {ncols}", row.len()));
    }
    Ok(DMatrix::from_fn(rows.len(), ncols, |i, j| rows[i][j]))
}

/// Serde adapter: matrix as a list of rows (Stan's JSON convention).
mod matrix_rows {
    use nalgebra::DMatrix;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &DMatrix<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<Vec<f64>> = m.row_iter().map(|r| r.iter().copied().collect()).collect();
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DMatrix<f64>, D::Error> {
        let rows: Vec<Vec<f64>> = Vec::deserialize(deserializer)?;
        super::matrix_from_rows(&rows).map_err(D::Error::custom)
    }
}
