//! Stan CSV reader.
//!
//! CmdStan writes one CSV file per run:
//!
//! - `#` comment lines (configuration, adaptation info, timing), which may also
//!   appear between draws
//! - one header row of column names (`lp__,accept_stat__,...,k,m,delta.1,...`)
//! - one row per saved iteration

use std::fs::File;
use std::io::Read;
use std::path::Path;

use nalgebra::DMatrix;

use crate::error::EngineError;

/// Parsed Stan CSV output.
#[derive(Debug, Clone, PartialEq)]
pub struct StanCsv {
    pub columns: Vec<String>,
    /// One row per saved iteration, aligned with `columns`.
    pub draws: DMatrix<f64>,
}

impl StanCsv {
    pub fn num_draws(&self) -> usize {
        self.draws.nrows()
    }

    /// Keep only the final row (the optimum, for optimizer output).
    pub fn last_draw(&self) -> Option<Vec<f64>> {
        let n = self.draws.nrows();
        if n == 0 {
            return None;
        }
        Some(self.draws.row(n - 1).iter().copied().collect())
    }
}

/// Parse a Stan CSV file from disk.
pub fn read_stan_csv(path: &Path) -> Result<StanCsv, EngineError> {
    let file = File::open(path)?;
    parse_stan_csv(file)
        .map_err(|e| EngineError::Output(format!("{} ({})", e, path.display())))
}

/// Parse Stan CSV from any reader.
pub fn parse_stan_csv<R: Read>(reader: R) -> Result<StanCsv, EngineError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| EngineError::Output(format!("Failed to read Stan CSV header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    if columns.is_empty() || columns.iter().all(String::is_empty) {
        return Err(EngineError::Output("Stan CSV has no header row".into()));
    }

    let width = columns.len();
    let mut values = Vec::new();
    let mut rows = 0;

    for (i, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| EngineError::Output(format!("Malformed Stan CSV row {}: {e}", i + 1)))?;
        if record.len() != width {
            return Err(EngineError::Output(format!(
                "Stan CSV row {} has {} fields, expected {width}",
                i + 1,
                record.len()
            )));
        }
        for field in record.iter() {
            let v = field.parse::<f64>().map_err(|e| {
                EngineError::Output(format!("Invalid number '{field}' in Stan CSV row {}: {e}", i + 1))
            })?;
            values.push(v);
        }
        rows += 1;
    }

    Ok(StanCsv {
        columns,
        draws: DMatrix::from_row_slice(rows, width, &values),
    })
}
