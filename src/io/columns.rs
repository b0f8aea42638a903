//! Column demultiplexing.
//!
//! Engines that report results as a flat table name each column after the
//! parameter it belongs to:
//!
//! - scalars: `lp__`, `k`
//! - vector/matrix elements: `delta.1`, `X.2.3` or `delta[1]`
//!
//! `demultiplex` groups consecutive columns with the same base name and slices
//! the aligned data axis into one array per parameter.

use crate::domain::{ParamArray, ParamMap};
use crate::error::BackendError;

/// Base parameter name of a column: text before the first `.` (dotted
/// indexing) or, failing that, before the first `[`.
pub fn base_name(column: &str) -> &str {
    let sep = if column.contains('.') { '.' } else { '[' };
    column.split(sep).next().unwrap_or(column)
}

/// Split a flat column table into per-parameter arrays.
///
/// `data` is aligned with `columns` along its last axis: a vector has one
/// value per column, a matrix one column per column name. Output arrays keep
/// the input's dimensionality, so a run of width 1 yields `(1,)` or
/// `(rows, 1)`.
pub fn demultiplex<S: AsRef<str>>(columns: &[S], data: &ParamArray) -> Result<ParamMap, BackendError> {
    if columns.len() != data.last_dim() {
        return Err(BackendError::InvalidOutput(format!(
            "{} column names for {} data columns",
            columns.len(),
            data.last_dim()
        )));
    }

    let mut output = ParamMap::new();
    let Some(first) = columns.first() else {
        return Ok(output);
    };

    let mut prev = base_name(first.as_ref());
    let mut start = 0;
    let mut end = 0;

    for column in columns {
        let curr = base_name(column.as_ref());
        if curr != prev {
            close_run(&mut output, prev, data, start, end)?;
            prev = curr;
            start = end;
        }
        end += 1;
    }
    close_run(&mut output, prev, data, start, end)?;

    Ok(output)
}

fn close_run(
    output: &mut ParamMap,
    name: &str,
    data: &ParamArray,
    start: usize,
    end: usize,
) -> Result<(), BackendError> {
    if output.contains_key(name) {
        return Err(BackendError::DuplicateColumn(name.to_string()));
    }
    let width = end - start;
    let slice = match data {
        ParamArray::Vector(v) => ParamArray::Vector(v.rows(start, width).into_owned()),
        ParamArray::Matrix(m) => ParamArray::Matrix(m.columns(start, width).into_owned()),
    };
    output.insert(name, slice);
    Ok(())
}
