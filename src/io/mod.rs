//! Input/output helpers.
//!
//! - column demultiplexing of flat engine output (`columns`)
//! - Stan CSV parsing (`stan_csv`)
//! - model input / result JSON files (`files`)

pub mod columns;
pub mod files;
pub mod stan_csv;

pub use columns::*;
pub use files::*;
pub use stan_csv::*;
