//! Collected and streamed result shapes: column headers, records, and materialized results.

mod result_set;
mod row;

pub use result_set::{OutputParameters, ResultSet};
pub use row::{ColumnHeader, Record, ResultColumns};
