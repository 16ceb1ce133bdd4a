use std::sync::Arc;

use super::row::{Record, ResultColumns};
use crate::types::RowValues;

/// One statement's fully materialized output.
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// Position of this result within the execution (0-based).
    pub index: usize,
    /// The records produced by the statement, in server order
    pub rows: Vec<Record>,
    /// Rows affected as reported by the server, when it reports one.
    pub rows_affected: Option<u64>,
    columns: Arc<ResultColumns>,
}

impl ResultSet {
    #[must_use]
    pub fn new(index: usize, columns: Arc<ResultColumns>) -> Self {
        Self {
            index,
            rows: Vec::new(),
            rows_affected: None,
            columns,
        }
    }

    #[must_use]
    pub fn columns(&self) -> &Arc<ResultColumns> {
        &self.columns
    }

    pub fn push(&mut self, record: Record) {
        self.rows.push(record);
    }

    /// Add a row from raw values, sharing this result's headers.
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        self.rows
            .push(Record::new(Arc::clone(&self.columns), row_values));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Values of output parameters, available once the statement has fully completed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputParameters {
    values: Vec<(String, RowValues)>,
}

impl OutputParameters {
    #[must_use]
    pub fn new(values: Vec<(String, RowValues)>) -> Self {
        Self { values }
    }

    /// Look up a parameter by name; a leading `@` is optional and case is ignored.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RowValues> {
        let wanted = name.trim_start_matches('@');
        self.values
            .iter()
            .find(|(n, _)| n.trim_start_matches('@').eq_ignore_ascii_case(wanted))
            .map(|(_, v)| v)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RowValues)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ColumnHeader;
    use crate::types::SqlType;

    #[test]
    fn rows_share_headers() {
        let columns = Arc::new(ResultColumns::new(vec![ColumnHeader::new(
            "n",
            SqlType::Int,
        )]));
        let mut rs = ResultSet::new(0, columns);
        rs.add_row_values(vec![RowValues::Int(1)]);
        rs.add_row_values(vec![RowValues::Int(2)]);
        assert_eq!(rs.len(), 2);
        assert!(Arc::ptr_eq(rs.rows[0].columns(), rs.rows[1].columns()));
    }

    #[test]
    fn output_lookup_accepts_at_prefix() {
        let out = OutputParameters::new(vec![("@Total".into(), RowValues::Int(9))]);
        assert_eq!(out.get("total"), Some(&RowValues::Int(9)));
        assert_eq!(out.get("@TOTAL"), Some(&RowValues::Int(9)));
        assert!(out.get("other").is_none());
    }
}
