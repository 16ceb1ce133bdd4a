use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{RowValues, SqlType};

/// Name and declared type of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnHeader {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

impl ColumnHeader {
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
        }
    }
}

/// Column headers of one result, shared by every record of that result.
///
/// Lookups by name are case-insensitive; the first column wins when a name repeats.
#[derive(Debug)]
pub struct ResultColumns {
    headers: Vec<ColumnHeader>,
    // lowercased name -> first ordinal
    index: HashMap<String, usize>,
}

impl ResultColumns {
    #[must_use]
    pub fn new(headers: Vec<ColumnHeader>) -> Self {
        let mut index = HashMap::with_capacity(headers.len());
        for (i, header) in headers.iter().enumerate() {
            index.entry(header.name.to_lowercase()).or_insert(i);
        }
        Self { headers, index }
    }

    #[must_use]
    pub fn headers(&self) -> &[ColumnHeader] {
        &self.headers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Ordinal of a column, matched case-insensitively.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        if let Some(&idx) = self.index.get(name) {
            return Some(idx);
        }
        self.index.get(&name.to_lowercase()).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|h| h.name.as_str())
    }
}

/// One row of a result. Immutable once produced; mapping only reads from it.
#[derive(Debug, Clone)]
pub struct Record {
    columns: Arc<ResultColumns>,
    values: Vec<RowValues>,
}

impl Record {
    #[must_use]
    pub fn new(columns: Arc<ResultColumns>, values: Vec<RowValues>) -> Self {
        Self { columns, values }
    }

    #[must_use]
    pub fn columns(&self) -> &Arc<ResultColumns> {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[RowValues] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value from the row by column name (case-insensitive).
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.columns
            .position(column_name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Get a value from the row by column ordinal.
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.values.get(index)
    }

    pub fn into_values(self) -> Vec<RowValues> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let columns = Arc::new(ResultColumns::new(vec![
            ColumnHeader::new("Id", SqlType::Int),
            ColumnHeader::new("DisplayName", SqlType::Text),
            ColumnHeader::new("id", SqlType::Int),
        ]));
        let record = Record::new(
            Arc::clone(&columns),
            vec![
                RowValues::Int(7),
                RowValues::Text("seven".into()),
                RowValues::Int(8),
            ],
        );
        assert_eq!(record.get("ID"), Some(&RowValues::Int(7)));
        assert_eq!(record.get("displayname").and_then(RowValues::as_text), Some("seven"));
        assert_eq!(record.get_by_index(2), Some(&RowValues::Int(8)));
        assert!(record.get("missing").is_none());
        assert_eq!(columns.names().collect::<Vec<_>>(), ["Id", "DisplayName", "id"]);
    }
}
