//! Projection of records into caller-defined types.
//!
//! The automatic modes go through serde, so any `#[derive(Deserialize)]` type works:
//! ```rust
//! use std::sync::Arc;
//!
//! use serde::Deserialize;
//! use sql_conduit::prelude::*;
//!
//! #[derive(Deserialize)]
//! struct Order {
//!     id: i64,
//!     customer: String,
//!     note: Option<String>,
//! }
//!
//! let columns = Arc::new(ResultColumns::new(vec![
//!     ColumnHeader::new("ID", SqlType::Int),
//!     ColumnHeader::new("Customer", SqlType::Text),
//!     ColumnHeader::new("Region", SqlType::Text),
//! ]));
//! let record = Record::new(
//!     columns,
//!     vec![RowValues::Int(7), "acme".into(), "west".into()],
//! );
//! let order: Order = map_record(&record, MapMode::STRICT).unwrap();
//! assert_eq!(order.id, 7);
//! assert_eq!(order.note, None);
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::SqlConduitError;
use crate::results::{Record, ResultColumns};

mod de;

use de::RecordDeserializer;

/// How record columns are matched to the members of the target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    /// Match column names to member names, ignoring case. Columns without a member are ignored.
    /// A member without a column fails the mapping when `strict`, otherwise it takes its zero
    /// value (`0`, `false`, `""`, `None`).
    ByName { strict: bool },
    /// Match purely by ordinal: the n-th member takes the n-th column.
    ByPosition,
}

impl MapMode {
    pub const STRICT: MapMode = MapMode::ByName { strict: true };
    pub const LAX: MapMode = MapMode::ByName { strict: false };
}

impl Default for MapMode {
    fn default() -> Self {
        MapMode::STRICT
    }
}

/// Map one record into `T`. The record itself is left untouched.
///
/// # Errors
/// Returns `SqlConduitError::MappingError` when a required member has no column (strict mode),
/// or when a value cannot be represented as its member's type.
pub fn map_record<T: DeserializeOwned>(
    record: &Record,
    mode: MapMode,
) -> Result<T, SqlConduitError> {
    T::deserialize(RecordDeserializer::new(record, mode)).map_err(SqlConduitError::from)
}

/// Caller-supplied mapping with full control over decoding; bypasses automatic matching.
#[async_trait]
pub trait RowMapper<T>: Send + Sync {
    async fn map_row(
        &self,
        record: &Record,
        columns: &ResultColumns,
        ct: &CancellationToken,
    ) -> Result<T, SqlConduitError>;
}

/// Adapts a synchronous closure into a [`RowMapper`].
pub struct FnMapper<F>(pub F);

#[async_trait]
impl<T, F> RowMapper<T> for FnMapper<F>
where
    T: Send + 'static,
    F: Fn(&Record, &ResultColumns) -> Result<T, SqlConduitError> + Send + Sync,
{
    async fn map_row(
        &self,
        record: &Record,
        columns: &ResultColumns,
        _ct: &CancellationToken,
    ) -> Result<T, SqlConduitError> {
        (self.0)(record, columns)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use serde::Deserialize;

    use super::*;
    use crate::results::ColumnHeader;
    use crate::types::{RowValues, SqlType};

    fn record() -> Record {
        let columns = Arc::new(ResultColumns::new(vec![
            ColumnHeader::new("OrderId", SqlType::Int),
            ColumnHeader::new("placed_on", SqlType::Date),
            ColumnHeader::new("Total", SqlType::Float),
            ColumnHeader::new("audit_user", SqlType::Text),
        ]));
        Record::new(
            columns,
            vec![
                RowValues::Int(12),
                RowValues::Date(NaiveDate::from_ymd_opt(2024, 3, 9).expect("date")),
                RowValues::Float(99.5),
                RowValues::Null,
            ],
        )
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        orderid: i64,
        #[serde(rename = "PLACED_ON")]
        placed: NaiveDate,
        total: f64,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct WithMissing {
        orderid: i64,
        discount: f64,
        comment: String,
        shipped: bool,
    }

    #[test]
    fn by_name_ignores_case_and_extra_columns() {
        let order: Order = map_record(&record(), MapMode::STRICT).expect("mapped");
        assert_eq!(order.orderid, 12);
        assert_eq!(order.placed, NaiveDate::from_ymd_opt(2024, 3, 9).expect("date"));
        assert!((order.total - 99.5).abs() < f64::EPSILON);
    }

    #[test]
    fn strict_fails_on_missing_member_and_lax_zero_fills() {
        let err = map_record::<WithMissing>(&record(), MapMode::STRICT).unwrap_err();
        assert!(matches!(err, SqlConduitError::MappingError(ref m) if m.contains("discount")));

        let lax: WithMissing = map_record(&record(), MapMode::LAX).expect("lax");
        assert_eq!(
            lax,
            WithMissing {
                orderid: 12,
                discount: 0.0,
                comment: String::new(),
                shipped: false,
            }
        );
    }

    #[test]
    fn by_position_and_map_targets() {
        let (id, placed): (i64, NaiveDate) =
            map_record(&record(), MapMode::ByPosition).expect("tuple");
        assert_eq!(id, 12);
        assert_eq!(placed.to_string(), "2024-03-09");

        #[derive(Deserialize)]
        struct Renamed {
            a: i64,
            b: String,
        }
        let renamed: Renamed = map_record(&record(), MapMode::ByPosition).expect("positional");
        assert_eq!(renamed.a, 12);
        assert_eq!(renamed.b, "2024-03-09");

        let all: HashMap<String, serde_json::Value> =
            map_record(&record(), MapMode::STRICT).expect("map");
        assert_eq!(all.len(), 4);
        assert_eq!(all["OrderId"], serde_json::json!(12));
        assert_eq!(all["audit_user"], serde_json::Value::Null);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn custom_mapper_gets_record_and_headers() {
        let mapper = FnMapper(|record: &Record, columns: &ResultColumns| {
            Ok::<_, SqlConduitError>(format!("{}:{}", columns.len(), record.values().len()))
        });
        let rec = record();
        let out = mapper
            .map_row(&rec, rec.columns(), &CancellationToken::new())
            .await
            .expect("custom");
        assert_eq!(out, "4:4");
        assert_eq!(rec.get("orderid"), Some(&RowValues::Int(12)));
    }
}
