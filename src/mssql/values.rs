use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use tiberius::{Column, ColumnData, ColumnType, FromSql};

use crate::error::SqlConduitError;
use crate::results::ColumnHeader;
use crate::types::{RowValues, SqlType};

pub(crate) fn header(column: &Column) -> ColumnHeader {
    ColumnHeader::new(column.name(), sql_type(column.column_type()))
}

fn sql_type(column_type: ColumnType) -> SqlType {
    match column_type {
        ColumnType::Bit | ColumnType::Bitn => SqlType::Bool,
        ColumnType::Int1
        | ColumnType::Int2
        | ColumnType::Int4
        | ColumnType::Int8
        | ColumnType::Intn => SqlType::Int,
        ColumnType::Float4 | ColumnType::Float8 | ColumnType::Floatn => SqlType::Float,
        ColumnType::Money | ColumnType::Money4 | ColumnType::Decimaln | ColumnType::Numericn => {
            SqlType::Decimal
        }
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2 => SqlType::Timestamp,
        ColumnType::Daten => SqlType::Date,
        ColumnType::Timen => SqlType::Time,
        ColumnType::DatetimeOffsetn => SqlType::TimestampTz,
        ColumnType::Guid => SqlType::Guid,
        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => SqlType::Binary,
        ColumnType::BigVarChar
        | ColumnType::BigChar
        | ColumnType::NVarchar
        | ColumnType::NChar
        | ColumnType::Text
        | ColumnType::NText
        | ColumnType::Xml => SqlType::Text,
        other => SqlType::Other(format!("{other:?}")),
    }
}

/// Decode one wire value. Dates and times are read from their binary encoding, never from text.
pub(crate) fn row_value(data: ColumnData<'static>) -> Result<RowValues, SqlConduitError> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I64(v) => v.map(RowValues::Int),
        ColumnData::F32(v) => v.map(|v| RowValues::Float(f64::from(v))),
        ColumnData::F64(v) => v.map(RowValues::Float),
        ColumnData::Bit(v) => v.map(RowValues::Bool),
        ColumnData::String(v) => v.map(|s| RowValues::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(RowValues::Guid),
        ColumnData::Binary(v) => v.map(|b| RowValues::Blob(b.into_owned())),
        ColumnData::Numeric(v) => v.map(|n| RowValues::Float(f64::from(n))),
        ColumnData::Xml(v) => v.map(|x| RowValues::Text(x.into_owned().into_string())),
        ref temporal @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => {
            NaiveDateTime::from_sql(temporal)?.map(RowValues::Timestamp)
        }
        ref date @ ColumnData::Date(_) => NaiveDate::from_sql(date)?.map(RowValues::Date),
        ref time @ ColumnData::Time(_) => NaiveTime::from_sql(time)?.map(RowValues::Time),
        ref offset @ ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(offset)?.map(RowValues::TimestampTz)
        }
    };
    Ok(value.unwrap_or(RowValues::Null))
}
