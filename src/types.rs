use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::convert;

/// Values that can be stored in a database row or used as query parameters.
///
/// The same enum is shared by every driver binding so record handling never has to branch on
/// wire types:
/// ```rust
/// use sql_conduit::prelude::*;
///
/// let params = vec![
///     RowValues::Int(1),
///     RowValues::Text("alice".into()),
///     RowValues::Bool(true),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp without offset
    Timestamp(NaiveDateTime),
    /// Calendar date
    Date(NaiveDate),
    /// Time of day
    Time(NaiveTime),
    /// Timestamp with a fixed UTC offset
    TimestampTz(DateTime<FixedOffset>),
    /// Globally unique identifier
    Guid(Uuid),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<&bool> {
        if let RowValues::Bool(value) = self {
            return Some(value);
        } else if let Some(i) = self.as_int() {
            if *i == 1 {
                return Some(&true);
            } else if *i == 0 {
                return Some(&false);
            }
        }
        None
    }

    /// Timestamp view of the value. Text is accepted only in ISO 8601 shapes, so the result
    /// never depends on the server's language or date format settings.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            RowValues::Timestamp(value) => Some(*value),
            RowValues::Date(date) => date.and_hms_opt(0, 0, 0),
            RowValues::TimestampTz(value) => Some(value.naive_local()),
            RowValues::Text(s) => convert::parse_iso_timestamp(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            RowValues::Date(date) => Some(*date),
            RowValues::Timestamp(value) => Some(value.date()),
            RowValues::Text(s) => convert::parse_date(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            RowValues::Time(time) => Some(*time),
            RowValues::Timestamp(value) => Some(value.time()),
            RowValues::Text(s) => convert::parse_time(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            RowValues::Float(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            RowValues::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            RowValues::Guid(id) => Some(*id),
            RowValues::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    /// The declared type this value binds as when no explicit type is given.
    #[must_use]
    pub fn natural_type(&self) -> SqlType {
        match self {
            RowValues::Int(_) => SqlType::Int,
            RowValues::Float(_) => SqlType::Float,
            RowValues::Text(_) | RowValues::Null => SqlType::Text,
            RowValues::Bool(_) => SqlType::Bool,
            RowValues::Timestamp(_) => SqlType::Timestamp,
            RowValues::Date(_) => SqlType::Date,
            RowValues::Time(_) => SqlType::Time,
            RowValues::TimestampTz(_) => SqlType::TimestampTz,
            RowValues::Guid(_) => SqlType::Guid,
            RowValues::JSON(_) => SqlType::Json,
            RowValues::Blob(_) => SqlType::Binary,
        }
    }
}

macro_rules! row_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RowValues {
                fn from(value: $ty) -> Self {
                    RowValues::$variant(value.into())
                }
            }
        )*
    };
}

row_value_from!(
    i64 => Int,
    i32 => Int,
    i16 => Int,
    u8 => Int,
    f64 => Float,
    f32 => Float,
    String => Text,
    &str => Text,
    bool => Bool,
    NaiveDateTime => Timestamp,
    NaiveDate => Date,
    NaiveTime => Time,
    DateTime<FixedOffset> => TimestampTz,
    Uuid => Guid,
    JsonValue => JSON,
    Vec<u8> => Blob,
);

impl<T: Into<RowValues>> From<Option<T>> for RowValues {
    fn from(value: Option<T>) -> Self {
        value.map_or(RowValues::Null, Into::into)
    }
}

/// Declared type of a column or parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Int,
    Float,
    Decimal,
    Text,
    Bool,
    Timestamp,
    Date,
    Time,
    TimestampTz,
    Guid,
    Json,
    Binary,
    /// A wire type with no dedicated mapping; carries the driver's own name for it.
    Other(String),
}

impl SqlType {
    /// T-SQL type name used when a variable of this type has to be declared.
    #[must_use]
    pub fn declaration(&self) -> &str {
        match self {
            SqlType::Int => "BIGINT",
            SqlType::Float => "FLOAT",
            SqlType::Decimal => "DECIMAL(38, 10)",
            SqlType::Text | SqlType::Json | SqlType::Other(_) => "NVARCHAR(MAX)",
            SqlType::Bool => "BIT",
            SqlType::Timestamp => "DATETIME2",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::TimestampTz => "DATETIMEOFFSET",
            SqlType::Guid => "UNIQUEIDENTIFIER",
            SqlType::Binary => "VARBINARY(MAX)",
        }
    }
}

/// Transaction isolation levels understood by [`crate::client::SqlClient::begin_transaction`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    /// Server default; a pooled connection is always returned at this level.
    #[default]
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Observable connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Direction of a procedure parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ParamDirection {
    #[default]
    Input,
    /// Value materializes after the statement completes.
    Output,
    InputOutput,
}

impl ParamDirection {
    #[must_use]
    pub fn is_output(self) -> bool {
        matches!(self, ParamDirection::Output | ParamDirection::InputOutput)
    }
}
