//! Conversions between wire values and typed Rust values.
//!
//! Date/time values are rendered and parsed in ISO 8601 form only, so a value read back through
//! the mapper is independent of the server session's language or date format.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::de::{self, IntoDeserializer, Visitor};
use serde::{Deserializer, forward_to_deserialize_any};

use crate::error::SqlConduitError;
use crate::types::RowValues;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Render a timestamp in the ISO 8601 form chrono's own `FromStr` accepts.
#[must_use]
pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse `YYYY-MM-DD[T| ]HH:MM:SS[.fff]`; anything else is rejected.
#[must_use]
pub fn parse_iso_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Error raised while projecting values into Rust types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeError(String);

impl fmt::Display for DeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DeError {}

impl de::Error for DeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        DeError(msg.to_string())
    }
}

impl From<DeError> for SqlConduitError {
    fn from(err: DeError) -> Self {
        SqlConduitError::MappingError(err.0)
    }
}

/// Deserialize a single [`RowValues`] into any `T: Deserialize`.
///
/// # Errors
/// Returns `SqlConduitError::MappingError` when the value cannot be represented as `T`.
pub fn from_value<T: de::DeserializeOwned>(value: &RowValues) -> Result<T, SqlConduitError> {
    T::deserialize(ValueDeserializer::new(value)).map_err(SqlConduitError::from)
}

/// serde `Deserializer` over one borrowed value.
#[derive(Debug, Clone, Copy)]
pub struct ValueDeserializer<'v> {
    value: &'v RowValues,
}

impl<'v> ValueDeserializer<'v> {
    #[must_use]
    pub fn new(value: &'v RowValues) -> Self {
        Self { value }
    }
}

impl<'de> de::Deserializer<'de> for ValueDeserializer<'_> {
    type Error = DeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.value {
            RowValues::Int(i) => visitor.visit_i64(*i),
            RowValues::Float(f) => visitor.visit_f64(*f),
            RowValues::Text(s) => visitor.visit_str(s),
            RowValues::Bool(b) => visitor.visit_bool(*b),
            RowValues::Timestamp(ts) => visitor.visit_string(format_timestamp(ts)),
            RowValues::Date(d) => visitor.visit_string(d.format("%Y-%m-%d").to_string()),
            RowValues::Time(t) => visitor.visit_string(t.format("%H:%M:%S%.f").to_string()),
            RowValues::TimestampTz(ts) => visitor.visit_string(ts.to_rfc3339()),
            RowValues::Guid(id) => visitor.visit_string(id.to_string()),
            RowValues::Null => visitor.visit_none(),
            RowValues::JSON(json) => json
                .clone()
                .deserialize_any(visitor)
                .map_err(<DeError as de::Error>::custom),
            RowValues::Blob(bytes) => visitor.visit_bytes(bytes),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        if self.value.is_null() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.value.as_bool() {
            Some(b) => visitor.visit_bool(*b),
            None => self.deserialize_any(visitor),
        }
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.value.as_float() {
            Some(f) => visitor.visit_f64(f),
            None => self.deserialize_any(visitor),
        }
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        self.deserialize_f64(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DeError> {
        match self.value {
            RowValues::Text(s) => visitor.visit_enum(s.as_str().into_deserializer()),
            RowValues::JSON(json) => json
                .clone()
                .deserialize_any(visitor)
                .map_err(<DeError as de::Error>::custom),
            other => Err(<DeError as de::Error>::custom(format!(
                "cannot read an enum from {other:?}"
            ))),
        }
    }

    forward_to_deserialize_any! {
        i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map struct
        identifier ignored_any
    }
}

/// Stands in for a member that has no matching column when mapping laxly: every primitive reads
/// as its zero value and optional members read as `None`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ZeroValueDeserializer;

impl<'de> de::Deserializer<'de> for ZeroValueDeserializer {
    type Error = DeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_unit()
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_none()
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_bool(false)
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_i64(0)
    }

    fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_i64(0)
    }

    fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_i64(0)
    }

    fn deserialize_i64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_i64(0)
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_u64(0)
    }

    fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_u64(0)
    }

    fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_u64(0)
    }

    fn deserialize_u64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_u64(0)
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_f64(0.0)
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_f64(0.0)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_str("")
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_str("")
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_bytes(&[])
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_bytes(&[])
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_seq(de::value::SeqDeserializer::new(std::iter::empty::<()>()))
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        visitor.visit_newtype_struct(self)
    }

    forward_to_deserialize_any! {
        i128 u128 char unit unit_struct tuple tuple_struct map struct enum
        identifier ignored_any
    }
}

pub(crate) fn parse_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f").ok()
}

pub(crate) fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, FixedOffset};
    use uuid::Uuid;

    #[test]
    fn timestamps_round_trip_through_serde() {
        let ts = NaiveDate::from_ymd_opt(2023, 12, 31)
            .and_then(|d| d.and_hms_milli_opt(23, 59, 58, 125))
            .expect("valid timestamp");
        let back: NaiveDateTime = from_value(&RowValues::Timestamp(ts)).expect("timestamp");
        assert_eq!(back, ts);

        let date = NaiveDate::from_ymd_opt(2001, 2, 3).expect("valid date");
        let back: NaiveDate = from_value(&RowValues::Date(date)).expect("date");
        assert_eq!(back, date);

        let tz: DateTime<FixedOffset> =
            DateTime::parse_from_rfc3339("2020-06-01T10:00:00+02:00").expect("rfc3339");
        let back: DateTime<FixedOffset> = from_value(&RowValues::TimestampTz(tz)).expect("tz");
        assert_eq!(back, tz);
    }

    #[test]
    fn nulls_and_numbers() {
        let none: Option<i32> = from_value(&RowValues::Null).expect("null option");
        assert_eq!(none, None);
        let widened: f64 = from_value(&RowValues::Int(3)).expect("int as float");
        assert!((widened - 3.0).abs() < f64::EPSILON);
        let narrowed: i16 = from_value(&RowValues::Int(12)).expect("small int");
        assert_eq!(narrowed, 12);
        let overflow = from_value::<u8>(&RowValues::Int(300));
        assert!(matches!(overflow, Err(SqlConduitError::MappingError(_))));
        let missing = from_value::<i64>(&RowValues::Null);
        assert!(matches!(missing, Err(SqlConduitError::MappingError(_))));
    }

    #[test]
    fn guids_and_bits() {
        let id = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
        let back: Uuid = from_value(&RowValues::Guid(id)).expect("guid");
        assert_eq!(back, id);
        let flag: bool = from_value(&RowValues::Int(1)).expect("bit as int");
        assert!(flag);
    }

    #[test]
    fn iso_helpers() {
        assert!(parse_iso_timestamp(" 2024-01-02T03:04:05 ").is_some());
        assert!(parse_iso_timestamp("01/02/2024 03:04").is_none());
        assert_eq!(
            parse_time("10:11:12.5").map(|t| t.to_string()),
            Some("10:11:12.500".to_string())
        );
        assert!(parse_date("2024-13-01").is_none());
    }
}
