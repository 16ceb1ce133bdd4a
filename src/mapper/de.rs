use serde::de::{self, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;

use crate::convert::{DeError, ValueDeserializer, ZeroValueDeserializer};
use crate::results::Record;

use super::MapMode;

/// serde `Deserializer` over one record.
///
/// Structs are matched against the record per [`MapMode`]; maps see every column by name and
/// sequences/tuples see the values in column order.
pub(crate) struct RecordDeserializer<'r> {
    record: &'r Record,
    mode: MapMode,
}

impl<'r> RecordDeserializer<'r> {
    pub(crate) fn new(record: &'r Record, mode: MapMode) -> Self {
        Self { record, mode }
    }
}

impl<'de> de::Deserializer<'de> for RecordDeserializer<'_> {
    type Error = DeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.mode {
            MapMode::ByPosition => self.deserialize_seq(visitor),
            MapMode::ByName { .. } => visitor.visit_map(ColumnMap {
                record: self.record,
                next: 0,
            }),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DeError> {
        match self.mode {
            MapMode::ByPosition => self.deserialize_seq(visitor),
            MapMode::ByName { strict } => visitor.visit_map(FieldMap {
                record: self.record,
                fields,
                strict,
                next: 0,
                pending: None,
            }),
        }
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_seq(Ordinals {
            record: self.record,
            next: 0,
        })
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, DeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        visitor.visit_newtype_struct(self)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct map enum identifier ignored_any
    }
}

/// Struct members looked up by name, ignoring case. Extra columns are never visited.
struct FieldMap<'r> {
    record: &'r Record,
    fields: &'static [&'static str],
    strict: bool,
    next: usize,
    pending: Option<Pending<'r>>,
}

enum Pending<'r> {
    Column(&'r crate::types::RowValues),
    Zero,
}

impl<'de> MapAccess<'de> for FieldMap<'_> {
    type Error = DeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, DeError> {
        while let Some(&field) = self.fields.get(self.next) {
            self.next += 1;
            let pending = match self.record.get(field) {
                Some(value) => Pending::Column(value),
                // Strict mode leaves the member out so serde reports it as missing unless it is
                // optional or defaulted.
                None if self.strict => continue,
                None => Pending::Zero,
            };
            self.pending = Some(pending);
            return seed.deserialize(field.into_deserializer()).map(Some);
        }
        Ok(None)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, DeError> {
        match self.pending.take() {
            Some(Pending::Column(value)) => seed.deserialize(ValueDeserializer::new(value)),
            Some(Pending::Zero) => seed.deserialize(ZeroValueDeserializer),
            None => Err(de::Error::custom("value requested before its key")),
        }
    }
}

/// Every column as a `name => value` entry.
struct ColumnMap<'r> {
    record: &'r Record,
    next: usize,
}

impl<'de> MapAccess<'de> for ColumnMap<'_> {
    type Error = DeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, DeError> {
        match self.record.columns().headers().get(self.next) {
            Some(header) => seed
                .deserialize(header.name.as_str().into_deserializer())
                .map(Some),
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, DeError> {
        let value = self
            .record
            .get_by_index(self.next)
            .ok_or_else(|| <DeError as de::Error>::custom("record is shorter than its headers"))?;
        self.next += 1;
        seed.deserialize(ValueDeserializer::new(value))
    }
}

/// Values by ordinal. Columns beyond what the target reads are ignored.
struct Ordinals<'r> {
    record: &'r Record,
    next: usize,
}

impl<'de> SeqAccess<'de> for Ordinals<'_> {
    type Error = DeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, DeError> {
        match self.record.get_by_index(self.next) {
            Some(value) => {
                self.next += 1;
                seed.deserialize(ValueDeserializer::new(value)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.record.len().saturating_sub(self.next))
    }
}
