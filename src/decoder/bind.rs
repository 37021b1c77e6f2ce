//! Serde binding of string cells.
//!
//! Every cell is text. `CellDeserializer` parses it into whatever the target
//! field asks for (integers, floats, bools, chars, unit enum variants, and
//! `Option` with an empty cell meaning `None`); anything that asks for
//! `deserialize_any` gets the raw string.

use serde::de::value::{Error as BindError, MapDeserializer, StrDeserializer};
use serde::de::{DeserializeOwned, Deserializer, Error as _, IntoDeserializer, Visitor};
use serde::forward_to_deserialize_any;

/// Parse the boolean spellings a bulk result uses.
pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CellDeserializer<'a> {
    value: &'a str,
}

impl<'a> CellDeserializer<'a> {
    pub(crate) const fn new(value: &'a str) -> Self {
        Self { value }
    }
}

macro_rules! deserialize_parsed {
    ($($method:ident => $visit:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
                let parsed = self.value.trim().parse::<$ty>().map_err(|e| {
                    BindError::custom(format!("invalid {} '{}': {}", stringify!($ty), self.value, e))
                })?;
                visitor.$visit(parsed)
            }
        )*
    };
}

impl<'de, 'a> Deserializer<'de> for CellDeserializer<'a> {
    type Error = BindError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_str(self.value)
    }

    deserialize_parsed! {
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        match parse_bool(self.value) {
            Some(b) => visitor.visit_bool(b),
            None => Err(BindError::custom(format!("invalid bool '{}'", self.value))),
        }
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        let mut chars = self.value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => Err(BindError::custom(format!("invalid char '{}'", self.value))),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_str(self.value)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_string(self.value.to_string())
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        if self.value.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, BindError> {
        if self.value.is_empty() {
            visitor.visit_unit()
        } else {
            Err(BindError::custom(format!("expected empty cell, got '{}'", self.value)))
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V) -> Result<V::Value, BindError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, BindError> {
        let variant: StrDeserializer<'_, BindError> = self.value.into_deserializer();
        visitor.visit_enum(variant)
    }

    forward_to_deserialize_any! {
        bytes byte_buf unit_struct seq tuple tuple_struct map struct identifier ignored_any
    }
}

impl<'de, 'a> IntoDeserializer<'de, BindError> for CellDeserializer<'a> {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

/// Bind heading/value pairs into `T` as if they were a map.
pub(crate) fn bind_pairs<'a, T, I>(pairs: I) -> Result<T, BindError>
where
    T: DeserializeOwned,
    I: Iterator<Item = (&'a str, &'a str)>,
{
    let map = MapDeserializer::<_, BindError>::new(pairs.map(|(heading, value)| (heading, CellDeserializer::new(value))));
    T::deserialize(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "lowercase")]
    enum Stage {
        Open,
        Closed,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Opportunity {
        #[serde(rename = "Id")]
        id: String,
        #[serde(rename = "Amount")]
        amount: f64,
        #[serde(rename = "Quantity")]
        quantity: Option<u32>,
        #[serde(rename = "IsWon")]
        is_won: bool,
        #[serde(rename = "Stage")]
        stage: Stage,
    }

    #[test]
    fn binds_typed_fields() {
        let pairs = [
            ("Id", "006A"),
            ("Amount", "1250.5"),
            ("Quantity", ""),
            ("IsWon", "true"),
            ("Stage", "closed"),
            ("Extra", "ignored"),
        ];
        let opp: Opportunity = bind_pairs(pairs.into_iter()).unwrap();
        assert_eq!(
            opp,
            Opportunity {
                id: "006A".to_string(),
                amount: 1250.5,
                quantity: None,
                is_won: true,
                stage: Stage::Closed,
            }
        );
    }

    #[test]
    fn reports_conversion_failures() {
        let pairs = [("Id", "1"), ("Amount", "lots"), ("Quantity", "1"), ("IsWon", "0"), ("Stage", "open")];
        let err = bind_pairs::<Opportunity, _>(pairs.into_iter()).unwrap_err();
        assert!(err.to_string().contains("invalid f64 'lots'"));

        let pairs = [("Id", "1"), ("Amount", "1"), ("Quantity", "1"), ("IsWon", "maybe"), ("Stage", "open")];
        let err = bind_pairs::<Opportunity, _>(pairs.into_iter()).unwrap_err();
        assert!(err.to_string().contains("invalid bool 'maybe'"));
    }

    #[test]
    fn missing_field_is_an_error() {
        let err = bind_pairs::<Opportunity, _>([("Id", "1")].into_iter()).unwrap_err();
        assert!(err.to_string().contains("missing field"));
    }

    #[test]
    fn binds_open_maps() {
        let row: HashMap<String, String> = bind_pairs([("a", "1"), ("b", "")].into_iter()).unwrap();
        assert_eq!(row["a"], "1");
        assert_eq!(row["b"], "");
    }
}
