//! Runtime target shapes.
//!
//! For callers that only know the element shape at runtime. Only
//! `Shape::Sequence` is a valid decode target; its element describes one row.

use serde_json::{Map, Number, Value};

use super::bind::parse_bool;
use super::DecodedRecord;

/// Scalar type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Float,
    Boolean,
}

impl FieldType {
    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
        }
    }

    fn coerce(self, raw: &str) -> Result<Value, String> {
        match self {
            Self::String => Ok(Value::String(raw.to_string())),
            Self::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("invalid int '{raw}': {e}")),
            Self::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("invalid float '{raw}'")),
            Self::Boolean => parse_bool(raw)
                .map(Value::Bool)
                .ok_or_else(|| format!("invalid boolean '{raw}'")),
        }
    }
}

/// A named, typed field of a record shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    /// Empty or missing cells bind to `null` instead of failing.
    pub optional: bool,
}

impl Field {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: true,
        }
    }
}

/// Shape a decode result is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// Homogeneous sequence; the only valid decode target.
    Sequence(Box<Shape>),
    /// Record with typed fields. Columns without a field are ignored.
    Record(Vec<Field>),
    /// Open record: every column as a string.
    Map,
    Scalar(FieldType),
}

impl Shape {
    /// Sequence of `element`.
    #[must_use]
    pub fn sequence_of(element: Self) -> Self {
        Self::Sequence(Box::new(element))
    }

    pub(crate) fn bind(&self, record: &DecodedRecord) -> Result<Value, String> {
        match self {
            Self::Map => Ok(record.to_json()),
            Self::Record(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for field in fields {
                    let value = match record.get(&field.name) {
                        Some(raw) if raw.is_empty() && field.optional => Value::Null,
                        Some(raw) => field.ty.coerce(raw).map_err(|e| format!("field '{}': {e}", field.name))?,
                        None if field.optional => Value::Null,
                        None => return Err(format!("no column for field '{}'", field.name)),
                    };
                    out.insert(field.name.clone(), value);
                }
                Ok(Value::Object(out))
            }
            Self::Sequence(_) | Self::Scalar(_) => Err(format!("a row cannot be bound to {self}")),
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequence(element) => write!(f, "{element}[]"),
            Self::Record(fields) => {
                f.write_str("record {")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    let marker = if field.optional { "?" } else { "" };
                    write!(f, " {}{marker}: {}", field.name, field.ty.name())?;
                }
                f.write_str(" }")
            }
            Self::Map => f.write_str("map<string>"),
            Self::Scalar(ty) => f.write_str(ty.name()),
        }
    }
}
