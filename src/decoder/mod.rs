//! Bulk result decoder.
//!
//! Turns delimited text whose first row holds the column headings into typed
//! records. Each data row becomes a `DecodedRecord` (heading -> cell text) and
//! is then bound to the caller's element type, either statically through serde
//! (`decode`) or against a runtime `Shape` (`decode_shaped`).
//!
//! Decoding is all-or-nothing: the first malformed row, arity mismatch or
//! conversion failure fails the whole call.

mod bind;
mod csv;
/// Runtime target shapes.
pub mod shape;

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::DecodeError;

pub use shape::{Field, FieldType, Shape};

/// Decoding knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Treat the last data row as a trailer and leave it out.
    ///
    /// Off by default: every data row is decoded. Turn on for producers that
    /// append a trailer row after the data.
    pub skip_trailer: bool,
}

impl DecodeOptions {
    /// Options that drop the final data row.
    #[must_use]
    pub const fn with_trailer() -> Self {
        Self { skip_trailer: true }
    }
}

/// One data row keyed by heading, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    row: usize,
    fields: Vec<(String, String)>,
}

impl DecodedRecord {
    pub(crate) fn new(row: usize, fields: Vec<(String, String)>) -> Self {
        Self { row, fields }
    }

    /// 1-based data row number (the heading row is row 0).
    #[must_use]
    pub const fn row(&self) -> usize {
        self.row
    }

    #[must_use]
    pub fn get(&self, heading: &str) -> Option<&str> {
        self.fields.iter().find(|(h, _)| h == heading).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(h, v)| (h.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Structured intermediate form: a JSON object of string values.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(h, v)| (h.clone(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }

    /// Bind this row to `T`, converting cell text as the fields require.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        bind::bind_pairs(self.iter()).map_err(|e| DecodeError::Conversion {
            row: self.row,
            message: e.to_string(),
        })
    }
}

/// Split `text` into heading-keyed records.
pub fn records(text: &str, options: DecodeOptions) -> Result<Vec<DecodedRecord>, DecodeError> {
    let rows = csv::parse_rows(text)?;
    let Some((headings, data)) = rows.split_first() else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::with_capacity(headings.fields.len());
    for heading in &headings.fields {
        if !seen.insert(heading.as_str()) {
            return Err(DecodeError::DuplicateHeading {
                heading: heading.clone(),
            });
        }
    }

    let keep = if options.skip_trailer {
        data.len().saturating_sub(1)
    } else {
        data.len()
    };

    data[..keep]
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let row_number = idx + 1;
            if row.fields.len() != headings.fields.len() {
                return Err(DecodeError::ArityMismatch {
                    row: row_number,
                    headings: headings.fields.len(),
                    values: row.fields.len(),
                });
            }
            let fields = headings.fields.iter().cloned().zip(row.fields.iter().cloned()).collect();
            Ok(DecodedRecord::new(row_number, fields))
        })
        .collect()
}

/// Decode every data row of `text` into `T`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, DecodeError> {
    decode_with(text, DecodeOptions::default())
}

/// Decode with explicit options.
pub fn decode_with<T: DeserializeOwned>(text: &str, options: DecodeOptions) -> Result<Vec<T>, DecodeError> {
    records(text, options)?.iter().map(DecodedRecord::bind::<T>).collect()
}

/// Decode against a runtime shape, which must be a `Shape::Sequence`.
pub fn decode_shaped(text: &str, shape: &Shape, options: DecodeOptions) -> Result<Vec<Value>, DecodeError> {
    let Shape::Sequence(element) = shape else {
        return Err(DecodeError::UnsupportedShape {
            shape: shape.to_string(),
        });
    };

    records(text, options)?
        .iter()
        .map(|record| {
            element.bind(record).map_err(|message| DecodeError::Conversion {
                row: record.row(),
                message,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;
    use serde_json::json;

    const PEOPLE: &str = "id,name\n1,Alice\n2,Bob\n3,Carol\n";

    #[derive(Debug, Deserialize, PartialEq)]
    struct Person {
        id: i64,
        name: String,
    }

    fn person(id: i64, name: &str) -> Person {
        Person {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn decodes_every_data_row_by_default() {
        let people: Vec<Person> = decode(PEOPLE).unwrap();
        assert_eq!(people, vec![person(1, "Alice"), person(2, "Bob"), person(3, "Carol")]);
    }

    #[test]
    fn trailer_option_drops_last_row() {
        let people: Vec<Person> = decode_with(PEOPLE, DecodeOptions::with_trailer()).unwrap();
        assert_eq!(people, vec![person(1, "Alice"), person(2, "Bob")]);
    }

    #[test]
    fn row_counts_for_n_rows() {
        for data_rows in 1..6usize {
            let mut text = String::from("k,v\n");
            for i in 0..data_rows {
                text.push_str(&format!("{i},x{i}\n"));
            }
            let total_rows = data_rows + 1;
            assert_eq!(records(&text, DecodeOptions::default()).unwrap().len(), total_rows - 1);
            let trimmed = records(&text, DecodeOptions::with_trailer()).unwrap();
            assert_eq!(trimmed.len(), total_rows - 2);
            assert!(trimmed.iter().all(|r| !r.is_empty()));
        }
    }

    #[test]
    fn heading_only_and_empty_input() {
        assert!(decode::<Person>("id,name\n").unwrap().is_empty());
        assert!(decode::<Person>("").unwrap().is_empty());
        assert!(decode_with::<Person>("id,name\n", DecodeOptions::with_trailer()).unwrap().is_empty());
    }

    #[test]
    fn arity_mismatch_rejects_whole_decode() {
        let err = decode::<Person>("id,name\n1,Alice\n2,Bob,extra\n").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ArityMismatch {
                row: 2,
                headings: 2,
                values: 3
            }
        ));

        let err = records("id,name\n1\n", DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::ArityMismatch { row: 1, values: 1, .. }));
    }

    #[test]
    fn blank_line_in_single_column_keeps_empty_value() {
        let rows = records("Email\na@x.com\n\nb@x.com\n", DecodeOptions::default()).unwrap();
        let emails: Vec<Option<&str>> = rows.iter().map(|r| r.get("Email")).collect();
        assert_eq!(emails, vec![Some("a@x.com"), Some(""), Some("b@x.com")]);
        assert_eq!(rows[1].row(), 2);
    }

    #[test]
    fn blank_line_in_multi_column_is_arity_mismatch() {
        let err = records("id,name\n1,A\n\n2,B\n", DecodeOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ArityMismatch {
                row: 2,
                headings: 2,
                values: 1
            }
        ));
    }

    #[test]
    fn duplicate_headings_rejected() {
        let err = records("id,id\n1,2\n", DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::DuplicateHeading { ref heading } if heading == "id"));
    }

    #[test]
    fn conversion_error_names_row() {
        let err = decode::<Person>("id,name\n1,Alice\nx,Bob\n").unwrap_err();
        let DecodeError::Conversion { row, message } = &err else {
            panic!("expected conversion error, got {err:?}");
        };
        assert_eq!(*row, 2);
        assert!(message.contains("invalid i64 'x'"));
    }

    #[test]
    fn intermediate_record_form() {
        let records = records("Id,Name\n001,\"Acme, Inc.\"\n", DecodeOptions::default()).unwrap();
        assert_eq!(records[0].get("Name"), Some("Acme, Inc."));
        assert_eq!(records[0].to_json(), json!({"Id": "001", "Name": "Acme, Inc."}));
        assert_eq!(records[0].row(), 1);
    }

    #[test]
    fn shaped_decode_requires_sequence() {
        let element = Shape::Record(vec![
            Field::required("id", FieldType::Int),
            Field::required("name", FieldType::String),
        ]);

        let err = decode_shaped(PEOPLE, &element, DecodeOptions::default()).unwrap_err();
        let DecodeError::UnsupportedShape { shape } = &err else {
            panic!("expected unsupported shape, got {err:?}");
        };
        assert_eq!(shape, "record { id: int, name: string }");

        let values = decode_shaped(PEOPLE, &Shape::sequence_of(element), DecodeOptions::with_trailer()).unwrap();
        assert_eq!(values, vec![json!({"id": 1, "name": "Alice"}), json!({"id": 2, "name": "Bob"})]);
    }

    #[test]
    fn shaped_decode_of_scalar_elements_fails_per_row() {
        let shape = Shape::sequence_of(Shape::Scalar(FieldType::String));
        let err = decode_shaped(PEOPLE, &shape, DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Conversion { row: 1, .. }));
    }
}
