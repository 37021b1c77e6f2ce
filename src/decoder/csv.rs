//! Delimited-text tokenizer.
//!
//! RFC 4180 rules: `,` separates fields, fields may be wrapped in `"`, a doubled
//! `""` inside a quoted field is a literal quote, and quoted fields may contain
//! separators and line breaks. Rows end at LF, CRLF or a lone CR. A trailing
//! line break does not start another row; an empty line inside the text is a
//! row with a single empty field.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::DecodeError;

const DELIMITER: char = ',';
const QUOTE: char = '"';

/// One parsed row and the line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Row {
    pub line: usize,
    pub fields: Vec<String>,
}

#[derive(Default)]
struct Tokenizer {
    rows: Vec<Row>,
    fields: Vec<String>,
    field: String,
    in_quotes: bool,
    /// Current field was quoted and its closing quote has been read.
    closed_quote: bool,
    line: usize,
    row_line: usize,
}

impl Tokenizer {
    fn end_field(&mut self) {
        self.fields.push(std::mem::take(&mut self.field));
    }

    fn end_row(&mut self) {
        self.end_field();
        self.rows.push(Row {
            line: self.row_line,
            fields: std::mem::take(&mut self.fields),
        });
        self.closed_quote = false;
        self.line += 1;
        self.row_line = self.line;
    }

    fn malformed(&self, message: &str) -> DecodeError {
        DecodeError::Malformed {
            line: self.line,
            message: message.to_string(),
        }
    }

    fn quoted(&mut self, c: char, chars: &mut Peekable<Chars<'_>>) {
        match c {
            QUOTE if chars.peek() == Some(&QUOTE) => {
                chars.next();
                self.field.push(QUOTE);
            }
            QUOTE => {
                self.in_quotes = false;
                self.closed_quote = true;
            }
            '\n' => {
                self.line += 1;
                self.field.push(c);
            }
            _ => self.field.push(c),
        }
    }

    fn unquoted(&mut self, c: char, chars: &mut Peekable<Chars<'_>>) -> Result<(), DecodeError> {
        match c {
            DELIMITER => {
                self.end_field();
                self.closed_quote = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\r' | '\n' => self.end_row(),
            _ if self.closed_quote => {
                if c != ' ' && c != '\t' {
                    return Err(self.malformed("unexpected character after closing quote"));
                }
            }
            QUOTE if self.field.is_empty() => self.in_quotes = true,
            _ => self.field.push(c),
        }
        Ok(())
    }
}

/// Split `text` into rows of raw cell values.
pub(crate) fn parse_rows(text: &str) -> Result<Vec<Row>, DecodeError> {
    let mut t = Tokenizer {
        line: 1,
        row_line: 1,
        ..Tokenizer::default()
    };
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if t.in_quotes {
            t.quoted(c, &mut chars);
        } else {
            t.unquoted(c, &mut chars)?;
        }
    }

    if t.in_quotes {
        return Err(DecodeError::Malformed {
            line: t.row_line,
            message: "unterminated quoted field".to_string(),
        });
    }
    if !t.field.is_empty() || !t.fields.is_empty() || t.closed_quote {
        t.end_row();
    }
    Ok(t.rows)
}
