//! Typed coercion of loosely-typed row values into target column types.
//!
//! A DML entry arrives as JSON, so every value is a string, number, bool, or
//! null regardless of the target column's declared type. [`convert_value`]
//! maps each raw value onto a [`SqlValue`] keyed on the column type; a value
//! that cannot be coerced fails with an error naming the row index and the
//! column, which is enough context to inspect the dead-lettered message.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::postgres::ColumnMeta;
use crate::{Error, Result};

/// A row value after coercion to its target column type.
///
/// Decimals are kept as validated text rather than `f64` so arbitrary
/// precision survives the trip into a `numeric` column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Renders the value in PostgreSQL text representation, or `None` for
    /// NULL. The output is valid both as a text-protocol parameter (with an
    /// explicit cast) and as a COPY text field before escaping.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(if *b { "t" } else { "f" }.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Numeric(s) => Some(s.clone()),
            SqlValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            SqlValue::Text(s) => Some(s.clone()),
        }
    }

    /// Renders the value as one field of a COPY text-format row: `\N` for
    /// NULL, with backslash, tab, newline, and carriage return escaped.
    pub fn to_copy_field(&self) -> String {
        match self.to_text() {
            None => "\\N".to_string(),
            Some(s) => {
                let mut out = String::with_capacity(s.len());
                for c in s.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '\t' => out.push_str("\\t"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        _ => out.push(c),
                    }
                }
                out
            }
        }
    }
}

/// Type classes the converter distinguishes. Everything it does not
/// recognize falls back to text, mirroring how the target database will
/// coerce unknown-but-textual types itself.
enum TypeClass {
    Integer,
    Float,
    Numeric,
    Boolean,
    Date,
    Timestamp,
    Text,
}

fn classify(db_type: &str) -> TypeClass {
    let t = db_type.to_ascii_lowercase();
    match t.as_str() {
        "smallint" | "integer" | "bigint" => TypeClass::Integer,
        "real" | "double precision" => TypeClass::Float,
        "boolean" => TypeClass::Boolean,
        "date" => TypeClass::Date,
        _ if t.starts_with("numeric") || t.starts_with("decimal") => TypeClass::Numeric,
        _ if t.starts_with("timestamp") => TypeClass::Timestamp,
        _ => TypeClass::Text,
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d",
];

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    for fmt in TIMESTAMP_FORMATS {
        if *fmt == "%Y-%m-%d" {
            if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
                return d.and_hms_opt(0, 0, 0);
            }
        } else if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.naive_utc())
}

fn conversion_error(row: usize, column: &ColumnMeta, reason: impl Into<String>) -> Error {
    Error::Conversion {
        row,
        column: column.name.clone(),
        reason: reason.into(),
    }
}

/// Coerces one raw JSON value to the native type of `column`.
///
/// Empty strings count as NULL for every non-text class, matching the
/// upstream capture convention of emitting `""` for absent values.
pub fn convert_value(raw: &Value, column: &ColumnMeta, row: usize) -> Result<SqlValue> {
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }

    match classify(&column.db_type) {
        TypeClass::Integer => match raw {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    // JSON numbers often arrive as floats; truncate back.
                    Ok(SqlValue::Int(f as i64))
                } else {
                    Err(conversion_error(row, column, format!("integer out of range: {n}")))
                }
            }
            Value::String(s) if s.is_empty() => Ok(SqlValue::Null),
            Value::String(s) => s
                .parse::<i64>()
                .map(SqlValue::Int)
                .map_err(|e| conversion_error(row, column, format!("not an integer: {e}"))),
            other => Err(conversion_error(
                row,
                column,
                format!("unsupported value for integer column: {other}"),
            )),
        },

        TypeClass::Float => match raw {
            Value::Number(n) => n
                .as_f64()
                .map(SqlValue::Float)
                .ok_or_else(|| conversion_error(row, column, format!("not a float: {n}"))),
            Value::String(s) if s.is_empty() => Ok(SqlValue::Null),
            Value::String(s) => s
                .parse::<f64>()
                .map(SqlValue::Float)
                .map_err(|e| conversion_error(row, column, format!("not a float: {e}"))),
            other => Err(conversion_error(
                row,
                column,
                format!("unsupported value for float column: {other}"),
            )),
        },

        TypeClass::Numeric => match raw {
            Value::Number(n) => Ok(SqlValue::Numeric(n.to_string())),
            Value::String(s) if s.is_empty() => Ok(SqlValue::Null),
            Value::String(s) => {
                // Validate numeric-ness only; the original text is kept so
                // precision beyond f64 is not lost.
                s.parse::<f64>()
                    .map(|_| SqlValue::Numeric(s.clone()))
                    .map_err(|e| conversion_error(row, column, format!("not a number: {e}")))
            }
            other => Err(conversion_error(
                row,
                column,
                format!("unsupported value for numeric column: {other}"),
            )),
        },

        TypeClass::Boolean => match raw {
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(SqlValue::Bool(true)),
                "false" | "0" => Ok(SqlValue::Bool(false)),
                _ => Err(conversion_error(row, column, format!("not a boolean: \"{s}\""))),
            },
            other => Err(conversion_error(
                row,
                column,
                format!("unsupported value for boolean column: {other}"),
            )),
        },

        TypeClass::Date => match raw {
            Value::String(s) if s.is_empty() => Ok(SqlValue::Null),
            Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(SqlValue::Date)
                .or_else(|_| {
                    parse_timestamp(s)
                        .map(|ts| SqlValue::Date(ts.date()))
                        .ok_or_else(|| conversion_error(row, column, format!("not a date: \"{s}\"")))
                }),
            other => Err(conversion_error(
                row,
                column,
                format!("unsupported value for date column: {other}"),
            )),
        },

        TypeClass::Timestamp => match raw {
            Value::String(s) if s.is_empty() => Ok(SqlValue::Null),
            Value::String(s) => parse_timestamp(s)
                .map(SqlValue::Timestamp)
                .ok_or_else(|| conversion_error(row, column, format!("not a timestamp: \"{s}\""))),
            other => Err(conversion_error(
                row,
                column,
                format!("unsupported value for timestamp column: {other}"),
            )),
        },

        TypeClass::Text => match raw {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            other => Ok(SqlValue::Text(other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(name: &str, db_type: &str) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            db_type: db_type.to_string(),
            is_primary_key: false,
            is_auto_increment: false,
        }
    }

    #[test]
    fn test_integer_coercions() {
        let col = column("qty", "bigint");
        assert_eq!(convert_value(&json!(7), &col, 0).unwrap(), SqlValue::Int(7));
        assert_eq!(convert_value(&json!(7.9), &col, 0).unwrap(), SqlValue::Int(7));
        assert_eq!(
            convert_value(&json!("42"), &col, 0).unwrap(),
            SqlValue::Int(42)
        );
        assert_eq!(convert_value(&json!(""), &col, 0).unwrap(), SqlValue::Null);
        assert!(convert_value(&json!("x"), &col, 0).is_err());
        assert!(convert_value(&json!(true), &col, 0).is_err());
    }

    #[test]
    fn test_float_and_numeric_coercions() {
        let col = column("price", "double precision");
        assert_eq!(
            convert_value(&json!(1.5), &col, 0).unwrap(),
            SqlValue::Float(1.5)
        );
        assert_eq!(
            convert_value(&json!("2.25"), &col, 0).unwrap(),
            SqlValue::Float(2.25)
        );

        let col = column("amount", "numeric(18,4)");
        assert_eq!(
            convert_value(&json!("12345678901234.5678"), &col, 0).unwrap(),
            SqlValue::Numeric("12345678901234.5678".to_string())
        );
        assert!(convert_value(&json!("abc"), &col, 0).is_err());
    }

    #[test]
    fn test_boolean_coercions() {
        let col = column("active", "boolean");
        assert_eq!(
            convert_value(&json!(true), &col, 0).unwrap(),
            SqlValue::Bool(true)
        );
        assert_eq!(
            convert_value(&json!("1"), &col, 0).unwrap(),
            SqlValue::Bool(true)
        );
        assert_eq!(
            convert_value(&json!("False"), &col, 0).unwrap(),
            SqlValue::Bool(false)
        );
        assert!(convert_value(&json!("yes"), &col, 0).is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        let col = column("updated_at", "timestamp without time zone");
        for raw in [
            "2025-05-28 09:21:48.627",
            "2025-05-28T09:21:48.627",
            "2025-05-28T09:21:48.627+00:00",
            "2025-05-28",
        ] {
            let v = convert_value(&json!(raw), &col, 0).unwrap();
            assert!(matches!(v, SqlValue::Timestamp(_)), "failed for {raw}");
        }
        assert!(convert_value(&json!("28/05/2025"), &col, 0).is_err());
    }

    #[test]
    fn test_text_fallback_stringifies() {
        let col = column("note", "character varying(50)");
        assert_eq!(
            convert_value(&json!("hi"), &col, 0).unwrap(),
            SqlValue::Text("hi".to_string())
        );
        assert_eq!(
            convert_value(&json!(9), &col, 0).unwrap(),
            SqlValue::Text("9".to_string())
        );
        assert_eq!(
            convert_value(&json!(true), &col, 0).unwrap(),
            SqlValue::Text("true".to_string())
        );

        // Unknown declared type also lands in the text fallback.
        let col = column("id", "uuid");
        assert_eq!(
            convert_value(&json!("0d4cafda-4e9c-4222-9dde-22a7fda6b00d"), &col, 0).unwrap(),
            SqlValue::Text("0d4cafda-4e9c-4222-9dde-22a7fda6b00d".to_string())
        );
    }

    #[test]
    fn test_conversion_error_names_row_and_column() {
        let col = column("qty", "integer");
        let err = convert_value(&json!("oops"), &col, 3).unwrap_err();
        match err {
            Error::Conversion { row, column, .. } => {
                assert_eq!(row, 3);
                assert_eq!(column, "qty");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_copy_field_escaping() {
        assert_eq!(SqlValue::Null.to_copy_field(), "\\N");
        assert_eq!(
            SqlValue::Text("a\tb\nc\\d".to_string()).to_copy_field(),
            "a\\tb\\nc\\\\d"
        );
        assert_eq!(SqlValue::Bool(true).to_copy_field(), "t");
    }
}
