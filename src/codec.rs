//! Value codec: input coercion, SQL literal rendering and result decoding.
//!
//! The write path is `coerce` then [`Dialect::literal`]; the read path is
//! [`decode`]. Both paths share the text-column JSON rules so that a value
//! written and read back compares equal to the coerced input, which is what
//! the row cache relies on.

use std::fmt::Write as _;
use thiserror::Error;

use crate::schema::{Column, ColumnType, TextMode};
use crate::value::Value;

/// Literal syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Mysql,
    Postgres,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Render an already coerced value as a SQL literal.
    pub fn literal(self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format_float(*v),
            Value::Text(v) => self.quote(v),
            Value::Json(v) => self.quote(&v.to_string()),
            Value::Bool(v) => match self {
                Self::Sqlite => if *v { "1" } else { "0" }.to_string(),
                Self::Mysql | Self::Postgres => if *v { "TRUE" } else { "FALSE" }.to_string(),
            },
            Value::Blob(bytes) => {
                let mut hex = String::with_capacity(bytes.len() * 2);
                for b in bytes {
                    let _ = write!(hex, "{b:02x}");
                }
                match self {
                    Self::Sqlite | Self::Mysql => format!("X'{hex}'"),
                    Self::Postgres => format!("'\\x{hex}'::bytea"),
                }
            }
        }
    }

    /// Single-quote a string, escaping per backend.
    pub fn quote(self, text: &str) -> String {
        let mut escaped = text.replace('\'', "''");
        if self == Self::Mysql {
            escaped = escaped.replace('\\', "\\\\");
        }
        format!("'{escaped}'")
    }
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

/// A caller value that cannot be represented in the target column.
#[derive(Debug, Clone, Error)]
#[error("unsupported {kind} value `{value}` for {column_type} column `{column}`")]
pub struct UnsupportedValue {
    pub column: String,
    pub column_type: ColumnType,
    pub kind: &'static str,
    pub value: String,
}

impl UnsupportedValue {
    fn new(column: &Column, value: &Value) -> Self {
        Self {
            column: column.name.clone(),
            column_type: column.column_type,
            kind: value.kind(),
            value: value.to_string(),
        }
    }
}

/// Validate a caller value against a column and convert it to the column's
/// canonical representation.
pub fn coerce(column: &Column, value: Value) -> Result<Value, UnsupportedValue> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let rejected = |v: &Value| UnsupportedValue::new(column, v);
    match column.column_type {
        ColumnType::Int => match value {
            Value::Int(_) => Ok(value),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            Value::Float(f) => float_to_int(f).map(Value::Int).ok_or_else(|| rejected(&value)),
            Value::Text(ref s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| rejected(&value)),
            Value::Json(serde_json::Value::Number(ref n)) => {
                n.as_i64().map(Value::Int).ok_or_else(|| rejected(&value))
            }
            other => Err(rejected(&other)),
        },
        ColumnType::Float => match value {
            Value::Float(f) if f.is_finite() => Ok(value),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Bool(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
            Value::Text(ref s) => match s.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Value::Float(f)),
                _ => Err(rejected(&value)),
            },
            Value::Json(serde_json::Value::Number(ref n)) => {
                n.as_f64().map(Value::Float).ok_or_else(|| rejected(&value))
            }
            other => Err(rejected(&other)),
        },
        ColumnType::Text => match value {
            Value::Text(s) => Ok(decode_text(column.text_mode, s)),
            Value::Json(json) => Ok(coerce_json_text(column.text_mode, json)),
            Value::Int(i) => Ok(Value::Text(i.to_string())),
            Value::Float(f) => Ok(Value::Text(f.to_string())),
            Value::Bool(b) => Ok(Value::Text(b.to_string())),
            other => Err(rejected(&other)),
        },
        ColumnType::Bool => match value {
            Value::Bool(_) => Ok(value),
            Value::Int(i) => Ok(Value::Bool(i != 0)),
            Value::Float(f) if f.is_finite() => Ok(Value::Bool(f.trunc() != 0.0)),
            Value::Text(ref s) => parse_bool(s).map(Value::Bool).ok_or_else(|| rejected(&value)),
            Value::Json(serde_json::Value::Bool(b)) => Ok(Value::Bool(b)),
            other => Err(rejected(&other)),
        },
        ColumnType::Blob => match value {
            Value::Blob(_) => Ok(value),
            Value::Text(s) => Ok(Value::Blob(s.into_bytes())),
            other => Err(rejected(&other)),
        },
    }
}

/// Decode a backend cell into the column's typed representation.
pub fn decode(column: &Column, raw: Value) -> Value {
    match (column.column_type, raw) {
        (_, Value::Null) => Value::Null,
        (ColumnType::Bool, Value::Int(i)) => Value::Bool(i != 0),
        (ColumnType::Bool, Value::Text(s)) => match parse_bool(&s) {
            Some(b) => Value::Bool(b),
            None => Value::Text(s),
        },
        (ColumnType::Float, Value::Int(i)) => Value::Float(i as f64),
        (ColumnType::Int, Value::Bool(b)) => Value::Int(i64::from(b)),
        (ColumnType::Text, Value::Text(s)) => decode_text(column.text_mode, s),
        (ColumnType::Text, Value::Blob(bytes)) => match String::from_utf8(bytes) {
            Ok(s) => decode_text(column.text_mode, s),
            Err(e) => Value::Blob(e.into_bytes()),
        },
        (ColumnType::Blob, Value::Text(s)) => Value::Blob(s.into_bytes()),
        (_, other) => other,
    }
}

/// Apply the column's JSON rule to a text value.
pub fn decode_text(mode: TextMode, text: String) -> Value {
    match mode {
        TextMode::Plain => Value::Text(text),
        TextMode::Detect if !looks_like_json(&text) => Value::Text(text),
        TextMode::Detect => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) if json.is_object() || json.is_array() => Value::Json(json),
            _ => Value::Text(text),
        },
        TextMode::Json => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::String(s)) => Value::Text(s),
            Ok(json) => Value::Json(json),
            Err(_) => Value::Text(text),
        },
    }
}

fn coerce_json_text(mode: TextMode, json: serde_json::Value) -> Value {
    match (mode, json) {
        (_, serde_json::Value::Null) => Value::Null,
        (TextMode::Plain, serde_json::Value::String(s)) => Value::Text(s),
        (TextMode::Plain, other) => Value::Text(other.to_string()),
        (TextMode::Detect, json @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            Value::Json(json)
        }
        (TextMode::Detect, serde_json::Value::String(s)) => decode_text(TextMode::Detect, s),
        (TextMode::Detect, other) => Value::Text(other.to_string()),
        (TextMode::Json, serde_json::Value::String(s)) => Value::Text(s),
        (TextMode::Json, other) => Value::Json(other),
    }
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

/// 2^63, the first float above `i64::MAX`.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Truncate `f` toward zero when the result fits in an `i64`.
fn float_to_int(f: f64) -> Option<i64> {
    let t = f.trunc();
    (t >= -I64_LIMIT && t < I64_LIMIT).then_some(t as i64)
}
