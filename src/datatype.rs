// used for persistence
use rusqlite::types::Value as SqlValue;

// used for the temporal field types
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

// used to print out readable forms of a value
use std::fmt;

use crate::error::{DinoError, Result};

/// Unquoted text that stands for "no value" wherever a value is written as text.
pub const NULL_SENTINEL: &str = "None";

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Returns the inner text when `text` is wrapped in single quotes.
pub fn quoted(text: &str) -> Option<&str> {
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        Some(&text[1..text.len() - 1])
    } else {
        None
    }
}

/// True when `text` is the bare null sentinel. A quoted `'None'` is literal text.
pub fn is_null(text: &str) -> bool {
    text.trim() == NULL_SENTINEL
}

// ------------- Field Types -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int,
    String,
    Text,
    Float,
    Date,
    DateTime,
    Duration,
}

impl FieldType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Bool | FieldType::Int | FieldType::Duration => "integer",
            FieldType::Float => "real",
            _ => "text",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Float => "float",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Duration => "duration",
        }
    }

    /// Coerces user supplied text into a typed value.
    pub fn coerce(&self, attribute: &str, text: &str) -> Result<Value> {
        if let Some(literal) = quoted(text.trim()) {
            return self.coerce_literal(attribute, literal);
        }
        if is_null(text) {
            return Ok(Value::Null);
        }
        match self {
            FieldType::String | FieldType::Text => self.coerce_literal(attribute, text),
            _ if text.trim().is_empty() => Ok(Value::Null),
            _ => self.coerce_literal(attribute, text.trim()),
        }
    }

    /// Coerces text known not to be the null sentinel.
    pub(crate) fn coerce_literal(&self, attribute: &str, text: &str) -> Result<Value> {
        let invalid = || DinoError::InvalidValue {
            attribute: attribute.to_string(),
            value: text.to_string(),
            expected: self.name().to_string(),
        };
        let value = match self {
            FieldType::String => Value::Text(text.trim().to_string()),
            FieldType::Text => Value::Text(text.to_string()),
            FieldType::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => return Err(invalid()),
            },
            FieldType::Int => Value::Int(text.parse().map_err(|_| invalid())?),
            FieldType::Float => Value::Float(text.parse().map_err(|_| invalid())?),
            FieldType::Date => Value::Date(NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|_| invalid())?),
            FieldType::DateTime => Value::DateTime(parse_datetime(text).ok_or_else(invalid)?),
            FieldType::Duration => Value::Duration(parse_duration(text).ok_or_else(invalid)?),
        };
        Ok(value)
    }

    /// Reads a stored column back into a typed value.
    pub fn from_sql(&self, column: &str, value: SqlValue) -> Result<Value> {
        let corrupt = |v: &SqlValue| DinoError::InvalidValue {
            attribute: column.to_string(),
            value: format!("{v:?}"),
            expected: self.name().to_string(),
        };
        let value = match (self, value) {
            (_, SqlValue::Null) => Value::Null,
            (FieldType::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
            (FieldType::Int, SqlValue::Integer(i)) => Value::Int(i),
            (FieldType::Float, SqlValue::Real(r)) => Value::Float(r),
            (FieldType::Float, SqlValue::Integer(i)) => Value::Float(i as f64),
            (FieldType::String | FieldType::Text, SqlValue::Text(t)) => Value::Text(t),
            (FieldType::Date, SqlValue::Text(t)) => {
                Value::Date(NaiveDate::parse_from_str(&t, DATE_FORMAT).map_err(|_| corrupt(&SqlValue::Text(t.clone())))?)
            }
            (FieldType::DateTime, SqlValue::Text(t)) => {
                Value::DateTime(parse_datetime(&t).ok_or_else(|| corrupt(&SqlValue::Text(t.clone())))?)
            }
            (FieldType::Duration, SqlValue::Integer(i)) => {
                Value::Duration(TimeDelta::try_seconds(i).ok_or_else(|| corrupt(&SqlValue::Integer(i)))?)
            }
            (_, other) => return Err(corrupt(&other)),
        };
        Ok(value)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.replacen('T', " ", 1);
    NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(&text, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_duration(text: &str) -> Option<TimeDelta> {
    let (number, unit) = match text.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&text[..i], c),
        _ => (text, 's'),
    };
    let n: i64 = number.trim().parse().ok()?;
    let seconds = match unit {
        's' => n,
        'm' => n.checked_mul(60)?,
        'h' => n.checked_mul(3_600)?,
        'd' => n.checked_mul(86_400)?,
        _ => return None,
    };
    TimeDelta::try_seconds(seconds)
}

// ------------- Values -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Float(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Duration(TimeDelta),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Text used when the value is spliced into a derived name. Null has none.
    pub fn name_part(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn to_sql(&self) -> SqlValue {
        match self {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Int(i) => SqlValue::Integer(*i),
            Value::Text(t) => SqlValue::Text(t.clone()),
            Value::Float(f) => SqlValue::Real(*f),
            Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
            Value::DateTime(dt) => SqlValue::Text(dt.format(DATETIME_FORMAT).to_string()),
            Value::Duration(d) => SqlValue::Integer(d.num_seconds()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "{NULL_SENTINEL}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(t) => write!(f, "{t}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Value::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Value::Duration(d) => write!(f, "{}s", d.num_seconds()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}
