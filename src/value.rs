//! Canonical values and driver-native raw values.
//!
//! [`Value`] is what user code reads and writes. [`RawValue`] is what a driver
//! sends and receives; the conversion between the two lives in
//! [`crate::codec`].

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Backend-independent representation of a data value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
    /// Well-known-text geometry, normalised to an upper-case type keyword.
    Geometry(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "string",
            Value::Bytes(_) => "binary",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Json(_) => "json",
            Value::Geometry(_) => "geometry",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Geometry(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Int(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Plain display form used by exports and error messages.
    pub fn display(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("[{} bytes]", b.len()),
            Value::Date(d) => d.to_string(),
            Value::DateTime(dt) => dt.to_rfc3339(),
            Value::Json(j) => j.to_string(),
            Value::Geometry(g) => g.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(d) => serde_json::Value::String(d.to_string()),
            Value::Text(s) | Value::Geometry(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::Date(d) => serde_json::Value::String(d.to_string()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Json(j) => j.clone(),
        }
    }

    /// Ordering between two canonical values of compatible kinds.
    ///
    /// Returns `None` for NULLs and for incomparable kinds.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Int(b)) => Some(a.cmp(&Decimal::from(*b))),
            (Value::Int(a), Value::Decimal(b)) => Some(Decimal::from(*a).cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Geometry(a), Value::Geometry(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A value in the form a backend driver sends or receives.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    /// Timestamp without zone information.
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::Float(_) => "float",
            RawValue::Decimal(_) => "decimal",
            RawValue::Text(_) => "text",
            RawValue::Bytes(_) => "bytes",
            RawValue::Date(_) => "date",
            RawValue::Timestamp(_) => "timestamp",
            RawValue::TimestampTz(_) => "timestamptz",
            RawValue::Json(_) => "json",
        }
    }

    /// Short rendering used in parse errors. Binary payloads are summarised.
    pub fn describe(&self) -> String {
        match self {
            RawValue::Null => "NULL".to_string(),
            RawValue::Bool(b) => b.to_string(),
            RawValue::Int(i) => i.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Decimal(d) => d.to_string(),
            RawValue::Text(s) => format!("{s:?}"),
            RawValue::Bytes(b) => format!("[{} bytes]", b.len()),
            RawValue::Date(d) => d.to_string(),
            RawValue::Timestamp(ts) => ts.to_string(),
            RawValue::TimestampTz(ts) => ts.to_rfc3339(),
            RawValue::Json(j) => j.to_string(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawValue::Bool(b) => Some(*b),
            RawValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Ordering used by the in-memory engine. Numeric kinds compare across
    /// each other; everything else compares within its own kind only.
    pub fn compare(&self, other: &RawValue) -> Option<Ordering> {
        match (self, other) {
            (RawValue::Null, _) | (_, RawValue::Null) => None,
            (RawValue::Bool(a), RawValue::Bool(b)) => Some(a.cmp(b)),
            (RawValue::Int(a), RawValue::Int(b)) => Some(a.cmp(b)),
            (RawValue::Float(a), RawValue::Float(b)) => a.partial_cmp(b),
            (RawValue::Int(a), RawValue::Float(b)) => (*a as f64).partial_cmp(b),
            (RawValue::Float(a), RawValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (RawValue::Decimal(a), RawValue::Decimal(b)) => Some(a.cmp(b)),
            (RawValue::Decimal(a), RawValue::Int(b)) => Some(a.cmp(&Decimal::from(*b))),
            (RawValue::Int(a), RawValue::Decimal(b)) => Some(Decimal::from(*a).cmp(b)),
            (RawValue::Text(a), RawValue::Text(b)) => Some(a.cmp(b)),
            (RawValue::Bytes(a), RawValue::Bytes(b)) => Some(a.cmp(b)),
            (RawValue::Date(a), RawValue::Date(b)) => Some(a.cmp(b)),
            (RawValue::Timestamp(a), RawValue::Timestamp(b)) => Some(a.cmp(b)),
            (RawValue::TimestampTz(a), RawValue::TimestampTz(b)) => Some(a.cmp(b)),
            (RawValue::Json(a), RawValue::Json(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RawValue::Null => serde_json::Value::Null,
            RawValue::Bool(b) => serde_json::Value::Bool(*b),
            RawValue::Int(i) => serde_json::Value::from(*i),
            RawValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            RawValue::Decimal(d) => serde_json::Value::String(d.to_string()),
            RawValue::Text(s) => serde_json::Value::String(s.clone()),
            RawValue::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|x| serde_json::Value::from(*x)).collect())
            }
            RawValue::Date(d) => serde_json::Value::String(d.to_string()),
            RawValue::Timestamp(ts) => serde_json::Value::String(ts.to_string()),
            RawValue::TimestampTz(ts) => serde_json::Value::String(ts.to_rfc3339()),
            RawValue::Json(j) => j.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.display(), "NULL");
        assert_eq!(Value::Int(-100).display(), "-100");
        assert_eq!(Value::Text("hello".into()).display(), "hello");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).display(), "[3 bytes]");
        assert_eq!(Value::Decimal(Decimal::new(150, 2)).display(), "1.50");
    }

    #[test]
    fn test_from_option() {
        let v: Value = Option::<i64>::None.into();
        assert!(v.is_null());
        let v: Value = Some("x").into();
        assert_eq!(v, Value::Text("x".into()));
    }

    #[test]
    fn test_compare_across_numeric_kinds() {
        assert_eq!(
            Value::Int(2).compare(&Value::Float(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::Decimal(Decimal::new(200, 2)).compare(&Value::Int(2)),
            Some(Ordering::Equal)
        );
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::Text("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_raw_compare() {
        assert_eq!(
            RawValue::Text("a".into()).compare(&RawValue::Text("b".into())),
            Some(Ordering::Less)
        );
        assert_eq!(RawValue::Int(1).compare(&RawValue::Null), None);
    }

    #[test]
    fn test_raw_describe_summarises_bytes() {
        assert_eq!(RawValue::Bytes(vec![0; 16]).describe(), "[16 bytes]");
        assert_eq!(RawValue::Text("x".into()).describe(), "\"x\"");
    }
}
