use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{normalize_wkt, Codec, Parser, Representer};
use crate::dialect::Backend;
use crate::error::{DalError, Result};
use crate::schema::FieldType;
use crate::value::{RawValue, Value};

/// How a backend stores booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolRepr {
    Native,
    /// `'T'` / `'F'` in a CHAR(1) column.
    Char,
    /// 1 / 0 in an integer column.
    Int,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalRepr {
    Native,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRepr {
    Native,
    Text,
}

/// How a backend stores points in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRepr {
    /// Zone-aware timestamps.
    Aware,
    /// Naive timestamps written in the assumed zone.
    Naive,
    /// ISO-8601 text written in the assumed zone.
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRepr {
    Native,
    Text,
}

/// Storage conventions of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeProfile {
    pub backend: Backend,
    pub boolean: BoolRepr,
    pub decimal: DecimalRepr,
    pub json: JsonRepr,
    pub datetime: TimeRepr,
    pub date: DateRepr,
}

impl TypeProfile {
    pub fn for_backend(backend: Backend) -> Self {
        use Backend::*;
        let (boolean, decimal, json, datetime, date) = match backend {
            Sqlite => (
                BoolRepr::Int,
                DecimalRepr::Text,
                JsonRepr::Text,
                TimeRepr::Text,
                DateRepr::Text,
            ),
            Postgres | Memory => (
                BoolRepr::Native,
                DecimalRepr::Native,
                JsonRepr::Native,
                TimeRepr::Aware,
                DateRepr::Native,
            ),
            MySql => (
                BoolRepr::Int,
                DecimalRepr::Native,
                JsonRepr::Native,
                TimeRepr::Naive,
                DateRepr::Native,
            ),
            MsSql | MsSql2005 => (
                BoolRepr::Int,
                DecimalRepr::Native,
                JsonRepr::Text,
                TimeRepr::Naive,
                DateRepr::Native,
            ),
            Oracle | Firebird | Db2 | Informix => (
                BoolRepr::Char,
                DecimalRepr::Native,
                JsonRepr::Text,
                TimeRepr::Naive,
                DateRepr::Native,
            ),
            Teradata => (
                BoolRepr::Int,
                DecimalRepr::Native,
                JsonRepr::Text,
                TimeRepr::Naive,
                DateRepr::Native,
            ),
            MongoDb => (
                BoolRepr::Native,
                DecimalRepr::Native,
                JsonRepr::Native,
                TimeRepr::Aware,
                DateRepr::Text,
            ),
        };
        Self {
            backend,
            boolean,
            decimal,
            json,
            datetime,
            date,
        }
    }
}

/// Parser and Representer driven by a [`TypeProfile`].
#[derive(Debug, Clone)]
pub struct ProfileCodec {
    profile: TypeProfile,
    zone: FixedOffset,
}

const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

impl ProfileCodec {
    pub fn new(profile: TypeProfile, zone: FixedOffset) -> Self {
        Self { profile, zone }
    }

    pub fn for_backend(backend: Backend, zone: FixedOffset) -> Self {
        Self::new(TypeProfile::for_backend(backend), zone)
    }

    pub fn profile(&self) -> &TypeProfile {
        &self.profile
    }

    fn out_of_range(value: &Value, target: &FieldType, reason: impl Into<String>) -> DalError {
        DalError::OutOfRange {
            context: format!("{} parameter", target),
            value: value.display(),
            target: target.clone(),
            reason: reason.into(),
        }
    }

    fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.zone
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn parse_datetime_text(&self, s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, NAIVE_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
            .and_then(|n| self.localize(n))
    }
}

/// Number of significant integer-plus-fraction digits of a decimal.
fn digit_count(d: &Decimal) -> u32 {
    let mantissa = d.mantissa().unsigned_abs();
    if mantissa == 0 {
        0
    } else {
        mantissa.to_string().len() as u32
    }
}

/// Check a decimal against `decimal(precision, scale)` and bring it to that
/// scale. Fails instead of rounding.
fn fit_decimal(d: Decimal, precision: u8, scale: u8) -> std::result::Result<Decimal, String> {
    let normalized = d.normalize();
    if normalized.scale() > scale as u32 {
        return Err(format!("more than {scale} fractional digits"));
    }
    let mut fitted = normalized;
    fitted.rescale(scale as u32);
    if digit_count(&fitted) > precision as u32 {
        return Err(format!("more than {precision} significant digits"));
    }
    Ok(fitted)
}

impl Representer for ProfileCodec {
    fn represent(&self, value: &Value, field_type: &FieldType) -> Result<RawValue> {
        if value.is_null() {
            return Ok(RawValue::Null);
        }
        let value = field_type.coerce(value.clone(), &format!("{field_type} parameter"))?;
        let p = &self.profile;
        Ok(match (field_type, &value) {
            (
                FieldType::Id | FieldType::Integer | FieldType::Reference { .. },
                Value::Int(i),
            ) => RawValue::Int(*i),
            (FieldType::Float, Value::Float(f)) => {
                if !f.is_finite() {
                    return Err(Self::out_of_range(&value, field_type, "not a finite number"));
                }
                RawValue::Float(*f)
            }
            (FieldType::String { length }, Value::Text(s)) => {
                if s.chars().count() > *length as usize {
                    return Err(Self::out_of_range(
                        &value,
                        field_type,
                        format!("longer than {length} characters"),
                    ));
                }
                RawValue::Text(s.clone())
            }
            (FieldType::Text, Value::Text(s)) => RawValue::Text(s.clone()),
            (FieldType::Decimal { precision, scale }, Value::Decimal(d)) => {
                let fitted = fit_decimal(*d, *precision, *scale)
                    .map_err(|reason| Self::out_of_range(&value, field_type, reason))?;
                match p.decimal {
                    DecimalRepr::Native => RawValue::Decimal(fitted),
                    DecimalRepr::Text => RawValue::Text(fitted.to_string()),
                }
            }
            (FieldType::Boolean, Value::Bool(b)) => match p.boolean {
                BoolRepr::Native => RawValue::Bool(*b),
                BoolRepr::Char => RawValue::Text(if *b { "T" } else { "F" }.to_string()),
                BoolRepr::Int => RawValue::Int(i64::from(*b)),
            },
            (FieldType::Date, Value::Date(d)) => match p.date {
                DateRepr::Native => RawValue::Date(*d),
                DateRepr::Text => RawValue::Text(d.format("%Y-%m-%d").to_string()),
            },
            (FieldType::DateTime, Value::DateTime(dt)) => match p.datetime {
                TimeRepr::Aware => RawValue::TimestampTz(*dt),
                TimeRepr::Naive => RawValue::Timestamp(dt.with_timezone(&self.zone).naive_local()),
                TimeRepr::Text => RawValue::Text(
                    dt.with_timezone(&self.zone)
                        .naive_local()
                        .format(NAIVE_FORMAT)
                        .to_string(),
                ),
            },
            (FieldType::Binary, Value::Bytes(b)) => RawValue::Bytes(b.clone()),
            (FieldType::Json, Value::Json(j)) => match p.json {
                JsonRepr::Native => RawValue::Json(j.clone()),
                JsonRepr::Text => RawValue::Text(j.to_string()),
            },
            (FieldType::Geometry { .. }, Value::Geometry(wkt)) => RawValue::Text(wkt.clone()),
            (target, other) => {
                return Err(DalError::mismatch(
                    format!("{target} parameter"),
                    target,
                    other.kind(),
                ))
            }
        })
    }
}

impl Parser for ProfileCodec {
    fn parse(&self, raw: RawValue, field_type: &FieldType, column: &str) -> Result<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let fail = |raw: &RawValue, reason: &str| DalError::Parse {
            column: column.to_string(),
            raw: raw.describe(),
            target: field_type.clone(),
            reason: reason.to_string(),
        };

        let parsed = match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => match &raw {
                RawValue::Int(i) => Some(Value::Int(*i)),
                RawValue::Text(s) => s.trim().parse::<i64>().ok().map(Value::Int),
                RawValue::Decimal(d) if d.fract().is_zero() => d.to_i64().map(Value::Int),
                _ => None,
            },
            FieldType::Float => match &raw {
                RawValue::Float(f) => Some(Value::Float(*f)),
                RawValue::Int(i) => Some(Value::Float(*i as f64)),
                RawValue::Decimal(d) => d.to_f64().map(Value::Float),
                RawValue::Text(s) => s.trim().parse::<f64>().ok().map(Value::Float),
                _ => None,
            },
            FieldType::String { length } => match &raw {
                RawValue::Text(s) if s.chars().count() <= *length as usize => {
                    Some(Value::Text(s.clone()))
                }
                RawValue::Text(_) => {
                    return Err(fail(&raw, &format!("longer than {length} characters")))
                }
                _ => None,
            },
            FieldType::Text => match &raw {
                RawValue::Text(s) => Some(Value::Text(s.clone())),
                _ => None,
            },
            FieldType::Decimal { precision, scale } => {
                let d = match &raw {
                    RawValue::Decimal(d) => Some(*d),
                    RawValue::Int(i) => Some(Decimal::from(*i)),
                    RawValue::Text(s) => Decimal::from_str(s.trim()).ok(),
                    RawValue::Float(f) => Decimal::from_str(&f.to_string()).ok(),
                    _ => None,
                };
                match d {
                    Some(d) => Some(Value::Decimal(
                        fit_decimal(d, *precision, *scale).map_err(|r| fail(&raw, &r))?,
                    )),
                    None => None,
                }
            }
            FieldType::Boolean => match &raw {
                RawValue::Bool(b) => Some(Value::Bool(*b)),
                RawValue::Int(0) => Some(Value::Bool(false)),
                RawValue::Int(1) => Some(Value::Bool(true)),
                RawValue::Text(s) => match s.trim().to_ascii_uppercase().as_str() {
                    "T" | "TRUE" | "1" => Some(Value::Bool(true)),
                    "F" | "FALSE" | "0" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            FieldType::Date => match &raw {
                RawValue::Date(d) => Some(Value::Date(*d)),
                RawValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .ok()
                    .map(Value::Date),
                RawValue::Timestamp(ts) if ts.time() == NaiveTime::MIN => {
                    Some(Value::Date(ts.date()))
                }
                _ => None,
            },
            FieldType::DateTime => match &raw {
                RawValue::TimestampTz(dt) => Some(Value::DateTime(*dt)),
                RawValue::Timestamp(n) => self.localize(*n).map(Value::DateTime),
                RawValue::Text(s) => self.parse_datetime_text(s).map(Value::DateTime),
                _ => None,
            },
            FieldType::Binary => match &raw {
                RawValue::Bytes(b) => Some(Value::Bytes(b.clone())),
                RawValue::Text(s) => s.strip_prefix("\\x").and_then(decode_hex).map(Value::Bytes),
                _ => None,
            },
            FieldType::Json => match &raw {
                RawValue::Json(j) => Some(Value::Json(j.clone())),
                RawValue::Text(s) => serde_json::from_str(s).ok().map(Value::Json),
                _ => None,
            },
            FieldType::Geometry { .. } => match &raw {
                RawValue::Text(s) => normalize_wkt(s).map(Value::Geometry),
                _ => None,
            },
        };

        parsed.ok_or_else(|| fail(&raw, "value is outside the type's domain"))
    }

    fn parse_untyped(&self, raw: RawValue) -> Value {
        match raw {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(b),
            RawValue::Int(i) => Value::Int(i),
            RawValue::Float(f) => Value::Float(f),
            RawValue::Decimal(d) => Value::Decimal(d),
            RawValue::Text(s) => Value::Text(s),
            RawValue::Bytes(b) => Value::Bytes(b),
            RawValue::Date(d) => Value::Date(d),
            RawValue::Timestamp(n) => self
                .localize(n)
                .map(Value::DateTime)
                .unwrap_or_else(|| Value::Text(n.to_string())),
            RawValue::TimestampTz(dt) => Value::DateTime(dt),
            RawValue::Json(j) => Value::Json(j),
        }
    }
}

impl Codec for ProfileCodec {
    fn assumed_zone(&self) -> FixedOffset {
        self.zone
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const ALL_BACKENDS: [Backend; 12] = [
        Backend::Sqlite,
        Backend::Postgres,
        Backend::MySql,
        Backend::MsSql,
        Backend::MsSql2005,
        Backend::Oracle,
        Backend::Firebird,
        Backend::Db2,
        Backend::Informix,
        Backend::Teradata,
        Backend::MongoDb,
        Backend::Memory,
    ];

    fn samples() -> Vec<(FieldType, Value)> {
        let instant = Utc
            .with_ymd_and_hms(2024, 3, 1, 23, 30, 15)
            .unwrap()
            .with_nanosecond(123_456_000)
            .unwrap();
        vec![
            (FieldType::Integer, Value::Int(-42)),
            (FieldType::Integer, Value::Int(i64::MAX)),
            (FieldType::reference("person"), Value::Int(7)),
            (FieldType::Float, Value::Float(0.1)),
            (FieldType::string(5), Value::from("héllo")),
            (FieldType::Text, Value::from("it's \"quoted\"")),
            (FieldType::decimal(10, 2), Value::Decimal(Decimal::new(-1234567, 2))),
            (FieldType::decimal(38, 10), Value::Decimal(Decimal::new(1, 10))),
            (FieldType::Boolean, Value::Bool(true)),
            (FieldType::Boolean, Value::Bool(false)),
            (
                FieldType::Date,
                Value::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            ),
            (FieldType::DateTime, Value::DateTime(instant)),
            (FieldType::Binary, Value::Bytes(vec![0, 159, 255])),
            (
                FieldType::Json,
                Value::Json(serde_json::json!({"a": [1, 2.5, null], "b": "x"})),
            ),
            (FieldType::geometry(4326), Value::Geometry("POINT(1 2)".into())),
        ]
    }

    #[test]
    fn test_round_trip_every_backend() {
        let zones = [
            FixedOffset::east_opt(0).unwrap(),
            FixedOffset::east_opt(2 * 3600).unwrap(),
            FixedOffset::west_opt(5 * 3600 + 1800).unwrap(),
        ];
        for backend in ALL_BACKENDS {
            for zone in zones {
                let codec = ProfileCodec::for_backend(backend, zone);
                for (ty, value) in samples() {
                    let raw = codec.represent(&value, &ty).unwrap();
                    let back = codec.parse(raw, &ty, "c").unwrap();
                    assert_eq!(back, value, "{backend:?} {ty} in zone {zone}");
                }
            }
        }
    }

    #[test]
    fn test_boolean_encodings() {
        let zone = FixedOffset::east_opt(0).unwrap();
        let oracle = ProfileCodec::for_backend(Backend::Oracle, zone);
        assert_eq!(
            oracle.represent(&Value::Bool(true), &FieldType::Boolean).unwrap(),
            RawValue::Text("T".into())
        );
        let mysql = ProfileCodec::for_backend(Backend::MySql, zone);
        assert_eq!(
            mysql.represent(&Value::Bool(false), &FieldType::Boolean).unwrap(),
            RawValue::Int(0)
        );
        let err = mysql
            .parse(RawValue::Int(2), &FieldType::Boolean, "person.active")
            .unwrap_err();
        assert!(matches!(err, DalError::Parse { .. }));
        assert!(err.to_string().contains("person.active"));
    }

    #[test]
    fn test_naive_timestamps_use_assumed_zone() {
        let zone = FixedOffset::east_opt(3600).unwrap();
        let codec = ProfileCodec::for_backend(Backend::MySql, zone);
        let noon_utc = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let raw = codec
            .represent(&Value::DateTime(noon_utc), &FieldType::DateTime)
            .unwrap();
        match &raw {
            RawValue::Timestamp(n) => assert_eq!(n.to_string(), "2024-06-01 13:00:00"),
            other => panic!("expected naive timestamp, got {other:?}"),
        }
    }

    #[test]
    fn test_decimal_is_never_rounded() {
        let zone = FixedOffset::east_opt(0).unwrap();
        let codec = ProfileCodec::for_backend(Backend::Postgres, zone);
        let ty = FieldType::decimal(5, 2);
        let too_precise = Value::Decimal(Decimal::new(12345, 3));
        assert!(matches!(
            codec.represent(&too_precise, &ty),
            Err(DalError::OutOfRange { .. })
        ));
        let too_large = Value::Decimal(Decimal::new(123456, 2));
        assert!(codec.represent(&too_large, &ty).is_err());
        let raw = RawValue::Text("1.005".into());
        assert!(matches!(
            codec.parse(raw, &ty, "item.price"),
            Err(DalError::Parse { .. })
        ));
        let trailing_zeros = RawValue::Decimal(Decimal::new(150000, 5));
        assert_eq!(
            codec.parse(trailing_zeros, &ty, "item.price").unwrap(),
            Value::Decimal(Decimal::new(150, 2))
        );
    }

    #[test]
    fn test_string_length_enforced() {
        let zone = FixedOffset::east_opt(0).unwrap();
        let codec = ProfileCodec::for_backend(Backend::Sqlite, zone);
        let ty = FieldType::string(3);
        assert!(codec.represent(&Value::from("abcd"), &ty).is_err());
        assert!(codec
            .parse(RawValue::Text("abcd".into()), &ty, "t.code")
            .is_err());
    }

    #[test]
    fn test_integer_parse_is_strict() {
        let zone = FixedOffset::east_opt(0).unwrap();
        let codec = ProfileCodec::for_backend(Backend::Sqlite, zone);
        assert!(codec
            .parse(RawValue::Text("99999999999999999999".into()), &FieldType::Integer, "t.n")
            .is_err());
        assert!(codec
            .parse(RawValue::Float(1.5), &FieldType::Integer, "t.n")
            .is_err());
        assert_eq!(
            codec
                .parse(RawValue::Text(" 12 ".into()), &FieldType::Integer, "t.n")
                .unwrap(),
            Value::Int(12)
        );
    }

    #[test]
    fn test_parse_untyped_localizes_naive() {
        let zone = FixedOffset::east_opt(7200).unwrap();
        let codec = ProfileCodec::for_backend(Backend::MySql, zone);
        let naive = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap();
        assert_eq!(
            codec.parse_untyped(RawValue::Timestamp(naive)),
            Value::DateTime(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_hex_bytes() {
        let zone = FixedOffset::east_opt(0).unwrap();
        let codec = ProfileCodec::for_backend(Backend::Postgres, zone);
        assert_eq!(
            codec
                .parse(RawValue::Text("\\x00ff".into()), &FieldType::Binary, "t.b")
                .unwrap(),
            Value::Bytes(vec![0, 255])
        );
    }
}
