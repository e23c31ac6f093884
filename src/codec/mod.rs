//! Conversion between canonical values and driver values.
//!
//! A [`Representer`] turns a [`Value`] into the [`RawValue`] a backend driver
//! expects; a [`Parser`] turns what the driver returns back into a [`Value`].
//! Both are total over a semantic type's domain and refuse anything outside
//! it instead of coercing.

mod profile;

use std::fmt;

use chrono::FixedOffset;

pub use profile::{BoolRepr, DateRepr, DecimalRepr, JsonRepr, ProfileCodec, TimeRepr, TypeProfile};

use crate::error::Result;
use crate::schema::FieldType;
use crate::value::{RawValue, Value};

/// Converts canonical values into driver values on the write path.
pub trait Representer: Send + Sync + fmt::Debug {
    fn represent(&self, value: &Value, field_type: &FieldType) -> Result<RawValue>;
}

/// Converts driver values into canonical values on the read path.
pub trait Parser: Send + Sync + fmt::Debug {
    /// `column` names the source column for error messages.
    fn parse(&self, raw: RawValue, field_type: &FieldType, column: &str) -> Result<Value>;

    /// Best-effort conversion when no declared type is known (raw queries).
    fn parse_untyped(&self, raw: RawValue) -> Value;
}

/// A matched Parser/Representer pair.
pub trait Codec: Parser + Representer {
    fn assumed_zone(&self) -> FixedOffset;
}

const WKT_KINDS: &[&str] = &[
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
    "GEOMETRYCOLLECTION",
];

/// Normalise well-known text: upper-case type keyword, no space before the
/// coordinate list. Returns `None` for malformed input.
pub fn normalize_wkt(input: &str) -> Option<String> {
    let input = input.trim();
    let split = input.find(|c: char| c == '(' || c.is_whitespace())?;
    let kind = input[..split].to_ascii_uppercase();
    if !WKT_KINDS.contains(&kind.as_str()) {
        return None;
    }
    let body = input[split..].trim();
    if body.eq_ignore_ascii_case("EMPTY") {
        return Some(format!("{kind} EMPTY"));
    }
    if !body.starts_with('(') || !body.ends_with(')') {
        return None;
    }
    let mut depth = 0i32;
    for c in body.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            c if c.is_ascii_digit() || " .,-+eE".contains(c) => {}
            c if c.is_ascii_alphabetic() && kind == "GEOMETRYCOLLECTION" => {}
            _ => return None,
        }
    }
    if depth != 0 || body.len() < 3 {
        return None;
    }
    Some(format!("{kind}{body}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_wkt() {
        assert_eq!(normalize_wkt("point (1 2)").as_deref(), Some("POINT(1 2)"));
        assert_eq!(
            normalize_wkt(" LineString(0 0, 1 1) ").as_deref(),
            Some("LINESTRING(0 0, 1 1)")
        );
        assert_eq!(normalize_wkt("POINT EMPTY").as_deref(), Some("POINT EMPTY"));
        assert!(normalize_wkt("CIRCLE(1 2)").is_none());
        assert!(normalize_wkt("POINT(1 2").is_none());
        assert!(normalize_wkt("POINT(1 2); DROP TABLE x").is_none());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_wkt("polygon ((0 0, 1 0, 1 1, 0 0))").unwrap();
        assert_eq!(normalize_wkt(&once).unwrap(), once);
    }
}
