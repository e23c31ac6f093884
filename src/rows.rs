//! Fetched rows.
//!
//! A [`RowSet`] is fully materialised: it owns its values and holds no
//! connection, so it can outlive the instance it came from.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;

use crate::ast::Direction;
use crate::error::{DalError, Result};
use crate::export;
use crate::schema::FieldType;
use crate::value::Value;

/// Output column of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    /// Declared type, when known. Raw statements may leave it unset.
    pub field_type: Option<FieldType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
    table: Option<String>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, values: Vec<Value>, table: Option<String>) -> Self {
        Self {
            columns,
            values,
            table,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Base table of the select this row came from.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    fn position(&self, name: &str) -> Option<usize> {
        position(&self.columns, name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|i| &self.values[i])
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn column_type(&self, name: &str) -> Option<&FieldType> {
        self.position(name)
            .and_then(|i| self.columns[i].field_type.as_ref())
    }

    /// Typed access to a column.
    pub fn try_get<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get(name).ok_or_else(|| self.unknown(name))?;
        T::from_value(value).ok_or_else(|| {
            DalError::mismatch(
                format!("{}.{name}", self.table().unwrap_or("result")),
                T::EXPECTED,
                value.kind(),
            )
        })
    }

    pub fn decode<T: FromRow>(&self) -> Result<T> {
        T::from_row(self)
    }

    pub fn into_map(self) -> IndexMap<String, Value> {
        self.columns
            .iter()
            .map(|c| c.name.clone())
            .zip(self.values)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.name.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    fn unknown(&self, name: &str) -> DalError {
        DalError::UnknownField {
            table: self.table().unwrap_or("result").to_string(),
            field: name.to_string(),
        }
    }
}

/// Exact match first; an unqualified name also matches a single
/// `source.name` column.
fn position(columns: &[Column], name: &str) -> Option<usize> {
    if let Some(i) = columns.iter().position(|c| c.name == name) {
        return Some(i);
    }
    if name.contains('.') {
        return None;
    }
    let suffix = format!(".{name}");
    let mut matches = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.name.ends_with(&suffix));
    match (matches.next(), matches.next()) {
        (Some((i, _)), None) => Some(i),
        _ => None,
    }
}

/// Conversion from a canonical value into a Rust type.
pub trait FromValue: Sized {
    const EXPECTED: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! from_value {
    ($t:ty, $expected:literal, $($pat:pat => $out:expr),+ $(,)?) => {
        impl FromValue for $t {
            const EXPECTED: &'static str = $expected;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    $($pat => $out,)+
                    _ => None,
                }
            }
        }
    };
}

from_value!(i64, "integer", Value::Int(i) => Some(*i));
from_value!(i32, "integer", Value::Int(i) => i32::try_from(*i).ok());
from_value!(f64, "float", Value::Float(f) => Some(*f), Value::Int(i) => Some(*i as f64));
from_value!(bool, "boolean", Value::Bool(b) => Some(*b));
from_value!(String, "text", Value::Text(s) => Some(s.clone()), Value::Geometry(g) => Some(g.clone()));
from_value!(Decimal, "decimal", Value::Decimal(d) => Some(*d), Value::Int(i) => Some(Decimal::from(*i)));
from_value!(NaiveDate, "date", Value::Date(d) => Some(*d));
from_value!(DateTime<Utc>, "datetime", Value::DateTime(dt) => Some(*dt));
from_value!(Vec<u8>, "binary", Value::Bytes(b) => Some(b.clone()));
from_value!(serde_json::Value, "json", Value::Json(j) => Some(j.clone()));

impl FromValue for Value {
    const EXPECTED: &'static str = "any";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Custom row types.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

impl FromRow for IndexMap<String, Value> {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone().into_map())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    columns: Arc<[Column]>,
    rows: Vec<Row>,
    table: Option<String>,
}

impl RowSet {
    pub(crate) fn new(columns: Vec<Column>, values: Vec<Vec<Value>>, table: Option<String>) -> Self {
        let columns: Arc<[Column]> = columns.into();
        let rows = values
            .into_iter()
            .map(|v| Row::new(Arc::clone(&columns), v, table.clone()))
            .collect();
        Self {
            columns,
            rows,
            table,
        }
    }

    fn with_rows(&self, rows: Vec<Row>) -> Self {
        Self {
            columns: Arc::clone(&self.columns),
            rows,
            table: self.table.clone(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn last(&self) -> Option<&Row> {
        self.rows.last()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn find<P: FnMut(&Row) -> bool>(&self, mut predicate: P) -> Option<&Row> {
        self.rows.iter().find(|r| predicate(r))
    }

    /// Rows matching `predicate`, as a new set.
    pub fn filter<P: FnMut(&Row) -> bool>(&self, mut predicate: P) -> RowSet {
        self.with_rows(self.rows.iter().filter(|r| predicate(r)).cloned().collect())
    }

    /// Remove the rows matching `predicate` from this set and return them.
    pub fn exclude<P: FnMut(&Row) -> bool>(&mut self, mut predicate: P) -> RowSet {
        let (removed, kept): (Vec<Row>, Vec<Row>) =
            std::mem::take(&mut self.rows).into_iter().partition(|r| predicate(r));
        self.rows = kept;
        self.with_rows(removed)
    }

    pub fn sort_by<F: FnMut(&Row, &Row) -> Ordering>(&mut self, compare: F) {
        self.rows.sort_by(compare);
    }

    /// Stable sort on one column. NULLs sort first ascending.
    pub fn sort_by_column(&mut self, name: &str, direction: Direction) -> Result<()> {
        let i = self.index_of(name)?;
        self.rows.sort_by(|a, b| {
            let ord = match (&a.values[i], &b.values[i]) {
                (Value::Null, Value::Null) => Ordering::Equal,
                (Value::Null, _) => Ordering::Less,
                (_, Value::Null) => Ordering::Greater,
                (x, y) => x.compare(y).unwrap_or(Ordering::Equal),
            };
            match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        });
        Ok(())
    }

    /// Split into groups keyed by the display form of one column, in order of
    /// first appearance.
    pub fn group_by_value(&self, name: &str) -> Result<IndexMap<String, RowSet>> {
        let i = self.index_of(name)?;
        let mut groups: IndexMap<String, Vec<Row>> = IndexMap::new();
        for row in &self.rows {
            groups
                .entry(row.values[i].display())
                .or_default()
                .push(row.clone());
        }
        Ok(groups
            .into_iter()
            .map(|(k, rows)| (k, self.with_rows(rows)))
            .collect())
    }

    pub fn column(&self, name: &str) -> Result<Vec<Value>> {
        let i = self.index_of(name)?;
        Ok(self.rows.iter().map(|r| r.values[i].clone()).collect())
    }

    /// Sum of a numeric column, skipping NULLs. Integer columns stay integral
    /// and fail on overflow; mixing in decimals yields a decimal.
    pub fn sum(&self, name: &str) -> Result<Value> {
        let i = self.index_of(name)?;
        let context = format!("sum of {name}");
        let mut total = Value::Int(0);
        for row in &self.rows {
            total = match (total, &row.values[i]) {
                (acc, Value::Null) => acc,
                (Value::Int(a), Value::Int(b)) => {
                    Value::Int(a.checked_add(*b).ok_or_else(|| DalError::OutOfRange {
                        context: context.clone(),
                        value: format!("{a} + {b}"),
                        target: FieldType::Integer,
                        reason: "integer overflow".into(),
                    })?)
                }
                (Value::Int(a), Value::Decimal(b)) => Value::Decimal(Decimal::from(a) + b),
                (Value::Decimal(a), Value::Int(b)) => Value::Decimal(a + Decimal::from(*b)),
                (Value::Decimal(a), Value::Decimal(b)) => Value::Decimal(a + b),
                (Value::Int(a), Value::Float(b)) => Value::Float(a as f64 + b),
                (Value::Float(a), Value::Int(b)) => Value::Float(a + *b as f64),
                (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                (_, other) => return Err(DalError::mismatch(context, "numeric", other.kind())),
            };
        }
        Ok(total)
    }

    pub fn decode<T: FromRow>(&self) -> Result<Vec<T>> {
        self.rows.iter().map(T::from_row).collect()
    }

    pub fn to_csv(&self) -> String {
        export::to_csv(self)
    }

    pub fn to_json(&self) -> String {
        export::to_json(self)
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        position(&self.columns, name).ok_or_else(|| DalError::UnknownField {
            table: self.table().unwrap_or("result").to_string(),
            field: name.to_string(),
        })
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> RowSet {
        RowSet::new(
            vec![
                Column {
                    name: "name".into(),
                    field_type: Some(FieldType::string(64)),
                },
                Column {
                    name: "age".into(),
                    field_type: Some(FieldType::Integer),
                },
                Column {
                    name: "city".into(),
                    field_type: Some(FieldType::Text),
                },
            ],
            vec![
                vec!["James".into(), 30.into(), "Leeds".into()],
                vec!["Ada".into(), 36.into(), "London".into()],
                vec!["Alan".into(), Value::Null, "London".into()],
            ],
            Some("person".into()),
        )
    }

    #[derive(Debug, PartialEq)]
    struct Person {
        name: String,
        age: Option<i64>,
    }

    impl FromRow for Person {
        fn from_row(row: &Row) -> Result<Self> {
            Ok(Person {
                name: row.try_get("name")?,
                age: row.try_get("age")?,
            })
        }
    }

    #[test]
    fn test_typed_access() {
        let set = people();
        let first = set.first().unwrap();
        assert_eq!(first.try_get::<String>("name").unwrap(), "James");
        assert_eq!(first.try_get::<i64>("age").unwrap(), 30);
        assert!(matches!(
            first.try_get::<bool>("age"),
            Err(DalError::TypeMismatch { .. })
        ));
        assert!(matches!(
            first.try_get::<i64>("missing"),
            Err(DalError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_decode_custom_type() {
        let people: Vec<Person> = people().decode().unwrap();
        assert_eq!(
            people[2],
            Person {
                name: "Alan".into(),
                age: None
            }
        );
    }

    #[test]
    fn test_exclude_and_sort() {
        let mut set = people();
        let londoners = set.exclude(|r| r.get("city") == Some(&Value::from("London")));
        assert_eq!(londoners.len(), 2);
        assert_eq!(set.len(), 1);

        let mut set = people();
        set.sort_by_column("age", Direction::Desc).unwrap();
        let names: Vec<Value> = set.column("name").unwrap();
        assert_eq!(names, vec!["Ada".into(), "James".into(), "Alan".into()]);
    }

    #[test]
    fn test_group_and_sum() {
        let set = people();
        let groups = set.group_by_value("city").unwrap();
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["Leeds", "London"]);
        assert_eq!(groups["London"].len(), 2);
        assert_eq!(set.sum("age").unwrap(), Value::Int(66));
        assert!(set.sum("name").is_err());
    }

    #[test]
    fn test_unqualified_lookup() {
        let set = RowSet::new(
            vec![
                Column {
                    name: "person.name".into(),
                    field_type: None,
                },
                Column {
                    name: "pet.name".into(),
                    field_type: None,
                },
                Column {
                    name: "pet.kind".into(),
                    field_type: None,
                },
            ],
            vec![vec!["James".into(), "Rex".into(), "dog".into()]],
            None,
        );
        let row = set.first().unwrap();
        assert_eq!(row.get("kind"), Some(&Value::from("dog")));
        // Two columns end in ".name": ambiguous, so no match.
        assert_eq!(row.get("name"), None);
        assert_eq!(row.get("pet.name"), Some(&Value::from("Rex")));
    }
}
