//! Declared schema: semantic field types, fields and tables.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DalError, Result};
use crate::value::Value;

/// Semantic type of a field, independent of any backend's column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// Auto-increment integer primary key.
    Id,
    String { length: u32 },
    Text,
    Integer,
    Float,
    Decimal { precision: u8, scale: u8 },
    Boolean,
    Date,
    DateTime,
    Binary,
    /// Integer foreign key to the `id` of another table.
    Reference { table: String },
    Json,
    Geometry { srid: u32 },
}

impl FieldType {
    pub fn string(length: u32) -> Self {
        FieldType::String { length }
    }

    pub fn decimal(precision: u8, scale: u8) -> Self {
        FieldType::Decimal { precision, scale }
    }

    pub fn reference(table: impl Into<String>) -> Self {
        FieldType::Reference {
            table: table.into(),
        }
    }

    pub fn geometry(srid: u32) -> Self {
        FieldType::Geometry { srid }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Id
                | FieldType::Integer
                | FieldType::Float
                | FieldType::Decimal { .. }
                | FieldType::Reference { .. }
        )
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. }
        )
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, FieldType::String { .. } | FieldType::Text)
    }

    /// Whether values of `self` and `other` may be compared with each other.
    pub fn comparable_with(&self, other: &FieldType) -> bool {
        (self.is_numeric() && other.is_numeric())
            || (self.is_textual() && other.is_textual())
            || std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Type inferred for a free-standing literal.
    pub fn infer(value: &Value) -> Option<FieldType> {
        Some(match value {
            Value::Null => return None,
            Value::Bool(_) => FieldType::Boolean,
            Value::Int(_) => FieldType::Integer,
            Value::Float(_) => FieldType::Float,
            Value::Decimal(d) => FieldType::Decimal {
                precision: 28,
                scale: d.scale().min(28) as u8,
            },
            Value::Text(_) => FieldType::Text,
            Value::Bytes(_) => FieldType::Binary,
            Value::Date(_) => FieldType::Date,
            Value::DateTime(_) => FieldType::DateTime,
            Value::Json(_) => FieldType::Json,
            Value::Geometry(_) => FieldType::Geometry { srid: 4326 },
        })
    }

    /// Check that `value` belongs to this type, promoting integers into
    /// float/decimal fields. NULL passes; nullability is checked elsewhere.
    pub fn coerce(&self, value: Value, context: &str) -> Result<Value> {
        let ok = match (self, &value) {
            (_, Value::Null) => true,
            (FieldType::Id | FieldType::Integer | FieldType::Reference { .. }, Value::Int(_)) => {
                true
            }
            (FieldType::Float, Value::Int(i)) => return Ok(Value::Float(*i as f64)),
            (FieldType::Float, Value::Float(_)) => true,
            (FieldType::Decimal { .. }, Value::Int(i)) => {
                return Ok(Value::Decimal(rust_decimal::Decimal::from(*i)))
            }
            (FieldType::Decimal { .. }, Value::Decimal(_)) => true,
            (FieldType::String { .. } | FieldType::Text, Value::Text(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Date, Value::Date(_)) => true,
            (FieldType::DateTime, Value::DateTime(_)) => true,
            (FieldType::Binary, Value::Bytes(_)) => true,
            (FieldType::Json, Value::Json(_)) => true,
            (FieldType::Geometry { .. }, Value::Geometry(_)) => true,
            (FieldType::Geometry { .. }, Value::Text(wkt)) => {
                return crate::codec::normalize_wkt(wkt)
                    .map(Value::Geometry)
                    .ok_or_else(|| DalError::mismatch(context, self, "malformed WKT text"));
            }
            _ => false,
        };
        if ok {
            Ok(value)
        } else {
            Err(DalError::mismatch(context, self, value.kind()))
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Id => write!(f, "id"),
            FieldType::String { length } => write!(f, "string({length})"),
            FieldType::Text => write!(f, "text"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Float => write!(f, "float"),
            FieldType::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Date => write!(f, "date"),
            FieldType::DateTime => write!(f, "datetime"),
            FieldType::Binary => write!(f, "binary"),
            FieldType::Reference { table } => write!(f, "reference {table}"),
            FieldType::Json => write!(f, "json"),
            FieldType::Geometry { srid } => write!(f, "geometry({srid})"),
        }
    }
}

/// Value used when an insert omits a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    Value(Value),
    /// A fresh UUID string from the configured generator.
    Uuid,
    /// The current UTC time.
    Now,
}

/// Built-in validation rule attached to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    NotEmpty,
    MaxLength(usize),
    Range { min: Option<i64>, max: Option<i64> },
    OneOf(Vec<Value>),
}

impl Validator {
    /// Returns a message describing the violation, if any.
    pub fn check(&self, value: &Value) -> Option<String> {
        if value.is_null() {
            return None;
        }
        match self {
            Validator::NotEmpty => match value {
                Value::Text(s) if s.trim().is_empty() => Some("must not be empty".into()),
                Value::Bytes(b) if b.is_empty() => Some("must not be empty".into()),
                _ => None,
            },
            Validator::MaxLength(max) => match value {
                Value::Text(s) if s.chars().count() > *max => {
                    Some(format!("longer than {max} characters"))
                }
                _ => None,
            },
            Validator::Range { min, max } => {
                let n = value.as_i64()?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    Some(format!("{n} outside range {min:?}..={max:?}"))
                } else {
                    None
                }
            }
            Validator::OneOf(options) => {
                if options.contains(value) {
                    None
                } else {
                    Some(format!("{value} is not an allowed value"))
                }
            }
        }
    }
}

/// A column of a declared table.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub default: Option<FieldDefault>,
    pub unique: bool,
    pub validators: Vec<Validator>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            default: None,
            unique: false,
            validators: Vec::new(),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(FieldDefault::Value(value.into()));
        self
    }

    pub fn default_with(mut self, default: FieldDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn validate_with(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Whether an insert must supply this field explicitly.
    pub fn required(&self) -> bool {
        !self.nullable && self.default.is_none() && self.field_type != FieldType::Id
    }
}

/// Whether schema migrations run for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Compare with the backend and apply DDL.
    #[default]
    Migrate,
    /// Record the table as synchronized without running DDL or checking the
    /// backend. The caller vouches that the backend already matches.
    Fake,
    /// Never touch the backend schema.
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    pub migration: MigrationMode,
    /// Filter applied to every select/update/delete on this table unless the
    /// query opts out.
    pub default_filter: Option<crate::ast::Expr>,
    pub indexes: Vec<IndexDef>,
}

/// A declared table. Immutable once built; redefinition goes through the
/// owning [`crate::schema::Schema`].
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    fields: Vec<Field>,
    primary_key: Vec<String>,
    options: TableOptions,
}

impl Table {
    pub fn builder(name: impl Into<String>) -> TableBuilder {
        TableBuilder {
            name: name.into(),
            fields: Vec::new(),
            primary_key: None,
            options: TableOptions::default(),
            auto_id: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The auto-increment id field, if the table has one.
    pub fn id_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.field_type == FieldType::Id)
    }

    /// Resolve a field reference. Fails with `UnknownField`.
    pub fn field(&self, name: &str) -> Result<crate::ast::FieldRef> {
        let field = self.get_field(name).ok_or_else(|| DalError::UnknownField {
            table: self.name.clone(),
            field: name.to_string(),
        })?;
        Ok(crate::ast::FieldRef {
            table: self.name.clone(),
            qualifier: None,
            name: field.name.clone(),
            field_type: field.field_type.clone(),
        })
    }

    /// Every field of the table, in declaration order.
    pub fn all_fields(&self) -> Vec<crate::ast::FieldRef> {
        self.fields
            .iter()
            .map(|f| crate::ast::FieldRef {
                table: self.name.clone(),
                qualifier: None,
                name: f.name.clone(),
                field_type: f.field_type.clone(),
            })
            .collect()
    }

    /// Attach a filter applied to every select, update and delete on this
    /// table. The closure receives the table so it can resolve fields.
    pub fn with_default_filter<F>(self: Arc<Self>, build: F) -> Result<Arc<Table>>
    where
        F: FnOnce(&Table) -> Result<crate::ast::Expr>,
    {
        let filter = build(&self)?;
        if filter.result_type() != Some(FieldType::Boolean) {
            return Err(DalError::mismatch(
                format!("{} default filter", self.name),
                FieldType::Boolean,
                filter.describe(),
            ));
        }
        let mut table = (*self).clone();
        table.options.default_filter = Some(filter);
        Ok(Arc::new(table))
    }

    /// An aliased view of this table for self-joins.
    pub fn alias(self: &Arc<Self>, alias: impl Into<String>) -> crate::ast::TableAlias {
        crate::ast::TableAlias {
            table: Arc::clone(self),
            alias: alias.into(),
        }
    }
}

pub struct TableBuilder {
    name: String,
    fields: Vec<Field>,
    primary_key: Option<Vec<String>>,
    options: TableOptions,
    auto_id: bool,
}

impl TableBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Use the given fields as primary key instead of an implicit `id`.
    pub fn primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = Some(fields.into_iter().map(Into::into).collect());
        self.auto_id = false;
        self
    }

    pub fn migration(mut self, mode: MigrationMode) -> Self {
        self.options.migration = mode;
        self
    }

    pub fn index<I, S>(mut self, name: impl Into<String>, fields: I, unique: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.indexes.push(IndexDef {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique,
        });
        self
    }

    pub fn build(self) -> Result<Arc<Table>> {
        let invalid = |reason: String| DalError::InvalidSchema {
            table: self.name.clone(),
            reason,
        };

        if !is_identifier(&self.name) {
            return Err(invalid(format!("{:?} is not a valid identifier", self.name)));
        }

        let mut fields = Vec::with_capacity(self.fields.len() + 1);
        if self.auto_id && !self.fields.iter().any(|f| f.field_type == FieldType::Id) {
            fields.push(Field::new("id", FieldType::Id).not_null());
        }
        fields.extend(self.fields.iter().cloned());

        for (i, field) in fields.iter().enumerate() {
            if !is_identifier(&field.name) {
                return Err(invalid(format!(
                    "field {:?} is not a valid identifier",
                    field.name
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("duplicate field {}", field.name)));
            }
            if let Some(FieldDefault::Value(v)) = &field.default {
                field
                    .field_type
                    .coerce(v.clone(), &format!("{}.{} default", self.name, field.name))?;
            }
        }
        if fields.iter().filter(|f| f.field_type == FieldType::Id).count() > 1 {
            return Err(invalid("more than one id field".into()));
        }

        let primary_key = match self.primary_key {
            Some(pk) => pk,
            None => fields
                .iter()
                .filter(|f| f.field_type == FieldType::Id)
                .map(|f| f.name.clone())
                .collect(),
        };
        if primary_key.is_empty() {
            return Err(invalid("no primary key".into()));
        }
        for key in &primary_key {
            if !fields.iter().any(|f| &f.name == key) {
                return Err(invalid(format!("primary key field {key} is not declared")));
            }
        }
        for index in &self.options.indexes {
            if !is_identifier(&index.name) || index.fields.is_empty() {
                return Err(invalid(format!("malformed index {:?}", index.name)));
            }
            for name in &index.fields {
                if !fields.iter().any(|f| &f.name == name) {
                    return Err(invalid(format!(
                        "index {} references unknown field {name}",
                        index.name
                    )));
                }
            }
        }

        Ok(Arc::new(Table {
            name: self.name,
            fields,
            primary_key,
            options: self.options,
        }))
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Arc<Table> {
        Table::builder("person")
            .field(Field::new("name", FieldType::string(64)).not_null())
            .field(Field::new("age", FieldType::Integer))
            .build()
            .unwrap()
    }

    #[test]
    fn test_implicit_id_field() {
        let table = person();
        assert_eq!(table.fields()[0].name, "id");
        assert_eq!(table.primary_key(), &["id".to_string()]);
        assert_eq!(table.fields().len(), 3);
    }

    #[test]
    fn test_unknown_field() {
        let err = person().field("agee").unwrap_err();
        assert!(matches!(err, DalError::UnknownField { .. }));
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        assert!(Table::builder("bad name").build().is_err());
        assert!(Table::builder("t")
            .field(Field::new("x;drop", FieldType::Integer))
            .build()
            .is_err());
        assert!(Table::builder("t")
            .field(Field::new("a", FieldType::Integer))
            .field(Field::new("a", FieldType::Text))
            .build()
            .is_err());
    }

    #[test]
    fn test_custom_primary_key() {
        let table = Table::builder("country")
            .field(Field::new("code", FieldType::string(2)).not_null())
            .primary_key(["code"])
            .build()
            .unwrap();
        assert!(table.id_field().is_none());
        assert_eq!(table.primary_key(), &["code".to_string()]);
    }

    #[test]
    fn test_default_must_match_type() {
        let result = Table::builder("t")
            .field(Field::new("n", FieldType::Integer).default_value("x"))
            .build();
        assert!(matches!(result, Err(DalError::TypeMismatch { .. })));
    }

    #[test]
    fn test_coerce_promotes_integers() {
        assert_eq!(
            FieldType::Float.coerce(Value::Int(2), "t.f").unwrap(),
            Value::Float(2.0)
        );
        assert!(FieldType::Integer
            .coerce(Value::Text("30".into()), "t.age")
            .is_err());
    }

    #[test]
    fn test_validators() {
        assert!(Validator::NotEmpty.check(&Value::Text("  ".into())).is_some());
        assert!(Validator::MaxLength(3).check(&Value::Text("abcd".into())).is_some());
        assert!(Validator::Range {
            min: Some(0),
            max: Some(150)
        }
        .check(&Value::Int(30))
        .is_none());
        assert!(Validator::OneOf(vec![Value::from("a")])
            .check(&Value::from("b"))
            .is_some());
        assert!(Validator::NotEmpty.check(&Value::Null).is_none());
    }

    #[test]
    fn test_comparable_types() {
        assert!(FieldType::Integer.comparable_with(&FieldType::reference("person")));
        assert!(FieldType::string(10).comparable_with(&FieldType::Text));
        assert!(!FieldType::string(10).comparable_with(&FieldType::Integer));
    }
}
