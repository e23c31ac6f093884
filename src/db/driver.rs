//! The seam between adapters and physical drivers.
//!
//! A [`Driver`] opens [`Connection`]s for a URI. Connections speak only in
//! rendered [`Statement`]s and [`RawValue`]s; everything above them (schema,
//! rendering, value conversion) is the adapter's job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::ast::Command;
use crate::error::Result;
use crate::schema::FieldType;
use crate::uri::ConnectionUri;
use crate::value::RawValue;

/// One statement ready for a driver.
#[derive(Debug, Clone)]
pub struct Statement {
    pub text: String,
    pub params: Vec<RawValue>,
    /// The command tree the text was rendered from. Raw statements have none.
    /// Engines that evaluate trees directly read this instead of `text`.
    pub command: Option<Arc<Command>>,
    pub returns_rows: bool,
}

impl Statement {
    pub fn raw(text: impl Into<String>, params: Vec<RawValue>, returns_rows: bool) -> Self {
        Self {
            text: text.into(),
            params,
            command: None,
            returns_rows,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(DriverRows),
    Affected { count: u64, last_id: Option<i64> },
}

/// A column as the backend reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Backend type name, as the backend spells it.
    pub type_name: String,
    /// Semantic type, when the driver can map `type_name` back to one.
    pub field_type: Option<FieldType>,
    pub nullable: bool,
}

/// Persisted shape of a table, as found by introspection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<String>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A live physical connection.
///
/// Errors that leave the connection unusable must be reported as
/// [`crate::DalError::Connection`] so the pool discards it.
#[async_trait]
pub trait Connection: Send {
    async fn run(&mut self, statement: &Statement) -> Result<Outcome>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Cheap liveness check used when recycling pooled connections.
    async fn ping(&mut self) -> Result<()>;

    /// Shape of `table`, or `None` when it does not exist.
    async fn introspect(&mut self, table: &str) -> Result<Option<TableInfo>>;

    /// Whether the connection is already known to be unusable.
    fn is_broken(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn connect(&self, uri: &ConnectionUri) -> Result<Box<dyn Connection>>;
}
