//! polydal: one query interface over many database backends.
//!
//! ```text
//! Dal ─ InstanceRegistry ─ Instance ─┬─ Adapter ─┬─ Dialect   (text)
//!                                    │           ├─ Codec     (values)
//!                                    │           └─ Pool ─ Driver
//!                                    └─ Migrator ─ Ledger
//! ```

pub mod ast;
pub mod codec;
pub mod config;
pub mod dal;
pub mod db;
pub mod dialect;
pub mod error;
pub mod export;
pub mod migrate;
pub mod registry;
pub mod rows;
pub mod schema;
pub mod uri;
pub mod value;

pub use config::{DalConfig, Hooks, OpenOptions, PoolOptions};
pub use dal::Dal;
pub use db::{Affected, CallOptions, InstanceState, RawResult, RawStatement, Transaction};
pub use dialect::Backend;
pub use error::{DalError, ErrorClass, Result};
pub use migrate::{MigrateOptions, MigrationReport, TableState};
pub use registry::{Instance, InstanceRegistry};
pub use rows::{FromRow, FromValue, Row, RowSet};
pub use schema::{Field, FieldDefault, FieldType, MigrationMode, Table, Validator};
pub use uri::ConnectionUri;
pub use value::{RawValue, Value};
