//! Backend dialects: rendering command trees into backend text.
//!
//! Every backend implements [`Dialect`]. The shared ANSI renderer in
//! [`compiler`] does most of the work and calls back into the dialect for
//! quoting, placeholders, column types, pagination and the constructs that
//! differ between backends.

pub mod classify;
pub mod compiler;
mod db2;
mod firebird;
mod informix;
mod memory;
mod mongo;
mod mssql;
mod mysql;
mod named;
mod oracle;
mod postgres;
mod sqlite;
mod teradata;

use std::fmt;
use std::sync::Arc;

pub use compiler::{Param, Rendered, SelectParts};
pub use named::bind_named;

use crate::ast::{AggregateFn, Command, Ddl, LimitSpec, ScalarFn};
use crate::codec::TypeProfile;
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldType};

/// Every backend the layer knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    Sqlite,
    Postgres,
    MySql,
    /// SQL Server 2012 and later.
    MsSql,
    /// SQL Server 2005/2008 (no OFFSET/FETCH).
    MsSql2005,
    Oracle,
    Firebird,
    Db2,
    Informix,
    Teradata,
    MongoDb,
    /// The in-process engine.
    Memory,
}

/// Schemes that name a real backend this layer has no dialect for.
const RECOGNISED_UNSUPPORTED: &[&str] = &["imap", "imaps", "google", "gae", "datastore"];

impl Backend {
    pub const ALL: [Backend; 12] = [
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

    pub fn from_scheme(scheme: &str) -> Result<Self> {
        let scheme = scheme.to_ascii_lowercase();
        Ok(match scheme.as_str() {
            "sqlite" => Backend::Sqlite,
            "postgres" | "postgresql" => Backend::Postgres,
            "mysql" => Backend::MySql,
            "mssql" => Backend::MsSql,
            "mssql2005" => Backend::MsSql2005,
            "oracle" => Backend::Oracle,
            "firebird" => Backend::Firebird,
            "db2" => Backend::Db2,
            "informix" => Backend::Informix,
            "teradata" => Backend::Teradata,
            "mongodb" => Backend::MongoDb,
            "memory" => Backend::Memory,
            other if RECOGNISED_UNSUPPORTED.contains(&other) => {
                return Err(DalError::UnsupportedBackend {
                    scheme: other.to_string(),
                    reason: "recognised but not supported by this layer".into(),
                })
            }
            other => {
                return Err(DalError::UnsupportedBackend {
                    scheme: other.to_string(),
                    reason: "unknown scheme".into(),
                })
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
            Backend::MySql => "mysql",
            Backend::MsSql => "mssql",
            Backend::MsSql2005 => "mssql2005",
            Backend::Oracle => "oracle",
            Backend::Firebird => "firebird",
            Backend::Db2 => "db2",
            Backend::Informix => "informix",
            Backend::Teradata => "teradata",
            Backend::MongoDb => "mongodb",
            Backend::Memory => "memory",
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Backend::Postgres => Some(5432),
            Backend::MySql => Some(3306),
            Backend::MsSql | Backend::MsSql2005 => Some(1433),
            Backend::Oracle => Some(1521),
            Backend::Firebird => Some(3050),
            Backend::Db2 => Some(50000),
            Backend::Informix => Some(9088),
            Backend::Teradata => Some(1025),
            Backend::MongoDb => Some(27017),
            Backend::Sqlite | Backend::Memory => None,
        }
    }

    pub fn dialect(&self) -> Arc<dyn Dialect> {
        match self {
            Backend::Sqlite => Arc::new(sqlite::SqliteDialect),
            Backend::Postgres => Arc::new(postgres::PostgresDialect),
            Backend::MySql => Arc::new(mysql::MySqlDialect),
            Backend::MsSql => Arc::new(mssql::MsSqlDialect::new(Backend::MsSql)),
            Backend::MsSql2005 => Arc::new(mssql::MsSqlDialect::new(Backend::MsSql2005)),
            Backend::Oracle => Arc::new(oracle::OracleDialect),
            Backend::Firebird => Arc::new(firebird::FirebirdDialect),
            Backend::Db2 => Arc::new(db2::Db2Dialect),
            Backend::Informix => Arc::new(informix::InformixDialect),
            Backend::Teradata => Arc::new(teradata::TeradataDialect),
            Backend::MongoDb => Arc::new(mongo::MongoDialect),
            Backend::Memory => Arc::new(memory::MemoryDialect),
        }
    }

    pub fn profile(&self) -> TypeProfile {
        TypeProfile::for_backend(*self)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Backend-specific rendering rules.
///
/// Implementations are stateless and shared between connections. Only
/// [`Dialect::backend`] and [`Dialect::column_type`] are mandatory; the rest
/// default to ANSI SQL.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn backend(&self) -> Backend;

    /// Quote an identifier, escaping embedded quote characters.
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Placeholder for the `n`-th parameter (1-based).
    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    /// Column type for a semantic field type.
    fn column_type(&self, field_type: &FieldType) -> Result<String>;

    /// Column type of an auto-increment id, without the key clause.
    fn id_column(&self) -> &'static str {
        "BIGINT GENERATED BY DEFAULT AS IDENTITY"
    }

    /// Key clause following [`Dialect::id_column`].
    fn id_key(&self) -> &'static str {
        " PRIMARY KEY"
    }

    /// A FROM/JOIN source read under an alias.
    fn table_alias(&self, table: &str, alias: &str) -> String {
        format!("{} AS {}", self.quote(table), self.quote(alias))
    }

    /// Case-insensitive LIKE.
    fn ilike(&self, left: &str, right: &str) -> String {
        format!("LOWER({left}) LIKE LOWER({right})")
    }

    /// `arg` is `*` for `COUNT(*)`.
    fn aggregate(&self, func: AggregateFn, arg: &str, distinct: bool) -> Result<String> {
        if func == AggregateFn::ArrayAgg {
            return Err(DalError::unsupported(self.backend(), format!("ARRAY_AGG({arg})")));
        }
        let distinct = if distinct { "DISTINCT " } else { "" };
        Ok(format!("{}({distinct}{arg})", func.name()))
    }

    fn function(&self, func: ScalarFn, args: &[String]) -> Result<String> {
        Ok(format!("{}({})", func.name(), args.join(", ")))
    }

    /// Wrap a geometry column read in the select list so it comes back as
    /// well-known text.
    fn geometry_read(&self, column: &str) -> Result<String> {
        Err(DalError::unsupported(self.backend(), format!("geometry column {column}")))
    }

    /// Wrap a placeholder carrying well-known text into a geometry value.
    fn geometry_write(&self, placeholder: &str, _srid: u32) -> Result<String> {
        Err(DalError::unsupported(self.backend(), format!("geometry value {placeholder}")))
    }

    /// Assemble a select with its row window applied.
    fn paginate(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        let mut sql = parts.assemble(true);
        match (limit.limit, limit.offset) {
            (None, 0) => {}
            (Some(n), 0) => sql.push_str(&format!(" LIMIT {n}")),
            (Some(n), m) => sql.push_str(&format!(" LIMIT {n} OFFSET {m}")),
            (None, m) => sql.push_str(&format!(" LIMIT {} OFFSET {m}", self.unbounded_limit())),
        }
        Ok(sql)
    }

    /// LIMIT operand meaning "no limit", for offsets without a limit.
    fn unbounded_limit(&self) -> &'static str {
        "ALL"
    }

    /// Clause appended to an insert to return the generated id.
    fn returning_id(&self, _id_column: &str) -> Option<String> {
        None
    }

    /// Whether one INSERT may carry several VALUES rows.
    fn multi_row_insert(&self) -> bool {
        true
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn supports_joins(&self) -> bool {
        true
    }

    /// Render a command into text plus ordered parameters.
    fn render(&self, command: &Command) -> Result<Rendered> {
        compiler::render(self, command)
    }

    /// Render a schema change into the statements that apply it. An empty
    /// list means the backend needs no statement for this change.
    fn render_ddl(&self, ddl: &Ddl) -> Result<Vec<String>> {
        compiler::render_ddl(self, ddl)
    }

    /// Keyword introducing a new column in ALTER TABLE.
    fn add_column_keyword(&self) -> &'static str {
        "ADD COLUMN"
    }

    fn drop_column_keyword(&self) -> &'static str {
        "DROP COLUMN"
    }

    /// Statements changing an existing column to match `field`.
    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        let mut out = vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            self.quote(table),
            self.quote(&field.name),
            self.column_type(&field.field_type)?
        )];
        let nullability = if field.nullable { "DROP" } else { "SET" };
        out.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} {nullability} NOT NULL",
            self.quote(table),
            self.quote(&field.name)
        ));
        Ok(out)
    }

    fn truncate(&self, table: &str) -> String {
        format!("TRUNCATE TABLE {}", self.quote(table))
    }
}
