//! The adapter binds one dialect, one codec and one connection pool.
//!
//! Every command follows the same path: schema check, rewrite passes,
//! insert completion (defaults and validators), rendering, parameter
//! representation, checkout, driver call, result parsing. Connections that
//! saw an error are discarded instead of returned to the pool.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{Connection, DriverRows, Outcome, Statement, TableInfo};
use super::pool::{self, map_pool_error, ConnectionPool, PoolStatus, PooledConnection};
use super::timings::{Timing, Timings};
use super::transaction::Transaction;
use super::Driver;
use crate::ast::{Command, Expr, InsertCommand, Optimizer, SelectQuery, UpdateCommand};
use crate::codec::{Codec, Parser, Representer};
use crate::config::{Hooks, OpenOptions, PoolOptions};
use crate::dialect::{bind_named, classify, Backend, Dialect};
use crate::error::{DalError, Result};
use crate::rows::{Column, RowSet};
use crate::schema::{Field, FieldDefault, FieldType, Schema};
use crate::uri::ConnectionUri;
use crate::value::{RawValue, Value};

/// Rows written by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Affected {
    pub count: u64,
    /// Generated id of the last inserted row, when the backend reports one.
    pub last_id: Option<i64>,
}

/// Per-call deadline and cancellation.
///
/// Both abort the pool checkout and the in-flight driver call. A connection
/// interrupted mid-call is discarded.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) async fn guard<T, F>(&self, during: &'static str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            result = work => result,
            _ = cancelled => Err(DalError::Cancelled { during }),
            _ = expired => Err(DalError::DeadlineExceeded { during }),
        }
    }
}

/// Lifecycle of an instance in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Active,
    /// No live connection left; the next `open` of the same signature
    /// rebinds a fresh pool.
    Zombie,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawParams {
    None,
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

/// A hand-written statement. Parameters still go through the representer
/// and results through the parser.
#[derive(Debug, Clone)]
pub struct RawStatement {
    sql: String,
    params: RawParams,
    mixed: bool,
    column_types: Vec<(String, FieldType)>,
    returns_rows: Option<bool>,
}

impl RawStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: RawParams::None,
            mixed: false,
            column_types: Vec::new(),
            returns_rows: None,
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        match &mut self.params {
            RawParams::None => self.params = RawParams::Positional(vec![value.into()]),
            RawParams::Positional(values) => values.push(value.into()),
            RawParams::Named(_) => self.mixed = true,
        }
        self
    }

    /// Bind a value for every `:name` occurrence.
    pub fn bind_named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self.params {
            RawParams::None => self.params = RawParams::Named(vec![(name.into(), value.into())]),
            RawParams::Named(values) => values.push((name.into(), value.into())),
            RawParams::Positional(_) => self.mixed = true,
        }
        self
    }

    /// Declare the semantic type of a result column so it parses strictly.
    pub fn column_type(mut self, column: impl Into<String>, field_type: FieldType) -> Self {
        self.column_types.push((column.into(), field_type));
        self
    }

    /// Override the row-returning guess made from the statement text.
    pub fn returns_rows(mut self, returns_rows: bool) -> Self {
        self.returns_rows = Some(returns_rows);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Rows(RowSet),
    Affected(Affected),
}

impl RawResult {
    pub fn into_rows(self) -> Result<RowSet> {
        match self {
            RawResult::Rows(rows) => Ok(rows),
            RawResult::Affected(_) => Err(DalError::mismatch("raw statement", "rows", "affected count")),
        }
    }

    pub fn affected(&self) -> Option<Affected> {
        match self {
            RawResult::Affected(a) => Some(*a),
            RawResult::Rows(_) => None,
        }
    }
}

pub struct Adapter {
    uri: ConnectionUri,
    dialect: Arc<dyn Dialect>,
    codec: Arc<dyn Codec>,
    driver: Arc<dyn Driver>,
    pool: RwLock<ConnectionPool>,
    pool_options: PoolOptions,
    schema: Arc<Schema>,
    optimizer: Optimizer,
    hooks: Hooks,
    timings: Mutex<Timings>,
    state: Mutex<InstanceState>,
    /// Held while a zombie's pool is being replaced.
    rebinding: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("uri", &self.uri)
            .field("driver", &self.driver.name())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Adapter {
    /// Build the pool and make sure at least one connection can be opened,
    /// retrying with exponential backoff.
    pub async fn connect(
        uri: ConnectionUri,
        driver: Arc<dyn Driver>,
        dialect: Arc<dyn Dialect>,
        codec: Arc<dyn Codec>,
        schema: Arc<Schema>,
        options: &OpenOptions,
    ) -> Result<Self> {
        let pool = pool::build_pool(Arc::clone(&driver), uri.clone(), &options.pool)?;
        warm_up(&pool, &options.pool).await?;
        info!(uri = %uri, driver = driver.name(), max_size = options.pool.max_size, "adapter connected");
        Ok(Self {
            uri,
            dialect,
            codec,
            driver,
            pool: RwLock::new(pool),
            pool_options: options.pool.clone(),
            schema,
            optimizer: Optimizer::with_defaults(),
            hooks: options.hooks.clone(),
            timings: Mutex::new(Timings::new(options.timings_capacity)),
            state: Mutex::new(InstanceState::Active),
            rebinding: tokio::sync::Mutex::new(()),
        })
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    pub fn backend(&self) -> Backend {
        self.dialect.backend()
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    pub fn pool_status(&self) -> PoolStatus {
        pool::status(&self.pool.read())
    }

    pub fn timings(&self) -> Vec<Timing> {
        self.timings.lock().entries()
    }

    pub fn last_statement(&self) -> Option<Timing> {
        self.timings.lock().last().cloned()
    }

    pub fn mark_zombie(&self) {
        let mut state = self.state.lock();
        if *state == InstanceState::Active {
            warn!(uri = %self.uri, "instance marked zombie");
            *state = InstanceState::Zombie;
        }
    }

    /// Replace the pool with a fresh one and return to Active. Concurrent
    /// callers wait for the first; only a still-zombie adapter is rebound.
    pub(crate) async fn rebind(&self) -> Result<()> {
        let _rebinding = self.rebinding.lock().await;
        if *self.state.lock() != InstanceState::Zombie {
            return Ok(());
        }
        let fresh = pool::build_pool(Arc::clone(&self.driver), self.uri.clone(), &self.pool_options)?;
        warm_up(&fresh, &self.pool_options).await?;
        let old = std::mem::replace(&mut *self.pool.write(), fresh);
        old.close();
        *self.state.lock() = InstanceState::Active;
        info!(uri = %self.uri, "zombie instance reclaimed with a fresh pool");
        Ok(())
    }

    /// Stop accepting work and close the pool once in-flight checkouts are
    /// back, or the grace period runs out.
    pub(crate) async fn drain(&self) -> bool {
        *self.state.lock() = InstanceState::Closed;
        let pool = self.pool.read().clone();
        let clean = pool::drain(&pool, self.pool_options.drain_grace()).await;
        info!(uri = %self.uri, clean, "adapter closed");
        clean
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.state.lock() == InstanceState::Closed {
            return Err(DalError::Closed(self.uri.to_string()));
        }
        Ok(())
    }

    /// Schema check, rewrite passes and insert completion.
    pub(crate) fn prepare(&self, command: Command) -> Result<Command> {
        self.schema.check(&command)?;
        let command = self.optimizer.optimize(command)?;
        Ok(match command {
            Command::Insert(insert) => Command::Insert(self.complete_insert(insert)?),
            Command::Update(update) => {
                self.validate_update(&update)?;
                Command::Update(update)
            }
            other => other,
        })
    }

    /// Fill in defaults for omitted fields and run validators.
    fn complete_insert(&self, mut insert: InsertCommand) -> Result<InsertCommand> {
        let table = Arc::clone(&insert.table);
        for field in table.fields() {
            if insert.columns.contains(&field.name) {
                continue;
            }
            match &field.default {
                Some(default) => {
                    insert.columns.push(field.name.clone());
                    for row in &mut insert.rows {
                        row.push(self.default_value(field, default)?);
                    }
                }
                None if field.required() => {
                    return Err(DalError::Validation {
                        table: table.name().to_string(),
                        field: field.name.clone(),
                        message: "required field missing".into(),
                    })
                }
                None => {}
            }
        }
        for row in &insert.rows {
            for (name, value) in insert.columns.iter().zip(row) {
                if let Some(field) = table.get_field(name) {
                    self.validate(table.name(), field, value)?;
                }
            }
        }
        Ok(insert)
    }

    fn default_value(&self, field: &Field, default: &FieldDefault) -> Result<Value> {
        let value = match default {
            FieldDefault::Value(v) => v.clone(),
            FieldDefault::Uuid => Value::Text(self.hooks.new_uuid()),
            FieldDefault::Now => Value::DateTime(Utc::now()),
        };
        field.field_type.coerce(value, &field.name)
    }

    fn validate_update(&self, update: &UpdateCommand) -> Result<()> {
        for (name, expr) in &update.assignments {
            if let (Some(field), Expr::Literal { value, .. }) = (update.table.get_field(name), expr) {
                self.validate(update.table.name(), field, value)?;
            }
        }
        Ok(())
    }

    fn validate(&self, table: &str, field: &Field, value: &Value) -> Result<()> {
        let fail = |message: String| DalError::Validation {
            table: table.to_string(),
            field: field.name.clone(),
            message,
        };
        if value.is_null() && !field.nullable && field.field_type != FieldType::Id {
            return Err(fail("must not be null".into()));
        }
        for validator in &field.validators {
            if let Some(message) = validator.check(value) {
                return Err(fail(message));
            }
        }
        for check in self.hooks.validators_for(table, &field.name) {
            if let Some(message) = check(value) {
                return Err(fail(message));
            }
        }
        Ok(())
    }

    /// Render and represent one command.
    pub(crate) fn lower_one(&self, command: &Command) -> Result<Statement> {
        let rendered = self.dialect.render(command)?;
        let params = rendered
            .params
            .iter()
            .map(|p| self.codec.represent(&p.value, &p.field_type))
            .collect::<Result<Vec<_>>>()?;
        let returning = match command {
            Command::Insert(insert) => insert
                .table
                .id_field()
                .is_some_and(|id| self.dialect.returning_id(&id.name).is_some()),
            _ => false,
        };
        Ok(Statement {
            text: rendered.text,
            params,
            command: Some(Arc::new(command.clone())),
            returns_rows: command.returns_rows() || returning,
        })
    }

    /// Render a prepared command into the statements that implement it.
    /// Multi-row inserts become one statement per row on backends without
    /// multi-row VALUES.
    pub(crate) fn lower(&self, command: &Command) -> Result<Vec<Statement>> {
        match command {
            Command::Insert(insert) if insert.rows.len() > 1 && !self.dialect.multi_row_insert() => {
                insert
                    .rows
                    .iter()
                    .map(|row| {
                        self.lower_one(&Command::Insert(InsertCommand {
                            table: Arc::clone(&insert.table),
                            columns: insert.columns.clone(),
                            rows: vec![row.clone()],
                        }))
                    })
                    .collect()
            }
            other => Ok(vec![self.lower_one(other)?]),
        }
    }

    pub(crate) fn lower_raw(&self, raw: &RawStatement) -> Result<Statement> {
        if raw.mixed {
            return Err(DalError::Config(
                "raw statement mixes positional and named parameters".into(),
            ));
        }
        let (text, values) = match &raw.params {
            RawParams::None => (raw.sql.clone(), Vec::new()),
            RawParams::Positional(values) => (raw.sql.clone(), values.clone()),
            RawParams::Named(bound) => {
                let (text, names) = bind_named(&raw.sql, self.dialect.as_ref())?;
                let values = names
                    .iter()
                    .map(|name| {
                        bound
                            .iter()
                            .find(|(k, _)| k == name)
                            .map(|(_, v)| v.clone())
                            .ok_or_else(|| {
                                DalError::Config(format!("no value bound for parameter :{name}"))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                (text, values)
            }
        };
        let params = values
            .iter()
            .map(|v| {
                let field_type = FieldType::infer(v).unwrap_or(FieldType::Text);
                self.codec.represent(v, &field_type)
            })
            .collect::<Result<Vec<_>>>()?;
        let returns_rows = raw
            .returns_rows
            .unwrap_or_else(|| classify::returns_rows(self.backend(), &text));
        Ok(Statement::raw(text, params, returns_rows))
    }

    pub(crate) async fn checkout(&self, call: &CallOptions) -> Result<PooledConnection> {
        self.ensure_open()?;
        let pool = self.pool.read().clone();
        let result = call
            .guard("pool checkout", async {
                pool.get()
                    .await
                    .map_err(|e| map_pool_error(e, &self.pool_options))
            })
            .await;
        if let Err(DalError::Connection { .. }) = &result {
            self.note_connection_loss();
        }
        result
    }

    pub(crate) fn discard(&self, conn: PooledConnection, error: &DalError) {
        warn!(backend = %self.backend(), error = %error, "discarding connection after error");
        pool::discard(conn);
        if matches!(error, DalError::Connection { .. }) {
            self.note_connection_loss();
        }
    }

    fn note_connection_loss(&self) {
        let status = self.pool_status();
        if status.in_use + status.idle == 0 {
            self.mark_zombie();
        }
    }

    /// Run one statement, recording its timing.
    pub(crate) async fn run(
        &self,
        conn: &mut Box<dyn Connection>,
        statement: &Statement,
        call: &CallOptions,
    ) -> Result<Outcome> {
        let started_at = Utc::now();
        let start = StdInstant::now();
        let result = call.guard("statement", conn.run(statement)).await;
        let duration = start.elapsed();
        let rows = match &result {
            Ok(Outcome::Rows(r)) => r.rows.len() as u64,
            Ok(Outcome::Affected { count, .. }) => *count,
            Err(_) => 0,
        };
        debug!(
            backend = %self.backend(),
            statement = %statement.text,
            params = statement.params.len(),
            ?duration,
            rows,
            ok = result.is_ok(),
            "statement"
        );
        self.timings.lock().add(Timing {
            statement: statement.text.clone(),
            started_at,
            duration,
            rows,
            success: result.is_ok(),
        });
        result
    }

    /// Run statements in order on one connection. Several statements run
    /// inside their own transaction unless `in_transaction`.
    pub(crate) async fn run_batch(
        &self,
        conn: &mut Box<dyn Connection>,
        statements: &[Statement],
        call: &CallOptions,
        in_transaction: bool,
    ) -> Result<Vec<Outcome>> {
        let wrap = statements.len() > 1 && !in_transaction;
        if wrap {
            call.guard("begin", conn.begin()).await?;
        }
        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            match self.run(conn, statement, call).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    if wrap {
                        if let Err(rb) = conn.rollback().await {
                            warn!(error = %rb, "rollback after failed batch also failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        if wrap {
            call.guard("commit", conn.commit()).await?;
        }
        Ok(outcomes)
    }

    async fn run_autocommit(
        &self,
        statements: &[Statement],
        call: &CallOptions,
    ) -> Result<Vec<Outcome>> {
        let mut conn = self.checkout(call).await?;
        match self.run_batch(&mut conn, statements, call, false).await {
            Ok(outcomes) => Ok(outcomes),
            Err(e) => {
                self.discard(conn, &e);
                Err(e)
            }
        }
    }

    pub async fn execute(&self, command: Command, call: &CallOptions) -> Result<Affected> {
        let command = self.prepare(command)?;
        let statements = self.lower(&command)?;
        let outcomes = self.run_autocommit(&statements, call).await?;
        Ok(affected(outcomes))
    }

    pub async fn fetch(&self, query: SelectQuery, call: &CallOptions) -> Result<RowSet> {
        let command = self.prepare(Command::Select(Box::new(query)))?;
        let statement = self.lower_one(&command)?;
        let mut outcomes = self
            .run_autocommit(std::slice::from_ref(&statement), call)
            .await?;
        self.to_rowset(&command, outcomes.pop())
    }

    pub async fn execute_raw(&self, raw: RawStatement, call: &CallOptions) -> Result<RawResult> {
        let statement = self.lower_raw(&raw)?;
        let mut outcomes = self
            .run_autocommit(std::slice::from_ref(&statement), call)
            .await?;
        self.to_raw_result(&raw, outcomes.pop())
    }

    pub async fn introspect(&self, table: &str, call: &CallOptions) -> Result<Option<TableInfo>> {
        let mut conn = self.checkout(call).await?;
        match call.guard("introspection", conn.introspect(table)).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.discard(conn, &e);
                Err(e)
            }
        }
    }

    /// Open a transaction pinned to one pooled connection.
    pub async fn begin(self: &Arc<Self>, call: CallOptions) -> Result<Transaction> {
        let mut conn = self.checkout(&call).await?;
        if let Err(e) = call.guard("begin", conn.begin()).await {
            self.discard(conn, &e);
            return Err(e);
        }
        debug!(backend = %self.backend(), "transaction started");
        Ok(Transaction::new(Arc::clone(self), conn, call))
    }

    pub(crate) fn to_rowset(&self, command: &Command, outcome: Option<Outcome>) -> Result<RowSet> {
        let Command::Select(query) = command else {
            return Err(DalError::mismatch("fetch", "select", command.kind()));
        };
        let driver_rows = expect_rows(outcome, self.backend())?;
        let columns: Vec<Column> = query
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                field_type: c.expr.result_type(),
            })
            .collect();
        let values = self.parse_rows(&columns, driver_rows)?;
        Ok(RowSet::new(columns, values, Some(query.table.name().to_string())))
    }

    pub(crate) fn to_raw_result(
        &self,
        raw: &RawStatement,
        outcome: Option<Outcome>,
    ) -> Result<RawResult> {
        match outcome {
            Some(Outcome::Affected { count, last_id }) => {
                Ok(RawResult::Affected(Affected { count, last_id }))
            }
            other => {
                let driver_rows = expect_rows(other, self.backend())?;
                let columns: Vec<Column> = driver_rows
                    .columns
                    .iter()
                    .map(|name| Column {
                        name: name.clone(),
                        field_type: raw
                            .column_types
                            .iter()
                            .find(|(c, _)| c == name)
                            .map(|(_, t)| t.clone()),
                    })
                    .collect();
                let values = self.parse_rows(&columns, driver_rows)?;
                Ok(RawResult::Rows(RowSet::new(columns, values, None)))
            }
        }
    }

    fn parse_rows(&self, columns: &[Column], driver_rows: DriverRows) -> Result<Vec<Vec<Value>>> {
        driver_rows
            .rows
            .into_iter()
            .map(|raw_row| {
                if raw_row.len() != columns.len() {
                    return Err(DalError::Statement {
                        backend: self.backend().to_string(),
                        code: None,
                        message: format!(
                            "driver returned {} values for {} columns",
                            raw_row.len(),
                            columns.len()
                        ),
                    });
                }
                raw_row
                    .into_iter()
                    .zip(columns)
                    .map(|(raw, column)| match &column.field_type {
                        Some(t) => self.codec.parse(raw, t, &column.name),
                        None => Ok(self.codec.parse_untyped(raw)),
                    })
                    .collect()
            })
            .collect()
    }
}

fn expect_rows(outcome: Option<Outcome>, backend: Backend) -> Result<DriverRows> {
    match outcome {
        Some(Outcome::Rows(rows)) => Ok(rows),
        _ => Err(DalError::Statement {
            backend: backend.to_string(),
            code: None,
            message: "statement returned no result set".into(),
        }),
    }
}

/// Fold per-statement outcomes into one count. Inserts with RETURNING report
/// the generated ids as rows.
pub(crate) fn affected(outcomes: Vec<Outcome>) -> Affected {
    let mut total = Affected::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Affected { count, last_id } => {
                total.count += count;
                total.last_id = last_id.or(total.last_id);
            }
            Outcome::Rows(rows) => {
                total.count += rows.rows.len() as u64;
                if let Some(RawValue::Int(id)) = rows.rows.last().and_then(|r| r.first()) {
                    total.last_id = Some(*id);
                }
            }
        }
    }
    total
}

async fn warm_up(pool: &ConnectionPool, options: &PoolOptions) -> Result<()> {
    let attempts = options.connect_attempts.max(1);
    let mut delay = options.backoff();
    let mut attempt = 1;
    loop {
        match pool.get().await {
            Ok(conn) => {
                drop(conn);
                return Ok(());
            }
            Err(e) => {
                let err = map_pool_error(e, options);
                if attempt >= attempts || !err.is_retryable() {
                    return Err(err);
                }
                warn!(attempt, error = %err, ?delay, "connection attempt failed; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affected_folds_outcomes() {
        let total = affected(vec![
            Outcome::Affected {
                count: 1,
                last_id: Some(4),
            },
            Outcome::Rows(DriverRows {
                columns: vec!["id".into()],
                rows: vec![vec![RawValue::Int(5)]],
            }),
        ]);
        assert_eq!(
            total,
            Affected {
                count: 2,
                last_id: Some(5)
            }
        );
    }

    #[test]
    fn test_raw_statement_mixing_is_flagged() {
        let raw = RawStatement::new("SELECT :a, ?").bind_named("a", 1).bind(2);
        assert!(raw.mixed);
    }

    #[tokio::test]
    async fn test_call_options_deadline() {
        let call = CallOptions::new().timeout(Duration::from_millis(20));
        let err = call
            .guard("statement", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DalError::DeadlineExceeded { during: "statement" }));
    }

    #[tokio::test]
    async fn test_call_options_cancel() {
        let token = CancellationToken::new();
        let call = CallOptions::new().cancel_token(token.clone());
        token.cancel();
        let err = call
            .guard("pool checkout", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, DalError::Cancelled { .. }));
    }
}
