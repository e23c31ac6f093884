//! The handle applications hold: one opened instance plus the registry it
//! came from.

use std::sync::Arc;

use tracing::debug;

use crate::ast::{self, Command, Expr, SelectBuilder, SelectQuery};
use crate::config::{DalConfig, OpenOptions};
use crate::db::{
    Adapter, Affected, CallOptions, InstanceState, PoolStatus, RawResult, RawStatement, Timing,
    Transaction,
};
use crate::error::{DalError, Result};
use crate::migrate::{LedgerEntry, MigrateOptions, MigrationReport, Plan, TableState};
use crate::registry::{Instance, InstanceRegistry};
use crate::rows::{Row, RowSet};
use crate::schema::{FieldType, Table};
use crate::value::Value;

/// Field/value pairs for inserts and updates:
///
/// ```
/// let row = polydal::values! { "name" => "James", "age" => 30 };
/// assert_eq!(row.len(), 2);
/// ```
#[macro_export]
macro_rules! values {
    ($($name:expr => $value:expr),* $(,)?) => {
        vec![$((::std::string::String::from($name), $crate::Value::from($value))),*]
    };
}

/// An open database.
///
/// Handles opened for the same URI and pool parameters share one instance.
/// Call [`Dal::close`] when done; the last close drains the pool.
#[derive(Debug)]
pub struct Dal {
    registry: Arc<InstanceRegistry>,
    instance: Arc<Instance>,
    call: CallOptions,
}

impl Dal {
    /// Open through the process-wide registry.
    pub async fn open(uri: &str, options: OpenOptions) -> Result<Self> {
        Self::open_in(InstanceRegistry::global(), uri, options).await
    }

    pub async fn open_in(
        registry: Arc<InstanceRegistry>,
        uri: &str,
        options: OpenOptions,
    ) -> Result<Self> {
        let instance = registry.open(uri, &options).await?;
        Ok(Self {
            registry,
            instance,
            call: CallOptions::new(),
        })
    }

    /// Open the named connection of a loaded config file.
    pub async fn open_config(config: &DalConfig, name: &str) -> Result<Self> {
        let connection = config.connection(name)?;
        let uri = connection.resolve_uri()?;
        let options = connection.open_options(&config.migrations)?;
        let registry = InstanceRegistry::global();
        let instance = registry.open_uri(uri, &options).await?;
        Ok(Self {
            registry,
            instance,
            call: CallOptions::new(),
        })
    }

    /// Deadline and cancellation applied to every call made through this
    /// handle that does not take its own [`CallOptions`].
    pub fn with_call_options(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        self.instance.adapter()
    }

    pub fn state(&self) -> InstanceState {
        self.instance.state()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.adapter().pool_status()
    }

    pub fn timings(&self) -> Vec<Timing> {
        self.adapter().timings()
    }

    pub fn last_statement(&self) -> Option<Timing> {
        self.adapter().last_statement()
    }

    // Schema

    /// Register a table, returning the registered definition. Defining an
    /// identical table twice is a no-op.
    pub fn define_table(&self, table: Arc<Table>) -> Result<Arc<Table>> {
        let schema = self.instance.schema();
        let fresh = !schema.contains(table.name());
        let name = table.name().to_string();
        schema.define(table)?;
        if fresh {
            self.instance.migrator().declare(&name);
        }
        schema.get(&name)
    }

    /// Swap a table definition in one step. Queries already built against
    /// the old definition fail their schema check.
    pub fn redefine_table(&self, table: Arc<Table>) -> Result<Arc<Table>> {
        let name = table.name().to_string();
        self.instance.schema().redefine(Arc::clone(&table))?;
        self.instance.migrator().declare(&name);
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.instance.schema().get(name)
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.instance.schema().tables()
    }

    // Queries

    /// Start a select over a declared table.
    pub fn select(&self, table: &str) -> Result<SelectBuilder> {
        Ok(ast::select(&self.table(table)?))
    }

    pub async fn fetch(&self, query: SelectQuery) -> Result<RowSet> {
        self.adapter().fetch(query, &self.call).await
    }

    pub async fn fetch_with(&self, query: SelectQuery, call: &CallOptions) -> Result<RowSet> {
        self.adapter().fetch(query, call).await
    }

    pub async fn execute(&self, command: impl Into<Command>) -> Result<Affected> {
        self.adapter().execute(command.into(), &self.call).await
    }

    pub async fn execute_with(
        &self,
        command: impl Into<Command>,
        call: &CallOptions,
    ) -> Result<Affected> {
        self.adapter().execute(command.into(), call).await
    }

    pub async fn insert(&self, table: &str, values: Vec<(String, Value)>) -> Result<Affected> {
        let command = ast::insert(&self.table(table)?, values)?;
        self.execute(command).await
    }

    /// Insert many rows naming the same fields. Backends without multi-row
    /// VALUES get one statement per row inside a single transaction.
    pub async fn bulk_insert(
        &self,
        table: &str,
        rows: Vec<Vec<(String, Value)>>,
    ) -> Result<Affected> {
        let command = ast::insert_many(&self.table(table)?, rows)?;
        self.execute(command).await
    }

    pub async fn update(
        &self,
        table: &str,
        filter: Option<Expr>,
        values: Vec<(String, Value)>,
    ) -> Result<Affected> {
        let command = update_command(&self.table(table)?, filter, values)?;
        self.execute(command).await
    }

    pub async fn delete(&self, table: &str, filter: Option<Expr>) -> Result<Affected> {
        let mut builder = ast::delete(&self.table(table)?);
        if let Some(filter) = filter {
            builder = builder.filter(filter);
        }
        self.execute(builder.build()?).await
    }

    pub async fn count(&self, table: &str, filter: Option<Expr>) -> Result<u64> {
        let mut builder = self.select(table)?.column_as(ast::count_all(), "n");
        if let Some(filter) = filter {
            builder = builder.filter(filter);
        }
        let rows = self.fetch(builder.build()?).await?;
        row_count(&rows)
    }

    pub async fn is_empty(&self, table: &str, filter: Option<Expr>) -> Result<bool> {
        Ok(self.count(table, filter).await? == 0)
    }

    /// Update the rows matching `filter`, or insert `values` when none match.
    /// Both steps run in one transaction.
    pub async fn update_or_insert(
        &self,
        table: &str,
        filter: Expr,
        values: Vec<(String, Value)>,
    ) -> Result<Affected> {
        let table = self.table(table)?;
        let update = update_command(&table, Some(filter), values.clone())?;
        let mut tx = self.begin().await?;
        let updated = tx.execute(update.into()).await?;
        if updated.count > 0 {
            tx.commit().await?;
            return Ok(updated);
        }
        let inserted = tx.execute(ast::insert(&table, values)?.into()).await?;
        tx.commit().await?;
        debug!(table = table.name(), "update_or_insert inserted a new row");
        Ok(inserted)
    }

    /// Load the row a reference field of `row` points at.
    pub async fn fetch_related(&self, row: &Row, field: &str) -> Result<Option<Row>> {
        let source = row.table().ok_or_else(|| DalError::InvalidSchema {
            table: "?".into(),
            reason: format!("row has no base table to resolve {field} against"),
        })?;
        let source = self.table(source)?;
        let declared = source
            .get_field(field)
            .ok_or_else(|| DalError::UnknownField {
                table: source.name().to_string(),
                field: field.to_string(),
            })?;
        let FieldType::Reference { table: target } = &declared.field_type else {
            return Err(DalError::mismatch(
                format!("{}.{field}", source.name()),
                "a reference field",
                &declared.field_type,
            ));
        };
        let value = match row.get(field) {
            None => {
                return Err(DalError::UnknownField {
                    table: source.name().to_string(),
                    field: field.to_string(),
                })
            }
            Some(v) if v.is_null() => return Ok(None),
            Some(v) => v.clone(),
        };
        let target = self.table(target)?;
        let id = target.id_field().ok_or_else(|| DalError::InvalidSchema {
            table: target.name().to_string(),
            reason: "referenced table has no id field".into(),
        })?;
        let query = ast::select(&target)
            .filter(Expr::from(target.field(&id.name)?).eq(value)?)
            .limit(1)
            .build()?;
        Ok(self.fetch(query).await?.into_rows().into_iter().next())
    }

    pub async fn begin(&self) -> Result<Transaction> {
        self.adapter().begin(self.call.clone()).await
    }

    pub async fn execute_raw(&self, raw: RawStatement) -> Result<RawResult> {
        self.adapter().execute_raw(raw, &self.call).await
    }

    // Migrations

    pub fn table_state(&self, table: &str) -> TableState {
        self.instance.migrator().state(table)
    }

    pub async fn check(&self, table: &str) -> Result<Plan> {
        self.instance.migrator().check(table, &self.call).await
    }

    pub async fn migrate(&self, table: &str, options: MigrateOptions) -> Result<MigrationReport> {
        self.instance
            .migrator()
            .migrate(table, options, &self.call)
            .await
    }

    pub async fn migrate_all(&self, options: MigrateOptions) -> Result<Vec<MigrationReport>> {
        self.instance
            .migrator()
            .migrate_all(options, &self.call)
            .await
    }

    pub fn clear_partial(&self, table: &str) -> Result<bool> {
        self.instance.migrator().clear_partial(table)
    }

    pub fn ledger_entry(&self, table: &str) -> Option<LedgerEntry> {
        self.instance.migrator().ledger_entry(table)
    }

    pub async fn drop_table(&self, table: &str) -> Result<()> {
        self.instance.migrator().drop_table(table, &self.call).await
    }

    pub async fn truncate(&self, table: &str) -> Result<()> {
        self.instance.migrator().truncate(table, &self.call).await
    }

    /// Flag the instance as a zombie; the next open of its URI rebinds it.
    pub fn mark_zombie(&self) {
        self.registry.mark_zombie(&self.instance);
    }

    pub async fn close(self) -> Result<()> {
        self.registry.close(&self.instance).await
    }
}

/// The single `n` column of a count query. A missing or negative count is
/// a backend fault, not zero rows.
fn row_count(rows: &RowSet) -> Result<u64> {
    let value = rows
        .first()
        .and_then(|r| r.get("n"))
        .cloned()
        .unwrap_or(Value::Null);
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| DalError::Parse {
            column: "n".into(),
            raw: format!("{value:?}"),
            target: FieldType::Integer,
            reason: "count is missing or negative".into(),
        })
}

fn update_command(
    table: &Arc<Table>,
    filter: Option<Expr>,
    values: Vec<(String, Value)>,
) -> Result<ast::UpdateCommand> {
    let mut builder = ast::update(table);
    for (name, value) in values {
        builder = builder.set(&name, value)?;
    }
    if let Some(filter) = filter {
        builder = builder.filter(filter);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    async fn open(name: &str) -> Dal {
        let dal = Dal::open_in(
            Arc::new(InstanceRegistry::new()),
            &format!("memory://{name}"),
            OpenOptions::default(),
        )
        .await
        .unwrap();
        dal.define_table(
            Table::builder("person")
                .field(Field::new("name", FieldType::string(32)).not_null())
                .field(Field::new("age", FieldType::Integer))
                .build()
                .unwrap(),
        )
        .unwrap();
        dal.define_table(
            Table::builder("dog")
                .field(Field::new("name", FieldType::Text))
                .field(Field::new("owner", FieldType::reference("person")))
                .build()
                .unwrap(),
        )
        .unwrap();
        dal.migrate_all(MigrateOptions::default()).await.unwrap();
        dal
    }

    #[test]
    fn test_values_macro() {
        let row = values! { "name" => "James", "age" => 30 };
        assert_eq!(row[0], ("name".to_string(), Value::from("James")));
        assert_eq!(row[1].1, Value::from(30));
    }

    #[tokio::test]
    async fn test_count_and_update_or_insert() {
        let dal = open("dal_upsert").await;
        assert!(dal.is_empty("person", None).await.unwrap());

        let person = dal.table("person").unwrap();
        let james = || {
            Expr::from(person.field("name").unwrap())
                .eq("James")
                .unwrap()
        };
        dal.update_or_insert("person", james(), values! { "name" => "James", "age" => 30 })
            .await
            .unwrap();
        dal.update_or_insert("person", james(), values! { "name" => "James", "age" => 31 })
            .await
            .unwrap();
        assert_eq!(dal.count("person", None).await.unwrap(), 1);

        let rows = dal
            .fetch(dal.select("person").unwrap().filter(james()).build().unwrap())
            .await
            .unwrap();
        assert_eq!(rows.first().unwrap().get("age"), Some(&Value::from(31)));
    }

    #[tokio::test]
    async fn test_fetch_related_follows_reference() {
        let dal = open("dal_related").await;
        let owner = dal
            .insert("person", values! { "name" => "Anna", "age" => 40 })
            .await
            .unwrap();
        let owner_id = owner.last_id.unwrap();
        dal.bulk_insert(
            "dog",
            vec![
                values! { "name" => "Rex", "owner" => owner_id },
                values! { "name" => "Stray", "owner" => Value::Null },
            ],
        )
        .await
        .unwrap();

        let dogs = dal
            .fetch(dal.select("dog").unwrap().build().unwrap())
            .await
            .unwrap();
        let rex = dogs.find(|r| r.get("name") == Some(&Value::from("Rex"))).unwrap();
        let anna = dal.fetch_related(rex, "owner").await.unwrap().unwrap();
        assert_eq!(anna.get("name"), Some(&Value::from("Anna")));

        let stray = dogs.find(|r| r.get("name") == Some(&Value::from("Stray"))).unwrap();
        assert!(dal.fetch_related(stray, "owner").await.unwrap().is_none());
        assert!(matches!(
            dal.fetch_related(rex, "name").await,
            Err(DalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_row_count_rejects_negative_or_missing() {
        let counted = |values: Vec<Vec<Value>>| {
            RowSet::new(
                vec![crate::rows::Column {
                    name: "n".into(),
                    field_type: Some(FieldType::Integer),
                }],
                values,
                None,
            )
        };
        assert_eq!(row_count(&counted(vec![vec![Value::Int(3)]])).unwrap(), 3);
        assert!(matches!(
            row_count(&counted(vec![vec![Value::Int(-1)]])),
            Err(DalError::Parse { .. })
        ));
        assert!(matches!(
            row_count(&counted(vec![vec![Value::Null]])),
            Err(DalError::Parse { .. })
        ));
        assert!(matches!(row_count(&counted(Vec::new())), Err(DalError::Parse { .. })));
    }
}
