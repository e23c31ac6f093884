//! Schema migrator: brings backend tables in line with declared ones.
//!
//! ```text
//! Undeclared → Declared → Synchronized | Drifted
//!                              ↓
//!                          Migrating → Synchronized | Drifted | Failed
//! ```
//!
//! Backends with transactional DDL apply a table's changes in one
//! transaction. Elsewhere a failure after some DDL went through leaves a
//! partial-migration marker in the ledger, and the table refuses further
//! migrations until [`Migrator::clear_partial`] is called.

pub mod diff;
pub mod ledger;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

pub use self::diff::Plan;
pub use self::ledger::{ColumnSnapshot, Ledger, LedgerEntry, PartialMarker};
use crate::ast::{Command, Ddl};
use crate::db::{Adapter, CallOptions};
use crate::error::{DalError, Result};
use crate::schema::{FieldType, MigrationMode, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Undeclared,
    Declared,
    Synchronized,
    Drifted,
    Migrating,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    /// Allow dropping columns and narrowing or changing column types.
    pub force: bool,
}

impl MigrateOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub table: String,
    /// DDL applied, in order.
    pub applied: Vec<String>,
    /// Destructive changes held back for lack of `force`.
    pub skipped: Vec<String>,
    pub state: TableState,
}

pub struct Migrator {
    adapter: Arc<Adapter>,
    ledger: Mutex<Ledger>,
    states: Mutex<HashMap<String, TableState>>,
    /// Migrations on one instance run one at a time.
    running: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("states", &*self.states.lock())
            .finish()
    }
}

impl Migrator {
    pub fn new(adapter: Arc<Adapter>, ledger: Ledger) -> Self {
        Self {
            adapter,
            ledger: Mutex::new(ledger),
            states: Mutex::new(HashMap::new()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Note that `table` was (re)declared; its backend state is unknown until
    /// checked or migrated.
    pub fn declare(&self, table: &str) {
        self.states
            .lock()
            .insert(table.to_string(), TableState::Declared);
    }

    pub fn state(&self, table: &str) -> TableState {
        if !self.adapter.schema().contains(table) {
            return TableState::Undeclared;
        }
        self.states
            .lock()
            .get(table)
            .copied()
            .unwrap_or(TableState::Declared)
    }

    fn set_state(&self, table: &str, state: TableState) {
        self.states.lock().insert(table.to_string(), state);
    }

    pub fn ledger_entry(&self, table: &str) -> Option<LedgerEntry> {
        self.ledger.lock().entry(table).cloned()
    }

    /// Introspect without changing anything. Returns the changes a migration
    /// would make and moves the table to Synchronized or Drifted.
    pub async fn check(&self, table: &str, call: &CallOptions) -> Result<Plan> {
        let declared = self.adapter.schema().get(table)?;
        let found = self.adapter.introspect(table, call).await?;
        let plan = diff::plan(&declared, found.as_ref(), true);
        let state = if plan.is_empty() {
            TableState::Synchronized
        } else {
            TableState::Drifted
        };
        self.set_state(table, state);
        Ok(plan)
    }

    pub async fn migrate(
        &self,
        table: &str,
        options: MigrateOptions,
        call: &CallOptions,
    ) -> Result<MigrationReport> {
        let _running = self.running.lock().await;
        let declared = self.adapter.schema().get(table)?;

        if let Some(marker) = self.ledger.lock().partial(table) {
            return Err(DalError::MigrationFailed {
                table: table.to_string(),
                message: format!(
                    "an earlier migration was partially applied ({}); repair the table and clear the marker",
                    marker.message
                ),
                partial: true,
            });
        }

        match declared.options().migration {
            MigrationMode::Off => {
                return Ok(MigrationReport {
                    table: table.to_string(),
                    applied: Vec::new(),
                    skipped: Vec::new(),
                    state: self.state(table),
                })
            }
            MigrationMode::Fake => {
                {
                    let mut ledger = self.ledger.lock();
                    ledger.record_synchronized(&declared, true);
                    ledger.save()?;
                }
                self.set_state(table, TableState::Synchronized);
                info!(table, "table recorded as migrated without running DDL");
                return Ok(MigrationReport {
                    table: table.to_string(),
                    applied: Vec::new(),
                    skipped: Vec::new(),
                    state: TableState::Synchronized,
                });
            }
            MigrationMode::Migrate => {}
        }

        self.set_state(table, TableState::Migrating);
        let result = self.apply(&declared, options, call).await;
        match result {
            Ok((applied, skipped)) => {
                let recorded = {
                    let mut ledger = self.ledger.lock();
                    ledger.record_synchronized(&declared, false);
                    ledger.save()
                };
                if let Err(err) = recorded {
                    // The DDL went through but the ledger no longer says so.
                    self.set_state(table, TableState::Failed);
                    return Err(err);
                }
                let state = if skipped.is_empty() {
                    TableState::Synchronized
                } else {
                    TableState::Drifted
                };
                self.set_state(table, state);
                for change in &skipped {
                    warn!(table, change = change.as_str(), "destructive change skipped without force");
                }
                info!(table, applied = applied.len(), skipped = skipped.len(), "table migrated");
                Ok(MigrationReport {
                    table: table.to_string(),
                    applied,
                    skipped,
                    state,
                })
            }
            Err(err) => {
                self.set_state(table, TableState::Failed);
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        table: &Arc<Table>,
        options: MigrateOptions,
        call: &CallOptions,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let name = table.name();
        let found = self.adapter.introspect(name, call).await?;
        let plan = diff::plan(table, found.as_ref(), options.force);
        if plan.steps.is_empty() {
            return Ok((Vec::new(), plan.skipped));
        }

        let failed = |step: &Ddl, err: DalError, partial: bool| DalError::MigrationFailed {
            table: name.to_string(),
            message: format!("{step}: {err}"),
            partial,
        };

        let mut applied = Vec::with_capacity(plan.steps.len());
        if self.adapter.dialect().supports_transactional_ddl() {
            // A failed statement poisons the transaction, which rolls it back.
            let mut tx = self.adapter.begin(call.clone()).await?;
            for step in &plan.steps {
                tx.execute(Command::Ddl(step.clone()))
                    .await
                    .map_err(|e| failed(step, e, false))?;
                applied.push(step.to_string());
            }
            tx.commit().await.map_err(|e| DalError::MigrationFailed {
                table: name.to_string(),
                message: format!("commit: {e}"),
                partial: false,
            })?;
        } else {
            for step in &plan.steps {
                if let Err(e) = self.adapter.execute(Command::Ddl(step.clone()), call).await {
                    let partial = !applied.is_empty();
                    if partial {
                        let mut ledger = self.ledger.lock();
                        ledger.record_partial(name, format!("{step}: {e}"), applied.clone());
                        ledger.save()?;
                        warn!(table = name, applied = applied.len(), error = %e, "migration left partially applied");
                    }
                    return Err(failed(step, e, partial));
                }
                applied.push(step.to_string());
            }
        }
        Ok((applied, plan.skipped))
    }

    /// Migrate every declared table in declaration order, stopping at the
    /// first failure.
    pub async fn migrate_all(
        &self,
        options: MigrateOptions,
        call: &CallOptions,
    ) -> Result<Vec<MigrationReport>> {
        let mut reports = Vec::new();
        for table in self.adapter.schema().tables() {
            reports.push(self.migrate(table.name(), options, call).await?);
        }
        Ok(reports)
    }

    /// Remove the partial-migration marker after the operator repaired the
    /// table by hand. Returns whether a marker was present.
    pub fn clear_partial(&self, table: &str) -> Result<bool> {
        let mut ledger = self.ledger.lock();
        let cleared = ledger.clear_partial(table);
        if cleared {
            ledger.save()?;
            info!(table, "partial migration marker cleared");
            drop(ledger);
            self.set_state(table, TableState::Declared);
        }
        Ok(cleared)
    }

    /// Drop the backend table and forget its declaration.
    pub async fn drop_table(&self, table: &str, call: &CallOptions) -> Result<()> {
        let _running = self.running.lock().await;
        self.adapter.schema().get(table)?;
        if let Some(referrer) = self.adapter.schema().tables().iter().find(|t| {
            t.name() != table
                && t.fields().iter().any(
                    |f| matches!(&f.field_type, FieldType::Reference { table: target } if target == table),
                )
        }) {
            return Err(DalError::InvalidSchema {
                table: table.to_string(),
                reason: format!("still referenced by {}", referrer.name()),
            });
        }
        self.adapter
            .execute(
                Command::Ddl(Ddl::DropTable {
                    table: table.to_string(),
                }),
                call,
            )
            .await?;
        self.adapter.schema().remove(table);
        {
            let mut ledger = self.ledger.lock();
            ledger.forget(table);
            ledger.save()?;
        }
        self.states.lock().remove(table);
        info!(table, "table dropped");
        Ok(())
    }

    pub async fn truncate(&self, table: &str, call: &CallOptions) -> Result<()> {
        self.adapter.schema().get(table)?;
        self.adapter
            .execute(
                Command::Ddl(Ddl::Truncate {
                    table: table.to_string(),
                }),
                call,
            )
            .await?;
        info!(table, "table truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ProfileCodec;
    use crate::config::{utc, OpenOptions};
    use crate::db::MemoryDriver;
    use crate::dialect::Backend;
    use crate::schema::{Field, Schema};
    use crate::uri::ConnectionUri;

    async fn migrator(uri: &str, driver: Arc<MemoryDriver>) -> Migrator {
        let uri = ConnectionUri::parse(uri).unwrap();
        let backend = uri.backend();
        let adapter = Adapter::connect(
            uri,
            driver,
            backend.dialect(),
            Arc::new(ProfileCodec::for_backend(backend, utc())),
            Arc::new(Schema::new()),
            &OpenOptions::default(),
        )
        .await
        .unwrap();
        Migrator::new(Arc::new(adapter), Ledger::in_memory())
    }

    fn person(extra: Vec<Field>) -> Arc<Table> {
        let mut builder = Table::builder("person")
            .field(Field::new("name", FieldType::string(32)).not_null())
            .field(Field::new("age", FieldType::Integer));
        for field in extra {
            builder = builder.field(field);
        }
        builder.index("person_name", ["name"], false).build().unwrap()
    }

    #[tokio::test]
    async fn test_second_migration_is_a_no_op() {
        let m = migrator("memory://migrate_noop", Arc::new(MemoryDriver::new())).await;
        m.adapter.schema().define(person(vec![])).unwrap();
        assert_eq!(m.state("person"), TableState::Declared);
        assert_eq!(m.state("dog"), TableState::Undeclared);

        let call = CallOptions::new();
        let first = m.migrate("person", MigrateOptions::default(), &call).await.unwrap();
        assert_eq!(first.applied, vec!["create table person".to_string()]);
        assert_eq!(first.state, TableState::Synchronized);

        let second = m.migrate("person", MigrateOptions::default(), &call).await.unwrap();
        assert!(second.applied.is_empty());
        assert!(second.skipped.is_empty());
        assert_eq!(m.ledger_entry("person").unwrap().columns.len(), 3);
    }

    #[tokio::test]
    async fn test_dropped_field_needs_force() {
        let m = migrator("memory://migrate_force", Arc::new(MemoryDriver::new())).await;
        let call = CallOptions::new();
        m.adapter
            .schema()
            .define(person(vec![Field::new("nickname", FieldType::Text)]))
            .unwrap();
        m.migrate("person", MigrateOptions::default(), &call).await.unwrap();

        m.adapter.schema().redefine(person(vec![])).unwrap();
        m.declare("person");
        let held = m.migrate("person", MigrateOptions::default(), &call).await.unwrap();
        assert!(held.applied.is_empty());
        assert_eq!(held.skipped, vec!["drop column person.nickname".to_string()]);
        assert_eq!(held.state, TableState::Drifted);

        let forced = m.migrate("person", MigrateOptions::forced(), &call).await.unwrap();
        assert_eq!(forced.applied.len(), 1);
        assert_eq!(forced.state, TableState::Synchronized);
        assert!(m.check("person", &call).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fake_migration_runs_no_ddl() {
        let m = migrator("memory://migrate_fake", Arc::new(MemoryDriver::new())).await;
        let table = Table::builder("legacy")
            .field(Field::new("code", FieldType::Text))
            .migration(MigrationMode::Fake)
            .build()
            .unwrap();
        m.adapter.schema().define(table).unwrap();
        let call = CallOptions::new();
        let report = m.migrate("legacy", MigrateOptions::default(), &call).await.unwrap();
        assert_eq!(report.state, TableState::Synchronized);
        assert!(m.ledger_entry("legacy").unwrap().fake);
        assert!(m.adapter.introspect("legacy", &call).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_migration_blocks_until_cleared() {
        // The MySQL dialect has no transactional DDL; the memory engine
        // executes the statements.
        let driver = Arc::new(MemoryDriver::new());
        let m = migrator("mysql://app@partial/app", driver).await;
        assert_eq!(m.adapter.backend(), Backend::MySql);
        let call = CallOptions::new();
        m.adapter.schema().define(person(vec![])).unwrap();
        m.migrate("person", MigrateOptions::default(), &call).await.unwrap();
        m.adapter
            .execute(
                crate::ast::insert(
                    &m.adapter.schema().get("person").unwrap(),
                    [("name", crate::value::Value::from("James")), ("age", 30.into())],
                )
                .unwrap()
                .into(),
                &call,
            )
            .await
            .unwrap();

        m.adapter
            .schema()
            .redefine(person(vec![
                Field::new("email", FieldType::Text),
                Field::new("code", FieldType::Text).not_null(),
            ]))
            .unwrap();
        let err = m
            .migrate("person", MigrateOptions::default(), &call)
            .await
            .unwrap_err();
        assert!(matches!(err, DalError::MigrationFailed { partial: true, .. }));
        assert_eq!(m.state("person"), TableState::Failed);
        let marker = m.ledger_entry("person").unwrap().partial.unwrap();
        assert_eq!(marker.applied.len(), 1);
        assert!(marker.applied[0].starts_with("add column person.email"));

        let again = m
            .migrate("person", MigrateOptions::default(), &call)
            .await
            .unwrap_err();
        assert!(matches!(again, DalError::MigrationFailed { partial: true, .. }));

        assert!(m.clear_partial("person").unwrap());
        assert_eq!(m.state("person"), TableState::Declared);
    }

    #[tokio::test]
    async fn test_drop_referenced_table_is_refused() {
        let m = migrator("memory://migrate_drop", Arc::new(MemoryDriver::new())).await;
        let call = CallOptions::new();
        m.adapter.schema().define(person(vec![])).unwrap();
        let dog = Table::builder("dog")
            .field(Field::new("owner", FieldType::reference("person")))
            .build()
            .unwrap();
        m.adapter.schema().define(dog).unwrap();
        m.migrate_all(MigrateOptions::default(), &call).await.unwrap();

        let err = m.drop_table("person", &call).await.unwrap_err();
        assert!(matches!(err, DalError::InvalidSchema { .. }));

        m.drop_table("dog", &call).await.unwrap();
        assert_eq!(m.state("dog"), TableState::Undeclared);
        assert!(m.adapter.introspect("dog", &call).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transactional_failure_rolls_back_every_step() {
        let m = migrator("memory://migrate_rollback", Arc::new(MemoryDriver::new())).await;
        let call = CallOptions::new();
        m.adapter.schema().define(person(vec![])).unwrap();
        m.migrate("person", MigrateOptions::default(), &call).await.unwrap();
        m.adapter
            .execute(
                crate::ast::insert(
                    &m.adapter.schema().get("person").unwrap(),
                    [("name", crate::value::Value::from("James")), ("age", 30.into())],
                )
                .unwrap()
                .into(),
                &call,
            )
            .await
            .unwrap();

        // The second step cannot fill a NOT NULL column on existing rows.
        m.adapter
            .schema()
            .redefine(person(vec![
                Field::new("email", FieldType::Text),
                Field::new("code", FieldType::Text).not_null(),
            ]))
            .unwrap();
        let err = m
            .migrate("person", MigrateOptions::default(), &call)
            .await
            .unwrap_err();
        assert!(matches!(err, DalError::MigrationFailed { partial: false, .. }), "{err}");
        assert_eq!(m.state("person"), TableState::Failed);
        assert!(m.ledger_entry("person").unwrap().partial.is_none());

        let found = m.adapter.introspect("person", &call).await.unwrap().unwrap();
        assert!(found.column("email").is_none());
        assert!(found.column("code").is_none());
        assert_eq!(found.columns.len(), 3);
    }

    #[tokio::test]
    async fn test_ledger_write_failure_marks_table_failed() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("ledger");
        let ledger = Ledger::load(&folder, 7).unwrap();
        // A plain file where the ledger folder should be makes saving fail.
        std::fs::write(&folder, b"not a directory").unwrap();

        let uri = ConnectionUri::parse("memory://migrate_ledger_io").unwrap();
        let adapter = Adapter::connect(
            uri,
            Arc::new(MemoryDriver::new()),
            Backend::Memory.dialect(),
            Arc::new(ProfileCodec::for_backend(Backend::Memory, utc())),
            Arc::new(Schema::new()),
            &OpenOptions::default(),
        )
        .await
        .unwrap();
        let m = Migrator::new(Arc::new(adapter), ledger);
        m.adapter.schema().define(person(vec![])).unwrap();

        let call = CallOptions::new();
        let err = m
            .migrate("person", MigrateOptions::default(), &call)
            .await
            .unwrap_err();
        assert!(matches!(err, DalError::Io(_)), "{err}");
        assert_eq!(m.state("person"), TableState::Failed);
    }
}
