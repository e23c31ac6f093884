//! In-process engine behind `memory://` URIs.
//!
//! Databases live inside the driver, named by everything after `memory://`
//! (`memory://people` and `memory://shared/people` are two databases), and
//! survive for as long as the driver does. The engine executes command trees
//! directly and stores values in the memory backend's raw form.
//!
//! Isolation is read-uncommitted: writes are visible to every connection at
//! once, rows written inside a transaction are locked until it ends, and a
//! second transaction touching a locked row fails with a conflict.

mod engine;
mod eval;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use self::engine::{Database, Shared, Undo, Writer};
use super::driver::{Connection, Driver, Outcome, Statement, TableInfo};
use crate::codec::ProfileCodec;
use crate::config::utc;
use crate::dialect::Backend;
use crate::error::{DalError, Result};
use crate::uri::ConnectionUri;

#[derive(Debug, Default)]
pub struct MemoryDriver {
    databases: Mutex<HashMap<String, Shared>>,
    next_connection: AtomicU64,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn database(&self, name: &str) -> Shared {
        Arc::clone(
            self.databases
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Database::default()))),
        )
    }

    /// Simulate losing the server: open connections break and new ones
    /// cannot be made until [`MemoryDriver::restore`].
    pub fn sever(&self, database: &str) {
        self.database(database).lock().severed = true;
    }

    pub fn restore(&self, database: &str) {
        self.database(database).lock().severed = false;
    }

    /// Forget every table of `database`.
    pub fn reset(&self, database: &str) {
        self.databases.lock().remove(database);
    }
}

fn severed() -> DalError {
    DalError::Connection {
        backend: Backend::Memory.to_string(),
        message: "server connection lost".into(),
        source: None,
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, uri: &ConnectionUri) -> Result<Box<dyn Connection>> {
        let name = match uri.database() {
            "" => uri.host().to_string(),
            database => format!("{}/{database}", uri.host()),
        };
        let db = self.database(&name);
        if db.lock().severed {
            return Err(severed());
        }
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(MemoryConnection {
            id,
            db,
            codec: ProfileCodec::for_backend(Backend::Memory, utc()),
            undo: None,
            broken: false,
        }))
    }
}

fn check(broken: &mut bool, db: &Database) -> Result<()> {
    if db.severed || *broken {
        *broken = true;
        return Err(severed());
    }
    Ok(())
}

struct MemoryConnection {
    id: u64,
    db: Shared,
    codec: ProfileCodec,
    /// `Some` while a transaction is open.
    undo: Option<Vec<Undo>>,
    broken: bool,
}

impl MemoryConnection {
    fn finish(&mut self, commit: bool) -> Result<()> {
        let mut db = self.db.lock();
        check(&mut self.broken, &db)?;
        if let Some(log) = self.undo.take() {
            if !commit {
                db.undo(log);
            }
            db.release(self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn run(&mut self, statement: &Statement) -> Result<Outcome> {
        let Some(command) = statement.command.as_deref() else {
            return Err(DalError::unsupported(Backend::Memory, "raw SQL text"));
        };
        let mut db = self.db.lock();
        check(&mut self.broken, &db)?;
        let writer = Writer {
            conn: self.id,
            in_transaction: self.undo.is_some(),
        };
        let mut scratch = Vec::new();
        let log = self.undo.as_mut().unwrap_or(&mut scratch);
        db.execute(command, &self.codec, writer, log)
    }

    async fn begin(&mut self) -> Result<()> {
        let db = self.db.lock();
        check(&mut self.broken, &db)?;
        if self.undo.is_some() {
            return Err(DalError::Statement {
                backend: Backend::Memory.to_string(),
                code: Some("25001".into()),
                message: "there is already a transaction in progress".into(),
            });
        }
        self.undo = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish(true)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish(false)
    }

    async fn ping(&mut self) -> Result<()> {
        let db = self.db.lock();
        check(&mut self.broken, &db)
    }

    async fn introspect(&mut self, table: &str) -> Result<Option<TableInfo>> {
        let db = self.db.lock();
        check(&mut self.broken, &db)?;
        Ok(db.tables.get(table).map(|t| t.info()))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(log) = self.undo.take() {
            debug!(connection = self.id, "rolling back transaction of dropped connection");
            let mut db = self.db.lock();
            db.undo(log);
            db.release(self.id);
        }
    }
}
