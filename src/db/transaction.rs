use std::sync::Arc;

use tracing::{debug, warn};

use super::adapter::{affected, Adapter, Affected, CallOptions, RawResult, RawStatement};
use super::pool::PooledConnection;
use crate::ast::{Command, SelectQuery};
use crate::error::{DalError, Result};
use crate::rows::RowSet;

/// A transaction pinned to one pooled connection.
///
/// Every statement issued through it runs on that connection. Dropping it
/// without `commit` or `rollback` discards the connection, which ends the
/// transaction on the backend side.
pub struct Transaction {
    adapter: Arc<Adapter>,
    conn: Option<PooledConnection>,
    call: CallOptions,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("uri", self.adapter.uri())
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(adapter: Arc<Adapter>, conn: PooledConnection, call: CallOptions) -> Self {
        Self {
            adapter,
            conn: Some(conn),
            call,
        }
    }

    fn conn(&mut self) -> Result<&mut PooledConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DalError::Closed("transaction".into()))
    }

    /// A statement failure poisons the transaction: the connection is
    /// discarded and later calls fail with `Closed`.
    fn fail(&mut self, err: DalError) -> DalError {
        if let Some(conn) = self.conn.take() {
            self.adapter.discard(conn, &err);
        }
        err
    }

    pub async fn execute(&mut self, command: Command) -> Result<Affected> {
        let command = self.adapter.prepare(command)?;
        let statements = self.adapter.lower(&command)?;
        let adapter = Arc::clone(&self.adapter);
        let call = self.call.clone();
        let conn = self.conn()?;
        match adapter.run_batch(conn, &statements, &call, true).await {
            Ok(outcomes) => Ok(affected(outcomes)),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub async fn fetch(&mut self, query: SelectQuery) -> Result<RowSet> {
        let command = self.adapter.prepare(Command::Select(Box::new(query)))?;
        let statement = self.adapter.lower_one(&command)?;
        let adapter = Arc::clone(&self.adapter);
        let call = self.call.clone();
        let conn = self.conn()?;
        match adapter.run(conn, &statement, &call).await {
            Ok(outcome) => adapter.to_rowset(&command, Some(outcome)),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub async fn execute_raw(&mut self, raw: RawStatement) -> Result<RawResult> {
        let statement = self.adapter.lower_raw(&raw)?;
        let adapter = Arc::clone(&self.adapter);
        let call = self.call.clone();
        let conn = self.conn()?;
        match adapter.run(conn, &statement, &call).await {
            Ok(outcome) => adapter.to_raw_result(&raw, Some(outcome)),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub async fn commit(mut self) -> Result<()> {
        let call = self.call.clone();
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| DalError::Closed("transaction".into()))?;
        match call.guard("commit", conn.commit()).await {
            Ok(()) => {
                debug!(backend = %self.adapter.backend(), "transaction committed");
                Ok(())
            }
            Err(e) => {
                self.adapter.discard(conn, &e);
                Err(e)
            }
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        let call = self.call.clone();
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| DalError::Closed("transaction".into()))?;
        match call.guard("rollback", conn.rollback()).await {
            Ok(()) => {
                debug!(backend = %self.adapter.backend(), "transaction rolled back");
                Ok(())
            }
            Err(e) => {
                self.adapter.discard(conn, &e);
                Err(e)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                backend = %self.adapter.backend(),
                "transaction dropped without commit or rollback; discarding connection"
            );
            super::pool::discard(conn);
        }
    }
}
