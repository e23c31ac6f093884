//! Table storage and command execution for the in-process engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::ast::{Command, DeleteCommand, Ddl, InsertCommand, JoinKind, SelectQuery, UpdateCommand};
use crate::codec::{Parser, ProfileCodec, Representer};
use crate::db::driver::{ColumnInfo, DriverRows, Outcome, TableInfo};
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldDefault, FieldType, IndexDef, Table};
use crate::value::RawValue;

use super::eval::{sort_order, statement_error, Evaluator, Scope, Source, Tuple};

#[derive(Debug, Clone)]
pub(crate) struct StoredColumn {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredIndex {
    pub name: String,
    pub columns: Vec<usize>,
    pub unique: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TableData {
    pub name: String,
    pub columns: Vec<StoredColumn>,
    /// Keyed by insertion order so rollback restores rows in place.
    pub rows: BTreeMap<u64, Vec<RawValue>>,
    pub next_rowid: u64,
    pub next_id: i64,
    pub primary_key: Vec<usize>,
    pub indexes: Vec<StoredIndex>,
}

impl TableData {
    fn from_table(table: &Table) -> Result<Self> {
        let columns: Vec<StoredColumn> = table
            .fields()
            .iter()
            .map(|f| StoredColumn {
                name: f.name.clone(),
                field_type: f.field_type.clone(),
                nullable: f.nullable,
            })
            .collect();
        let position = |name: &str| {
            columns
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| statement_error("42703", format!("column {name} does not exist")))
        };
        let primary_key = table
            .primary_key()
            .iter()
            .map(|k| position(k))
            .collect::<Result<Vec<_>>>()?;
        let mut indexes = Vec::new();
        for field in table.fields().iter().filter(|f| f.unique) {
            indexes.push(StoredIndex {
                name: format!("{}_{}_key", table.name(), field.name),
                columns: vec![position(&field.name)?],
                unique: true,
            });
        }
        for index in &table.options().indexes {
            indexes.push(StoredIndex {
                name: index.name.clone(),
                columns: index
                    .fields
                    .iter()
                    .map(|f| position(f))
                    .collect::<Result<Vec<_>>>()?,
                unique: index.unique,
            });
        }
        Ok(Self {
            name: table.name().to_string(),
            columns,
            rows: BTreeMap::new(),
            next_rowid: 1,
            next_id: 1,
            primary_key,
            indexes,
        })
    }

    fn column(&self, name: &str) -> Result<usize> {
        self.columns.iter().position(|c| c.name == name).ok_or_else(|| {
            statement_error(
                "42703",
                format!("column {name} of relation {} does not exist", self.name),
            )
        })
    }

    fn id_column(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.field_type == FieldType::Id)
    }

    fn source(&self, name: &str) -> Source {
        Source {
            name: name.to_string(),
            columns: self.columns.iter().map(|c| c.name.clone()).collect(),
        }
    }

    /// Check NOT NULL and every unique key for `values` stored as `rowid`.
    fn check_row(&self, rowid: u64, values: &[RawValue]) -> Result<()> {
        for (column, value) in self.columns.iter().zip(values) {
            if value.is_null() && !column.nullable {
                return Err(statement_error(
                    "23502",
                    format!(
                        "null value in column {} of relation {} violates not-null constraint",
                        column.name, self.name
                    ),
                ));
            }
        }
        let pk_name = format!("{}_pkey", self.name);
        let keys = std::iter::once((pk_name.as_str(), &self.primary_key)).chain(
            self.indexes
                .iter()
                .filter(|i| i.unique)
                .map(|i| (i.name.as_str(), &i.columns)),
        );
        for (name, columns) in keys {
            let key: Vec<&RawValue> = columns.iter().map(|&c| &values[c]).collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = self.rows.iter().any(|(other, row)| {
                *other != rowid && columns.iter().zip(&key).all(|(&c, v)| row[c] == **v)
            });
            if clash {
                return Err(statement_error(
                    "23505",
                    format!("duplicate key value violates unique constraint {name}"),
                ));
            }
        }
        Ok(())
    }

    pub fn info(&self) -> TableInfo {
        TableInfo {
            name: self.name.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| ColumnInfo {
                    name: c.name.clone(),
                    type_name: c.field_type.to_string(),
                    field_type: Some(c.field_type.clone()),
                    nullable: c.nullable,
                })
                .collect(),
            indexes: self.indexes.iter().map(|i| i.name.clone()).collect(),
        }
    }
}

/// Change recorded inside a transaction, undone in reverse on rollback.
#[derive(Debug)]
pub(crate) enum Undo {
    Inserted { table: String, rowid: u64 },
    Updated { table: String, rowid: u64, before: Vec<RawValue> },
    Deleted { table: String, rowid: u64, before: Vec<RawValue> },
    /// Whole-table snapshot taken before DDL; `None` when it did not exist.
    Table { name: String, before: Option<TableData> },
}

/// Who is executing a command.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Writer {
    pub conn: u64,
    pub in_transaction: bool,
}

pub(crate) type Shared = Arc<parking_lot::Mutex<Database>>;

#[derive(Debug, Default)]
pub(crate) struct Database {
    pub tables: HashMap<String, TableData>,
    /// Rows written by open transactions, keyed by (table, rowid).
    pub locks: HashMap<(String, u64), u64>,
    pub severed: bool,
}

impl Database {
    fn table(&self, name: &str) -> Result<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| statement_error("42P01", format!("relation {name} does not exist")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| statement_error("42P01", format!("relation {name} does not exist")))
    }

    /// Take the row lock for `writer`, failing when another open
    /// transaction holds it.
    fn lock(&mut self, table: &str, rowid: u64, writer: Writer) -> Result<()> {
        let key = (table.to_string(), rowid);
        match self.locks.get(&key) {
            Some(&holder) if holder != writer.conn => Err(DalError::TransactionConflict {
                backend: "memory".into(),
                message: format!("row {rowid} of {table} is locked by another transaction"),
            }),
            _ => {
                if writer.in_transaction {
                    self.locks.insert(key, writer.conn);
                }
                Ok(())
            }
        }
    }

    pub fn release(&mut self, conn: u64) {
        self.locks.retain(|_, holder| *holder != conn);
    }

    pub fn undo(&mut self, log: Vec<Undo>) {
        for entry in log.into_iter().rev() {
            match entry {
                Undo::Inserted { table, rowid } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.rows.remove(&rowid);
                    }
                }
                Undo::Updated { table, rowid, before } | Undo::Deleted { table, rowid, before } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.rows.insert(rowid, before);
                    }
                }
                Undo::Table { name, before } => match before {
                    Some(data) => {
                        self.tables.insert(name, data);
                    }
                    None => {
                        self.tables.remove(&name);
                    }
                },
            }
        }
    }

    pub fn execute(
        &mut self,
        command: &Command,
        codec: &ProfileCodec,
        writer: Writer,
        undo: &mut Vec<Undo>,
    ) -> Result<Outcome> {
        match command {
            Command::Select(query) => self.select(query, codec).map(Outcome::Rows),
            Command::Insert(insert) => self.insert(insert, codec, writer, undo),
            Command::Update(update) => self.update(update, codec, writer, undo),
            Command::Delete(delete) => self.delete(delete, codec, writer, undo),
            Command::Ddl(ddl) => {
                self.ddl(ddl, codec, writer, undo)?;
                Ok(Outcome::Affected {
                    count: 0,
                    last_id: None,
                })
            }
        }
    }

    fn select(&self, query: &SelectQuery, codec: &ProfileCodec) -> Result<DriverRows> {
        let base = self.table(query.table.name())?;
        let mut sources = vec![base.source(query.source())];
        let mut tuples: Vec<Tuple> = base.rows.values().map(|r| vec![Some(r.clone())]).collect();

        for join in &query.joins {
            let table = self.table(join.table.name())?;
            sources.push(table.source(join.source()));
            let eval = Evaluator {
                sources: &sources,
                codec,
            };
            let mut joined = Vec::new();
            for tuple in tuples {
                let mut matched = false;
                for row in table.rows.values() {
                    let mut candidate = tuple.clone();
                    candidate.push(Some(row.clone()));
                    if eval.holds(&join.on, &Scope::Row(&candidate))? {
                        matched = true;
                        joined.push(candidate);
                    }
                }
                if !matched && join.kind == JoinKind::Left {
                    let mut candidate = tuple;
                    candidate.push(None);
                    joined.push(candidate);
                }
            }
            tuples = joined;
        }

        let eval = Evaluator {
            sources: &sources,
            codec,
        };
        if let Some(filter) = &query.filter {
            let mut kept = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                if eval.holds(filter, &Scope::Row(&tuple))? {
                    kept.push(tuple);
                }
            }
            tuples = kept;
        }

        // (output values, sort keys)
        let mut out: Vec<(Vec<RawValue>, Vec<RawValue>)> = Vec::new();
        let mut emit = |scope: &Scope<'_>| -> Result<()> {
            let values = query
                .columns
                .iter()
                .map(|c| eval.eval(&c.expr, scope))
                .collect::<Result<Vec<_>>>()?;
            let keys = query
                .order_by
                .iter()
                .map(|o| eval.eval(&o.expr, scope))
                .collect::<Result<Vec<_>>>()?;
            out.push((values, keys));
            Ok(())
        };

        if query.is_grouped() {
            let mut groups: Vec<(Vec<RawValue>, Vec<Tuple>)> = Vec::new();
            if query.group_by.is_empty() {
                groups.push((Vec::new(), tuples));
            } else {
                for tuple in tuples {
                    let key = query
                        .group_by
                        .iter()
                        .map(|g| eval.eval(g, &Scope::Row(&tuple)))
                        .collect::<Result<Vec<_>>>()?;
                    match groups.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, members)) => members.push(tuple),
                        None => groups.push((key, vec![tuple])),
                    }
                }
            }
            for (_, members) in &groups {
                let scope = Scope::Group(members);
                if let Some(having) = &query.having {
                    if !eval.holds(having, &scope)? {
                        continue;
                    }
                }
                emit(&scope)?;
            }
        } else {
            for tuple in &tuples {
                emit(&Scope::Row(tuple))?;
            }
        }

        if query.distinct {
            let mut seen: Vec<Vec<RawValue>> = Vec::new();
            out.retain(|(values, _)| {
                if seen.contains(values) {
                    false
                } else {
                    seen.push(values.clone());
                    true
                }
            });
        }

        if !query.order_by.is_empty() {
            out.sort_by(|(_, a), (_, b)| {
                for ((x, y), spec) in a.iter().zip(b).zip(&query.order_by) {
                    let ord = sort_order(x, y);
                    let ord = match spec.direction {
                        crate::ast::Direction::Asc => ord,
                        crate::ast::Direction::Desc => ord.reverse(),
                    };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let offset = usize::try_from(query.limit.offset).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        let rows = out
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(values, _)| values)
            .collect();

        Ok(DriverRows {
            columns: query.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
        })
    }

    fn insert(
        &mut self,
        insert: &InsertCommand,
        codec: &ProfileCodec,
        writer: Writer,
        undo: &mut Vec<Undo>,
    ) -> Result<Outcome> {
        let name = insert.table.name().to_string();
        let table = self.table(&name)?;
        let positions = insert
            .columns
            .iter()
            .map(|c| table.column(c))
            .collect::<Result<Vec<_>>>()?;
        let id_column = table.id_column();
        let width = table.columns.len();

        let mut last_id = None;
        let mut written = Vec::with_capacity(insert.rows.len());
        for row in &insert.rows {
            let table = self.table_mut(&name)?;
            let mut values = vec![RawValue::Null; width];
            for (&pos, value) in positions.iter().zip(row) {
                values[pos] = codec.represent(value, &table.columns[pos].field_type)?;
            }
            if let Some(id) = id_column {
                match values[id] {
                    RawValue::Null => {
                        values[id] = RawValue::Int(table.next_id);
                        last_id = Some(table.next_id);
                        table.next_id += 1;
                    }
                    RawValue::Int(given) => {
                        table.next_id = table.next_id.max(given.saturating_add(1));
                        last_id = Some(given);
                    }
                    _ => {}
                }
            }
            let rowid = table.next_rowid;
            if let Err(e) = table.check_row(rowid, &values) {
                self.abandon(&name, written);
                return Err(e);
            }
            table.next_rowid += 1;
            table.rows.insert(rowid, values);
            written.push(rowid);
        }
        let count = written.len() as u64;
        self.claim_inserted(&name, written, writer, undo)?;
        Ok(Outcome::Affected { count, last_id })
    }

    /// Remove rows a failed multi-row insert already wrote.
    fn abandon(&mut self, table: &str, written: Vec<u64>) {
        if let Some(t) = self.tables.get_mut(table) {
            for rowid in written {
                t.rows.remove(&rowid);
            }
        }
    }

    fn claim_inserted(
        &mut self,
        table: &str,
        written: Vec<u64>,
        writer: Writer,
        undo: &mut Vec<Undo>,
    ) -> Result<()> {
        for rowid in written {
            self.lock(table, rowid, writer)?;
            if writer.in_transaction {
                undo.push(Undo::Inserted {
                    table: table.to_string(),
                    rowid,
                });
            }
        }
        Ok(())
    }

    fn matching(
        &self,
        table: &TableData,
        source: &str,
        filter: Option<&crate::ast::Expr>,
        codec: &ProfileCodec,
    ) -> Result<Vec<u64>> {
        let sources = [table.source(source)];
        let eval = Evaluator {
            sources: &sources,
            codec,
        };
        let mut hits = Vec::new();
        for (&rowid, row) in &table.rows {
            let tuple = vec![Some(row.clone())];
            let keep = match filter {
                Some(f) => eval.holds(f, &Scope::Row(&tuple))?,
                None => true,
            };
            if keep {
                hits.push(rowid);
            }
        }
        Ok(hits)
    }

    fn update(
        &mut self,
        update: &UpdateCommand,
        codec: &ProfileCodec,
        writer: Writer,
        undo: &mut Vec<Undo>,
    ) -> Result<Outcome> {
        let name = update.table.name().to_string();
        let table = self.table(&name)?;
        let hits = self.matching(table, &name, update.filter.as_ref(), codec)?;
        let targets = update
            .assignments
            .iter()
            .map(|(column, _)| table.column(column))
            .collect::<Result<Vec<_>>>()?;
        for &rowid in &hits {
            self.lock(&name, rowid, writer)?;
        }

        let sources = [self.table(&name)?.source(&name)];
        let eval = Evaluator {
            sources: &sources,
            codec,
        };
        let mut changes = Vec::with_capacity(hits.len());
        {
            let table = self.table(&name)?;
            for &rowid in &hits {
                let Some(before) = table.rows.get(&rowid) else {
                    continue;
                };
                let tuple = vec![Some(before.clone())];
                let mut after = before.clone();
                for (&pos, (_, expr)) in targets.iter().zip(&update.assignments) {
                    let value = eval.eval(expr, &Scope::Row(&tuple))?;
                    after[pos] = conform(value, &table.columns[pos], codec)?;
                }
                changes.push((rowid, before.clone(), after));
            }
        }

        let table = self.table_mut(&name)?;
        let mut applied = Vec::with_capacity(changes.len());
        for (rowid, before, after) in changes {
            table.rows.insert(rowid, after.clone());
            if let Err(e) = table.check_row(rowid, &after) {
                table.rows.insert(rowid, before);
                for (rowid, before) in applied.into_iter().rev() {
                    table.rows.insert(rowid, before);
                }
                return Err(e);
            }
            applied.push((rowid, before));
        }
        let count = applied.len() as u64;
        if writer.in_transaction {
            undo.extend(applied.into_iter().map(|(rowid, before)| Undo::Updated {
                table: name.clone(),
                rowid,
                before,
            }));
        }
        Ok(Outcome::Affected {
            count,
            last_id: None,
        })
    }

    fn delete(
        &mut self,
        delete: &DeleteCommand,
        codec: &ProfileCodec,
        writer: Writer,
        undo: &mut Vec<Undo>,
    ) -> Result<Outcome> {
        let name = delete.table.name().to_string();
        let hits = self.matching(self.table(&name)?, &name, delete.filter.as_ref(), codec)?;
        for &rowid in &hits {
            self.lock(&name, rowid, writer)?;
        }
        let table = self.table_mut(&name)?;
        let mut count = 0;
        for rowid in hits {
            if let Some(before) = table.rows.remove(&rowid) {
                count += 1;
                if writer.in_transaction {
                    undo.push(Undo::Deleted {
                        table: name.clone(),
                        rowid,
                        before,
                    });
                }
            }
        }
        Ok(Outcome::Affected {
            count,
            last_id: None,
        })
    }

    fn snapshot(&self, name: &str, writer: Writer, undo: &mut Vec<Undo>) {
        if writer.in_transaction {
            undo.push(Undo::Table {
                name: name.to_string(),
                before: self.tables.get(name).cloned(),
            });
        }
    }

    fn ddl(
        &mut self,
        ddl: &Ddl,
        codec: &ProfileCodec,
        writer: Writer,
        undo: &mut Vec<Undo>,
    ) -> Result<()> {
        let name = ddl.table_name().to_string();
        match ddl {
            Ddl::CreateTable(table) => {
                if self.tables.contains_key(&name) {
                    return Err(statement_error(
                        "42P07",
                        format!("relation {name} already exists"),
                    ));
                }
                let data = TableData::from_table(table)?;
                self.snapshot(&name, writer, undo);
                self.tables.insert(name, data);
            }
            Ddl::AddColumn { field, .. } => {
                let fill = default_raw(field, codec)?;
                let mut table = self.table(&name)?.clone();
                if table.columns.iter().any(|c| c.name == field.name) {
                    return Err(statement_error(
                        "42701",
                        format!("column {} of relation {name} already exists", field.name),
                    ));
                }
                if fill.is_null() && !field.nullable && !table.rows.is_empty() {
                    return Err(statement_error(
                        "23502",
                        format!("column {} contains null values", field.name),
                    ));
                }
                table.columns.push(StoredColumn {
                    name: field.name.clone(),
                    field_type: field.field_type.clone(),
                    nullable: field.nullable,
                });
                for row in table.rows.values_mut() {
                    row.push(fill.clone());
                }
                if field.unique {
                    table.indexes.push(StoredIndex {
                        name: format!("{name}_{}_key", field.name),
                        columns: vec![table.columns.len() - 1],
                        unique: true,
                    });
                }
                self.snapshot(&name, writer, undo);
                self.tables.insert(name, table);
            }
            Ddl::AlterColumn { field, .. } => {
                let mut table = self.table(&name)?.clone();
                let pos = table.column(&field.name)?;
                let target = StoredColumn {
                    name: field.name.clone(),
                    field_type: field.field_type.clone(),
                    nullable: field.nullable,
                };
                let old_type = table.columns[pos].field_type.clone();
                for row in table.rows.values_mut() {
                    let value = codec.parse(row[pos].clone(), &old_type, &field.name)?;
                    let raw = codec.represent(&value, &field.field_type).map_err(|e| {
                        statement_error("22P02", format!("cannot convert {}: {e}", field.name))
                    })?;
                    if raw.is_null() && !field.nullable {
                        return Err(statement_error(
                            "23502",
                            format!("column {} contains null values", field.name),
                        ));
                    }
                    row[pos] = raw;
                }
                table.columns[pos] = target;
                self.snapshot(&name, writer, undo);
                self.tables.insert(name, table);
            }
            Ddl::DropColumn { column, .. } => {
                let mut table = self.table(&name)?.clone();
                let pos = table.column(column)?;
                if table.primary_key.contains(&pos) {
                    return Err(statement_error(
                        "2BP01",
                        format!("cannot drop primary key column {column}"),
                    ));
                }
                table.columns.remove(pos);
                for row in table.rows.values_mut() {
                    row.remove(pos);
                }
                let shift = |c: &mut usize| {
                    if *c > pos {
                        *c -= 1;
                    }
                };
                table.primary_key.iter_mut().for_each(shift);
                table.indexes.retain(|i| !i.columns.contains(&pos));
                for index in &mut table.indexes {
                    index.columns.iter_mut().for_each(shift);
                }
                self.snapshot(&name, writer, undo);
                self.tables.insert(name, table);
            }
            Ddl::CreateIndex { index, .. } => {
                let mut table = self.table(&name)?.clone();
                if table.indexes.iter().any(|i| i.name == index.name) {
                    return Err(statement_error(
                        "42P07",
                        format!("relation {} already exists", index.name),
                    ));
                }
                table.indexes.push(stored_index(&table, index)?);
                if index.unique {
                    for (&rowid, row) in &table.rows {
                        table.check_row(rowid, row)?;
                    }
                }
                self.snapshot(&name, writer, undo);
                self.tables.insert(name, table);
            }
            Ddl::DropTable { .. } => {
                self.table(&name)?;
                self.snapshot(&name, writer, undo);
                self.tables.remove(&name);
            }
            Ddl::Truncate { .. } => {
                if self.locks.iter().any(|((t, _), holder)| *t == name && *holder != writer.conn) {
                    return Err(DalError::TransactionConflict {
                        backend: "memory".into(),
                        message: format!("{name} has rows locked by another transaction"),
                    });
                }
                self.snapshot(&name, writer, undo);
                self.table_mut(&name)?.rows.clear();
            }
        }
        Ok(())
    }
}

fn stored_index(table: &TableData, index: &IndexDef) -> Result<StoredIndex> {
    Ok(StoredIndex {
        name: index.name.clone(),
        columns: index
            .fields
            .iter()
            .map(|f| table.column(f))
            .collect::<Result<Vec<_>>>()?,
        unique: index.unique,
    })
}

fn default_raw(field: &Field, codec: &ProfileCodec) -> Result<RawValue> {
    match &field.default {
        Some(FieldDefault::Value(v)) => codec.represent(v, &field.field_type),
        Some(FieldDefault::Now) => codec.represent(
            &crate::value::Value::DateTime(chrono::Utc::now()),
            &field.field_type,
        ),
        Some(FieldDefault::Uuid) => codec.represent(
            &crate::value::Value::Text(uuid::Uuid::new_v4().to_string()),
            &field.field_type,
        ),
        None => Ok(RawValue::Null),
    }
}

/// Fit an evaluated value into a column: integers widen into float and
/// decimal columns, anything else must already match.
fn conform(value: RawValue, column: &StoredColumn, codec: &ProfileCodec) -> Result<RawValue> {
    if value.is_null() {
        return Ok(value);
    }
    let canonical = codec.parse_untyped(value);
    codec.represent(&canonical, &column.field_type)
}
