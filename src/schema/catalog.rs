//! The set of tables declared on one instance.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::types::{FieldType, Table};
use crate::ast::Command;
use crate::error::{DalError, Result};

/// Registered table definitions, in declaration order.
///
/// Tables are immutable once registered; [`Schema::redefine`] swaps a
/// definition in a single step so readers never see a half-updated table.
#[derive(Debug, Default)]
pub struct Schema {
    tables: RwLock<IndexMap<String, Arc<Table>>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new table. Re-registering an identical definition is a
    /// no-op; a different definition under the same name must go through
    /// [`Schema::redefine`].
    pub fn define(&self, table: Arc<Table>) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(table.name()) {
            if same_shape(existing, &table) {
                return Ok(());
            }
            return Err(DalError::InvalidSchema {
                table: table.name().to_string(),
                reason: "already defined with a different shape; use redefine_table".into(),
            });
        }
        check_references(&tables, &table)?;
        tables.insert(table.name().to_string(), table);
        Ok(())
    }

    /// Atomically replace a table definition, returning the previous one.
    pub fn redefine(&self, table: Arc<Table>) -> Result<Option<Arc<Table>>> {
        let mut tables = self.tables.write();
        check_references(&tables, &table)?;
        Ok(tables.insert(table.name().to_string(), table))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.write().shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DalError::UnknownTable {
                table: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().values().cloned().collect()
    }

    /// Verify that every table and field a command touches is declared here
    /// with the type the command was built against.
    pub fn check(&self, command: &Command) -> Result<()> {
        let tables = self.tables.read();
        for table in command.tables() {
            if !tables.contains_key(table.name()) {
                return Err(DalError::UnknownTable {
                    table: table.name().to_string(),
                });
            }
        }
        let mut failure = None;
        command.visit_fields(&mut |f| {
            if failure.is_some() {
                return;
            }
            let declared = tables
                .get(&f.table)
                .and_then(|t| t.get_field(&f.name).map(|d| d.field_type.clone()));
            match declared {
                None if !tables.contains_key(&f.table) => {
                    failure = Some(DalError::UnknownTable {
                        table: f.table.clone(),
                    })
                }
                None => {
                    failure = Some(DalError::UnknownField {
                        table: f.table.clone(),
                        field: f.name.clone(),
                    })
                }
                Some(t) if t != f.field_type => {
                    failure = Some(DalError::mismatch(f.qualified_name(), t, &f.field_type))
                }
                Some(_) => {}
            }
        });
        if let Command::Insert(insert) = command {
            let current = tables
                .get(insert.table.name())
                .ok_or_else(|| DalError::UnknownTable {
                    table: insert.table.name().to_string(),
                })?;
            for column in &insert.columns {
                if current.get_field(column).is_none() {
                    return Err(DalError::UnknownField {
                        table: insert.table.name().to_string(),
                        field: column.clone(),
                    });
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn same_shape(a: &Table, b: &Table) -> bool {
    a.fields() == b.fields() && a.primary_key() == b.primary_key()
}

fn check_references(tables: &IndexMap<String, Arc<Table>>, table: &Table) -> Result<()> {
    for field in table.fields() {
        if let FieldType::Reference { table: target } = &field.field_type {
            if target != table.name() && !tables.contains_key(target) {
                return Err(DalError::UnknownTable {
                    table: target.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::select;
    use crate::schema::Field;

    fn person(age_type: FieldType) -> Arc<Table> {
        Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .field(Field::new("age", age_type))
            .build()
            .unwrap()
    }

    #[test]
    fn test_define_twice() {
        let schema = Schema::new();
        schema.define(person(FieldType::Integer)).unwrap();
        schema.define(person(FieldType::Integer)).unwrap();
        let err = schema.define(person(FieldType::Float)).unwrap_err();
        assert!(matches!(err, DalError::InvalidSchema { .. }));
    }

    #[test]
    fn test_redefine_replaces() {
        let schema = Schema::new();
        schema.define(person(FieldType::Integer)).unwrap();
        let old = schema.redefine(person(FieldType::Float)).unwrap();
        assert!(old.is_some());
        let current = schema.get("person").unwrap();
        assert_eq!(
            current.get_field("age").unwrap().field_type,
            FieldType::Float
        );
    }

    #[test]
    fn test_reference_to_unknown_table() {
        let schema = Schema::new();
        let dog = Table::builder("dog")
            .field(Field::new("owner", FieldType::reference("person")))
            .build()
            .unwrap();
        assert!(matches!(
            schema.define(dog),
            Err(DalError::UnknownTable { .. })
        ));
    }

    #[test]
    fn test_check_detects_stale_field_types() {
        let schema = Schema::new();
        let old = person(FieldType::Integer);
        schema.define(Arc::clone(&old)).unwrap();
        let q = select(&old)
            .filter(old.field("age").unwrap().gt(3).unwrap())
            .build()
            .unwrap();
        schema.check(&q.clone().into()).unwrap();

        schema.redefine(person(FieldType::Float)).unwrap();
        assert!(matches!(
            schema.check(&q.into()),
            Err(DalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_check_unknown_table() {
        let schema = Schema::new();
        let t = person(FieldType::Integer);
        let q = select(&t).build().unwrap();
        assert!(matches!(
            schema.check(&q.into()),
            Err(DalError::UnknownTable { .. })
        ));
    }
}
