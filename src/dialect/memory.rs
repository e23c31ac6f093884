use super::{Backend, Dialect};
use crate::ast::AggregateFn;
use crate::error::Result;
use crate::schema::{Field, FieldType};

/// Dialect of the in-process engine. The engine executes command trees
/// directly; the text rendered here only appears in logs and timings.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDialect;

impl Dialect for MemoryDialect {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(field_type.to_string())
    }

    fn id_column(&self) -> &'static str {
        "id"
    }

    fn aggregate(&self, func: AggregateFn, arg: &str, distinct: bool) -> Result<String> {
        let distinct = if distinct { "DISTINCT " } else { "" };
        Ok(format!("{}({distinct}{arg})", func.name()))
    }

    fn geometry_read(&self, column: &str) -> Result<String> {
        Ok(column.to_string())
    }

    fn geometry_write(&self, placeholder: &str, _srid: u32) -> Result<String> {
        Ok(placeholder.to_string())
    }

    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        let null = if field.nullable { "" } else { " NOT NULL" };
        Ok(vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} {}{null}",
            self.quote(table),
            self.quote(&field.name),
            field.field_type
        )])
    }
}
