use super::{Backend, Dialect, SelectParts};
use crate::ast::{LimitSpec, ScalarFn};
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldType};

#[derive(Debug, Clone, Copy)]
pub struct TeradataDialect;

impl Dialect for TeradataDialect {
    fn backend(&self) -> Backend {
        Backend::Teradata
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "BIGINT".into(),
            FieldType::String { length } => format!("VARCHAR({length})"),
            FieldType::Text | FieldType::Json => "CLOB".into(),
            FieldType::Float => "FLOAT".into(),
            FieldType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            FieldType::Boolean => "BYTEINT".into(),
            FieldType::Date => "DATE".into(),
            FieldType::DateTime => "TIMESTAMP(6)".into(),
            FieldType::Binary => "BLOB".into(),
            FieldType::Geometry { .. } => {
                return Err(DalError::unsupported(self.backend(), "geometry column"))
            }
        })
    }

    fn id_column(&self) -> &'static str {
        "BIGINT NOT NULL GENERATED ALWAYS AS IDENTITY"
    }

    fn function(&self, func: ScalarFn, args: &[String]) -> Result<String> {
        let name = match func {
            ScalarFn::Length => "CHARACTER_LENGTH",
            other => other.name(),
        };
        Ok(format!("{name}({})", args.join(", ")))
    }

    /// `TOP n` without an offset; otherwise a QUALIFY filter over
    /// ROW_NUMBER().
    fn paginate(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        let order_clause = parts
            .order_list()
            .map(|o| format!(" ORDER BY {o}"))
            .unwrap_or_default();
        match (limit.limit, limit.offset) {
            (None, 0) => Ok(parts.assemble(true)),
            (Some(n), 0) => Ok(format!(
                "SELECT {}TOP {n} {} {}{order_clause}",
                parts.distinct_keyword(),
                parts.select_list(),
                parts.tail()
            )),
            (_, offset) => {
                if parts.distinct {
                    return Err(DalError::unsupported(
                        self.backend(),
                        "DISTINCT with offset pagination",
                    ));
                }
                let window_order = parts.order_list().unwrap_or_else(|| "1".to_string());
                let range = match (offset.checked_add(1), limit.last_row()) {
                    (Some(first), Some(last)) => format!("BETWEEN {first} AND {last}"),
                    _ => format!("> {offset}"),
                };
                Ok(format!(
                    "{} QUALIFY ROW_NUMBER() OVER (ORDER BY {window_order}) {range}{order_clause}",
                    parts.assemble(false)
                ))
            }
        }
    }

    fn multi_row_insert(&self) -> bool {
        false
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn add_column_keyword(&self) -> &'static str {
        "ADD"
    }

    fn drop_column_keyword(&self) -> &'static str {
        "DROP"
    }

    // ADD on an existing column changes its attributes.
    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} ADD {} {}",
            self.quote(table),
            self.quote(&field.name),
            self.column_type(&field.field_type)?
        )])
    }

    fn truncate(&self, table: &str) -> String {
        format!("DELETE FROM {} ALL", self.quote(table))
    }
}
