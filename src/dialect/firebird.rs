use super::{Backend, Dialect, SelectParts};
use crate::ast::{LimitSpec, ScalarFn};
use crate::error::{DalError, Result};
use crate::schema::FieldType;

#[derive(Debug, Clone, Copy)]
pub struct FirebirdDialect;

impl Dialect for FirebirdDialect {
    fn backend(&self) -> Backend {
        Backend::Firebird
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "BIGINT".into(),
            FieldType::String { length } => format!("VARCHAR({length})"),
            FieldType::Text | FieldType::Json => "BLOB SUB_TYPE TEXT".into(),
            FieldType::Float => "DOUBLE PRECISION".into(),
            FieldType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            FieldType::Boolean => "CHAR(1)".into(),
            FieldType::Date => "DATE".into(),
            FieldType::DateTime => "TIMESTAMP".into(),
            FieldType::Binary => "BLOB SUB_TYPE BINARY".into(),
            FieldType::Geometry { .. } => {
                return Err(DalError::unsupported(self.backend(), "geometry column"))
            }
        })
    }

    fn function(&self, func: ScalarFn, args: &[String]) -> Result<String> {
        let name = match func {
            ScalarFn::Length => "CHAR_LENGTH",
            other => other.name(),
        };
        Ok(format!("{name}({})", args.join(", ")))
    }

    fn paginate(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        let mut window = String::new();
        if let Some(n) = limit.limit {
            window.push_str(&format!("FIRST {n} "));
        }
        if limit.offset > 0 {
            window.push_str(&format!("SKIP {} ", limit.offset));
        }
        let mut sql = format!(
            "SELECT {window}{}{} {}",
            parts.distinct_keyword(),
            parts.select_list(),
            parts.tail()
        );
        if let Some(order) = parts.order_list() {
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        Ok(sql)
    }

    fn multi_row_insert(&self) -> bool {
        false
    }

    fn add_column_keyword(&self) -> &'static str {
        "ADD"
    }

    fn drop_column_keyword(&self) -> &'static str {
        "DROP"
    }

    fn truncate(&self, table: &str) -> String {
        format!("DELETE FROM {}", self.quote(table))
    }
}
