use super::{Backend, Dialect};
use crate::ast::AggregateFn;
use crate::error::Result;
use crate::schema::{Field, FieldType};

#[derive(Debug, Clone, Copy)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "INTEGER".into(),
            FieldType::String { length } => format!("VARCHAR({length})"),
            // Decimals are stored as text so no digits are lost to REAL affinity.
            FieldType::Text | FieldType::Decimal { .. } | FieldType::Json => "TEXT".into(),
            FieldType::Float => "REAL".into(),
            FieldType::Boolean => "INTEGER".into(),
            FieldType::Date | FieldType::DateTime => "TEXT".into(),
            FieldType::Binary => "BLOB".into(),
            FieldType::Geometry { srid } => {
                return Err(crate::error::DalError::unsupported(
                    self.backend(),
                    format!("geometry({srid}) column"),
                ))
            }
        })
    }

    fn id_column(&self) -> &'static str {
        "INTEGER"
    }

    fn id_key(&self) -> &'static str {
        " PRIMARY KEY AUTOINCREMENT"
    }

    fn aggregate(&self, func: AggregateFn, arg: &str, distinct: bool) -> Result<String> {
        let distinct = if distinct { "DISTINCT " } else { "" };
        Ok(match func {
            AggregateFn::ArrayAgg => format!("json_group_array({distinct}{arg})"),
            other => format!("{}({distinct}{arg})", other.name()),
        })
    }

    fn unbounded_limit(&self) -> &'static str {
        "-1"
    }

    /// Column types are affinities only; a widened declaration needs no
    /// statement.
    fn alter_column(&self, _table: &str, _field: &Field) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn truncate(&self, table: &str) -> String {
        format!("DELETE FROM {}", self.quote(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{select, Ddl};
    use crate::schema::Table;

    #[test]
    fn test_offset_only_uses_negative_limit() {
        let t = Table::builder("t")
            .field(Field::new("a", FieldType::Integer))
            .build()
            .unwrap();
        let q = select(&t).offset(3).build().unwrap();
        let r = SqliteDialect.render(&q.into()).unwrap();
        assert!(r.text.ends_with("LIMIT -1 OFFSET 3"));
    }

    #[test]
    fn test_truncate_is_delete() {
        let stmts = SqliteDialect
            .render_ddl(&Ddl::Truncate { table: "t".into() })
            .unwrap();
        assert_eq!(stmts, vec!["DELETE FROM \"t\"".to_string()]);
    }
}
