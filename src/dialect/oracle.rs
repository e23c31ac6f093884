use super::{Backend, Dialect, SelectParts};
use crate::ast::LimitSpec;
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldType};

#[derive(Debug, Clone, Copy)]
pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn backend(&self) -> Backend {
        Backend::Oracle
    }

    fn placeholder(&self, n: usize) -> String {
        format!(":{n}")
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => {
                "NUMBER(19)".into()
            }
            FieldType::String { length } => format!("VARCHAR2({length} CHAR)"),
            FieldType::Text | FieldType::Json => "CLOB".into(),
            FieldType::Float => "BINARY_DOUBLE".into(),
            FieldType::Decimal { precision, scale } => format!("NUMBER({precision},{scale})"),
            FieldType::Boolean => "CHAR(1)".into(),
            FieldType::Date => "DATE".into(),
            FieldType::DateTime => "TIMESTAMP".into(),
            FieldType::Binary => "BLOB".into(),
            FieldType::Geometry { .. } => {
                return Err(DalError::unsupported(self.backend(), "geometry column"))
            }
        })
    }

    fn id_column(&self) -> &'static str {
        "NUMBER(19) GENERATED BY DEFAULT AS IDENTITY"
    }

    fn table_alias(&self, table: &str, alias: &str) -> String {
        format!("{} {}", self.quote(table), self.quote(alias))
    }

    /// ROWNUM is assigned before ORDER BY, so the ordered select is nested
    /// and numbered from outside.
    fn paginate(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        let inner = parts.assemble(true);
        if limit.is_noop() {
            return Ok(inner);
        }
        let outputs = parts.outputs.join(", ");
        if limit.offset == 0 {
            let n = limit.limit.unwrap_or(u64::MAX);
            return Ok(format!("SELECT {outputs} FROM ({inner}) WHERE ROWNUM <= {n}"));
        }
        let w = self.quote("__w");
        let rn = self.quote("__rn");
        let upper = match limit.last_row() {
            Some(last) => format!(" WHERE ROWNUM <= {last}"),
            None => String::new(),
        };
        Ok(format!(
            "SELECT {outputs} FROM (SELECT {w}.*, ROWNUM AS {rn} FROM ({inner}) {w}{upper}) WHERE {rn} > {}",
            limit.offset
        ))
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

    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} MODIFY ({} {})",
            self.quote(table),
            self.quote(&field.name),
            self.column_type(&field.field_type)?
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::select;
    use crate::schema::Table;

    #[test]
    fn test_rownum_window() {
        let t = Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .build()
            .unwrap();
        let q = select(&t)
            .alias("p")
            .column(t.alias("p").field("name").unwrap())
            .order_by(t.alias("p").field("name").unwrap().asc())
            .limit(10)
            .offset(20)
            .build()
            .unwrap();
        let r = OracleDialect.render(&q.into()).unwrap();
        assert_eq!(
            r.text,
            "SELECT \"name\" FROM (SELECT \"__w\".*, ROWNUM AS \"__rn\" FROM \
             (SELECT \"p\".\"name\" AS \"name\" FROM \"person\" \"p\" ORDER BY \"p\".\"name\" ASC) \
             \"__w\" WHERE ROWNUM <= 30) WHERE \"__rn\" > 20"
        );
    }

    #[test]
    fn test_limit_only() {
        let t = Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .build()
            .unwrap();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .distinct()
            .limit(5)
            .build()
            .unwrap();
        let r = OracleDialect.render(&q.into()).unwrap();
        assert_eq!(
            r.text,
            "SELECT \"name\" FROM (SELECT DISTINCT \"person\".\"name\" AS \"name\" FROM \"person\") \
             WHERE ROWNUM <= 5"
        );
    }

    #[test]
    fn test_huge_limit_drops_upper_bound() {
        let t = Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .build()
            .unwrap();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .order_by(t.field("name").unwrap().asc())
            .limit(u64::MAX)
            .offset(5)
            .build()
            .unwrap();
        let r = OracleDialect.render(&q.into()).unwrap();
        assert!(!r.text.contains("ROWNUM <="), "{}", r.text);
        assert!(r.text.ends_with("WHERE \"__rn\" > 5"));
    }
}
