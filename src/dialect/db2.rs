use super::{Backend, Dialect, SelectParts};
use crate::ast::LimitSpec;
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldType};

#[derive(Debug, Clone, Copy)]
pub struct Db2Dialect;

impl Dialect for Db2Dialect {
    fn backend(&self) -> Backend {
        Backend::Db2
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "BIGINT".into(),
            FieldType::String { length } => format!("VARCHAR({length})"),
            FieldType::Text | FieldType::Json => "CLOB".into(),
            FieldType::Float => "DOUBLE".into(),
            FieldType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
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
        "BIGINT NOT NULL GENERATED BY DEFAULT AS IDENTITY"
    }

    /// `FETCH FIRST` for plain limits, a ROW_NUMBER() window once an offset
    /// is involved.
    fn paginate(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        match (limit.limit, limit.offset) {
            (None, 0) => Ok(parts.assemble(true)),
            (Some(n), 0) => Ok(format!("{} FETCH FIRST {n} ROWS ONLY", parts.assemble(true))),
            (_, offset) => {
                if parts.distinct {
                    return Err(DalError::unsupported(
                        self.backend(),
                        "DISTINCT with offset pagination",
                    ));
                }
                let order = parts.order_list().unwrap_or_else(|| "1".to_string());
                let rn = self.quote("__rn");
                let mut sql = format!(
                    "SELECT {} FROM (SELECT {}, ROW_NUMBER() OVER (ORDER BY {order}) AS {rn} {}) AS {} WHERE {rn} > {offset}",
                    parts.outputs.join(", "),
                    parts.select_list(),
                    parts.tail(),
                    self.quote("__w"),
                );
                if let Some(last) = limit.last_row() {
                    sql.push_str(&format!(" AND {rn} <= {last}"));
                }
                sql.push_str(&format!(" ORDER BY {rn}"));
                Ok(sql)
            }
        }
    }

    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        let table = self.quote(table);
        let column = self.quote(&field.name);
        let nullability = if field.nullable { "DROP" } else { "SET" };
        Ok(vec![
            format!(
                "ALTER TABLE {table} ALTER COLUMN {column} SET DATA TYPE {}",
                self.column_type(&field.field_type)?
            ),
            format!("ALTER TABLE {table} ALTER COLUMN {column} {nullability} NOT NULL"),
        ])
    }

    fn truncate(&self, table: &str) -> String {
        format!("TRUNCATE TABLE {} IMMEDIATE", self.quote(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::select;
    use crate::schema::Table;

    #[test]
    fn test_fetch_first_and_window() {
        let t = Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .build()
            .unwrap();
        let first = select(&t)
            .column(t.field("name").unwrap())
            .limit(3)
            .build()
            .unwrap();
        let r = Db2Dialect.render(&first.into()).unwrap();
        assert!(r.text.ends_with("FROM \"person\" FETCH FIRST 3 ROWS ONLY"));

        let paged = select(&t)
            .column(t.field("name").unwrap())
            .limit(3)
            .offset(6)
            .build()
            .unwrap();
        let r = Db2Dialect.render(&paged.into()).unwrap();
        assert!(r.text.contains("ROW_NUMBER() OVER (ORDER BY 1)"));
        assert!(r.text.contains("\"__rn\" > 6 AND \"__rn\" <= 9"));
    }

    #[test]
    fn test_window_with_huge_limit() {
        let t = Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .build()
            .unwrap();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .limit(u64::MAX)
            .offset(5)
            .build()
            .unwrap();
        let r = Db2Dialect.render(&q.into()).unwrap();
        assert!(r.text.contains("\"__rn\" > 5 ORDER BY"), "{}", r.text);
        assert!(!r.text.contains("<="));
    }
}
