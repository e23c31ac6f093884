use super::{Backend, Dialect, SelectParts};
use crate::ast::LimitSpec;
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldType};

#[derive(Debug, Clone, Copy)]
pub struct InformixDialect;

impl Dialect for InformixDialect {
    fn backend(&self) -> Backend {
        Backend::Informix
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "INT8".into(),
            FieldType::String { length } if *length > 255 => format!("LVARCHAR({length})"),
            FieldType::String { length } => format!("VARCHAR({length})"),
            FieldType::Text | FieldType::Json => "TEXT".into(),
            FieldType::Float => "FLOAT".into(),
            FieldType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            FieldType::Boolean => "CHAR(1)".into(),
            FieldType::Date => "DATE".into(),
            FieldType::DateTime => "DATETIME YEAR TO FRACTION(5)".into(),
            FieldType::Binary => "BYTE".into(),
            FieldType::Geometry { .. } => {
                return Err(DalError::unsupported(self.backend(), "geometry column"))
            }
        })
    }

    fn id_column(&self) -> &'static str {
        "SERIAL8"
    }

    fn paginate(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        let mut window = String::new();
        if limit.offset > 0 {
            window.push_str(&format!("SKIP {} ", limit.offset));
        }
        if let Some(n) = limit.limit {
            window.push_str(&format!("FIRST {n} "));
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

    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        let null = if field.nullable { "" } else { " NOT NULL" };
        Ok(vec![format!(
            "ALTER TABLE {} MODIFY ({} {}{null})",
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
    fn test_skip_first() {
        let t = Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .build()
            .unwrap();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .limit(10)
            .offset(20)
            .build()
            .unwrap();
        let r = InformixDialect.render(&q.into()).unwrap();
        assert_eq!(
            r.text,
            "SELECT SKIP 20 FIRST 10 \"person\".\"name\" AS \"name\" FROM \"person\""
        );
    }
}
