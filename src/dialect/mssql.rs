use super::{Backend, Dialect, SelectParts};
use crate::ast::{LimitSpec, ScalarFn};
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldType};

/// SQL Server. 2012 and later paginate with OFFSET/FETCH; 2005 uses TOP and
/// a ROW_NUMBER() window.
#[derive(Debug, Clone, Copy)]
pub struct MsSqlDialect {
    backend: Backend,
}

impl MsSqlDialect {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn legacy(&self) -> bool {
        self.backend == Backend::MsSql2005
    }

    fn windowed(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        if parts.distinct {
            return Err(DalError::unsupported(
                self.backend,
                "DISTINCT with offset pagination",
            ));
        }
        let order = parts
            .order_list()
            .unwrap_or_else(|| "(SELECT NULL)".to_string());
        let rn = self.quote("__rn");
        let mut sql = format!(
            "SELECT {} FROM (SELECT {}, ROW_NUMBER() OVER (ORDER BY {order}) AS {rn} {}) AS {} WHERE {rn} > {}",
            parts.outputs.join(", "),
            parts.select_list(),
            parts.tail(),
            self.quote("__w"),
            limit.offset
        );
        if let Some(last) = limit.last_row() {
            sql.push_str(&format!(" AND {rn} <= {last}"));
        }
        sql.push_str(&format!(" ORDER BY {rn}"));
        Ok(sql)
    }
}

impl Dialect for MsSqlDialect {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn quote(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn placeholder(&self, n: usize) -> String {
        format!("@P{n}")
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "BIGINT".into(),
            FieldType::String { length } => format!("NVARCHAR({length})"),
            FieldType::Text | FieldType::Json => "NVARCHAR(MAX)".into(),
            FieldType::Float => "FLOAT".into(),
            FieldType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            FieldType::Boolean => "BIT".into(),
            FieldType::Date if self.legacy() => "DATETIME".into(),
            FieldType::Date => "DATE".into(),
            FieldType::DateTime if self.legacy() => "DATETIME".into(),
            FieldType::DateTime => "DATETIME2".into(),
            FieldType::Binary => "VARBINARY(MAX)".into(),
            FieldType::Geometry { .. } if self.legacy() => {
                return Err(DalError::unsupported(self.backend, "geometry column"))
            }
            FieldType::Geometry { .. } => "GEOMETRY".into(),
        })
    }

    fn id_column(&self) -> &'static str {
        "BIGINT IDENTITY(1,1)"
    }

    fn function(&self, func: ScalarFn, args: &[String]) -> Result<String> {
        let name = match func {
            ScalarFn::Length => "LEN",
            other => other.name(),
        };
        Ok(format!("{name}({})", args.join(", ")))
    }

    fn geometry_read(&self, column: &str) -> Result<String> {
        if self.legacy() {
            return Err(DalError::unsupported(self.backend, format!("geometry column {column}")));
        }
        Ok(format!("{column}.STAsText()"))
    }

    fn geometry_write(&self, placeholder: &str, srid: u32) -> Result<String> {
        if self.legacy() {
            return Err(DalError::unsupported(self.backend, "geometry value"));
        }
        Ok(format!("geometry::STGeomFromText({placeholder}, {srid})"))
    }

    fn paginate(&self, parts: &SelectParts, limit: &LimitSpec) -> Result<String> {
        if limit.is_noop() {
            return Ok(parts.assemble(true));
        }
        if self.legacy() {
            return match (limit.limit, limit.offset) {
                (Some(n), 0) => {
                    let mut sql = format!(
                        "SELECT {}TOP {n} {} {}",
                        parts.distinct_keyword(),
                        parts.select_list(),
                        parts.tail()
                    );
                    if let Some(order) = parts.order_list() {
                        sql.push_str(&format!(" ORDER BY {order}"));
                    }
                    Ok(sql)
                }
                _ => self.windowed(parts, limit),
            };
        }
        let order = parts
            .order_list()
            .unwrap_or_else(|| "(SELECT NULL)".to_string());
        let mut sql = format!(
            "{} ORDER BY {order} OFFSET {} ROWS",
            parts.assemble(false),
            limit.offset
        );
        if let Some(n) = limit.limit {
            sql.push_str(&format!(" FETCH NEXT {n} ROWS ONLY"));
        }
        Ok(sql)
    }

    fn multi_row_insert(&self) -> bool {
        !self.legacy()
    }

    fn add_column_keyword(&self) -> &'static str {
        "ADD"
    }

    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        let null = if field.nullable { "NULL" } else { "NOT NULL" };
        Ok(vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} {} {null}",
            self.quote(table),
            self.quote(&field.name),
            self.column_type(&field.field_type)?
        )])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ast::select;
    use crate::schema::Table;

    fn person() -> Arc<Table> {
        Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_offset_fetch() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .order_by(t.field("name").unwrap().asc())
            .limit(10)
            .offset(20)
            .build()
            .unwrap();
        let r = MsSqlDialect::new(Backend::MsSql).render(&q.into()).unwrap();
        assert_eq!(
            r.text,
            "SELECT [person].[name] AS [name] FROM [person] ORDER BY [person].[name] ASC \
             OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_legacy_top() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .limit(3)
            .build()
            .unwrap();
        let r = MsSqlDialect::new(Backend::MsSql2005)
            .render(&q.into())
            .unwrap();
        assert_eq!(
            r.text,
            "SELECT TOP 3 [person].[name] AS [name] FROM [person]"
        );
    }

    #[test]
    fn test_legacy_window() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .order_by(t.field("name").unwrap().desc())
            .limit(10)
            .offset(20)
            .build()
            .unwrap();
        let r = MsSqlDialect::new(Backend::MsSql2005)
            .render(&q.into())
            .unwrap();
        assert_eq!(
            r.text,
            "SELECT [name] FROM (SELECT [person].[name] AS [name], ROW_NUMBER() OVER \
             (ORDER BY [person].[name] DESC) AS [__rn] FROM [person]) AS [__w] \
             WHERE [__rn] > 20 AND [__rn] <= 30 ORDER BY [__rn]"
        );
    }

    #[test]
    fn test_distinct_window_is_unsupported() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .distinct()
            .limit(10)
            .offset(20)
            .build()
            .unwrap();
        let err = MsSqlDialect::new(Backend::MsSql2005)
            .render(&q.into())
            .unwrap_err();
        assert!(matches!(err, DalError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn test_len_function() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap().length().unwrap())
            .build()
            .unwrap();
        let r = MsSqlDialect::new(Backend::MsSql).render(&q.into()).unwrap();
        assert!(r.text.starts_with("SELECT LEN([person].[name]) AS [length_name]"));
    }

    #[test]
    fn test_legacy_window_with_huge_limit() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .order_by(t.field("name").unwrap().asc())
            .limit(u64::MAX)
            .offset(5)
            .build()
            .unwrap();
        let r = MsSqlDialect::new(Backend::MsSql2005)
            .render(&q.into())
            .unwrap();
        assert!(r.text.ends_with("WHERE [__rn] > 5 ORDER BY [__rn]"), "{}", r.text);
    }
}
