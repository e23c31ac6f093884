use super::{Backend, Dialect};
use crate::ast::AggregateFn;
use crate::error::Result;
use crate::schema::{Field, FieldType};

#[derive(Debug, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn backend(&self) -> Backend {
        Backend::MySql
    }

    fn quote(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "BIGINT".into(),
            FieldType::String { length } => format!("VARCHAR({length})"),
            FieldType::Text => "LONGTEXT".into(),
            FieldType::Float => "DOUBLE".into(),
            FieldType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
            FieldType::Boolean => "TINYINT(1)".into(),
            FieldType::Date => "DATE".into(),
            FieldType::DateTime => "DATETIME(6)".into(),
            FieldType::Binary => "LONGBLOB".into(),
            FieldType::Json => "JSON".into(),
            FieldType::Geometry { srid } => format!("GEOMETRY SRID {srid}"),
        })
    }

    fn id_column(&self) -> &'static str {
        "BIGINT AUTO_INCREMENT"
    }

    fn aggregate(&self, func: AggregateFn, arg: &str, distinct: bool) -> Result<String> {
        let distinct = if distinct { "DISTINCT " } else { "" };
        Ok(match func {
            AggregateFn::ArrayAgg => format!("JSON_ARRAYAGG({distinct}{arg})"),
            other => format!("{}({distinct}{arg})", other.name()),
        })
    }

    fn geometry_read(&self, column: &str) -> Result<String> {
        Ok(format!("ST_AsText({column})"))
    }

    fn geometry_write(&self, placeholder: &str, srid: u32) -> Result<String> {
        Ok(format!("ST_GeomFromText({placeholder}, {srid})"))
    }

    fn unbounded_limit(&self) -> &'static str {
        "18446744073709551615"
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn alter_column(&self, table: &str, field: &Field) -> Result<Vec<String>> {
        let null = if field.nullable { "NULL" } else { "NOT NULL" };
        Ok(vec![format!(
            "ALTER TABLE {} MODIFY {} {} {null}",
            self.quote(table),
            self.quote(&field.name),
            self.column_type(&field.field_type)?
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{select, Ddl};
    use crate::schema::Table;

    #[test]
    fn test_backtick_quoting_and_limit() {
        let t = Table::builder("order")
            .field(Field::new("total", FieldType::decimal(10, 2)))
            .build()
            .unwrap();
        let q = select(&t).limit(5).build().unwrap();
        let r = MySqlDialect.render(&q.into()).unwrap();
        assert_eq!(
            r.text,
            "SELECT `order`.`id` AS `id`, `order`.`total` AS `total` FROM `order` LIMIT 5"
        );
    }

    #[test]
    fn test_modify_column() {
        let stmts = MySqlDialect
            .render_ddl(&Ddl::AlterColumn {
                table: "t".into(),
                field: Field::new("name", FieldType::string(128)).not_null(),
            })
            .unwrap();
        assert_eq!(
            stmts,
            vec!["ALTER TABLE `t` MODIFY `name` VARCHAR(128) NOT NULL".to_string()]
        );
    }
}
