use super::{Backend, Dialect};
use crate::ast::AggregateFn;
use crate::error::Result;
use crate::schema::FieldType;

#[derive(Debug, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        Ok(match field_type {
            FieldType::Id | FieldType::Integer | FieldType::Reference { .. } => "BIGINT".into(),
            FieldType::String { length } => format!("VARCHAR({length})"),
            FieldType::Text => "TEXT".into(),
            FieldType::Float => "DOUBLE PRECISION".into(),
            FieldType::Decimal { precision, scale } => format!("NUMERIC({precision},{scale})"),
            FieldType::Boolean => "BOOLEAN".into(),
            FieldType::Date => "DATE".into(),
            FieldType::DateTime => "TIMESTAMPTZ".into(),
            FieldType::Binary => "BYTEA".into(),
            FieldType::Json => "JSONB".into(),
            FieldType::Geometry { srid } => format!("GEOMETRY(GEOMETRY,{srid})"),
        })
    }

    fn id_column(&self) -> &'static str {
        "BIGSERIAL"
    }

    fn ilike(&self, left: &str, right: &str) -> String {
        format!("{left} ILIKE {right}")
    }

    fn aggregate(&self, func: AggregateFn, arg: &str, distinct: bool) -> Result<String> {
        let distinct = if distinct { "DISTINCT " } else { "" };
        Ok(match func {
            AggregateFn::ArrayAgg => format!("array_to_json(ARRAY_AGG({distinct}{arg}))"),
            other => format!("{}({distinct}{arg})", other.name()),
        })
    }

    fn geometry_read(&self, column: &str) -> Result<String> {
        Ok(format!("ST_AsText({column})"))
    }

    fn geometry_write(&self, placeholder: &str, srid: u32) -> Result<String> {
        Ok(format!("ST_GeomFromText({placeholder}, {srid})"))
    }

    fn returning_id(&self, id_column: &str) -> Option<String> {
        Some(format!(" RETURNING {}", self.quote(id_column)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{select, LimitSpec};
    use crate::schema::{Field, Table};

    #[test]
    fn test_offset_without_limit() {
        let t = Table::builder("t")
            .field(Field::new("a", FieldType::Integer))
            .build()
            .unwrap();
        let q = select(&t).offset(5).build().unwrap();
        let r = PostgresDialect.render(&q.into()).unwrap();
        assert!(r.text.ends_with("LIMIT ALL OFFSET 5"));
        assert!(LimitSpec::default().is_noop());
    }

    #[test]
    fn test_geometry_round_trip_sql() {
        let t = Table::builder("place")
            .field(Field::new("loc", FieldType::geometry(4326)))
            .build()
            .unwrap();
        let q = select(&t)
            .column(t.field("loc").unwrap())
            .filter(t.field("loc").unwrap().eq("POINT(1 2)").unwrap())
            .build()
            .unwrap();
        let r = PostgresDialect.render(&q.into()).unwrap();
        assert!(r.text.contains("ST_AsText(\"place\".\"loc\") AS \"loc\""));
        assert!(r.text.contains("= ST_GeomFromText($1, 4326)"));
    }

    #[test]
    fn test_array_agg_as_json() {
        let t = Table::builder("t")
            .field(Field::new("a", FieldType::Integer))
            .build()
            .unwrap();
        let q = select(&t)
            .column(t.field("a").unwrap().array_agg().unwrap())
            .build()
            .unwrap();
        let r = PostgresDialect.render(&q.into()).unwrap();
        assert!(r
            .text
            .starts_with("SELECT array_to_json(ARRAY_AGG(\"t\".\"a\")) AS \"array_agg_a\""));
    }
}
