use tokio_postgres::Client;

use super::convert::map_error;
use crate::db::driver::{ColumnInfo, TableInfo};
use crate::error::Result;
use crate::schema::FieldType;

pub async fn get_table(client: &Client, table: &str) -> Result<Option<TableInfo>> {
    let rows = client
        .query(
            r#"
            SELECT
                c.column_name as name,
                c.data_type,
                c.udt_name,
                c.is_nullable = 'YES' as is_nullable,
                c.character_maximum_length as max_length,
                c.numeric_precision,
                c.numeric_scale
            FROM information_schema.columns c
            WHERE c.table_schema = current_schema() AND c.table_name = $1
            ORDER BY c.ordinal_position
            "#,
            &[&table],
        )
        .await
        .map_err(map_error)?;

    if rows.is_empty() {
        return Ok(None);
    }

    let columns = rows
        .iter()
        .map(|row| {
            let data_type: String = row.get("data_type");
            let udt_name: String = row.get("udt_name");
            let max_length: Option<i32> = row.get("max_length");
            let precision: Option<i32> = row.get("numeric_precision");
            let scale: Option<i32> = row.get("numeric_scale");
            ColumnInfo {
                name: row.get("name"),
                field_type: semantic_type(&data_type, &udt_name, max_length, precision, scale),
                type_name: data_type,
                nullable: row.get("is_nullable"),
            }
        })
        .collect();

    Ok(Some(TableInfo {
        name: table.to_string(),
        columns,
        indexes: get_indexes(client, table).await?,
    }))
}

async fn get_indexes(client: &Client, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            r#"
            SELECT i.relname as index_name
            FROM pg_catalog.pg_index ix
            JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
            JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            WHERE n.nspname = current_schema() AND t.relname = $1
            ORDER BY i.relname
            "#,
            &[&table],
        )
        .await
        .map_err(map_error)?;
    Ok(rows.iter().map(|row| row.get("index_name")).collect())
}

/// Map an information_schema column type back to a semantic type.
///
/// Geometry columns report srid 0; their srid lives in PostGIS metadata.
pub fn semantic_type(
    data_type: &str,
    udt_name: &str,
    max_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> Option<FieldType> {
    Some(match data_type {
        "bigint" | "integer" | "smallint" => FieldType::Integer,
        "character varying" | "character" => match max_length {
            Some(n) => FieldType::String {
                length: u32::try_from(n).ok()?,
            },
            None => FieldType::Text,
        },
        "text" => FieldType::Text,
        "double precision" | "real" => FieldType::Float,
        "numeric" => FieldType::Decimal {
            precision: u8::try_from(precision?).ok()?,
            scale: u8::try_from(scale.unwrap_or(0)).ok()?,
        },
        "boolean" => FieldType::Boolean,
        "date" => FieldType::Date,
        "timestamp with time zone" | "timestamp without time zone" => FieldType::DateTime,
        "bytea" => FieldType::Binary,
        "json" | "jsonb" => FieldType::Json,
        "USER-DEFINED" if udt_name == "geometry" => FieldType::Geometry { srid: 0 },
        _ => return None,
    })
}
