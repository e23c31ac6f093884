use std::error::Error as StdError;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

use crate::error::DalError;
use crate::value::RawValue;

/// Borrowed parameter adapting a [`RawValue`] to whatever type the server
/// inferred for its placeholder.
#[derive(Debug)]
pub struct PgParam<'a>(pub &'a RawValue);

type BoxError = Box<dyn StdError + Sync + Send>;

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            RawValue::Null => Ok(IsNull::Yes),
            RawValue::Bool(b) => b.to_sql(ty, out),
            RawValue::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                Type::BOOL => (*i != 0).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            RawValue::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            RawValue::Decimal(d) => match *ty {
                Type::FLOAT8 => d
                    .to_f64()
                    .ok_or("decimal does not fit a double")?
                    .to_sql(ty, out),
                _ => d.to_sql(ty, out),
            },
            RawValue::Text(s) => s.as_str().to_sql(ty, out),
            RawValue::Bytes(b) => b.as_slice().to_sql(ty, out),
            RawValue::Date(d) => d.to_sql(ty, out),
            RawValue::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => ts.and_utc().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            RawValue::TimestampTz(ts) => match *ty {
                Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            RawValue::Json(j) => j.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Read column `idx` of `row` into a raw value according to its server type.
pub fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> Result<RawValue, DalError> {
    fn get<'a, T>(row: &'a Row, idx: usize, map: impl FnOnce(T) -> RawValue) -> Result<RawValue, DalError>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx)
            .map(|v| v.map(map).unwrap_or(RawValue::Null))
            .map_err(|e| DalError::Statement {
                backend: "postgres".into(),
                code: None,
                message: format!("cannot read column {idx}: {e}"),
            })
    }

    match *pg_type {
        Type::BOOL => get::<bool>(row, idx, RawValue::Bool),
        Type::INT2 => get::<i16>(row, idx, |v| RawValue::Int(v.into())),
        Type::INT4 => get::<i32>(row, idx, |v| RawValue::Int(v.into())),
        Type::INT8 => get::<i64>(row, idx, RawValue::Int),
        Type::FLOAT4 => get::<f32>(row, idx, |v| RawValue::Float(v.into())),
        Type::FLOAT8 => get::<f64>(row, idx, RawValue::Float),
        Type::NUMERIC => get::<Decimal>(row, idx, RawValue::Decimal),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get::<String>(row, idx, RawValue::Text)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx, RawValue::Bytes),
        Type::DATE => get::<NaiveDate>(row, idx, RawValue::Date),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx, RawValue::Timestamp),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx, RawValue::TimestampTz),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx, RawValue::Json),
        _ => get::<String>(row, idx, RawValue::Text).or_else(|_| {
            Ok(RawValue::Text(format!("<{}>", pg_type.name())))
        }),
    }
}

/// Map a tokio-postgres failure onto the error taxonomy by SQLSTATE class.
pub fn map_error(err: tokio_postgres::Error) -> DalError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code().to_string();
        let message = db.message().to_string();
        return match categorize_sqlstate(&code) {
            SqlStateClass::Connection => DalError::Connection {
                backend: "postgres".into(),
                message,
                source: Some(Box::new(err)),
            },
            SqlStateClass::Conflict => DalError::TransactionConflict {
                backend: "postgres".into(),
                message,
            },
            SqlStateClass::Other => DalError::Statement {
                backend: "postgres".into(),
                code: Some(code),
                message,
            },
        };
    }
    if err.is_closed() || err.source().is_some() {
        return DalError::Connection {
            backend: "postgres".into(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        };
    }
    DalError::Statement {
        backend: "postgres".into(),
        code: None,
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStateClass {
    Connection,
    Conflict,
    Other,
}

/// Categorize a SQLSTATE code.
pub fn categorize_sqlstate(code: &str) -> SqlStateClass {
    match code.get(..2) {
        // Class 08: Connection Exception
        Some("08") => SqlStateClass::Connection,
        // 57P01..57P03: admin shutdown, crash shutdown, cannot connect now
        Some("57") if code.starts_with("57P") => SqlStateClass::Connection,
        // Class 40: Transaction Rollback (serialization failure, deadlock)
        Some("40") => SqlStateClass::Conflict,
        _ => SqlStateClass::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("08006"), SqlStateClass::Connection);
        assert_eq!(categorize_sqlstate("57P01"), SqlStateClass::Connection);
        assert_eq!(categorize_sqlstate("40001"), SqlStateClass::Conflict);
        assert_eq!(categorize_sqlstate("40P01"), SqlStateClass::Conflict);
        assert_eq!(categorize_sqlstate("23505"), SqlStateClass::Other);
        assert_eq!(categorize_sqlstate("4"), SqlStateClass::Other);
    }

    #[test]
    fn test_param_encodes_to_inferred_type() {
        let mut out = BytesMut::new();
        let param = PgParam(&RawValue::Int(7));
        assert!(matches!(param.to_sql(&Type::INT4, &mut out), Ok(IsNull::No)));
        assert_eq!(out.len(), 4);

        let mut out = BytesMut::new();
        let too_big = PgParam(&RawValue::Int(i64::MAX));
        assert!(too_big.to_sql(&Type::INT2, &mut out).is_err());

        let mut out = BytesMut::new();
        assert!(matches!(
            PgParam(&RawValue::Null).to_sql(&Type::TEXT, &mut out),
            Ok(IsNull::Yes)
        ));
    }
}
