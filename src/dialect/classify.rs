//! Decide whether raw SQL produces a result set.
//!
//! Raw statements bypass the expression engine, so the adapter has to guess
//! whether to read rows or an affected count. The text is parsed with
//! `sqlparser` in the backend's dialect; text it cannot parse falls back to
//! a keyword check.

use sqlparser::ast::Statement;
use sqlparser::dialect::{
    Dialect as SqlDialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect,
    SQLiteDialect,
};
use sqlparser::parser::Parser as SqlParser;

use super::Backend;

fn sql_dialect(backend: Backend) -> Box<dyn SqlDialect> {
    match backend {
        Backend::Postgres => Box::new(PostgreSqlDialect {}),
        Backend::MySql => Box::new(MySqlDialect {}),
        Backend::Sqlite => Box::new(SQLiteDialect {}),
        Backend::MsSql | Backend::MsSql2005 => Box::new(MsSqlDialect {}),
        _ => Box::new(GenericDialect {}),
    }
}

pub fn returns_rows(backend: Backend, sql: &str) -> bool {
    match SqlParser::parse_sql(sql_dialect(backend).as_ref(), sql) {
        Ok(statements) => statements.last().is_some_and(statement_returns_rows),
        Err(_) => keyword_returns_rows(sql),
    }
}

fn statement_returns_rows(statement: &Statement) -> bool {
    match statement {
        Statement::Query(_)
        | Statement::Explain { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowVariable { .. }
        | Statement::Pragma { .. } => true,
        Statement::Insert(insert) => insert.returning.is_some(),
        Statement::Update { returning, .. } => returning.is_some(),
        Statement::Delete(delete) => delete.returning.is_some(),
        _ => false,
    }
}

fn keyword_returns_rows(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    ["SELECT", "WITH", "SHOW", "EXPLAIN", "VALUES", "TABLE", "PRAGMA"]
        .iter()
        .any(|k| upper.starts_with(k))
        || upper.contains(" RETURNING ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_statements() {
        assert!(returns_rows(Backend::Postgres, "  select 1"));
        assert!(returns_rows(
            Backend::Postgres,
            "WITH x AS (SELECT 1) SELECT * FROM x"
        ));
        assert!(returns_rows(
            Backend::Postgres,
            "INSERT INTO t (a) VALUES (1) RETURNING id"
        ));
        assert!(!returns_rows(Backend::Postgres, "INSERT INTO t (a) VALUES ($1)"));
        assert!(!returns_rows(Backend::MySql, "UPDATE t SET a = 1"));
        assert!(returns_rows(Backend::MySql, "SHOW TABLES"));
    }

    #[test]
    fn test_unparsable_text_uses_keywords() {
        assert!(returns_rows(Backend::Oracle, "SELECT * FROM dual CONNECT BY LEVEL <= 3 ##"));
        assert!(!returns_rows(Backend::Oracle, "BEGIN my_proc; END; ##"));
    }
}
