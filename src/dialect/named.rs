use super::Dialect;
use crate::error::{DalError, Result};

/// Rewrite `:name` parameters in raw SQL into the dialect's positional
/// placeholders.
///
/// Returns the rewritten text and the parameter names in placeholder order.
/// A name used twice occupies two positions. Quoted regions and `::` casts
/// are left alone.
pub fn bind_named(sql: &str, dialect: &dyn Dialect) -> Result<(String, Vec<String>)> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut names = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                names.push(chars[start..end].iter().collect());
                out.push_str(&dialect.placeholder(names.len()));
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    if let Some(q) = quote {
        return Err(DalError::Statement {
            backend: dialect.backend().name().to_string(),
            code: None,
            message: format!("unterminated {q} quote in statement"),
        });
    }
    Ok((out, names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Backend;

    #[test]
    fn test_named_to_positional() {
        let pg = Backend::Postgres.dialect();
        let (sql, names) = bind_named(
            "SELECT * FROM person WHERE age > :min AND name = :name OR age < :min",
            pg.as_ref(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM person WHERE age > $1 AND name = $2 OR age < $3"
        );
        assert_eq!(names, vec!["min", "name", "min"]);
    }

    #[test]
    fn test_quotes_and_casts_untouched() {
        let sqlite = Backend::Sqlite.dialect();
        let (sql, names) = bind_named(
            "SELECT ':skip', created::date FROM \"a:b\" WHERE id = :id",
            sqlite.as_ref(),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT ':skip', created::date FROM \"a:b\" WHERE id = ?"
        );
        assert_eq!(names, vec!["id"]);
    }

    #[test]
    fn test_unterminated_quote() {
        let pg = Backend::Postgres.dialect();
        assert!(bind_named("SELECT 'oops", pg.as_ref()).is_err());
    }
}
