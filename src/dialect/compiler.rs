/// Shared command → SQL renderer.
///
/// Produces ANSI SQL and defers every backend-specific decision to the
/// [`Dialect`] it renders for. Literals never appear in the text: each one
/// becomes a placeholder and an entry in [`Rendered::params`], in the order the
/// placeholders occur in the text.
use super::Dialect;
use crate::ast::*;
use crate::error::{DalError, Result};
use crate::schema::{Field, FieldType, IndexDef, Table};
use crate::value::Value;

/// One bound parameter with the semantic type it is represented under.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: Value,
    pub field_type: FieldType,
}

/// Backend text plus its parameters, ordered as their placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub text: String,
    pub params: Vec<Param>,
}

/// A select split into rendered clauses, handed to [`Dialect::paginate`].
#[derive(Debug, Clone, Default)]
pub struct SelectParts {
    pub distinct: bool,
    /// `expr AS "name"` items, in requested order.
    pub columns: Vec<String>,
    /// Quoted output names, aligned with `columns`.
    pub outputs: Vec<String>,
    /// Base source plus joins.
    pub from: String,
    pub filter: Option<String>,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    /// `expr ASC|DESC` items.
    pub order_by: Vec<String>,
}

impl SelectParts {
    pub fn distinct_keyword(&self) -> &'static str {
        if self.distinct {
            "DISTINCT "
        } else {
            ""
        }
    }

    pub fn select_list(&self) -> String {
        self.columns.join(", ")
    }

    /// `FROM ... [WHERE ...] [GROUP BY ...] [HAVING ...]`
    pub fn tail(&self) -> String {
        let mut out = format!("FROM {}", self.from);
        if let Some(filter) = &self.filter {
            out.push_str(&format!(" WHERE {filter}"));
        }
        if !self.group_by.is_empty() {
            out.push_str(&format!(" GROUP BY {}", self.group_by.join(", ")));
        }
        if let Some(having) = &self.having {
            out.push_str(&format!(" HAVING {having}"));
        }
        out
    }

    /// The ORDER BY list, without the keyword.
    pub fn order_list(&self) -> Option<String> {
        if self.order_by.is_empty() {
            None
        } else {
            Some(self.order_by.join(", "))
        }
    }

    pub fn assemble(&self, with_order: bool) -> String {
        let mut sql = format!(
            "SELECT {}{} {}",
            self.distinct_keyword(),
            self.select_list(),
            self.tail()
        );
        if with_order {
            if let Some(order) = self.order_list() {
                sql.push_str(&format!(" ORDER BY {order}"));
            }
        }
        sql
    }
}

/// Render any command with the shared rules.
pub fn render<D: Dialect + ?Sized>(dialect: &D, command: &Command) -> Result<Rendered> {
    let mut r = Renderer::new(dialect);
    let text = match command {
        Command::Select(q) => r.select(q)?,
        Command::Insert(i) => r.insert(i)?,
        Command::Update(u) => r.update(u)?,
        Command::Delete(d) => r.delete(d)?,
        Command::Ddl(ddl) => dialect.render_ddl(ddl)?.join(";\n"),
    };
    Ok(Rendered {
        text,
        params: r.params,
    })
}

/// Render only the clauses of a select, for dialects that build their own
/// statement around them.
pub fn select_parts<D: Dialect + ?Sized>(
    dialect: &D,
    query: &SelectQuery,
) -> Result<(SelectParts, Vec<Param>)> {
    let mut r = Renderer::new(dialect);
    let parts = r.select_parts(query)?;
    Ok((parts, r.params))
}

struct Renderer<'d, D: Dialect + ?Sized> {
    dialect: &'d D,
    params: Vec<Param>,
}

impl<'d, D: Dialect + ?Sized> Renderer<'d, D> {
    fn new(dialect: &'d D) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn q(&self, ident: &str) -> String {
        self.dialect.quote(ident)
    }

    fn bind(&mut self, value: &Value, field_type: &FieldType) -> Result<String> {
        self.params.push(Param {
            value: value.clone(),
            field_type: field_type.clone(),
        });
        let placeholder = self.dialect.placeholder(self.params.len());
        match field_type {
            FieldType::Geometry { srid } if !value.is_null() => {
                self.dialect.geometry_write(&placeholder, *srid)
            }
            _ => Ok(placeholder),
        }
    }

    fn field(&self, f: &FieldRef) -> String {
        format!("{}.{}", self.q(f.source()), self.q(&f.name))
    }

    fn expr(&mut self, expr: &Expr) -> Result<String> {
        Ok(match expr {
            Expr::Field(f) => self.field(f),
            Expr::Literal { value, field_type } => self.bind(value, field_type)?,
            Expr::Comparison { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                match op {
                    CompareOp::ILike => self.dialect.ilike(&l, &r),
                    op => format!("{l} {} {r}", op.symbol()),
                }
            }
            Expr::Logical { op, children } => match op {
                LogicalOp::Not => {
                    let inner = match children.first() {
                        Some(c) => self.condition(c)?,
                        None => return Err(DalError::unsupported(self.dialect.backend(), "empty NOT")),
                    };
                    format!("NOT ({inner})")
                }
                LogicalOp::And | LogicalOp::Or if children.is_empty() => {
                    if *op == LogicalOp::And { "1 = 1" } else { "1 = 0" }.to_string()
                }
                LogicalOp::And | LogicalOp::Or => {
                    let joiner = if *op == LogicalOp::And { " AND " } else { " OR " };
                    let parts = children
                        .iter()
                        .map(|c| self.condition(c))
                        .collect::<Result<Vec<_>>>()?;
                    format!("({})", parts.join(joiner))
                }
            },
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                let inner = match arg {
                    Some(a) => self.expr(a)?,
                    None => "*".to_string(),
                };
                self.dialect.aggregate(*func, &inner, *distinct)?
            }
            Expr::IsNull { expr, negated } => {
                let inner = self.expr(expr)?;
                let not = if *negated { "NOT " } else { "" };
                format!("{inner} IS {not}NULL")
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let inner = self.expr(expr)?;
                let items = list
                    .iter()
                    .map(|e| self.expr(e))
                    .collect::<Result<Vec<_>>>()?;
                let not = if *negated { "NOT " } else { "" };
                format!("{inner} {not}IN ({})", items.join(", "))
            }
            Expr::Arithmetic { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                format!("({l} {} {r})", op.symbol())
            }
            Expr::Function { func, args } => {
                let args = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<Result<Vec<_>>>()?;
                self.dialect.function(*func, &args)?
            }
        })
    }

    /// Render an expression in a position that needs a predicate. Bare
    /// boolean values are compared with true so that backends without a
    /// native boolean type accept them.
    fn condition(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Comparison { .. }
            | Expr::Logical { .. }
            | Expr::IsNull { .. }
            | Expr::InList { .. } => self.expr(expr),
            other => {
                let value = self.expr(other)?;
                let truth = self.bind(&Value::Bool(true), &FieldType::Boolean)?;
                Ok(format!("{value} = {truth}"))
            }
        }
    }

    fn source(&self, table: &Table, alias: Option<&str>) -> String {
        match alias {
            Some(alias) => self.dialect.table_alias(table.name(), alias),
            None => self.q(table.name()),
        }
    }

    fn select_parts(&mut self, query: &SelectQuery) -> Result<SelectParts> {
        if !query.joins.is_empty() && !self.dialect.supports_joins() {
            return Err(DalError::unsupported(self.dialect.backend(), "JOIN"));
        }

        let mut columns = Vec::with_capacity(query.columns.len());
        let mut outputs = Vec::with_capacity(query.columns.len());
        for item in &query.columns {
            let mut sql = self.expr(&item.expr)?;
            if let Expr::Field(FieldRef {
                field_type: FieldType::Geometry { .. },
                ..
            }) = &item.expr
            {
                sql = self.dialect.geometry_read(&sql)?;
            }
            let name = self.q(&item.name);
            columns.push(format!("{sql} AS {name}"));
            outputs.push(name);
        }

        let mut from = self.source(&query.table, query.alias.as_deref());
        for join in &query.joins {
            let kind = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let source = self.source(&join.table, join.alias.as_deref());
            let on = self.condition(&join.on)?;
            from.push_str(&format!(" {kind} {source} ON {on}"));
        }

        let filter = match &query.filter {
            Some(f) => Some(self.condition(f)?),
            None => None,
        };
        let group_by = query
            .group_by
            .iter()
            .map(|g| self.expr(g))
            .collect::<Result<Vec<_>>>()?;
        let having = match &query.having {
            Some(h) => Some(self.condition(h)?),
            None => None,
        };
        let order_by = query
            .order_by
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                Ok(format!("{} {dir}", self.expr(&o.expr)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SelectParts {
            distinct: query.distinct,
            columns,
            outputs,
            from,
            filter,
            group_by,
            having,
            order_by,
        })
    }

    fn select(&mut self, query: &SelectQuery) -> Result<String> {
        let parts = self.select_parts(query)?;
        self.dialect.paginate(&parts, &query.limit)
    }

    fn insert(&mut self, cmd: &InsertCommand) -> Result<String> {
        let table = cmd.table.name();
        if cmd.rows.len() > 1 && !self.dialect.multi_row_insert() {
            return Err(DalError::unsupported(
                self.dialect.backend(),
                format!("multi-row INSERT into {table}"),
            ));
        }
        let mut sql = format!("INSERT INTO {}", self.q(table));
        if cmd.columns.is_empty() {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let types = cmd
                .columns
                .iter()
                .map(|c| {
                    cmd.table
                        .get_field(c)
                        .map(|f| f.field_type.clone())
                        .ok_or_else(|| DalError::UnknownField {
                            table: table.to_string(),
                            field: c.clone(),
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            let names: Vec<String> = cmd.columns.iter().map(|c| self.q(c)).collect();
            sql.push_str(&format!(" ({}) VALUES ", names.join(", ")));
            let mut rows = Vec::with_capacity(cmd.rows.len());
            for row in &cmd.rows {
                let values = row
                    .iter()
                    .zip(&types)
                    .map(|(v, t)| self.bind(v, t))
                    .collect::<Result<Vec<_>>>()?;
                rows.push(format!("({})", values.join(", ")));
            }
            sql.push_str(&rows.join(", "));
        }
        if let Some(id) = cmd.table.id_field() {
            if let Some(returning) = self.dialect.returning_id(&id.name) {
                sql.push_str(&returning);
            }
        }
        Ok(sql)
    }

    fn update(&mut self, cmd: &UpdateCommand) -> Result<String> {
        let mut sets = Vec::with_capacity(cmd.assignments.len());
        for (name, expr) in &cmd.assignments {
            let value = self.expr(expr)?;
            sets.push(format!("{} = {value}", self.q(name)));
        }
        let mut sql = format!("UPDATE {} SET {}", self.q(cmd.table.name()), sets.join(", "));
        if let Some(filter) = &cmd.filter {
            sql.push_str(&format!(" WHERE {}", self.condition(filter)?));
        }
        Ok(sql)
    }

    fn delete(&mut self, cmd: &DeleteCommand) -> Result<String> {
        let mut sql = format!("DELETE FROM {}", self.q(cmd.table.name()));
        if let Some(filter) = &cmd.filter {
            sql.push_str(&format!(" WHERE {}", self.condition(filter)?));
        }
        Ok(sql)
    }
}

/// Column definition for CREATE TABLE / ADD COLUMN.
pub fn column_definition<D: Dialect + ?Sized>(
    dialect: &D,
    field: &Field,
    inline_key: bool,
) -> Result<String> {
    let name = dialect.quote(&field.name);
    if field.field_type == FieldType::Id {
        let key = if inline_key { dialect.id_key() } else { "" };
        return Ok(format!("{name} {}{key}", dialect.id_column()));
    }
    let mut def = format!("{name} {}", dialect.column_type(&field.field_type)?);
    if !field.nullable {
        def.push_str(" NOT NULL");
    }
    if field.unique {
        def.push_str(" UNIQUE");
    }
    if let FieldType::Reference { table } = &field.field_type {
        def.push_str(&format!(
            " REFERENCES {} ({})",
            dialect.quote(table),
            dialect.quote("id")
        ));
    }
    Ok(def)
}

fn create_index<D: Dialect + ?Sized>(dialect: &D, table: &str, index: &IndexDef) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let cols: Vec<String> = index.fields.iter().map(|f| dialect.quote(f)).collect();
    format!(
        "CREATE {unique}INDEX {} ON {} ({})",
        dialect.quote(&index.name),
        dialect.quote(table),
        cols.join(", ")
    )
}

/// Default DDL rendering.
pub fn render_ddl<D: Dialect + ?Sized>(dialect: &D, ddl: &Ddl) -> Result<Vec<String>> {
    Ok(match ddl {
        Ddl::CreateTable(table) => {
            let id_key = table
                .id_field()
                .map_or(false, |id| table.primary_key() == std::slice::from_ref(&id.name));
            let mut defs = table
                .fields()
                .iter()
                .map(|f| column_definition(dialect, f, id_key))
                .collect::<Result<Vec<_>>>()?;
            if !id_key {
                let keys: Vec<String> =
                    table.primary_key().iter().map(|k| dialect.quote(k)).collect();
                defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
            }
            let mut out = vec![format!(
                "CREATE TABLE {} ({})",
                dialect.quote(table.name()),
                defs.join(", ")
            )];
            for index in &table.options().indexes {
                out.push(create_index(dialect, table.name(), index));
            }
            out
        }
        Ddl::AddColumn { table, field } => vec![format!(
            "ALTER TABLE {} {} {}",
            dialect.quote(table),
            dialect.add_column_keyword(),
            column_definition(dialect, field, false)?
        )],
        Ddl::AlterColumn { table, field } => dialect.alter_column(table, field)?,
        Ddl::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} {} {}",
            dialect.quote(table),
            dialect.drop_column_keyword(),
            dialect.quote(column)
        )],
        Ddl::CreateIndex { table, index } => vec![create_index(dialect, table, index)],
        Ddl::DropTable { table } => vec![format!("DROP TABLE {}", dialect.quote(table))],
        Ddl::Truncate { table } => vec![dialect.truncate(table)],
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dialect::Backend;
    use crate::schema::Field;

    fn person() -> Arc<Table> {
        Table::builder("person")
            .field(Field::new("name", FieldType::string(64)).not_null())
            .field(Field::new("age", FieldType::Integer))
            .field(Field::new("active", FieldType::Boolean))
            .index("person_name", ["name"], true)
            .build()
            .unwrap()
    }

    fn dog() -> Arc<Table> {
        Table::builder("dog")
            .field(Field::new("name", FieldType::string(32)))
            .field(Field::new("owner", FieldType::reference("person")))
            .build()
            .unwrap()
    }

    fn render_for(backend: Backend, command: impl Into<Command>) -> Rendered {
        backend.dialect().render(&command.into()).unwrap()
    }

    #[test]
    fn test_select_with_filter_and_window() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .filter(t.field("age").unwrap().gt(18).unwrap())
            .order_by(t.field("name").unwrap().asc())
            .limit(10)
            .offset(20)
            .build()
            .unwrap();
        let r = render_for(Backend::Postgres, q);
        assert_eq!(
            r.text,
            "SELECT \"person\".\"name\" AS \"name\" FROM \"person\" \
             WHERE \"person\".\"age\" > $1 ORDER BY \"person\".\"name\" ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            r.params,
            vec![Param {
                value: Value::Int(18),
                field_type: FieldType::Integer
            }]
        );
    }

    #[test]
    fn test_columns_keep_requested_order() {
        let t = person();
        let q = select(&t)
            .column(t.field("age").unwrap())
            .column(t.field("name").unwrap())
            .build()
            .unwrap();
        let r = render_for(Backend::Sqlite, q);
        assert!(r
            .text
            .starts_with("SELECT \"person\".\"age\" AS \"age\", \"person\".\"name\" AS \"name\""));
    }

    #[test]
    fn test_placeholders_follow_text_order() {
        let p = person();
        let d = dog();
        let q = select(&d)
            .column(d.field("name").unwrap())
            .join(
                &p,
                d.field("owner")
                    .unwrap()
                    .eq(p.field("id").unwrap())
                    .unwrap()
                    .and(p.field("age").unwrap().gt(3).unwrap())
                    .unwrap(),
            )
            .filter(d.field("name").unwrap().eq("rex").unwrap())
            .build()
            .unwrap();
        let r = render_for(Backend::MsSql, q);
        let first = r.text.find("@P1").unwrap();
        let second = r.text.find("@P2").unwrap();
        assert!(first < second);
        assert_eq!(r.params[0].value, Value::Int(3));
        assert_eq!(r.params[1].value, Value::from("rex"));
    }

    #[test]
    fn test_ilike_fallback_and_native() {
        let t = person();
        let q = select(&t)
            .filter(t.field("name").unwrap().ilike("%ann%").unwrap())
            .build()
            .unwrap();
        let sqlite = render_for(Backend::Sqlite, q.clone());
        assert!(sqlite
            .text
            .contains("LOWER(\"person\".\"name\") LIKE LOWER(?)"));
        let pg = render_for(Backend::Postgres, q);
        assert!(pg.text.contains("\"person\".\"name\" ILIKE $1"));
    }

    #[test]
    fn test_bare_boolean_condition() {
        let t = person();
        let q = select(&t)
            .filter(Expr::from(t.field("active").unwrap()))
            .build()
            .unwrap();
        let r = render_for(Backend::Oracle, q);
        assert!(r.text.contains("WHERE \"person\".\"active\" = :1"));
        assert_eq!(r.params[0].value, Value::Bool(true));
    }

    #[test]
    fn test_insert_returning_only_where_supported() {
        let t = person();
        let cmd = insert(&t, [("name", Value::from("Ann")), ("age", Value::Int(30))]).unwrap();
        let pg = render_for(Backend::Postgres, cmd.clone());
        assert_eq!(
            pg.text,
            "INSERT INTO \"person\" (\"name\", \"age\") VALUES ($1, $2) RETURNING \"id\""
        );
        let my = render_for(Backend::MySql, cmd);
        assert_eq!(my.text, "INSERT INTO `person` (`name`, `age`) VALUES (?, ?)");
    }

    #[test]
    fn test_update_and_delete() {
        let t = person();
        let u = update(&t)
            .set_expr("age", t.field("age").unwrap().add(1).unwrap())
            .unwrap()
            .filter(t.field("name").unwrap().eq("Ann").unwrap())
            .build()
            .unwrap();
        let r = render_for(Backend::Postgres, u);
        assert_eq!(
            r.text,
            "UPDATE \"person\" SET \"age\" = (\"person\".\"age\" + $1) WHERE \"person\".\"name\" = $2"
        );
        let d = delete(&t)
            .filter(t.field("age").unwrap().is_null())
            .build()
            .unwrap();
        let r = render_for(Backend::Sqlite, d);
        assert_eq!(r.text, "DELETE FROM \"person\" WHERE \"person\".\"age\" IS NULL");
        assert!(r.params.is_empty());
    }

    #[test]
    fn test_array_agg_rejected_on_oracle() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap().array_agg().unwrap())
            .build()
            .unwrap();
        let err = Backend::Oracle.dialect().render(&q.into()).unwrap_err();
        assert!(matches!(err, DalError::UnsupportedConstruct { .. }));
        assert!(err.to_string().contains("ARRAY_AGG"));
    }

    #[test]
    fn test_create_table_ddl() {
        let stmts = Backend::Postgres
            .dialect()
            .render_ddl(&Ddl::CreateTable(person()))
            .unwrap();
        assert_eq!(
            stmts,
            vec![
                "CREATE TABLE \"person\" (\"id\" BIGSERIAL PRIMARY KEY, \
                 \"name\" VARCHAR(64) NOT NULL, \"age\" BIGINT, \"active\" BOOLEAN)"
                    .to_string(),
                "CREATE UNIQUE INDEX \"person_name\" ON \"person\" (\"name\")".to_string(),
            ]
        );
        let dog_stmts = Backend::Postgres
            .dialect()
            .render_ddl(&Ddl::CreateTable(dog()))
            .unwrap();
        assert!(dog_stmts[0].contains("\"owner\" BIGINT REFERENCES \"person\" (\"id\")"));
    }

    #[test]
    fn test_composite_primary_key() {
        let t = Table::builder("membership")
            .field(Field::new("team", FieldType::Integer).not_null())
            .field(Field::new("member", FieldType::Integer).not_null())
            .primary_key(["team", "member"])
            .build()
            .unwrap();
        let stmts = Backend::Sqlite
            .dialect()
            .render_ddl(&Ddl::CreateTable(t))
            .unwrap();
        assert!(stmts[0].ends_with("PRIMARY KEY (\"team\", \"member\"))"));
    }
}
