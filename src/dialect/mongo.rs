//! MongoDB renders commands as JSON database commands instead of SQL.
//!
//! Filters are expressed with `$expr` aggregation expressions so every
//! comparison, including field-to-field ones, has one uniform shape.
//! Parameters appear as `{"$param": n}` markers that the driver substitutes.

use serde_json::{json, Map, Value as Json};

use super::{Backend, Dialect, Param, Rendered};
use crate::ast::*;
use crate::error::{DalError, Result};
use crate::schema::{FieldType, IndexDef};
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub struct MongoDialect;

impl Dialect for MongoDialect {
    fn backend(&self) -> Backend {
        Backend::MongoDb
    }

    fn quote(&self, ident: &str) -> String {
        ident.to_string()
    }

    fn placeholder(&self, n: usize) -> String {
        json!({ "$param": n }).to_string()
    }

    /// Collections are schemaless; the semantic type name is what the
    /// migration ledger compares.
    fn column_type(&self, field_type: &FieldType) -> Result<String> {
        if let FieldType::Geometry { .. } = field_type {
            return Err(DalError::unsupported(self.backend(), "geometry field"));
        }
        Ok(field_type.to_string())
    }

    fn supports_joins(&self) -> bool {
        false
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn render(&self, command: &Command) -> Result<Rendered> {
        let mut r = DocRenderer { params: Vec::new() };
        let doc = match command {
            Command::Select(q) => r.select(q)?,
            Command::Insert(i) => r.insert(i)?,
            Command::Update(u) => r.update(u)?,
            Command::Delete(d) => r.delete(d)?,
            Command::Ddl(ddl) => {
                return Ok(Rendered {
                    text: self.render_ddl(ddl)?.join("\n"),
                    params: Vec::new(),
                })
            }
        };
        Ok(Rendered {
            text: doc.to_string(),
            params: r.params,
        })
    }

    fn render_ddl(&self, ddl: &Ddl) -> Result<Vec<String>> {
        let index_cmd = |table: &str, index: &IndexDef| {
            let mut key = Map::new();
            for f in &index.fields {
                key.insert(f.clone(), json!(1));
            }
            json!({
                "createIndexes": table,
                "indexes": [{ "key": key, "name": index.name, "unique": index.unique }]
            })
            .to_string()
        };
        Ok(match ddl {
            Ddl::CreateTable(table) => {
                for field in table.fields() {
                    self.column_type(&field.field_type)?;
                }
                let mut out = vec![json!({ "create": table.name() }).to_string()];
                for index in &table.options().indexes {
                    out.push(index_cmd(table.name(), index));
                }
                out
            }
            Ddl::AddColumn { field, .. } | Ddl::AlterColumn { field, .. } => {
                self.column_type(&field.field_type)?;
                Vec::new()
            }
            Ddl::DropColumn { table, column } => vec![json!({
                "update": table,
                "updates": [{ "q": {}, "u": { "$unset": { column.as_str(): "" } }, "multi": true }]
            })
            .to_string()],
            Ddl::CreateIndex { table, index } => vec![index_cmd(table, index)],
            Ddl::DropTable { table } => vec![json!({ "drop": table }).to_string()],
            Ddl::Truncate { table } => vec![json!({
                "delete": table,
                "deletes": [{ "q": {}, "limit": 0 }]
            })
            .to_string()],
        })
    }
}

struct DocRenderer {
    params: Vec<Param>,
}

fn unsupported(construct: impl Into<String>) -> DalError {
    DalError::unsupported(Backend::MongoDb, construct)
}

fn path(f: &FieldRef) -> String {
    if f.field_type == FieldType::Id {
        "_id".to_string()
    } else {
        f.name.clone()
    }
}

/// Translate a LIKE pattern into an anchored regular expression.
fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c if "\\.^$|?*+()[]{}".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

impl DocRenderer {
    fn bind(&mut self, value: &Value, field_type: &FieldType) -> Result<Json> {
        if let FieldType::Geometry { .. } = field_type {
            return Err(unsupported("geometry value"));
        }
        self.params.push(Param {
            value: value.clone(),
            field_type: field_type.clone(),
        });
        Ok(json!({ "$param": self.params.len() }))
    }

    fn expr(&mut self, expr: &Expr) -> Result<Json> {
        Ok(match expr {
            Expr::Field(f) => {
                if let FieldType::Geometry { .. } = f.field_type {
                    return Err(unsupported(format!("geometry field {}", f.qualified_name())));
                }
                Json::String(format!("${}", path(f)))
            }
            Expr::Literal { value, field_type } => self.bind(value, field_type)?,
            Expr::Comparison { op, left, right } => {
                let l = self.expr(left)?;
                match op {
                    CompareOp::Like | CompareOp::ILike => {
                        let pattern = match right.as_ref() {
                            Expr::Literal {
                                value: Value::Text(p),
                                ..
                            } => like_to_regex(p),
                            other => {
                                return Err(unsupported(format!(
                                    "LIKE against {}",
                                    other.describe()
                                )))
                            }
                        };
                        let regex = self.bind(&Value::Text(pattern), &FieldType::Text)?;
                        let mut spec = json!({ "input": l, "regex": regex });
                        if *op == CompareOp::ILike {
                            spec["options"] = json!("i");
                        }
                        json!({ "$regexMatch": spec })
                    }
                    op => {
                        let r = self.expr(right)?;
                        let name = match op {
                            CompareOp::Eq => "$eq",
                            CompareOp::NotEq => "$ne",
                            CompareOp::Lt => "$lt",
                            CompareOp::LtEq => "$lte",
                            CompareOp::Gt => "$gt",
                            _ => "$gte",
                        };
                        json!({ name: [l, r] })
                    }
                }
            }
            Expr::Logical { op, children } => {
                let parts = children
                    .iter()
                    .map(|c| self.expr(c))
                    .collect::<Result<Vec<_>>>()?;
                match op {
                    LogicalOp::And => json!({ "$and": parts }),
                    LogicalOp::Or => json!({ "$or": parts }),
                    LogicalOp::Not => json!({ "$not": parts }),
                }
            }
            Expr::Aggregate { .. } => {
                return Err(unsupported(format!(
                    "{} outside a grouped select",
                    expr.describe()
                )))
            }
            Expr::IsNull { expr, negated } => {
                let inner = self.expr(expr)?;
                let op = if *negated { "$ne" } else { "$eq" };
                json!({ op: [{ "$ifNull": [inner, null] }, null] })
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
                let test = json!({ "$in": [inner, items] });
                if *negated {
                    json!({ "$not": [test] })
                } else {
                    test
                }
            }
            Expr::Arithmetic { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                let name = match op {
                    ArithOp::Add => "$add",
                    ArithOp::Sub => "$subtract",
                    ArithOp::Mul => "$multiply",
                    ArithOp::Div => "$divide",
                };
                json!({ name: [l, r] })
            }
            Expr::Function { func, args } => {
                let mut args = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<Result<Vec<_>>>()?;
                match func {
                    ScalarFn::Upper => json!({ "$toUpper": args.remove(0) }),
                    ScalarFn::Lower => json!({ "$toLower": args.remove(0) }),
                    ScalarFn::Length => json!({ "$strLenCP": args.remove(0) }),
                    ScalarFn::Coalesce => json!({ "$ifNull": args }),
                }
            }
        })
    }

    fn filter(&mut self, filter: Option<&Expr>) -> Result<Json> {
        Ok(match filter {
            Some(f) => json!({ "$expr": self.expr(f)? }),
            None => json!({}),
        })
    }

    fn accumulator(&mut self, expr: &Expr) -> Result<Json> {
        let Expr::Aggregate {
            func,
            arg,
            distinct,
        } = expr
        else {
            return Err(unsupported(format!(
                "{} mixing aggregates with other expressions",
                expr.describe()
            )));
        };
        if *distinct {
            return Err(unsupported(expr.describe()));
        }
        let arg = match arg {
            Some(a) => Some(self.expr(a)?),
            None => None,
        };
        Ok(match (func, arg) {
            (AggregateFn::Count, None) => json!({ "$sum": 1 }),
            (AggregateFn::Count, Some(a)) => json!({
                "$sum": { "$cond": [{ "$eq": [{ "$ifNull": [a, null] }, null] }, 0, 1] }
            }),
            (AggregateFn::Sum, Some(a)) => json!({ "$sum": a }),
            (AggregateFn::Avg, Some(a)) => json!({ "$avg": a }),
            (AggregateFn::Min, Some(a)) => json!({ "$min": a }),
            (AggregateFn::Max, Some(a)) => json!({ "$max": a }),
            _ => return Err(unsupported(expr.describe())),
        })
    }

    fn window(&self, doc: &mut Map<String, Json>, limit: &LimitSpec) {
        if limit.offset > 0 {
            doc.insert("skip".into(), json!(limit.offset));
        }
        if let Some(n) = limit.limit {
            doc.insert("limit".into(), json!(n));
        }
    }

    fn select(&mut self, q: &SelectQuery) -> Result<Json> {
        if !q.joins.is_empty() {
            return Err(unsupported("JOIN"));
        }
        if q.is_grouped() || q.distinct {
            return self.grouped(q);
        }
        let mut projection = Map::new();
        for item in &q.columns {
            projection.insert(item.name.clone(), self.expr(&item.expr)?);
        }
        if !projection.contains_key("_id") {
            projection.insert("_id".into(), json!(0));
        }
        let mut sort = Map::new();
        for o in &q.order_by {
            let Expr::Field(f) = &o.expr else {
                return Err(unsupported(format!("ORDER BY {}", o.expr.describe())));
            };
            sort.insert(path(f), json!(direction(o.direction)));
        }
        let mut doc = Map::new();
        doc.insert("find".into(), json!(q.table.name()));
        if q.filter.is_some() {
            doc.insert("filter".into(), self.filter(q.filter.as_ref())?);
        }
        doc.insert("projection".into(), Json::Object(projection));
        if !sort.is_empty() {
            doc.insert("sort".into(), Json::Object(sort));
        }
        self.window(&mut doc, &q.limit);
        Ok(Json::Object(doc))
    }

    /// Grouped and DISTINCT selects become an aggregation pipeline.
    fn grouped(&mut self, q: &SelectQuery) -> Result<Json> {
        if q.having.is_some() {
            return Err(unsupported("HAVING"));
        }
        let keys: Vec<&Expr> = if q.group_by.is_empty() && !q.is_grouped() {
            q.columns.iter().map(|c| &c.expr).collect()
        } else {
            q.group_by.iter().collect()
        };

        let mut pipeline = Vec::new();
        if q.filter.is_some() {
            pipeline.push(json!({ "$match": self.filter(q.filter.as_ref())? }));
        }

        let mut id = Map::new();
        for (i, key) in keys.iter().enumerate() {
            id.insert(format!("g{i}"), self.expr(key)?);
        }
        let mut group = Map::new();
        group.insert(
            "_id".into(),
            if id.is_empty() { Json::Null } else { Json::Object(id) },
        );
        let mut project = Map::new();
        project.insert("_id".into(), json!(0));
        for item in &q.columns {
            if let Some(i) = keys.iter().position(|k| **k == item.expr) {
                project.insert(item.name.clone(), json!(format!("$_id.g{i}")));
            } else {
                group.insert(item.name.clone(), self.accumulator(&item.expr)?);
                project.insert(item.name.clone(), json!(format!("${}", item.name)));
            }
        }
        pipeline.push(json!({ "$group": group }));
        pipeline.push(json!({ "$project": project }));

        if !q.order_by.is_empty() {
            let mut sort = Map::new();
            for o in &q.order_by {
                let item = q
                    .columns
                    .iter()
                    .find(|c| c.expr == o.expr)
                    .ok_or_else(|| {
                        unsupported(format!("ORDER BY {} not in the output", o.expr.describe()))
                    })?;
                sort.insert(item.name.clone(), json!(direction(o.direction)));
            }
            pipeline.push(json!({ "$sort": sort }));
        }
        if q.limit.offset > 0 {
            pipeline.push(json!({ "$skip": q.limit.offset }));
        }
        if let Some(n) = q.limit.limit {
            pipeline.push(json!({ "$limit": n }));
        }
        Ok(json!({
            "aggregate": q.table.name(),
            "pipeline": pipeline,
            "cursor": {}
        }))
    }

    fn insert(&mut self, cmd: &InsertCommand) -> Result<Json> {
        let mut documents = Vec::with_capacity(cmd.rows.len());
        for row in &cmd.rows {
            let mut doc = Map::new();
            for (name, value) in cmd.columns.iter().zip(row) {
                let field = cmd.table.field(name)?;
                doc.insert(path(&field), self.bind(value, &field.field_type)?);
            }
            documents.push(Json::Object(doc));
        }
        Ok(json!({ "insert": cmd.table.name(), "documents": documents }))
    }

    fn update(&mut self, cmd: &UpdateCommand) -> Result<Json> {
        let mut set = Map::new();
        for (name, expr) in &cmd.assignments {
            set.insert(name.clone(), self.expr(expr)?);
        }
        let q = self.filter(cmd.filter.as_ref())?;
        Ok(json!({
            "update": cmd.table.name(),
            "updates": [{ "q": q, "u": [{ "$set": set }], "multi": true }]
        }))
    }

    fn delete(&mut self, cmd: &DeleteCommand) -> Result<Json> {
        let q = self.filter(cmd.filter.as_ref())?;
        Ok(json!({
            "delete": cmd.table.name(),
            "deletes": [{ "q": q, "limit": 0 }]
        }))
    }
}

fn direction(d: Direction) -> i32 {
    match d {
        Direction::Asc => 1,
        Direction::Desc => -1,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::schema::{Field, Table};

    fn person() -> Arc<Table> {
        Table::builder("person")
            .field(Field::new("name", FieldType::string(64)))
            .field(Field::new("age", FieldType::Integer))
            .build()
            .unwrap()
    }

    #[test]
    fn test_find_document() {
        let t = person();
        let q = select(&t)
            .column(t.field("name").unwrap())
            .filter(t.field("age").unwrap().ge(21).unwrap())
            .order_by(t.field("age").unwrap().desc())
            .limit(5)
            .offset(10)
            .build()
            .unwrap();
        let r = MongoDialect.render(&q.into()).unwrap();
        let doc: Json = serde_json::from_str(&r.text).unwrap();
        assert_eq!(
            doc,
            json!({
                "find": "person",
                "filter": { "$expr": { "$gte": ["$age", { "$param": 1 }] } },
                "projection": { "name": "$name", "_id": 0 },
                "sort": { "age": -1 },
                "skip": 10,
                "limit": 5
            })
        );
        assert_eq!(r.params[0].value, Value::Int(21));
    }

    #[test]
    fn test_like_becomes_regex_param() {
        let t = person();
        let q = select(&t)
            .filter(t.field("name").unwrap().ilike("a_b%").unwrap())
            .build()
            .unwrap();
        let r = MongoDialect.render(&q.into()).unwrap();
        assert!(r.text.contains("$regexMatch"));
        assert_eq!(r.params[0].value, Value::from("^a.b.*$"));
    }

    #[test]
    fn test_grouped_pipeline() {
        let t = person();
        let q = select(&t)
            .column(t.field("age").unwrap())
            .column(count_all())
            .group_by(t.field("age").unwrap())
            .order_by(t.field("age").unwrap().asc())
            .build()
            .unwrap();
        let r = MongoDialect.render(&q.into()).unwrap();
        let doc: Json = serde_json::from_str(&r.text).unwrap();
        assert_eq!(doc["aggregate"], json!("person"));
        assert_eq!(
            doc["pipeline"][0],
            json!({ "$group": { "_id": { "g0": "$age" }, "count": { "$sum": 1 } } })
        );
        assert_eq!(doc["pipeline"][2], json!({ "$sort": { "age": 1 } }));
    }

    #[test]
    fn test_joins_rejected() {
        let t = person();
        let other = t.alias("other");
        let q = select(&t)
            .join_alias(
                JoinKind::Inner,
                &other,
                t.field("age")
                    .unwrap()
                    .eq(other.field("age").unwrap())
                    .unwrap(),
            )
            .build()
            .unwrap();
        let err = MongoDialect.render(&q.into()).unwrap_err();
        assert!(err.to_string().contains("JOIN"));
    }

    #[test]
    fn test_drop_column_unsets() {
        let stmts = MongoDialect
            .render_ddl(&Ddl::DropColumn {
                table: "person".into(),
                column: "age".into(),
            })
            .unwrap();
        assert!(stmts[0].contains("$unset"));
        assert!(MongoDialect
            .render_ddl(&Ddl::AddColumn {
                table: "person".into(),
                field: Field::new("nick", FieldType::string(10)),
            })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_create_index_command() {
        let stmts = MongoDialect
            .render_ddl(&Ddl::CreateIndex {
                table: "person".into(),
                index: IndexDef {
                    name: "person_name".into(),
                    fields: vec!["name".into()],
                    unique: true,
                },
            })
            .unwrap();
        let doc: Json = serde_json::from_str(&stmts[0]).unwrap();
        assert_eq!(doc["createIndexes"], "person");
        assert_eq!(doc["indexes"][0]["name"], "person_name");
        assert_eq!(doc["indexes"][0]["unique"], true);
        assert_eq!(doc["indexes"][0]["key"]["name"], 1);
    }
}
