/// Rewrite passes applied to commands before rendering.
///
/// Each pass takes a command and returns an equivalent (or deliberately
/// augmented) command. Passes run in registration order.
use super::types::*;
use crate::error::Result;

/// A single transformation over a command tree.
///
/// Passes must be pure: the same input always produces the same output.
pub trait RewritePass: Send + Sync {
    /// Unique name identifying this pass.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn transform(&self, command: Command) -> Result<Command>;
}

/// Ordered pipeline of rewrite passes.
#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn RewritePass>>,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.pass_names()).finish()
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pipeline every adapter runs.
    pub fn with_defaults() -> Self {
        let mut opt = Self::new();
        opt.add_pass(Box::new(ApplyDefaultFilters));
        opt.add_pass(Box::new(FlattenLogical));
        opt
    }

    pub fn add_pass(&mut self, pass: Box<dyn RewritePass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, command: Command) -> Result<Command> {
        let mut current = command;
        for pass in &self.passes {
            current = pass.transform(current)?;
        }
        Ok(current)
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }
}

/// ANDs each table's default filter into queries over it.
///
/// The base table's filter joins the WHERE clause; a joined table's filter
/// joins its ON clause so outer joins keep their meaning.
pub struct ApplyDefaultFilters;

impl ApplyDefaultFilters {
    fn requalify(filter: &Expr, qualifier: Option<&str>) -> Result<Expr> {
        filter.clone().map_fields(&mut |mut f| {
            f.qualifier = qualifier.map(str::to_string);
            Ok(f)
        })
    }

    fn conjoin(existing: Option<Expr>, extra: Expr) -> Expr {
        match existing {
            None => extra,
            Some(Expr::Logical {
                op: LogicalOp::And,
                mut children,
            }) => {
                children.push(extra);
                Expr::Logical {
                    op: LogicalOp::And,
                    children,
                }
            }
            Some(other) => Expr::Logical {
                op: LogicalOp::And,
                children: vec![other, extra],
            },
        }
    }
}

impl RewritePass for ApplyDefaultFilters {
    fn name(&self) -> &str {
        "apply_default_filters"
    }

    fn description(&self) -> &str {
        "Adds table-level default filters to selects, updates and deletes"
    }

    fn transform(&self, command: Command) -> Result<Command> {
        Ok(match command {
            Command::Select(mut q) if !q.unfiltered => {
                if let Some(filter) = &q.table.options().default_filter {
                    let filter = Self::requalify(filter, q.alias.as_deref())?;
                    q.filter = Some(Self::conjoin(q.filter.take(), filter));
                }
                for join in &mut q.joins {
                    if let Some(filter) = &join.table.options().default_filter {
                        let filter = Self::requalify(filter, join.alias.as_deref())?;
                        let on = std::mem::replace(&mut join.on, filter.clone());
                        join.on = Self::conjoin(Some(on), filter);
                    }
                }
                q.unfiltered = true;
                Command::Select(q)
            }
            Command::Update(mut u) if !u.unfiltered => {
                if let Some(filter) = &u.table.options().default_filter {
                    let filter = Self::requalify(filter, None)?;
                    u.filter = Some(Self::conjoin(u.filter.take(), filter));
                }
                u.unfiltered = true;
                Command::Update(u)
            }
            Command::Delete(mut d) if !d.unfiltered => {
                if let Some(filter) = &d.table.options().default_filter {
                    let filter = Self::requalify(filter, None)?;
                    d.filter = Some(Self::conjoin(d.filter.take(), filter));
                }
                d.unfiltered = true;
                Command::Delete(d)
            }
            other => other,
        })
    }
}

/// Collapses nested AND/OR nodes of the same operator and single-child
/// conjunctions: `(a AND (b AND c))` becomes `(a AND b AND c)`.
pub struct FlattenLogical;

impl RewritePass for FlattenLogical {
    fn name(&self) -> &str {
        "flatten_logical"
    }

    fn description(&self) -> &str {
        "Removes redundant nesting of AND/OR nodes"
    }

    fn transform(&self, command: Command) -> Result<Command> {
        Ok(match command {
            Command::Select(mut q) => {
                q.filter = q.filter.map(flatten);
                q.having = q.having.map(flatten);
                for join in &mut q.joins {
                    let on = std::mem::replace(
                        &mut join.on,
                        Expr::Logical {
                            op: LogicalOp::And,
                            children: Vec::new(),
                        },
                    );
                    join.on = flatten(on);
                }
                Command::Select(q)
            }
            Command::Update(mut u) => {
                u.filter = u.filter.map(flatten);
                Command::Update(u)
            }
            Command::Delete(mut d) => {
                d.filter = d.filter.map(flatten);
                Command::Delete(d)
            }
            other => other,
        })
    }
}

fn flatten(expr: Expr) -> Expr {
    match expr {
        Expr::Logical { op, children } if op != LogicalOp::Not => {
            let mut flat = Vec::with_capacity(children.len());
            for child in children.into_iter().map(flatten) {
                match child {
                    Expr::Logical {
                        op: inner,
                        children: nested,
                    } if inner == op => flat.extend(nested),
                    other => flat.push(other),
                }
            }
            if flat.len() == 1 {
                flat.remove(0)
            } else {
                Expr::Logical { op, children: flat }
            }
        }
        Expr::Logical { op, children } => Expr::Logical {
            op,
            children: children.into_iter().map(flatten).collect(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builder::{delete, select};
    use crate::schema::{Field, FieldType, Table};
    use std::sync::Arc;

    fn post() -> Arc<Table> {
        Table::builder("post")
            .field(Field::new("title", FieldType::string(100)))
            .field(Field::new("deleted", FieldType::Boolean).default_value(false))
            .build()
            .unwrap()
            .with_default_filter(|t| t.field("deleted")?.eq(false))
            .unwrap()
    }

    #[test]
    fn test_default_pipeline_names() {
        let opt = Optimizer::with_defaults();
        assert_eq!(
            opt.pass_names(),
            vec!["apply_default_filters", "flatten_logical"]
        );
    }

    #[test]
    fn test_default_filter_added_to_where() {
        let t = post();
        let q = select(&t)
            .filter(t.field("title").unwrap().eq("x").unwrap())
            .build()
            .unwrap();
        let cmd = Optimizer::with_defaults().optimize(q.into()).unwrap();
        match cmd {
            Command::Select(q) => match q.filter {
                Some(Expr::Logical { op, children }) => {
                    assert_eq!(op, LogicalOp::And);
                    assert_eq!(children.len(), 2);
                }
                other => panic!("expected conjunction, got {other:?}"),
            },
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn test_unfiltered_skips_default_filter() {
        let t = post();
        let q = select(&t).unfiltered().build().unwrap();
        let cmd = Optimizer::with_defaults().optimize(q.into()).unwrap();
        match cmd {
            Command::Select(q) => assert!(q.filter.is_none()),
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn test_default_filter_follows_alias() {
        let t = post();
        let q = select(&t).alias("p").build().unwrap();
        let cmd = Optimizer::with_defaults().optimize(q.into()).unwrap();
        let Command::Select(q) = cmd else {
            panic!("expected select")
        };
        let mut sources = Vec::new();
        q.filter
            .unwrap()
            .visit_fields(&mut |f| sources.push(f.source().to_string()));
        assert_eq!(sources, vec!["p"]);
    }

    #[test]
    fn test_default_filter_on_delete() {
        let t = post();
        let d = delete(&t).build().unwrap();
        let cmd = Optimizer::with_defaults().optimize(d.into()).unwrap();
        match cmd {
            Command::Delete(d) => assert!(d.filter.is_some()),
            _ => panic!("expected delete"),
        }
    }

    #[test]
    fn test_flatten_nested() {
        let t = post();
        let a = t.field("title").unwrap().eq("a").unwrap();
        let b = t.field("title").unwrap().eq("b").unwrap();
        let c = t.field("deleted").unwrap().eq(true).unwrap();
        let nested = Expr::Logical {
            op: LogicalOp::And,
            children: vec![
                a,
                Expr::Logical {
                    op: LogicalOp::And,
                    children: vec![b, c],
                },
            ],
        };
        match flatten(nested) {
            Expr::Logical { children, .. } => assert_eq!(children.len(), 3),
            other => panic!("expected AND, got {other:?}"),
        }
    }
}
