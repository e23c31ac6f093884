//! Backend-independent query tree.
//!
//! Every node is an immutable value. Field references always carry the
//! declared table and semantic type they were resolved against, so dialects
//! and drivers never need to look anything up while rendering or executing.

use std::fmt;
use std::sync::Arc;

use crate::schema::{Field, FieldType, IndexDef, Table};
use crate::value::Value;

/// A resolved reference to a declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub table: String,
    /// Alias the field is read through, when its table is joined under one.
    pub qualifier: Option<String>,
    pub name: String,
    pub field_type: FieldType,
}

impl FieldRef {
    /// Name of the FROM source this field is read from.
    pub fn source(&self) -> &str {
        self.qualifier.as_deref().unwrap_or(&self.table)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.source(), self.name)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// A declared table read under an alias.
#[derive(Debug, Clone)]
pub struct TableAlias {
    pub table: Arc<Table>,
    pub alias: String,
}

impl TableAlias {
    pub fn field(&self, name: &str) -> crate::error::Result<FieldRef> {
        let mut field = self.table.field(name)?;
        field.qualifier = Some(self.alias.clone());
        Ok(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    /// Case-insensitive LIKE. Rendered natively or as `LOWER(a) LIKE LOWER(b)`.
    ILike,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::ILike => "ILIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Collects the group's values into a JSON array.
    ArrayAgg,
}

impl AggregateFn {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::ArrayAgg => "ARRAY_AGG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFn {
    Upper,
    Lower,
    Length,
    Coalesce,
}

impl ScalarFn {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarFn::Upper => "UPPER",
            ScalarFn::Lower => "LOWER",
            ScalarFn::Length => "LENGTH",
            ScalarFn::Coalesce => "COALESCE",
        }
    }
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(FieldRef),
    /// A typed value. Always rendered as a bound parameter.
    Literal { value: Value, field_type: FieldType },
    Comparison {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical { op: LogicalOp, children: Vec<Expr> },
    /// `None` argument means `COUNT(*)`.
    Aggregate {
        func: AggregateFn,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    IsNull { expr: Box<Expr>, negated: bool },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Arithmetic {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Function { func: ScalarFn, args: Vec<Expr> },
}

impl Expr {
    /// Semantic type this expression evaluates to.
    pub fn result_type(&self) -> Option<FieldType> {
        match self {
            Expr::Field(f) => Some(f.field_type.clone()),
            Expr::Literal { field_type, .. } => Some(field_type.clone()),
            Expr::Comparison { .. } | Expr::Logical { .. } => Some(FieldType::Boolean),
            Expr::IsNull { .. } | Expr::InList { .. } => Some(FieldType::Boolean),
            Expr::Aggregate { func, arg, .. } => match func {
                AggregateFn::Count => Some(FieldType::Integer),
                AggregateFn::Avg => Some(FieldType::Float),
                AggregateFn::ArrayAgg => Some(FieldType::Json),
                AggregateFn::Sum => arg.as_ref().and_then(|a| a.result_type()).map(|t| {
                    if t.is_integral() {
                        FieldType::Integer
                    } else {
                        t
                    }
                }),
                AggregateFn::Min | AggregateFn::Max => {
                    arg.as_ref().and_then(|a| a.result_type()).map(|t| match t {
                        FieldType::Id => FieldType::Integer,
                        other => other,
                    })
                }
            },
            Expr::Arithmetic { left, right, .. } => {
                let l = left.result_type()?;
                let r = right.result_type()?;
                Some(numeric_result(&l, &r))
            }
            Expr::Function { func, args } => match func {
                ScalarFn::Length => Some(FieldType::Integer),
                ScalarFn::Upper | ScalarFn::Lower => Some(FieldType::Text),
                ScalarFn::Coalesce => args.first().and_then(|a| a.result_type()),
            },
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate { .. })
    }

    /// Whether an aggregate occurs anywhere inside this expression.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= e.is_aggregate());
        found
    }

    /// Visit this node and all of its descendants, parents first.
    pub fn walk<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Field(_) | Expr::Literal { .. } => {}
            Expr::Comparison { left, right, .. } | Expr::Arithmetic { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Logical { children, .. } => children.iter().for_each(|c| c.walk(f)),
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.walk(f);
                }
            }
            Expr::IsNull { expr, .. } => expr.walk(f),
            Expr::InList { expr, list, .. } => {
                expr.walk(f);
                list.iter().for_each(|c| c.walk(f));
            }
            Expr::Function { args, .. } => args.iter().for_each(|c| c.walk(f)),
        }
    }

    pub fn visit_fields<F: FnMut(&FieldRef)>(&self, f: &mut F) {
        self.walk(&mut |e| {
            if let Expr::Field(field) = e {
                f(field);
            }
        });
    }

    /// Rebuild the tree, applying `f` to every field reference.
    pub fn map_fields<F>(self, f: &mut F) -> crate::error::Result<Expr>
    where
        F: FnMut(FieldRef) -> crate::error::Result<FieldRef>,
    {
        let map_box = |e: Box<Expr>, f: &mut F| e.map_fields(f).map(Box::new);
        let map_vec = |v: Vec<Expr>, f: &mut F| {
            v.into_iter()
                .map(|e| e.map_fields(f))
                .collect::<crate::error::Result<Vec<_>>>()
        };
        Ok(match self {
            Expr::Field(field) => Expr::Field(f(field)?),
            lit @ Expr::Literal { .. } => lit,
            Expr::Comparison { op, left, right } => Expr::Comparison {
                op,
                left: map_box(left, &mut *f)?,
                right: map_box(right, &mut *f)?,
            },
            Expr::Logical { op, children } => Expr::Logical {
                op,
                children: map_vec(children, &mut *f)?,
            },
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => Expr::Aggregate {
                func,
                arg: match arg {
                    Some(a) => Some(map_box(a, &mut *f)?),
                    None => None,
                },
                distinct,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: map_box(expr, &mut *f)?,
                negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: map_box(expr, &mut *f)?,
                list: map_vec(list, &mut *f)?,
                negated,
            },
            Expr::Arithmetic { op, left, right } => Expr::Arithmetic {
                op,
                left: map_box(left, &mut *f)?,
                right: map_box(right, &mut *f)?,
            },
            Expr::Function { func, args } => Expr::Function {
                func,
                args: map_vec(args, &mut *f)?,
            },
        })
    }

    /// Short human-readable form used in error messages. Literal values are
    /// shown as `?` so secrets never end up in logs.
    pub fn describe(&self) -> String {
        match self {
            Expr::Field(f) => f.qualified_name(),
            Expr::Literal { .. } => "?".to_string(),
            Expr::Comparison { op, left, right } => {
                format!("{} {} {}", left.describe(), op.symbol(), right.describe())
            }
            Expr::Logical { op, children } => {
                let parts: Vec<String> = children.iter().map(|c| c.describe()).collect();
                match op {
                    LogicalOp::And => format!("({})", parts.join(" AND ")),
                    LogicalOp::Or => format!("({})", parts.join(" OR ")),
                    LogicalOp::Not => format!("NOT ({})", parts.join(", ")),
                }
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                let inner = arg.as_ref().map(|a| a.describe()).unwrap_or("*".into());
                let distinct = if *distinct { "DISTINCT " } else { "" };
                format!("{}({distinct}{inner})", func.name())
            }
            Expr::IsNull { expr, negated } => {
                let not = if *negated { " NOT" } else { "" };
                format!("{} IS{not} NULL", expr.describe())
            }
            Expr::InList { expr, list, negated } => {
                let not = if *negated { " NOT" } else { "" };
                format!("{}{not} IN ({} values)", expr.describe(), list.len())
            }
            Expr::Arithmetic { op, left, right } => {
                format!("({} {} {})", left.describe(), op.symbol(), right.describe())
            }
            Expr::Function { func, args } => {
                let parts: Vec<String> = args.iter().map(|a| a.describe()).collect();
                format!("{}({})", func.name(), parts.join(", "))
            }
        }
    }

    /// Column name used for this expression when the caller gives none.
    pub fn default_name(&self, qualified: bool) -> String {
        match self {
            Expr::Field(f) if qualified => f.qualified_name(),
            Expr::Field(f) => f.name.clone(),
            Expr::Aggregate { func, arg, .. } => match arg.as_deref() {
                Some(Expr::Field(f)) => format!("{}_{}", func.name().to_lowercase(), f.name),
                _ => func.name().to_lowercase(),
            },
            Expr::Function { func, args } => match args.first() {
                Some(Expr::Field(f)) => format!("{}_{}", func.name().to_lowercase(), f.name),
                _ => func.name().to_lowercase(),
            },
            _ => "expr".to_string(),
        }
    }
}

impl From<FieldRef> for Expr {
    fn from(field: FieldRef) -> Self {
        Expr::Field(field)
    }
}

impl From<&FieldRef> for Expr {
    fn from(field: &FieldRef) -> Self {
        Expr::Field(field.clone())
    }
}

fn numeric_result(l: &FieldType, r: &FieldType) -> FieldType {
    if matches!(l, FieldType::Float) || matches!(r, FieldType::Float) {
        return FieldType::Float;
    }
    match (l, r) {
        (FieldType::Decimal { precision: p1, scale: s1 }, FieldType::Decimal { precision: p2, scale: s2 }) => {
            FieldType::Decimal {
                precision: (*p1).max(*p2),
                scale: (*s1).max(*s2),
            }
        }
        (d @ FieldType::Decimal { .. }, _) | (_, d @ FieldType::Decimal { .. }) => d.clone(),
        _ => FieldType::Integer,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    pub table: Arc<Table>,
    pub alias: Option<String>,
    pub on: Expr,
}

impl Join {
    pub fn source(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.table.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub expr: Expr,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitSpec {
    pub limit: Option<u64>,
    pub offset: u64,
}

impl LimitSpec {
    pub fn is_noop(&self) -> bool {
        self.limit.is_none() && self.offset == 0
    }

    /// 1-based number of the last row in the window, for dialects that
    /// paginate by row number. `None` when the window has no upper bound,
    /// including a bound past `u64::MAX`.
    pub fn last_row(&self) -> Option<u64> {
        self.limit.and_then(|n| self.offset.checked_add(n))
    }
}

/// One output column of a select.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub table: Arc<Table>,
    pub alias: Option<String>,
    pub columns: Vec<SelectItem>,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderSpec>,
    pub limit: LimitSpec,
    pub distinct: bool,
    /// Skip table default filters for this query.
    pub unfiltered: bool,
}

impl SelectQuery {
    pub fn source(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.table.name())
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
            || self.having.is_some()
            || self.columns.iter().any(|c| c.expr.contains_aggregate())
    }

    /// Every expression in the query, in no particular order.
    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        self.columns
            .iter()
            .map(|c| &c.expr)
            .chain(self.joins.iter().map(|j| &j.on))
            .chain(self.filter.iter())
            .chain(self.group_by.iter())
            .chain(self.having.iter())
            .chain(self.order_by.iter().map(|o| &o.expr))
    }
}

#[derive(Debug, Clone)]
pub struct InsertCommand {
    pub table: Arc<Table>,
    pub columns: Vec<String>,
    /// One entry per row, aligned with `columns`. Values are already checked
    /// against the field types.
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct UpdateCommand {
    pub table: Arc<Table>,
    pub assignments: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
    pub unfiltered: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteCommand {
    pub table: Arc<Table>,
    pub filter: Option<Expr>,
    pub unfiltered: bool,
}

/// Schema change statements.
#[derive(Debug, Clone)]
pub enum Ddl {
    CreateTable(Arc<Table>),
    AddColumn { table: String, field: Field },
    /// Change the column's type (and nullability) to match `field`.
    AlterColumn { table: String, field: Field },
    DropColumn { table: String, column: String },
    CreateIndex { table: String, index: IndexDef },
    DropTable { table: String },
    Truncate { table: String },
}

impl Ddl {
    pub fn table_name(&self) -> &str {
        match self {
            Ddl::CreateTable(t) => t.name(),
            Ddl::AddColumn { table, .. }
            | Ddl::AlterColumn { table, .. }
            | Ddl::DropColumn { table, .. }
            | Ddl::CreateIndex { table, .. }
            | Ddl::DropTable { table }
            | Ddl::Truncate { table } => table,
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Ddl::DropColumn { .. } | Ddl::DropTable { .. } | Ddl::Truncate { .. }
        )
    }
}

impl fmt::Display for Ddl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ddl::CreateTable(t) => write!(f, "create table {}", t.name()),
            Ddl::AddColumn { table, field } => {
                write!(f, "add column {table}.{} {}", field.name, field.field_type)
            }
            Ddl::AlterColumn { table, field } => {
                write!(f, "alter column {table}.{} to {}", field.name, field.field_type)
            }
            Ddl::DropColumn { table, column } => write!(f, "drop column {table}.{column}"),
            Ddl::CreateIndex { table, index } => {
                write!(f, "create index {} on {table}", index.name)
            }
            Ddl::DropTable { table } => write!(f, "drop table {table}"),
            Ddl::Truncate { table } => write!(f, "truncate {table}"),
        }
    }
}

/// Top-level statement tree handed to a dialect.
#[derive(Debug, Clone)]
pub enum Command {
    Select(Box<SelectQuery>),
    Insert(InsertCommand),
    Update(UpdateCommand),
    Delete(DeleteCommand),
    Ddl(Ddl),
}

impl Command {
    pub fn returns_rows(&self) -> bool {
        matches!(self, Command::Select(_))
    }

    /// Short label for logs and timings.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Select(_) => "select",
            Command::Insert(_) => "insert",
            Command::Update(_) => "update",
            Command::Delete(_) => "delete",
            Command::Ddl(_) => "ddl",
        }
    }

    /// Declared tables this command reads or writes.
    pub fn tables(&self) -> Vec<&Arc<Table>> {
        match self {
            Command::Select(q) => std::iter::once(&q.table)
                .chain(q.joins.iter().map(|j| &j.table))
                .collect(),
            Command::Insert(c) => vec![&c.table],
            Command::Update(c) => vec![&c.table],
            Command::Delete(c) => vec![&c.table],
            Command::Ddl(Ddl::CreateTable(t)) => vec![t],
            Command::Ddl(_) => Vec::new(),
        }
    }

    pub fn visit_fields<F: FnMut(&FieldRef)>(&self, f: &mut F) {
        match self {
            Command::Select(q) => q.expressions().for_each(|e| e.visit_fields(f)),
            Command::Update(c) => {
                c.assignments.iter().for_each(|(_, e)| e.visit_fields(f));
                c.filter.iter().for_each(|e| e.visit_fields(f));
            }
            Command::Delete(c) => c.filter.iter().for_each(|e| e.visit_fields(f)),
            Command::Insert(_) | Command::Ddl(_) => {}
        }
    }
}

impl From<SelectQuery> for Command {
    fn from(query: SelectQuery) -> Self {
        Command::Select(Box::new(query))
    }
}

impl From<InsertCommand> for Command {
    fn from(cmd: InsertCommand) -> Self {
        Command::Insert(cmd)
    }
}

impl From<UpdateCommand> for Command {
    fn from(cmd: UpdateCommand) -> Self {
        Command::Update(cmd)
    }
}

impl From<DeleteCommand> for Command {
    fn from(cmd: DeleteCommand) -> Self {
        Command::Delete(cmd)
    }
}

impl From<Ddl> for Command {
    fn from(ddl: Ddl) -> Self {
        Command::Ddl(ddl)
    }
}
