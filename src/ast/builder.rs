//! Constructors for expression trees and commands.
//!
//! Every constructor checks arity and type compatibility as soon as it is
//! called, so a malformed query never reaches a dialect.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use super::types::*;
use crate::error::{DalError, Result};
use crate::schema::{FieldType, Table};
use crate::value::Value;

/// Right-hand side of a comparison: another expression or a plain value that
/// will be typed against the left-hand side.
#[derive(Debug, Clone)]
pub enum Operand {
    Expr(Expr),
    Value(Value),
}

impl From<Expr> for Operand {
    fn from(e: Expr) -> Self {
        Operand::Expr(e)
    }
}

impl From<FieldRef> for Operand {
    fn from(f: FieldRef) -> Self {
        Operand::Expr(Expr::Field(f))
    }
}

impl From<&FieldRef> for Operand {
    fn from(f: &FieldRef) -> Self {
        Operand::Expr(Expr::Field(f.clone()))
    }
}

macro_rules! value_operand {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Operand {
                fn from(v: $t) -> Self {
                    Operand::Value(Value::from(v))
                }
            }
        )*
    };
}

value_operand!(
    Value,
    &str,
    String,
    i64,
    i32,
    bool,
    f64,
    Decimal,
    NaiveDate,
    DateTime<Utc>,
    serde_json::Value,
    Vec<u8>
);

/// Reference a field of a declared table.
pub fn field(table: &Table, name: &str) -> Result<FieldRef> {
    table.field(name)
}

/// A free-standing literal with an inferred type. NULL has no type of its
/// own; compare against NULL with [`Expr::is_null`] instead.
pub fn literal(value: impl Into<Value>) -> Result<Expr> {
    let value = value.into();
    let field_type = FieldType::infer(&value)
        .ok_or_else(|| DalError::mismatch("literal", "a typed value", "untyped NULL"))?;
    Ok(Expr::Literal { value, field_type })
}

/// A literal typed as `target`, failing if the value does not belong to it.
pub(crate) fn typed_literal(value: Value, target: &FieldType, context: &str) -> Result<Expr> {
    let value = target.coerce(value, context)?;
    Ok(Expr::Literal {
        value,
        field_type: target.clone(),
    })
}

fn operand_against(left: &Expr, right: Operand) -> Result<Expr> {
    match right {
        Operand::Expr(e) => Ok(e),
        Operand::Value(v) => match left.result_type() {
            Some(t) => typed_literal(v, &literal_type(&t), &left.describe()),
            None => literal(v),
        },
    }
}

/// Literals compared with an id or reference are plain integers.
fn literal_type(t: &FieldType) -> FieldType {
    match t {
        FieldType::Id | FieldType::Reference { .. } => FieldType::Integer,
        other => other.clone(),
    }
}

fn expect_type(expr: &Expr, check: fn(&FieldType) -> bool, expected: &str) -> Result<FieldType> {
    match expr.result_type() {
        Some(t) if check(&t) => Ok(t),
        Some(t) => Err(DalError::mismatch(expr.describe(), expected, t)),
        None => Err(DalError::mismatch(expr.describe(), expected, "unknown type")),
    }
}

fn is_boolean(t: &FieldType) -> bool {
    *t == FieldType::Boolean
}

impl Expr {
    fn compare(self, op: CompareOp, right: impl Into<Operand>) -> Result<Expr> {
        let right = right.into();
        if let Operand::Value(Value::Null) = right {
            return match op {
                CompareOp::Eq => Ok(self.is_null()),
                CompareOp::NotEq => Ok(self.is_not_null()),
                _ => Err(DalError::mismatch(
                    self.describe(),
                    "a comparable value",
                    "NULL",
                )),
            };
        }
        let right = operand_against(&self, right)?;
        let (l, r) = match (self.result_type(), right.result_type()) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                return Err(DalError::mismatch(
                    self.describe(),
                    "a typed operand",
                    right.describe(),
                ))
            }
        };
        let compatible = match op {
            CompareOp::Like | CompareOp::ILike => l.is_textual() && r.is_textual(),
            CompareOp::Eq | CompareOp::NotEq => l.comparable_with(&r),
            _ => {
                l.comparable_with(&r)
                    && !matches!(l, FieldType::Json | FieldType::Binary | FieldType::Geometry { .. })
            }
        };
        if !compatible {
            return Err(DalError::mismatch(
                format!("{} {} {}", self.describe(), op.symbol(), right.describe()),
                l,
                r,
            ));
        }
        Ok(Expr::Comparison {
            op,
            left: Box::new(self),
            right: Box::new(right),
        })
    }

    pub fn eq(self, right: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::Eq, right)
    }

    pub fn ne(self, right: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::NotEq, right)
    }

    pub fn lt(self, right: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::Lt, right)
    }

    pub fn le(self, right: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::LtEq, right)
    }

    pub fn gt(self, right: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::Gt, right)
    }

    pub fn ge(self, right: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::GtEq, right)
    }

    pub fn like(self, pattern: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::Like, pattern)
    }

    pub fn ilike(self, pattern: impl Into<Operand>) -> Result<Expr> {
        self.compare(CompareOp::ILike, pattern)
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    fn in_list_impl<I, V>(self, values: I, negated: bool) -> Result<Expr>
    where
        I: IntoIterator<Item = V>,
        V: Into<Operand>,
    {
        let target = self.result_type();
        let mut list = Vec::new();
        for v in values {
            let item = operand_against(&self, v.into())?;
            if let (Some(l), Some(r)) = (&target, item.result_type()) {
                if !l.comparable_with(&r) {
                    return Err(DalError::mismatch(self.describe(), l, r));
                }
            }
            list.push(item);
        }
        if list.is_empty() {
            return Err(DalError::mismatch(
                self.describe(),
                "a non-empty value list",
                "empty list",
            ));
        }
        Ok(Expr::InList {
            expr: Box::new(self),
            list,
            negated,
        })
    }

    pub fn in_list<I, V>(self, values: I) -> Result<Expr>
    where
        I: IntoIterator<Item = V>,
        V: Into<Operand>,
    {
        self.in_list_impl(values, false)
    }

    pub fn not_in_list<I, V>(self, values: I) -> Result<Expr>
    where
        I: IntoIterator<Item = V>,
        V: Into<Operand>,
    {
        self.in_list_impl(values, true)
    }

    pub fn and(self, other: Expr) -> Result<Expr> {
        all([self, other])
    }

    pub fn or(self, other: Expr) -> Result<Expr> {
        any([self, other])
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Result<Expr> {
        expect_type(&self, is_boolean, "boolean")?;
        Ok(Expr::Logical {
            op: LogicalOp::Not,
            children: vec![self],
        })
    }

    fn arith(self, op: ArithOp, right: impl Into<Operand>) -> Result<Expr> {
        expect_type(&self, FieldType::is_numeric, "numeric")?;
        let right = operand_against(&self, right.into())?;
        expect_type(&right, FieldType::is_numeric, "numeric")?;
        Ok(Expr::Arithmetic {
            op,
            left: Box::new(self),
            right: Box::new(right),
        })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, right: impl Into<Operand>) -> Result<Expr> {
        self.arith(ArithOp::Add, right)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, right: impl Into<Operand>) -> Result<Expr> {
        self.arith(ArithOp::Sub, right)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, right: impl Into<Operand>) -> Result<Expr> {
        self.arith(ArithOp::Mul, right)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn div(self, right: impl Into<Operand>) -> Result<Expr> {
        self.arith(ArithOp::Div, right)
    }

    fn aggregate(self, func: AggregateFn, distinct: bool) -> Result<Expr> {
        if self.contains_aggregate() {
            return Err(DalError::mismatch(
                self.describe(),
                "a non-aggregate argument",
                "nested aggregate",
            ));
        }
        match func {
            AggregateFn::Sum | AggregateFn::Avg => {
                expect_type(&self, FieldType::is_numeric, "numeric")?;
            }
            AggregateFn::Min | AggregateFn::Max => {
                expect_type(
                    &self,
                    |t| !matches!(t, FieldType::Json | FieldType::Binary | FieldType::Geometry { .. }),
                    "an orderable type",
                )?;
            }
            AggregateFn::Count | AggregateFn::ArrayAgg => {}
        }
        Ok(Expr::Aggregate {
            func,
            arg: Some(Box::new(self)),
            distinct,
        })
    }

    pub fn count(self) -> Result<Expr> {
        self.aggregate(AggregateFn::Count, false)
    }

    pub fn count_distinct(self) -> Result<Expr> {
        self.aggregate(AggregateFn::Count, true)
    }

    pub fn sum(self) -> Result<Expr> {
        self.aggregate(AggregateFn::Sum, false)
    }

    pub fn avg(self) -> Result<Expr> {
        self.aggregate(AggregateFn::Avg, false)
    }

    pub fn min(self) -> Result<Expr> {
        self.aggregate(AggregateFn::Min, false)
    }

    pub fn max(self) -> Result<Expr> {
        self.aggregate(AggregateFn::Max, false)
    }

    pub fn array_agg(self) -> Result<Expr> {
        self.aggregate(AggregateFn::ArrayAgg, false)
    }

    pub fn upper(self) -> Result<Expr> {
        expect_type(&self, FieldType::is_textual, "string")?;
        Ok(Expr::Function {
            func: ScalarFn::Upper,
            args: vec![self],
        })
    }

    pub fn lower(self) -> Result<Expr> {
        expect_type(&self, FieldType::is_textual, "string")?;
        Ok(Expr::Function {
            func: ScalarFn::Lower,
            args: vec![self],
        })
    }

    pub fn length(self) -> Result<Expr> {
        expect_type(&self, FieldType::is_textual, "string")?;
        Ok(Expr::Function {
            func: ScalarFn::Length,
            args: vec![self],
        })
    }

    /// `COALESCE(self, fallback)`.
    pub fn coalesce(self, fallback: impl Into<Operand>) -> Result<Expr> {
        let fallback = operand_against(&self, fallback.into())?;
        match (self.result_type(), fallback.result_type()) {
            (Some(l), Some(r)) if l.comparable_with(&r) => {}
            (l, r) => {
                return Err(DalError::mismatch(
                    self.describe(),
                    l.map(|t| t.to_string()).unwrap_or_default(),
                    r.map(|t| t.to_string()).unwrap_or_default(),
                ))
            }
        }
        Ok(Expr::Function {
            func: ScalarFn::Coalesce,
            args: vec![self, fallback],
        })
    }
}

/// `COUNT(*)`.
pub fn count_all() -> Expr {
    Expr::Aggregate {
        func: AggregateFn::Count,
        arg: None,
        distinct: false,
    }
}

fn combine<I: IntoIterator<Item = Expr>>(op: LogicalOp, exprs: I) -> Result<Expr> {
    let mut children = Vec::new();
    for e in exprs {
        expect_type(&e, is_boolean, "boolean")?;
        match e {
            Expr::Logical { op: inner, children: nested } if inner == op => {
                children.extend(nested)
            }
            other => children.push(other),
        }
    }
    match children.len() {
        0 => Err(DalError::mismatch(
            format!("{op:?}"),
            "at least one condition",
            "none",
        )),
        1 => Ok(children.remove(0)),
        _ => Ok(Expr::Logical { op, children }),
    }
}

/// Conjunction of every condition.
pub fn all<I: IntoIterator<Item = Expr>>(exprs: I) -> Result<Expr> {
    combine(LogicalOp::And, exprs)
}

/// Disjunction of every condition.
pub fn any<I: IntoIterator<Item = Expr>>(exprs: I) -> Result<Expr> {
    combine(LogicalOp::Or, exprs)
}

// Forward the common constructors so callers can start from a field
// reference without an explicit conversion.
macro_rules! forward_to_expr {
    ($($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
        impl FieldRef {
            $(
                pub fn $name(&self, $($arg: $ty),*) -> $ret {
                    Expr::Field(self.clone()).$name($($arg),*)
                }
            )*
        }
    };
}

forward_to_expr! {
    eq(right: impl Into<Operand>) -> Result<Expr>;
    ne(right: impl Into<Operand>) -> Result<Expr>;
    lt(right: impl Into<Operand>) -> Result<Expr>;
    le(right: impl Into<Operand>) -> Result<Expr>;
    gt(right: impl Into<Operand>) -> Result<Expr>;
    ge(right: impl Into<Operand>) -> Result<Expr>;
    like(pattern: impl Into<Operand>) -> Result<Expr>;
    ilike(pattern: impl Into<Operand>) -> Result<Expr>;
    is_null() -> Expr;
    is_not_null() -> Expr;
    add(right: impl Into<Operand>) -> Result<Expr>;
    sub(right: impl Into<Operand>) -> Result<Expr>;
    count() -> Result<Expr>;
    count_distinct() -> Result<Expr>;
    sum() -> Result<Expr>;
    avg() -> Result<Expr>;
    min() -> Result<Expr>;
    max() -> Result<Expr>;
    array_agg() -> Result<Expr>;
    upper() -> Result<Expr>;
    lower() -> Result<Expr>;
    length() -> Result<Expr>;
    coalesce(fallback: impl Into<Operand>) -> Result<Expr>;
}

impl FieldRef {
    pub fn in_list<I, V>(&self, values: I) -> Result<Expr>
    where
        I: IntoIterator<Item = V>,
        V: Into<Operand>,
    {
        Expr::Field(self.clone()).in_list(values)
    }

    pub fn asc(&self) -> OrderSpec {
        OrderSpec {
            expr: Expr::Field(self.clone()),
            direction: Direction::Asc,
        }
    }

    pub fn desc(&self) -> OrderSpec {
        OrderSpec {
            expr: Expr::Field(self.clone()),
            direction: Direction::Desc,
        }
    }
}

impl Expr {
    pub fn asc(self) -> OrderSpec {
        OrderSpec {
            expr: self,
            direction: Direction::Asc,
        }
    }

    pub fn desc(self) -> OrderSpec {
        OrderSpec {
            expr: self,
            direction: Direction::Desc,
        }
    }
}

impl From<FieldRef> for OrderSpec {
    fn from(f: FieldRef) -> Self {
        f.asc()
    }
}

impl From<Expr> for OrderSpec {
    fn from(e: Expr) -> Self {
        e.asc()
    }
}

/// A FROM source known to a select.
struct Source {
    name: String,
    table: String,
    aliased: bool,
}

struct Scope {
    sources: Vec<Source>,
}

impl Scope {
    fn add(&mut self, table: &Table, alias: Option<&str>) -> Result<()> {
        let name = alias.unwrap_or(table.name()).to_string();
        if self.sources.iter().any(|s| s.name == name) {
            return Err(DalError::AmbiguousReference {
                reference: name,
                reason: "table appears twice in the query; give the join an alias".into(),
            });
        }
        self.sources.push(Source {
            name,
            table: table.name().to_string(),
            aliased: alias.is_some(),
        });
        Ok(())
    }

    /// Bind a field to exactly one source, filling in its qualifier.
    fn resolve(&self, mut field: FieldRef) -> Result<FieldRef> {
        if let Some(q) = &field.qualifier {
            return match self.sources.iter().find(|s| &s.name == q) {
                Some(s) if s.table == field.table => Ok(field),
                Some(s) => Err(DalError::AmbiguousReference {
                    reference: field.qualified_name(),
                    reason: format!("alias {q} refers to table {}", s.table),
                }),
                None => Err(DalError::AmbiguousReference {
                    reference: field.qualified_name(),
                    reason: format!("alias {q} is not part of the query"),
                }),
            };
        }
        let candidates: Vec<&Source> = self
            .sources
            .iter()
            .filter(|s| s.table == field.table)
            .collect();
        let unaliased = candidates.iter().find(|s| !s.aliased);
        match (unaliased, candidates.len()) {
            (Some(_), _) => Ok(field),
            (None, 1) => {
                field.qualifier = Some(candidates[0].name.clone());
                Ok(field)
            }
            (None, 0) => Err(DalError::AmbiguousReference {
                reference: field.qualified_name(),
                reason: format!(
                    "table {} is neither the base table nor joined",
                    field.table
                ),
            }),
            (None, _) => Err(DalError::AmbiguousReference {
                reference: field.qualified_name(),
                reason: format!(
                    "table {} is joined more than once; use the alias",
                    field.table
                ),
            }),
        }
    }

    fn resolve_expr(&self, expr: Expr) -> Result<Expr> {
        expr.map_fields(&mut |f| self.resolve(f))
    }
}

/// Incremental builder for [`SelectQuery`].
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: Arc<Table>,
    alias: Option<String>,
    columns: Vec<(Expr, Option<String>)>,
    joins: Vec<Join>,
    filter: Vec<Expr>,
    group_by: Vec<Expr>,
    having: Option<Expr>,
    order_by: Vec<OrderSpec>,
    limit: LimitSpec,
    distinct: bool,
    unfiltered: bool,
}

/// Start a select over `table`.
pub fn select(table: &Arc<Table>) -> SelectBuilder {
    SelectBuilder {
        table: Arc::clone(table),
        alias: None,
        columns: Vec::new(),
        joins: Vec::new(),
        filter: Vec::new(),
        group_by: Vec::new(),
        having: None,
        order_by: Vec::new(),
        limit: LimitSpec::default(),
        distinct: false,
        unfiltered: false,
    }
}

impl SelectBuilder {
    /// Read the base table under an alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn column(mut self, expr: impl Into<Expr>) -> Self {
        self.columns.push((expr.into(), None));
        self
    }

    pub fn column_as(mut self, expr: impl Into<Expr>, name: impl Into<String>) -> Self {
        self.columns.push((expr.into(), Some(name.into())));
        self
    }

    pub fn columns<I, E>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        self.columns
            .extend(exprs.into_iter().map(|e| (e.into(), None)));
        self
    }

    pub fn join(mut self, table: &Arc<Table>, on: Expr) -> Self {
        self.joins.push(Join {
            kind: JoinKind::Inner,
            table: Arc::clone(table),
            alias: None,
            on,
        });
        self
    }

    pub fn left_join(mut self, table: &Arc<Table>, on: Expr) -> Self {
        self.joins.push(Join {
            kind: JoinKind::Left,
            table: Arc::clone(table),
            alias: None,
            on,
        });
        self
    }

    pub fn join_alias(mut self, kind: JoinKind, alias: &TableAlias, on: Expr) -> Self {
        self.joins.push(Join {
            kind,
            table: Arc::clone(&alias.table),
            alias: Some(alias.alias.clone()),
            on,
        });
        self
    }

    /// Add a WHERE condition; repeated calls are ANDed.
    pub fn filter(mut self, condition: Expr) -> Self {
        self.filter.push(condition);
        self
    }

    pub fn group_by(mut self, expr: impl Into<Expr>) -> Self {
        self.group_by.push(expr.into());
        self
    }

    pub fn having(mut self, condition: Expr) -> Self {
        self.having = Some(condition);
        self
    }

    pub fn order_by(mut self, order: impl Into<OrderSpec>) -> Self {
        self.order_by.push(order.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.limit.offset = offset;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Do not apply table default filters.
    pub fn unfiltered(mut self) -> Self {
        self.unfiltered = true;
        self
    }

    pub fn build(self) -> Result<SelectQuery> {
        let mut scope = Scope {
            sources: Vec::new(),
        };
        scope.add(&self.table, self.alias.as_deref())?;

        let mut joins = Vec::with_capacity(self.joins.len());
        for join in self.joins {
            scope.add(&join.table, join.alias.as_deref())?;
            expect_type(&join.on, is_boolean, "boolean join condition")?;
            if join.on.contains_aggregate() {
                return Err(DalError::mismatch(
                    join.on.describe(),
                    "a row condition",
                    "aggregate",
                ));
            }
            let on = scope.resolve_expr(join.on)?;
            joins.push(Join { on, ..join });
        }

        let qualified = !joins.is_empty();
        let raw_columns = if self.columns.is_empty() {
            let base_alias = self.alias.clone();
            self.table
                .all_fields()
                .into_iter()
                .map(|mut f| {
                    f.qualifier = base_alias.clone();
                    (Expr::Field(f), None)
                })
                .collect()
        } else {
            self.columns
        };

        let mut columns: Vec<SelectItem> = Vec::with_capacity(raw_columns.len());
        for (expr, name) in raw_columns {
            let expr = scope.resolve_expr(expr)?;
            let name = name.unwrap_or_else(|| expr.default_name(qualified));
            if columns.iter().any(|c| c.name == name) {
                return Err(DalError::AmbiguousReference {
                    reference: name,
                    reason: "two output columns share this name; use column_as".into(),
                });
            }
            columns.push(SelectItem { expr, name });
        }

        let filter = if self.filter.is_empty() {
            None
        } else {
            let f = all(self.filter)?;
            if f.contains_aggregate() {
                return Err(DalError::mismatch(
                    f.describe(),
                    "a row condition",
                    "aggregate (use having)",
                ));
            }
            Some(scope.resolve_expr(f)?)
        };

        let group_by = self
            .group_by
            .into_iter()
            .map(|e| scope.resolve_expr(e))
            .collect::<Result<Vec<_>>>()?;

        let having = match self.having {
            Some(h) => {
                expect_type(&h, is_boolean, "boolean")?;
                Some(scope.resolve_expr(h)?)
            }
            None => None,
        };

        let mut order_by = Vec::with_capacity(self.order_by.len());
        for spec in self.order_by {
            let plain = match &spec.expr {
                Expr::Field(_) => true,
                Expr::Aggregate { arg, .. } => {
                    arg.as_deref().map_or(true, |a| matches!(a, Expr::Field(_)))
                }
                _ => false,
            };
            if !plain {
                return Err(DalError::mismatch(
                    spec.expr.describe(),
                    "a field or aggregate of a field",
                    "computed expression in ORDER BY",
                ));
            }
            order_by.push(OrderSpec {
                expr: scope.resolve_expr(spec.expr)?,
                direction: spec.direction,
            });
        }

        let query = SelectQuery {
            table: self.table,
            alias: self.alias,
            columns,
            joins,
            filter,
            group_by,
            having,
            order_by,
            limit: self.limit,
            distinct: self.distinct,
            unfiltered: self.unfiltered,
        };

        if query.is_grouped() {
            check_grouping(&query)?;
        }
        Ok(query)
    }
}

/// Every plain column of a grouped select must be grouped on.
fn check_grouping(query: &SelectQuery) -> Result<()> {
    for item in &query.columns {
        if item.expr.contains_aggregate() {
            continue;
        }
        let mut ungrouped = None;
        item.expr.visit_fields(&mut |f| {
            let grouped = query
                .group_by
                .iter()
                .any(|g| matches!(g, Expr::Field(gf) if gf == f));
            if !grouped && ungrouped.is_none() {
                ungrouped = Some(f.qualified_name());
            }
        });
        if let Some(name) = ungrouped {
            return Err(DalError::AmbiguousReference {
                reference: name,
                reason: "column is neither grouped nor aggregated".into(),
            });
        }
    }
    Ok(())
}

/// Build an insert of one row. Field names are checked; values are typed
/// against their fields.
pub fn insert<I, K, V>(table: &Arc<Table>, values: I) -> Result<InsertCommand>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    let row: Vec<(String, Value)> = values
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    insert_many(table, vec![row])
}

/// Build a multi-row insert. Every row must name the same fields.
pub fn insert_many(table: &Arc<Table>, rows: Vec<Vec<(String, Value)>>) -> Result<InsertCommand> {
    let columns: Vec<String> = match rows.first() {
        Some(first) => first.iter().map(|(k, _)| k.clone()).collect(),
        None => {
            return Err(DalError::InvalidSchema {
                table: table.name().to_string(),
                reason: "insert without rows".into(),
            })
        }
    };
    if columns.is_empty() {
        return Err(DalError::InvalidSchema {
            table: table.name().to_string(),
            reason: "insert without values".into(),
        });
    }
    for (i, c) in columns.iter().enumerate() {
        if columns[..i].contains(c) {
            return Err(DalError::AmbiguousReference {
                reference: format!("{}.{c}", table.name()),
                reason: "field assigned twice".into(),
            });
        }
    }
    let fields = columns
        .iter()
        .map(|c| table.field(c))
        .collect::<Result<Vec<_>>>()?;

    let mut typed_rows = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() != columns.len() || row.iter().zip(&columns).any(|((k, _), c)| k != c) {
            return Err(DalError::InvalidSchema {
                table: table.name().to_string(),
                reason: "all rows of a bulk insert must name the same fields".into(),
            });
        }
        let mut typed = Vec::with_capacity(row.len());
        for ((_, value), field) in row.into_iter().zip(&fields) {
            let context = field.qualified_name();
            typed.push(literal_type(&field.field_type).coerce(value, &context)?);
        }
        typed_rows.push(typed);
    }

    Ok(InsertCommand {
        table: Arc::clone(table),
        columns,
        rows: typed_rows,
    })
}

/// Builder for [`UpdateCommand`].
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: Arc<Table>,
    assignments: Vec<(String, Expr)>,
    filter: Vec<Expr>,
    unfiltered: bool,
    error: Option<String>,
}

pub fn update(table: &Arc<Table>) -> UpdateBuilder {
    UpdateBuilder {
        table: Arc::clone(table),
        assignments: Vec::new(),
        filter: Vec::new(),
        unfiltered: false,
        error: None,
    }
}

impl UpdateBuilder {
    /// Assign a plain value.
    pub fn set(self, name: &str, value: impl Into<Value>) -> Result<Self> {
        let field = self.table.field(name)?;
        let expr = typed_literal(
            value.into(),
            &literal_type(&field.field_type),
            &field.qualified_name(),
        )?;
        self.set_expr(name, expr)
    }

    /// Assign a computed expression, such as `age + 1`.
    pub fn set_expr(mut self, name: &str, expr: Expr) -> Result<Self> {
        let field = self.table.field(name)?;
        if field.field_type == FieldType::Id {
            return Err(DalError::mismatch(
                field.qualified_name(),
                "a writable field",
                "the id field",
            ));
        }
        if expr.contains_aggregate() {
            return Err(DalError::mismatch(
                field.qualified_name(),
                "a row expression",
                "aggregate",
            ));
        }
        if let Some(t) = expr.result_type() {
            if !literal_type(&field.field_type).comparable_with(&t) {
                return Err(DalError::mismatch(field.qualified_name(), &field.field_type, t));
            }
        }
        let mut foreign = None;
        expr.visit_fields(&mut |f| {
            if f.table != self.table.name() && foreign.is_none() {
                foreign = Some(f.qualified_name());
            }
        });
        if let Some(reference) = foreign {
            return Err(DalError::AmbiguousReference {
                reference,
                reason: format!("updates of {} may only read its own fields", self.table.name()),
            });
        }
        if self.assignments.iter().any(|(n, _)| n == name) {
            self.error = Some(name.to_string());
        }
        self.assignments.push((name.to_string(), expr));
        Ok(self)
    }

    pub fn filter(mut self, condition: Expr) -> Self {
        self.filter.push(condition);
        self
    }

    pub fn unfiltered(mut self) -> Self {
        self.unfiltered = true;
        self
    }

    pub fn build(self) -> Result<UpdateCommand> {
        if let Some(name) = self.error {
            return Err(DalError::AmbiguousReference {
                reference: format!("{}.{name}", self.table.name()),
                reason: "field assigned twice".into(),
            });
        }
        if self.assignments.is_empty() {
            return Err(DalError::InvalidSchema {
                table: self.table.name().to_string(),
                reason: "update without assignments".into(),
            });
        }
        let filter = single_table_filter(&self.table, self.filter)?;
        Ok(UpdateCommand {
            table: self.table,
            assignments: self.assignments,
            filter,
            unfiltered: self.unfiltered,
        })
    }
}

/// Builder for [`DeleteCommand`].
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: Arc<Table>,
    filter: Vec<Expr>,
    unfiltered: bool,
}

pub fn delete(table: &Arc<Table>) -> DeleteBuilder {
    DeleteBuilder {
        table: Arc::clone(table),
        filter: Vec::new(),
        unfiltered: false,
    }
}

impl DeleteBuilder {
    pub fn filter(mut self, condition: Expr) -> Self {
        self.filter.push(condition);
        self
    }

    pub fn unfiltered(mut self) -> Self {
        self.unfiltered = true;
        self
    }

    pub fn build(self) -> Result<DeleteCommand> {
        let filter = single_table_filter(&self.table, self.filter)?;
        Ok(DeleteCommand {
            table: self.table,
            filter,
            unfiltered: self.unfiltered,
        })
    }
}

fn single_table_filter(table: &Table, conditions: Vec<Expr>) -> Result<Option<Expr>> {
    if conditions.is_empty() {
        return Ok(None);
    }
    let filter = all(conditions)?;
    if filter.contains_aggregate() {
        return Err(DalError::mismatch(
            filter.describe(),
            "a row condition",
            "aggregate",
        ));
    }
    let scope = Scope {
        sources: vec![Source {
            name: table.name().to_string(),
            table: table.name().to_string(),
            aliased: false,
        }],
    };
    let filter = scope.resolve_expr(filter)?;
    let mut aliased = None;
    filter.visit_fields(&mut |f| {
        if f.qualifier.is_some() && aliased.is_none() {
            aliased = Some(f.qualified_name());
        }
    });
    match aliased {
        Some(reference) => Err(DalError::AmbiguousReference {
            reference,
            reason: "aliases are not allowed in single-table commands".into(),
        }),
        None => Ok(Some(filter)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    fn person() -> Arc<Table> {
        Table::builder("person")
            .field(Field::new("name", FieldType::string(64)).not_null())
            .field(Field::new("age", FieldType::Integer))
            .field(Field::new("boss", FieldType::reference("person")))
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

    #[test]
    fn test_string_field_vs_integer_literal() {
        let t = person();
        let err = t.field("name").unwrap().eq(30).unwrap_err();
        assert!(matches!(err, DalError::TypeMismatch { .. }));
        assert!(err.to_string().contains("person.name"));
    }

    #[test]
    fn test_literal_typed_against_field() {
        let t = person();
        let e = t.field("age").unwrap().eq(30).unwrap();
        match e {
            Expr::Comparison { right, .. } => match *right {
                Expr::Literal { value, field_type } => {
                    assert_eq!(value, Value::Int(30));
                    assert_eq!(field_type, FieldType::Integer);
                }
                other => panic!("expected literal, got {other:?}"),
            },
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_eq_null_becomes_is_null() {
        let t = person();
        let e = t.field("age").unwrap().eq(Value::Null).unwrap();
        assert!(matches!(e, Expr::IsNull { negated: false, .. }));
        assert!(t.field("age").unwrap().lt(Value::Null).is_err());
    }

    #[test]
    fn test_and_requires_booleans() {
        let t = person();
        let age: Expr = t.field("age").unwrap().into();
        let cond = t.field("name").unwrap().eq("James").unwrap();
        assert!(cond.clone().and(age).is_err());
        let both = cond
            .clone()
            .and(t.field("age").unwrap().gt(18).unwrap())
            .unwrap();
        let nested = both.and(cond).unwrap();
        match nested {
            Expr::Logical { op, children } => {
                assert_eq!(op, LogicalOp::And);
                assert_eq!(children.len(), 3);
            }
            other => panic!("expected flattened AND, got {other:?}"),
        }
    }

    #[test]
    fn test_sum_rejects_strings() {
        let t = person();
        assert!(t.field("name").unwrap().sum().is_err());
        assert!(t.field("age").unwrap().sum().is_ok());
        assert!(t.field("age").unwrap().sum().unwrap().sum().is_err());
    }

    #[test]
    fn test_unjoined_table_is_ambiguous() {
        let p = person();
        let d = dog();
        let err = select(&p)
            .column(d.field("name").unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, DalError::AmbiguousReference { .. }));
    }

    #[test]
    fn test_join_twice_without_alias() {
        let p = person();
        let d = dog();
        let on = d.field("owner").unwrap().eq(p.field("id").unwrap()).unwrap();
        let err = select(&p)
            .join(&d, on.clone())
            .join(&d, on)
            .build()
            .unwrap_err();
        assert!(matches!(err, DalError::AmbiguousReference { .. }));
    }

    #[test]
    fn test_self_join_with_alias() {
        let p = person();
        let boss = p.alias("boss");
        let on = p
            .field("boss")
            .unwrap()
            .eq(boss.field("id").unwrap())
            .unwrap();
        let q = select(&p)
            .column(p.field("name").unwrap())
            .column_as(boss.field("name").unwrap(), "boss_name")
            .join_alias(JoinKind::Left, &boss, on)
            .build()
            .unwrap();
        assert_eq!(q.columns[0].name, "person.name");
        assert_eq!(q.columns[1].name, "boss_name");
    }

    #[test]
    fn test_duplicate_output_names_rejected() {
        let p = person();
        let d = dog();
        let on = d.field("owner").unwrap().eq(p.field("id").unwrap()).unwrap();
        let q = select(&p)
            .column(p.field("name").unwrap())
            .column(d.field("name").unwrap())
            .join(&d, on)
            .build()
            .unwrap();
        assert_eq!(q.columns[0].name, "person.name");
        assert_eq!(q.columns[1].name, "dog.name");
    }

    #[test]
    fn test_aliased_base_table_qualifies_fields() {
        let p = person();
        let q = select(&p)
            .alias("p")
            .column(p.field("name").unwrap())
            .build()
            .unwrap();
        match &q.columns[0].expr {
            Expr::Field(f) => assert_eq!(f.source(), "p"),
            other => panic!("expected field, got {other:?}"),
        }
    }

    #[test]
    fn test_order_by_rejects_computed() {
        let p = person();
        let computed = p.field("age").unwrap().add(1).unwrap();
        let err = select(&p).order_by(computed).build().unwrap_err();
        assert!(matches!(err, DalError::TypeMismatch { .. }));
        assert!(select(&p)
            .order_by(p.field("age").unwrap().desc())
            .build()
            .is_ok());
    }

    #[test]
    fn test_grouping_requires_grouped_columns() {
        let p = person();
        let err = select(&p)
            .column(p.field("name").unwrap())
            .column(count_all())
            .build()
            .unwrap_err();
        assert!(matches!(err, DalError::AmbiguousReference { .. }));
        assert!(select(&p)
            .column(p.field("name").unwrap())
            .column(count_all())
            .group_by(p.field("name").unwrap())
            .build()
            .is_ok());
    }

    #[test]
    fn test_insert_checks_fields_and_types() {
        let p = person();
        let cmd = insert(&p, [("name", Value::from("James")), ("age", Value::from(30))]).unwrap();
        assert_eq!(cmd.columns, vec!["name", "age"]);
        assert!(insert(&p, [("agee", Value::from(30))]).is_err());
        assert!(insert(&p, [("age", Value::from("thirty"))]).is_err());
    }

    #[test]
    fn test_update_rejects_id_and_foreign_fields() {
        let p = person();
        let d = dog();
        assert!(update(&p).set("id", 3).is_err());
        let foreign: Expr = d.field("owner").unwrap().into();
        assert!(update(&p).set_expr("age", foreign).is_err());
        let bump = p.field("age").unwrap().add(1).unwrap();
        let cmd = update(&p).set_expr("age", bump).unwrap().build().unwrap();
        assert_eq!(cmd.assignments.len(), 1);
    }

    #[test]
    fn test_delete_filter_must_stay_on_table() {
        let p = person();
        let d = dog();
        let err = delete(&p)
            .filter(d.field("name").unwrap().eq("Rex").unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, DalError::AmbiguousReference { .. }));
    }
}
