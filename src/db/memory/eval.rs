//! Expression evaluation over stored raw values.

use std::cmp::Ordering;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::ast::{AggregateFn, ArithOp, CompareOp, Expr, FieldRef, LogicalOp, ScalarFn};
use crate::codec::{ProfileCodec, Representer};
use crate::error::{DalError, Result};
use crate::schema::FieldType;
use crate::value::RawValue;

/// Column layout of one FROM source.
#[derive(Debug, Clone)]
pub(crate) struct Source {
    pub name: String,
    pub columns: Vec<String>,
}

/// One joined row: a slot per source, `None` for the missing side of a
/// left join.
pub(crate) type Tuple = Vec<Option<Vec<RawValue>>>;

pub(crate) enum Scope<'a> {
    Row(&'a Tuple),
    /// Aggregates fold over every tuple; plain fields read the first one.
    Group(&'a [Tuple]),
}

pub(crate) struct Evaluator<'a> {
    pub sources: &'a [Source],
    pub codec: &'a ProfileCodec,
}

pub(crate) fn statement_error(code: &str, message: impl Into<String>) -> DalError {
    DalError::Statement {
        backend: "memory".into(),
        code: Some(code.to_string()),
        message: message.into(),
    }
}

impl<'a> Evaluator<'a> {
    fn field(&self, field: &FieldRef, tuple: Option<&Tuple>) -> Result<RawValue> {
        let slot = self
            .sources
            .iter()
            .position(|s| s.name == field.source())
            .ok_or_else(|| {
                statement_error("42P01", format!("missing FROM entry for {}", field.source()))
            })?;
        let column = self.sources[slot]
            .columns
            .iter()
            .position(|c| *c == field.name)
            .ok_or_else(|| {
                statement_error("42703", format!("column {} does not exist", field.qualified_name()))
            })?;
        Ok(tuple
            .and_then(|t| t[slot].as_ref())
            .map(|values| values[column].clone())
            .unwrap_or(RawValue::Null))
    }

    pub fn eval(&self, expr: &Expr, scope: &Scope<'_>) -> Result<RawValue> {
        match expr {
            Expr::Field(field) => match scope {
                Scope::Row(tuple) => self.field(field, Some(tuple)),
                Scope::Group(tuples) => self.field(field, tuples.first()),
            },
            Expr::Literal { value, field_type } => self.codec.represent(value, field_type),
            Expr::Comparison { op, left, right } => {
                let l = self.eval(left, scope)?;
                let r = self.eval(right, scope)?;
                Ok(compare(*op, &l, &r))
            }
            Expr::Logical { op, children } => self.logical(*op, children, scope),
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                let tuples: &[Tuple] = match scope {
                    Scope::Group(tuples) => tuples,
                    Scope::Row(_) => {
                        return Err(statement_error(
                            "42803",
                            "aggregate used outside of a grouped query",
                        ))
                    }
                };
                let values = match arg {
                    None => return Ok(RawValue::Int(tuples.len() as i64)),
                    Some(arg) => {
                        let mut values = Vec::with_capacity(tuples.len());
                        for tuple in tuples {
                            let v = self.eval(arg, &Scope::Row(tuple))?;
                            if !v.is_null() && !(*distinct && values.contains(&v)) {
                                values.push(v);
                            }
                        }
                        values
                    }
                };
                aggregate(*func, values)
            }
            Expr::IsNull { expr, negated } => {
                let v = self.eval(expr, scope)?;
                Ok(RawValue::Bool(v.is_null() != *negated))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let v = self.eval(expr, scope)?;
                if v.is_null() {
                    return Ok(RawValue::Null);
                }
                let mut saw_null = false;
                for item in list {
                    let candidate = self.eval(item, scope)?;
                    match v.compare(&candidate) {
                        Some(Ordering::Equal) => return Ok(RawValue::Bool(!*negated)),
                        None if candidate.is_null() => saw_null = true,
                        _ => {}
                    }
                }
                if saw_null {
                    Ok(RawValue::Null)
                } else {
                    Ok(RawValue::Bool(*negated))
                }
            }
            Expr::Arithmetic { op, left, right } => {
                let l = self.eval(left, scope)?;
                let r = self.eval(right, scope)?;
                arithmetic(*op, l, r)
            }
            Expr::Function { func, args } => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a, scope))
                    .collect::<Result<Vec<_>>>()?;
                function(*func, values)
            }
        }
    }

    fn logical(&self, op: LogicalOp, children: &[Expr], scope: &Scope<'_>) -> Result<RawValue> {
        match op {
            LogicalOp::Not => {
                let v = match children.first() {
                    Some(child) => self.eval(child, scope)?,
                    None => RawValue::Null,
                };
                Ok(match truth(&v) {
                    Some(b) => RawValue::Bool(!b),
                    None => RawValue::Null,
                })
            }
            LogicalOp::And | LogicalOp::Or => {
                let short = op == LogicalOp::Or;
                let mut unknown = false;
                for child in children {
                    match truth(&self.eval(child, scope)?) {
                        Some(b) if b == short => return Ok(RawValue::Bool(short)),
                        Some(_) => {}
                        None => unknown = true,
                    }
                }
                Ok(if unknown {
                    RawValue::Null
                } else {
                    RawValue::Bool(!short)
                })
            }
        }
    }

    /// Whether `expr` holds for the scope. NULL counts as false.
    pub fn holds(&self, expr: &Expr, scope: &Scope<'_>) -> Result<bool> {
        Ok(truth(&self.eval(expr, scope)?) == Some(true))
    }
}

pub(crate) fn truth(v: &RawValue) -> Option<bool> {
    match v {
        RawValue::Null => None,
        other => other.as_bool(),
    }
}

fn compare(op: CompareOp, l: &RawValue, r: &RawValue) -> RawValue {
    if l.is_null() || r.is_null() {
        return RawValue::Null;
    }
    match op {
        CompareOp::Like | CompareOp::ILike => match (l, r) {
            (RawValue::Text(text), RawValue::Text(pattern)) => {
                let hit = if op == CompareOp::ILike {
                    like(&text.to_lowercase(), &pattern.to_lowercase())
                } else {
                    like(text, pattern)
                };
                RawValue::Bool(hit)
            }
            _ => RawValue::Null,
        },
        _ => match l.compare(r) {
            None => RawValue::Null,
            Some(ord) => RawValue::Bool(match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::NotEq => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::LtEq => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::GtEq => ord != Ordering::Less,
                CompareOp::Like | CompareOp::ILike => false,
            }),
        },
    }
}

/// SQL LIKE with `%` and `_` wildcards and `\` as escape.
pub(crate) fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_at(&text, &pattern)
}

fn like_at(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len()).any(|skip| like_at(&text[skip..], rest)),
        Some(('_', rest)) => !text.is_empty() && like_at(&text[1..], rest),
        Some(('\\', rest)) if !rest.is_empty() => {
            text.first() == rest.first() && like_at(&text[1..], &rest[1..])
        }
        Some((c, rest)) => text.first() == Some(c) && like_at(&text[1..], rest),
    }
}

fn overflow(op: &str) -> DalError {
    DalError::OutOfRange {
        context: format!("memory {op}"),
        value: "result".into(),
        target: FieldType::Integer,
        reason: "integer overflow".into(),
    }
}

fn as_decimal(v: &RawValue) -> Option<Decimal> {
    match v {
        RawValue::Int(i) => Some(Decimal::from(*i)),
        RawValue::Decimal(d) => Some(*d),
        _ => None,
    }
}

fn as_float(v: &RawValue) -> Option<f64> {
    match v {
        RawValue::Int(i) => Some(*i as f64),
        RawValue::Float(f) => Some(*f),
        RawValue::Decimal(d) => d.to_f64(),
        _ => None,
    }
}

fn arithmetic(op: ArithOp, l: RawValue, r: RawValue) -> Result<RawValue> {
    if l.is_null() || r.is_null() {
        return Ok(RawValue::Null);
    }
    let zero_division = || statement_error("22012", "division by zero");
    match (&l, &r) {
        (RawValue::Int(a), RawValue::Int(b)) => {
            let out = match op {
                ArithOp::Add => a.checked_add(*b),
                ArithOp::Sub => a.checked_sub(*b),
                ArithOp::Mul => a.checked_mul(*b),
                ArithOp::Div => {
                    if *b == 0 {
                        return Err(zero_division());
                    }
                    a.checked_div(*b)
                }
            };
            out.map(RawValue::Int).ok_or_else(|| overflow(op.symbol()))
        }
        (RawValue::Float(_), _) | (_, RawValue::Float(_)) => {
            let (Some(a), Some(b)) = (as_float(&l), as_float(&r)) else {
                return Err(DalError::mismatch("arithmetic", "number", l.kind()));
            };
            Ok(RawValue::Float(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => {
                    if b == 0.0 {
                        return Err(zero_division());
                    }
                    a / b
                }
            }))
        }
        _ => {
            let (Some(a), Some(b)) = (as_decimal(&l), as_decimal(&r)) else {
                return Err(DalError::mismatch("arithmetic", "number", l.kind()));
            };
            let out = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
                ArithOp::Div => {
                    if b.is_zero() {
                        return Err(zero_division());
                    }
                    a.checked_div(b)
                }
            };
            out.map(RawValue::Decimal).ok_or_else(|| overflow(op.symbol()))
        }
    }
}

fn function(func: ScalarFn, mut args: Vec<RawValue>) -> Result<RawValue> {
    match func {
        ScalarFn::Coalesce => Ok(args
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(RawValue::Null)),
        _ => {
            let arg = if args.is_empty() {
                RawValue::Null
            } else {
                args.swap_remove(0)
            };
            match (func, arg) {
                (_, RawValue::Null) => Ok(RawValue::Null),
                (ScalarFn::Upper, RawValue::Text(s)) => Ok(RawValue::Text(s.to_uppercase())),
                (ScalarFn::Lower, RawValue::Text(s)) => Ok(RawValue::Text(s.to_lowercase())),
                (ScalarFn::Length, RawValue::Text(s)) => {
                    Ok(RawValue::Int(s.chars().count() as i64))
                }
                (func, other) => Err(DalError::mismatch(func.name(), "text", other.kind())),
            }
        }
    }
}

/// Fold non-null values. Empty input yields NULL except for COUNT.
fn aggregate(func: AggregateFn, values: Vec<RawValue>) -> Result<RawValue> {
    match func {
        AggregateFn::Count => Ok(RawValue::Int(values.len() as i64)),
        AggregateFn::ArrayAgg => Ok(if values.is_empty() {
            RawValue::Null
        } else {
            RawValue::Json(serde_json::Value::Array(
                values.iter().map(RawValue::to_json).collect(),
            ))
        }),
        AggregateFn::Min | AggregateFn::Max => {
            let want = if func == AggregateFn::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let mut best: Option<RawValue> = None;
            for v in values {
                best = match best {
                    Some(b) if v.compare(&b) != Some(want) => Some(b),
                    _ => Some(v),
                };
            }
            Ok(best.unwrap_or(RawValue::Null))
        }
        AggregateFn::Sum => {
            let mut iter = values.into_iter();
            let Some(mut total) = iter.next() else {
                return Ok(RawValue::Null);
            };
            for v in iter {
                total = arithmetic(ArithOp::Add, total, v)?;
            }
            Ok(total)
        }
        AggregateFn::Avg => {
            if values.is_empty() {
                return Ok(RawValue::Null);
            }
            let count = values.len() as f64;
            let mut sum = 0.0;
            for v in &values {
                sum += as_float(v)
                    .ok_or_else(|| DalError::mismatch("AVG", "number", v.kind()))?;
            }
            Ok(RawValue::Float(sum / count))
        }
    }
}

/// Total order for ORDER BY: NULLs first, incomparable kinds equal.
pub(crate) fn sort_order(a: &RawValue, b: &RawValue) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_wildcards() {
        assert!(like("James", "J%"));
        assert!(like("James", "_ames"));
        assert!(like("50%", "50\\%"));
        assert!(!like("James", "j%"));
        assert!(!like("Jam", "J_"));
    }

    #[test]
    fn test_three_valued_comparison() {
        assert_eq!(
            compare(CompareOp::Eq, &RawValue::Null, &RawValue::Int(1)),
            RawValue::Null
        );
        assert_eq!(
            compare(CompareOp::Lt, &RawValue::Int(1), &RawValue::Float(1.5)),
            RawValue::Bool(true)
        );
    }

    #[test]
    fn test_integer_overflow_is_reported() {
        let err = arithmetic(ArithOp::Add, RawValue::Int(i64::MAX), RawValue::Int(1)).unwrap_err();
        assert!(matches!(err, DalError::OutOfRange { .. }));
        let err = arithmetic(ArithOp::Div, RawValue::Int(1), RawValue::Int(0)).unwrap_err();
        assert!(err.to_string().contains("22012"));
    }

    #[test]
    fn test_aggregates_skip_nothing_they_are_given() {
        let values = vec![RawValue::Int(3), RawValue::Int(9), RawValue::Int(6)];
        assert_eq!(aggregate(AggregateFn::Max, values.clone()).unwrap(), RawValue::Int(9));
        assert_eq!(aggregate(AggregateFn::Min, values.clone()).unwrap(), RawValue::Int(3));
        assert_eq!(aggregate(AggregateFn::Sum, values.clone()).unwrap(), RawValue::Int(18));
        assert_eq!(aggregate(AggregateFn::Avg, values).unwrap(), RawValue::Float(6.0));
        assert_eq!(aggregate(AggregateFn::Sum, vec![]).unwrap(), RawValue::Null);
    }
}
