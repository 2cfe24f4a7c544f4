use super::parser::{BinaryOp, Expr, Method};
use super::{Bindings, PredicateError, Value};

pub(crate) fn eval(expr: &Expr, bindings: &Bindings) -> Result<Value, PredicateError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| PredicateError::Unbound(name.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!as_bool(eval(inner, bindings)?)?)),
        Expr::Binary {
            op: BinaryOp::And,
            lhs,
            rhs,
        } => {
            if !as_bool(eval(lhs, bindings)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(eval(rhs, bindings)?)?))
        }
        Expr::Binary {
            op: BinaryOp::Or,
            lhs,
            rhs,
        } => {
            if as_bool(eval(lhs, bindings)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(eval(rhs, bindings)?)?))
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, bindings)?;
            let r = eval(rhs, bindings)?;
            binary(*op, l, r)
        }
        Expr::In { needle, haystack } => {
            let needle = eval(needle, bindings)?;
            for item in haystack {
                if eval(item, bindings)? == needle {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Method {
            method,
            target,
            arg,
        } => {
            let target = as_string(eval(target, bindings)?)?;
            let arg = as_string(eval(arg, bindings)?)?;
            Ok(Value::Bool(match method {
                Method::StartsWith => target.starts_with(&arg),
                Method::EndsWith => target.ends_with(&arg),
                Method::Contains => target.contains(&arg),
            }))
        }
        Expr::Size(inner) => {
            let s = as_string(eval(inner, bindings)?)?;
            Ok(Value::Uint(s.chars().count() as u64))
        }
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, PredicateError> {
    use std::cmp::Ordering;

    let ordering = |l: &Value, r: &Value| -> Result<Ordering, PredicateError> {
        match (l, r) {
            (Value::Uint(a), Value::Uint(b)) => Ok(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(PredicateError::Type(format!(
                "cannot compare {} with {}",
                l.value_type(),
                r.value_type()
            ))),
        }
    };

    match op {
        BinaryOp::Eq | BinaryOp::Ne => {
            if l.value_type() != r.value_type() {
                return Err(PredicateError::Type(format!(
                    "cannot compare {} with {}",
                    l.value_type(),
                    r.value_type()
                )));
            }
            let equal = l == r;
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Lt => Ok(Value::Bool(ordering(&l, &r)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(ordering(&l, &r)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(ordering(&l, &r)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(ordering(&l, &r)? != Ordering::Less)),
        BinaryOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (l, r) => {
                let (a, b) = (as_uint(l)?, as_uint(r)?);
                a.checked_add(b).map(Value::Uint).ok_or(PredicateError::Overflow)
            }
        },
        BinaryOp::Sub => {
            let (a, b) = (as_uint(l)?, as_uint(r)?);
            a.checked_sub(b).map(Value::Uint).ok_or(PredicateError::Overflow)
        }
        BinaryOp::Mul => {
            let (a, b) = (as_uint(l)?, as_uint(r)?);
            a.checked_mul(b).map(Value::Uint).ok_or(PredicateError::Overflow)
        }
        BinaryOp::Div => {
            let (a, b) = (as_uint(l)?, as_uint(r)?);
            if b == 0 {
                return Err(PredicateError::DivisionByZero);
            }
            Ok(Value::Uint(a / b))
        }
        BinaryOp::And | BinaryOp::Or => {
            let (a, b) = (as_bool(l)?, as_bool(r)?);
            Ok(Value::Bool(if op == BinaryOp::And { a && b } else { a || b }))
        }
    }
}

fn as_bool(value: Value) -> Result<bool, PredicateError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(PredicateError::Type(format!(
            "expected bool, found {}",
            other.value_type()
        ))),
    }
}

fn as_uint(value: Value) -> Result<u64, PredicateError> {
    match value {
        Value::Uint(v) => Ok(v),
        other => Err(PredicateError::Type(format!(
            "expected uint, found {}",
            other.value_type()
        ))),
    }
}

fn as_string(value: Value) -> Result<String, PredicateError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(PredicateError::Type(format!(
            "expected string, found {}",
            other.value_type()
        ))),
    }
}
