//! Operator semantics shared by expressions, compound assignment and `switch`.

use std::cmp::Ordering;
use std::sync::Arc;

use super::evaluator::{EvalError, EvalResult};
use super::governor::DEFAULT_MAX_ELEMENTS;
use super::value::{compare_containers, parse_number, ListValue, Value, Visited};
use crate::ast::{BinaryOp, UnaryOp, UpdateOp};

fn undefined(op: impl std::fmt::Display, value: &Value) -> EvalError {
    EvalError::InvalidOperation(format!(
        "operator {} not defined on {}",
        op,
        value.type_name()
    ))
}

// 数値として読めるスカラーだけを変換する
fn numeric(op: impl std::fmt::Display + Copy, value: &Value) -> EvalResult<Value> {
    match value {
        Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_) => {
            Ok(value.to_number())
        }
        other => Err(undefined(op, other)),
    }
}

fn integer(op: BinaryOp, value: &Value) -> EvalResult<i64> {
    Ok(numeric(op, value)?.to_int())
}

/// `"ab" * 3` and `3 * "ab"`
pub fn repeat_operands<'a>(op: BinaryOp, left: &'a Value, right: &'a Value) -> Option<(&'a str, i64)> {
    match (op, left, right) {
        (BinaryOp::Mul, Value::String(s), Value::Int(n))
        | (BinaryOp::Mul, Value::Int(n), Value::String(s)) => Some((s.as_str(), *n)),
        _ => None,
    }
}

/// Character count of `text` repeated `count` times.
pub fn repeat_len(text: &str, count: i64) -> EvalResult<usize> {
    if count < 0 {
        return Err(EvalError::InvalidOperation(
            "negative string repeat count".to_string(),
        ));
    }
    usize::try_from(count)
        .ok()
        .and_then(|count| text.chars().count().checked_mul(count))
        .ok_or_else(|| EvalError::InvalidOperation("string repeat count overflows".to_string()))
}

pub fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub => arithmetic(op, left, right, i64::wrapping_sub, |a, b| a - b),
        BinaryOp::Mul => match repeat_operands(op, left, right) {
            Some((text, count)) => {
                if repeat_len(text, count)? > DEFAULT_MAX_ELEMENTS {
                    return Err(EvalError::InvalidOperation(
                        "string repeat result too large".to_string(),
                    ));
                }
                Ok(Value::String(text.repeat(count as usize)))
            }
            None => arithmetic(op, left, right, i64::wrapping_mul, |a, b| a * b),
        },
        BinaryOp::Div => {
            let l = numeric(op, left)?.to_float();
            let r = numeric(op, right)?.to_float();
            Ok(Value::Float(l / r))
        }
        BinaryOp::Mod => {
            let l = integer(op, left)?;
            let r = integer(op, right)?;
            if r == 0 {
                return Err(EvalError::InvalidOperation(
                    "integer divide by zero".to_string(),
                ));
            }
            Ok(Value::Int(l.wrapping_rem(r)))
        }
        BinaryOp::Pow => power(left, right),
        BinaryOp::BitAnd => Ok(Value::Int(integer(op, left)? & integer(op, right)?)),
        BinaryOp::BitOr => Ok(Value::Int(integer(op, left)? | integer(op, right)?)),
        BinaryOp::BitXor => Ok(Value::Int(integer(op, left)? ^ integer(op, right)?)),
        BinaryOp::Shl | BinaryOp::Shr => shift(op, integer(op, left)?, integer(op, right)?),
        BinaryOp::And => Ok(Value::Bool(left.truthy() && right.truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.truthy() || right.truthy())),
        BinaryOp::Eq => Ok(Value::Bool(equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!equal(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(op, left, right)? == Some(Ordering::Less))),
        BinaryOp::Le => Ok(Value::Bool(matches!(
            compare(op, left, right)?,
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Gt => Ok(Value::Bool(compare(op, left, right)? == Some(Ordering::Greater))),
        BinaryOp::Ge => Ok(Value::Bool(matches!(
            compare(op, left, right)?,
            Some(Ordering::Greater | Ordering::Equal)
        ))),
    }
}

fn add(left: &Value, right: &Value) -> EvalResult<Value> {
    match (left, right) {
        (Value::String(_), _) | (_, Value::String(_)) => {
            Ok(Value::String(format!("{}{}", left, right)))
        }
        (Value::List(a), Value::List(b)) => {
            let mut items = a.snapshot();
            items.extend(b.snapshot());
            Ok(Value::List(Arc::new(ListValue::typed(
                items,
                a.elem_type().cloned().filter(|_| a.elem_type() == b.elem_type()),
                false,
            ))))
        }
        _ => arithmetic(BinaryOp::Add, left, right, i64::wrapping_add, |a, b| a + b),
    }
}

fn arithmetic(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> EvalResult<Value> {
    match (numeric(op, left)?, numeric(op, right)?) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(a, b))),
        (a, b) => Ok(Value::Float(float_op(a.to_float(), b.to_float()))),
    }
}

fn power(left: &Value, right: &Value) -> EvalResult<Value> {
    match (numeric(BinaryOp::Pow, left)?, numeric(BinaryOp::Pow, right)?) {
        (Value::Int(base), Value::Int(exp)) if (0..=u32::MAX as i64).contains(&exp) => {
            match base.checked_pow(exp as u32) {
                Some(result) => Ok(Value::Int(result)),
                None => Ok(Value::Float((base as f64).powf(exp as f64))),
            }
        }
        (base, exp) => Ok(Value::Float(base.to_float().powf(exp.to_float()))),
    }
}

fn shift(op: BinaryOp, value: i64, count: i64) -> EvalResult<Value> {
    if count < 0 {
        return Err(EvalError::InvalidOperation(format!(
            "negative shift count {}",
            count
        )));
    }
    let shifted = match op {
        BinaryOp::Shl if count >= 64 => 0,
        BinaryOp::Shl => value << count,
        _ if count >= 64 => {
            if value < 0 {
                -1
            } else {
                0
            }
        }
        _ => value >> count,
    };
    Ok(Value::Int(shifted))
}

/// Script `==` with cross-type coercion.
pub fn equal(left: &Value, right: &Value) -> bool {
    loose_equal(left, right, &mut Visited::new())
}

fn loose_equal(left: &Value, right: &Value, visited: &mut Visited) -> bool {
    match (left, right) {
        (Value::Nil, Value::Nil) => true,
        (Value::Nil, _) | (_, Value::Nil) => false,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Bool(b), other @ Value::String(_)) | (other @ Value::String(_), Value::Bool(b)) => {
            *b == other.loose_bool()
        }
        (Value::Bool(b), number) | (number, Value::Bool(b)) if number.is_numeric() => {
            numbers_equal(&Value::Int(i64::from(*b)), number)
        }
        (a, b) if a.is_numeric() && b.is_numeric() => numbers_equal(a, b),
        (Value::String(s), number) | (number, Value::String(s)) if number.is_numeric() => {
            parse_number(s).is_some_and(|parsed| numbers_equal(&parsed, number))
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::List(a), Value::List(b)) => compare_containers(a, b, visited, |visited| {
            let (a, b) = (a.snapshot(), b.snapshot());
            a.len() == b.len()
                && a.iter().zip(b.iter()).all(|(x, y)| loose_equal(x, y, visited))
        }),
        (Value::Map(a), Value::Map(b)) => compare_containers(a, b, visited, |visited| {
            let (a, b) = (a.snapshot(), b.snapshot());
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && loose_equal(va, vb, visited))
        }),
        (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
        (Value::Chan(a), Value::Chan(b)) => Arc::ptr_eq(a, b),
        (Value::Handle(a), Value::Handle(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        _ => a.to_float() == b.to_float(),
    }
}

/// Ordering for `< <= > >=`: strings lexicographically, everything else numerically.
/// `None` when unordered (NaN).
pub fn compare(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Option<Ordering>> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(Some(a.cmp(b)));
    }
    match (numeric(op, left)?, numeric(op, right)?) {
        (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(&b))),
        (a, b) => Ok(a.to_float().partial_cmp(&b.to_float())),
    }
}

pub fn unary_op(op: UnaryOp, operand: &Value) -> EvalResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Neg => match numeric(op, operand)? {
            Value::Float(f) => Ok(Value::Float(-f)),
            number => Ok(Value::Int(number.to_int().wrapping_neg())),
        },
        UnaryOp::BitNot => Ok(Value::Int(!numeric(op, operand)?.to_int())),
    }
}

/// `++`/`--`: floats stay floats, everything else becomes an integer.
pub fn update(op: UpdateOp, value: &Value) -> EvalResult<Value> {
    let delta = match op {
        UpdateOp::Inc => 1,
        UpdateOp::Dec => -1,
    };
    match value {
        Value::Float(f) => Ok(Value::Float(f + delta as f64)),
        other => Ok(Value::Int(numeric(op, other)?.to_int().wrapping_add(delta))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bin(op: BinaryOp, l: impl Into<Value>, r: impl Into<Value>) -> Value {
        binary_op(op, &l.into(), &r.into()).unwrap()
    }

    #[test]
    fn test_arithmetic_promotion() {
        assert_eq!(bin(BinaryOp::Add, 1, 2), Value::Int(3));
        assert_eq!(bin(BinaryOp::Add, 1, 2.5), Value::Float(3.5));
        assert_eq!(bin(BinaryOp::Div, 2, 1), Value::Float(2.0));
        assert_eq!(bin(BinaryOp::Div, 1, 0), Value::Float(f64::INFINITY));
        assert_eq!(bin(BinaryOp::Pow, 2, 10), Value::Int(1024));
        assert_eq!(bin(BinaryOp::Pow, 2, -1), Value::Float(0.5));
        assert_eq!(bin(BinaryOp::Sub, "5", true), Value::Int(4));
    }

    #[test]
    fn test_integer_operators_coerce() {
        assert_eq!(bin(BinaryOp::Mod, 7, 3), Value::Int(1));
        assert_eq!(bin(BinaryOp::Mod, 7.9, "3"), Value::Int(1));
        assert_eq!(bin(BinaryOp::BitAnd, true, 3), Value::Int(1));
        assert_eq!(bin(BinaryOp::BitOr, Value::Nil, "abc"), Value::Int(0));
        assert_eq!(bin(BinaryOp::Shl, 1, 4), Value::Int(16));
        assert_eq!(bin(BinaryOp::Shr, -8, 100), Value::Int(-1));
        assert_eq!(unary_op(UnaryOp::BitNot, &Value::Int(0)).unwrap(), Value::Int(-1));
        assert!(binary_op(BinaryOp::Mod, &Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn test_string_operators() {
        assert_eq!(bin(BinaryOp::Add, "a", 1), Value::string("a1"));
        assert_eq!(bin(BinaryOp::Add, 1.5, "b"), Value::string("1.5b"));
        assert_eq!(bin(BinaryOp::Mul, "ab", 3), Value::string("ababab"));
        assert!(matches!(
            binary_op(BinaryOp::Mul, &Value::string("ab"), &Value::Int(i64::MAX)),
            Err(EvalError::InvalidOperation(_))
        ));
        assert_eq!(bin(BinaryOp::Lt, "abc", "abd"), Value::Bool(true));
    }

    #[test]
    fn test_list_concatenation() {
        let l = Value::list(vec![Value::Int(1)]);
        let r = Value::list(vec![Value::Int(2)]);
        assert_eq!(
            binary_op(BinaryOp::Add, &l, &r).unwrap(),
            Value::list(vec![Value::Int(1), Value::Int(2)])
        );
        assert!(binary_op(BinaryOp::Sub, &l, &r).is_err());
    }

    #[test]
    fn test_equality_matrix() {
        assert!(equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(equal(&Value::Int(2), &Value::string("2")));
        assert!(equal(&Value::string("2.5"), &Value::Float(2.5)));
        assert!(!equal(&Value::Int(2), &Value::string("two")));
        assert!(equal(&Value::Bool(true), &Value::string("YES")));
        assert!(equal(&Value::Bool(false), &Value::string("f")));
        assert!(equal(&Value::Bool(true), &Value::string("foo")));
        assert!(!equal(&Value::Bool(false), &Value::string("foo")));
        assert!(!equal(&Value::Nil, &Value::Bool(false)));
        assert!(!equal(&Value::Nil, &Value::Int(0)));
        assert!(equal(&Value::Bool(true), &Value::Int(1)));
        assert!(equal(
            &Value::list(vec![Value::Int(1)]),
            &Value::list(vec![Value::Float(1.0)])
        ));
    }

    #[test]
    fn test_equality_on_cyclic_lists() {
        let cyclic = |first: Value| {
            let list = Arc::new(ListValue::new(vec![first]));
            list.push(Value::List(list.clone())).unwrap();
            Value::List(list)
        };
        assert!(equal(&cyclic(Value::Int(1)), &cyclic(Value::Float(1.0))));
        assert!(!equal(&cyclic(Value::Int(1)), &cyclic(Value::Int(2))));
    }

    #[test]
    fn test_update() {
        assert_eq!(update(UpdateOp::Inc, &Value::Nil).unwrap(), Value::Int(1));
        assert_eq!(update(UpdateOp::Inc, &Value::Bool(true)).unwrap(), Value::Int(2));
        assert_eq!(update(UpdateOp::Dec, &Value::string("5")).unwrap(), Value::Int(4));
        assert_eq!(update(UpdateOp::Inc, &Value::Float(1.5)).unwrap(), Value::Float(2.5));
        assert!(update(UpdateOp::Inc, &Value::list(vec![])).is_err());
    }

    #[test]
    fn test_comparison_with_nan() {
        let nan = Value::Float(f64::NAN);
        assert_eq!(binary_op(BinaryOp::Lt, &nan, &Value::Int(1)).unwrap(), Value::Bool(false));
        assert_eq!(binary_op(BinaryOp::Ge, &nan, &Value::Int(1)).unwrap(), Value::Bool(false));
    }
}
