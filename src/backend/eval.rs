//! Expression evaluation for the in-memory backend.

use std::cmp::Ordering;

use serde_json::Value;

use super::error::{BackendError, BackendResult};
use crate::sql::{BinaryOperator, Expr, Row, UnaryOperator};

/// Evaluate an expression against a row.
pub fn evaluate(expr: &Expr, row: &Row) -> BackendResult<Value> {
    match expr {
        Expr::Column(name) => row
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::ColumnNotFound(name.clone())),

        Expr::Literal(lit) => Ok(lit.to_json()),

        Expr::BinaryOp { left, op, right } => {
            let l = evaluate(left, row)?;
            let r = evaluate(right, row)?;
            eval_binary_op(&l, *op, &r)
        }

        Expr::UnaryOp { op, expr } => {
            let v = evaluate(expr, row)?;
            eval_unary_op(*op, &v)
        }

        Expr::IsNull { expr, negated } => {
            let is_null = evaluate(expr, row)?.is_null();
            Ok(Value::Bool(if *negated { !is_null } else { is_null }))
        }

        Expr::InList { expr, list, negated } => {
            let v = evaluate(expr, row)?;
            let mut in_list = false;
            for item in list {
                if values_equal(&v, &evaluate(item, row)?) {
                    in_list = true;
                    break;
                }
            }
            Ok(Value::Bool(if *negated { !in_list } else { in_list }))
        }

        Expr::Between { expr, low, high, negated } => {
            let v = evaluate(expr, row)?;
            let l = evaluate(low, row)?;
            let h = evaluate(high, row)?;
            let in_range = matches!(compare_values(&v, &l), Some(Ordering::Greater | Ordering::Equal))
                && matches!(compare_values(&v, &h), Some(Ordering::Less | Ordering::Equal));
            Ok(Value::Bool(if *negated { !in_range } else { in_range }))
        }

        Expr::Like { expr, pattern, negated } => {
            let v = evaluate(expr, row)?;
            let matches = like_match(v.as_str().unwrap_or(""), pattern);
            Ok(Value::Bool(if *negated { !matches } else { matches }))
        }

        Expr::Nested(inner) => evaluate(inner, row),
    }
}

/// Evaluate a WHERE clause, returning true if row matches.
pub fn matches_where(expr: &Expr, row: &Row) -> BackendResult<bool> {
    Ok(value_to_bool(&evaluate(expr, row)?))
}

fn eval_binary_op(left: &Value, op: BinaryOperator, right: &Value) -> BackendResult<Value> {
    let cmp = || compare_values(left, right);
    match op {
        BinaryOperator::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOperator::NotEq => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOperator::Lt => Ok(Value::Bool(cmp() == Some(Ordering::Less))),
        BinaryOperator::LtEq => Ok(Value::Bool(matches!(cmp(), Some(Ordering::Less | Ordering::Equal)))),
        BinaryOperator::Gt => Ok(Value::Bool(cmp() == Some(Ordering::Greater))),
        BinaryOperator::GtEq => Ok(Value::Bool(matches!(cmp(), Some(Ordering::Greater | Ordering::Equal)))),

        BinaryOperator::And => Ok(Value::Bool(value_to_bool(left) && value_to_bool(right))),
        BinaryOperator::Or => Ok(Value::Bool(value_to_bool(left) || value_to_bool(right))),

        BinaryOperator::Plus => eval_arithmetic(left, right, i64::checked_add, |a, b| a + b),
        BinaryOperator::Minus => eval_arithmetic(left, right, i64::checked_sub, |a, b| a - b),
        BinaryOperator::Multiply => eval_arithmetic(left, right, i64::checked_mul, |a, b| a * b),
        BinaryOperator::Divide => {
            if value_to_f64(right) == 0.0 {
                Err(BackendError::DivisionByZero)
            } else {
                // exact integer quotients stay integers
                let exact = |a: i64, b: i64| a.checked_rem(b).filter(|r| *r == 0).and_then(|_| a.checked_div(b));
                eval_arithmetic(left, right, exact, |a, b| a / b)
            }
        }
        BinaryOperator::Modulo => eval_arithmetic(left, right, i64::checked_rem, |a, b| a % b),

        BinaryOperator::Concat => Ok(Value::String(format!(
            "{}{}",
            value_to_string(left),
            value_to_string(right)
        ))),
    }
}

fn eval_unary_op(op: UnaryOperator, value: &Value) -> BackendResult<Value> {
    match op {
        UnaryOperator::Not => Ok(Value::Bool(!value_to_bool(value))),
        UnaryOperator::Minus => match value.as_i64().and_then(i64::checked_neg) {
            Some(n) => Ok(Value::from(n)),
            None => Ok(number(-value_to_f64(value), value.is_i64())),
        },
        UnaryOperator::Plus => Ok(value.clone()),
    }
}

/// Integer operands use `int_op`; on overflow, or for any other operand,
/// the float result is used.
fn eval_arithmetic<I, F>(left: &Value, right: &Value, int_op: I, float_op: F) -> BackendResult<Value>
where
    I: Fn(i64, i64) -> Option<i64>,
    F: Fn(f64, f64) -> f64,
{
    if let Some(n) = left.as_i64().zip(right.as_i64()).and_then(|(a, b)| int_op(a, b)) {
        return Ok(Value::from(n));
    }
    let result = float_op(value_to_f64(left), value_to_f64(right));
    Ok(number(result, left.is_i64() && right.is_i64()))
}

/// Integer when `integral` and the value is whole, float otherwise.
pub(crate) fn number(n: f64, integral: bool) -> Value {
    if integral && n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Check if two JSON values are equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) if a.is_i64() && b.is_i64() => a.as_i64() == b.as_i64(),
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(x, y)| (x - y).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

/// Compare two JSON values. `None` when they are not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) if a.is_i64() && b.is_i64() => Some(a.as_i64()?.cmp(&b.as_i64()?)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order used for ORDER BY; nulls sort first.
pub(crate) fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

fn value_to_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn value_to_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Bool(b) => if *b { 1.0 } else { 0.0 },
        _ => 0.0,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => v.to_string(),
    }
}

/// LIKE pattern matching, case-insensitive.
fn like_match(s: &str, pattern: &str) -> bool {
    let s_chars: Vec<char> = s.chars().collect();
    let p_chars: Vec<char> = pattern.chars().collect();
    match_like(&s_chars, &p_chars, 0, 0)
}

fn match_like(s: &[char], p: &[char], si: usize, pi: usize) -> bool {
    if pi >= p.len() {
        return si >= s.len();
    }

    match p[pi] {
        '%' => (si..=s.len()).any(|i| match_like(s, p, i, pi + 1)),
        '_' => si < s.len() && match_like(s, p, si + 1, pi + 1),
        c => {
            si < s.len()
                && s[si].to_lowercase().eq(c.to_lowercase())
                && match_like(s, p, si + 1, pi + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::LiteralValue;
    use serde_json::json;

    fn make_row() -> Row {
        json!({
            "tb_user.uid": 1,
            "tb_user.name": "Alice",
            "tb_user.age": 30,
            "tb_user.active": true
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_comparison() {
        let row = make_row();
        let expr = Expr::binary(
            Expr::column("tb_user.age"),
            BinaryOperator::Gt,
            Expr::Literal(LiteralValue::Integer(25)),
        );
        assert_eq!(evaluate(&expr, &row).unwrap(), json!(true));
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let row = make_row();
        assert_eq!(
            evaluate(&Expr::column("tb_user.nope"), &row),
            Err(BackendError::ColumnNotFound("tb_user.nope".into()))
        );
    }

    #[test]
    fn test_and_or() {
        let row = make_row();
        let expr = Expr::binary(
            Expr::column("tb_user.active"),
            BinaryOperator::And,
            Expr::binary(Expr::column("tb_user.age"), BinaryOperator::Lt, Expr::value(50)),
        );
        assert!(matches_where(&expr, &row).unwrap());
    }

    #[test]
    fn test_like_pattern() {
        assert!(like_match("Alice", "A%"));
        assert!(like_match("Alice", "%ice"));
        assert!(like_match("Alice", "a____"));
        assert!(!like_match("Alice", "B%"));
    }

    #[test]
    fn test_arithmetic_keeps_integers() {
        let row = make_row();
        let expr = Expr::binary(Expr::column("tb_user.age"), BinaryOperator::Plus, Expr::value(10));
        assert_eq!(evaluate(&expr, &row).unwrap(), json!(40));

        let div = Expr::binary(Expr::column("tb_user.age"), BinaryOperator::Divide, Expr::value(0));
        assert_eq!(evaluate(&div, &row), Err(BackendError::DivisionByZero));

        let half = Expr::binary(Expr::column("tb_user.age"), BinaryOperator::Divide, Expr::value(4));
        assert_eq!(evaluate(&half, &row).unwrap(), json!(7.5));
    }

    #[test]
    fn test_large_integers_stay_exact() {
        let row = make_row();
        let big = (1_i64 << 53) + 1;

        let sum = Expr::binary(Expr::value(big), BinaryOperator::Plus, Expr::value(2));
        assert_eq!(evaluate(&sum, &row).unwrap(), json!(big + 2));

        let product = Expr::binary(Expr::value(big), BinaryOperator::Multiply, Expr::value(3));
        assert_eq!(evaluate(&product, &row).unwrap(), json!(big * 3));

        let quotient = Expr::binary(Expr::value(big * 2), BinaryOperator::Divide, Expr::value(2));
        assert_eq!(evaluate(&quotient, &row).unwrap(), json!(big));

        let neighbour = Expr::binary(Expr::value(big), BinaryOperator::Eq, Expr::value(big - 1));
        assert_eq!(evaluate(&neighbour, &row).unwrap(), json!(false));

        let overflow = Expr::binary(Expr::value(i64::MAX), BinaryOperator::Plus, Expr::value(1));
        assert!(evaluate(&overflow, &row).unwrap().is_f64());
    }

    #[test]
    fn test_sort_order_puts_nulls_first() {
        assert_eq!(sort_order(&Value::Null, &json!(1)), Ordering::Less);
        assert_eq!(sort_order(&json!("b"), &json!("a")), Ordering::Greater);
    }
}
