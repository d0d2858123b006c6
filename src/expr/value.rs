//! JSON value semantics for the interpreter

use serde_json::{Number, Value};
use std::cmp::Ordering;

use super::{ExprError, ExprResult};

/// Python-style truthiness
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// String form used by `str()` and template substitution.
///
/// Strings render raw; everything else renders as compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn int(i: i64) -> Value {
    Value::Number(Number::from(i))
}

pub fn float(f: f64) -> ExprResult<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type(format!("non-finite number {}", f)))
}

/// Integer view, if the value is an integral number
pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Equality that treats `1` and `1.0` as the same number
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Ordering for `<`, `sorted`, `min`, `max`
pub fn compare(a: &Value, b: &Value) -> ExprResult<Ordering> {
    match (a, b) {
        (Value::Number(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_)) => {
            if let (Some(i), Some(j)) = (as_int(a), as_int(b)) {
                return Ok(i.cmp(&j));
            }
            let (x, y) = (as_f64(a).unwrap_or(0.0), as_f64(b).unwrap_or(0.0));
            x.partial_cmp(&y)
                .ok_or_else(|| ExprError::Type("cannot order NaN".to_string()))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (p, q) in x.iter().zip(y) {
                let ord = compare(p, q)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(ExprError::Type(format!(
            "cannot compare {} with {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

/// Elements of something iterable: list items, string chars, dict keys
pub fn iterate(value: &Value) -> ExprResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Object(map) => Ok(map.keys().map(|k| Value::String(k.clone())).collect()),
        other => Err(ExprError::Type(format!("{} is not iterable", type_name(other)))),
    }
}

/// Membership test behind `in`
pub fn contains(container: &Value, item: &Value) -> ExprResult<bool> {
    match container {
        Value::String(haystack) => match item {
            Value::String(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(ExprError::Type(format!(
                "'in <str>' requires a str, got {}",
                type_name(other)
            ))),
        },
        Value::Array(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        Value::Object(map) => match item {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },
        other => Err(ExprError::Type(format!(
            "argument of type {} is not a container",
            type_name(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!({"a": 1})));
        assert!(is_truthy(&json!(0.5)));
    }

    #[test]
    fn test_numeric_equality() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!([1, {"a": 2.0}]), &json!([1.0, {"a": 2}])));
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn test_compare_mixed_types_fails() {
        assert_eq!(compare(&json!(1), &json!(2.5)).unwrap(), Ordering::Less);
        assert_eq!(compare(&json!("b"), &json!("a")).unwrap(), Ordering::Greater);
        assert!(compare(&json!("a"), &json!(1)).is_err());
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&json!("plain")), "plain");
        assert_eq!(render(&json!(3)), "3");
        assert_eq!(render(&json!({"k": [1]})), r#"{"k":[1]}"#);
    }
}
