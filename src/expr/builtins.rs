//! Builtin function allow-list
//!
//! Everything callable from an expression lives here. None of these touch
//! anything outside their arguments.

use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::eval::EvalLimits;
use super::value::{self, as_f64, as_int, compare, float, int, is_truthy, iterate, render, type_name};
use super::{ExprError, ExprResult};

const BUILTINS: [&str; 31] = [
    "len", "str", "int", "float", "bool", "abs", "round", "min", "max", "sum", "sorted",
    "reversed", "range", "enumerate", "zip", "any", "all", "keys", "values", "lower", "upper",
    "strip", "split", "join", "startswith", "endswith", "contains", "type", "list", "get",
    "replace",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize, expected: &'static str) -> ExprResult<()> {
    if args.len() < min || args.len() > max {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn expect_str<'a>(name: &str, value: &'a Value) -> ExprResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| ExprError::Type(format!("{}() expects a str, got {}", name, type_name(value))))
}

fn expect_int(name: &str, value: &Value) -> ExprResult<i64> {
    as_int(value)
        .ok_or_else(|| ExprError::Type(format!("{}() expects an int, got {}", name, type_name(value))))
}

fn check_len(len: usize, limits: &EvalLimits) -> ExprResult<()> {
    if len > limits.max_collection_len {
        return Err(ExprError::Limit(format!(
            "collection of {} items exceeds {}",
            len, limits.max_collection_len
        )));
    }
    Ok(())
}

/// Items for min/max: one iterable argument, or the arguments themselves
fn spread(name: &str, args: Vec<Value>) -> ExprResult<Vec<Value>> {
    let items = if args.len() == 1 { iterate(&args[0])? } else { args };
    if items.is_empty() {
        return Err(ExprError::Type(format!("{}() of an empty sequence", name)));
    }
    Ok(items)
}

fn extreme(name: &str, args: Vec<Value>, want: Ordering) -> ExprResult<Value> {
    let mut items = spread(name, args)?.into_iter();
    let mut best = items.next().unwrap_or(Value::Null);
    for item in items {
        if compare(&item, &best)? == want {
            best = item;
        }
    }
    Ok(best)
}

fn sort_values(mut items: Vec<Value>) -> ExprResult<Vec<Value>> {
    let mut failure = None;
    items.sort_by(|a, b| {
        compare(a, b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(items),
    }
}

pub fn call(name: &str, args: Vec<Value>, limits: &EvalLimits) -> ExprResult<Value> {
    match name {
        "len" => {
            arity(name, &args, 1, 1, "1 argument")?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ExprError::Type(format!("object of type {} has no len()", type_name(other))))
                }
            };
            Ok(int(len as i64))
        }
        "str" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::String(render(&args[0])))
        }
        "int" => {
            arity(name, &args, 1, 1, "1 argument")?;
            match &args[0] {
                Value::String(s) => {
                    let trimmed = s.trim();
                    trimmed
                        .parse::<i64>()
                        .map(int)
                        .map_err(|_| ExprError::Type(format!("invalid literal for int(): '{}'", s)))
                }
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Ok(int(i)),
                    None => {
                        let f = n.as_f64().unwrap_or(0.0).trunc();
                        if f.abs() < i64::MAX as f64 {
                            Ok(int(f as i64))
                        } else {
                            Err(ExprError::Type(format!("int() overflow for {}", f)))
                        }
                    }
                },
                Value::Bool(b) => Ok(int(i64::from(*b))),
                other => Err(ExprError::Type(format!("int() cannot convert {}", type_name(other)))),
            }
        }
        "float" => {
            arity(name, &args, 1, 1, "1 argument")?;
            match &args[0] {
                Value::String(s) => {
                    let parsed = s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| ExprError::Type(format!("could not convert string to float: '{}'", s)))?;
                    float(parsed)
                }
                other => match as_f64(other) {
                    Some(f) => float(f),
                    None => Err(ExprError::Type(format!("float() cannot convert {}", type_name(other)))),
                },
            }
        }
        "bool" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::Bool(is_truthy(&args[0])))
        }
        "abs" => {
            arity(name, &args, 1, 1, "1 argument")?;
            match &args[0] {
                Value::Number(n) if n.is_i64() => {
                    let i = n.as_i64().unwrap_or(0);
                    i.checked_abs()
                        .map(int)
                        .ok_or_else(|| ExprError::Type("integer overflow in abs()".to_string()))
                }
                other => match as_f64(other) {
                    Some(f) => float(f.abs()),
                    None => Err(ExprError::Type(format!("bad operand for abs(): {}", type_name(other)))),
                },
            }
        }
        "round" => {
            arity(name, &args, 1, 2, "1 or 2 arguments")?;
            let x = as_f64(&args[0])
                .ok_or_else(|| ExprError::Type(format!("round() expects a number, got {}", type_name(&args[0]))))?;
            match args.get(1) {
                None => Ok(int(x.round() as i64)),
                Some(digits) => {
                    let digits = expect_int(name, digits)?.clamp(-15, 15) as i32;
                    let factor = 10f64.powi(digits);
                    float((x * factor).round() / factor)
                }
            }
        }
        "min" => extreme(name, args, Ordering::Less),
        "max" => extreme(name, args, Ordering::Greater),
        "sum" => {
            arity(name, &args, 1, 2, "1 or 2 arguments")?;
            let items = iterate(&args[0])?;
            let start = args.get(1).cloned().unwrap_or_else(|| int(0));
            let mut int_total = as_int(&start);
            let mut float_total = as_f64(&start)
                .ok_or_else(|| ExprError::Type("sum() start must be a number".to_string()))?;
            for item in &items {
                let f = as_f64(item)
                    .ok_or_else(|| ExprError::Type(format!("sum() cannot add {}", type_name(item))))?;
                int_total = match (int_total, as_int(item)) {
                    (Some(total), Some(i)) if !matches!(item, Value::Number(n) if n.is_f64()) => {
                        total.checked_add(i)
                    }
                    _ => None,
                };
                float_total += f;
            }
            match int_total {
                Some(total) => Ok(int(total)),
                None => float(float_total),
            }
        }
        "sorted" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::Array(sort_values(iterate(&args[0])?)?))
        }
        "reversed" => {
            arity(name, &args, 1, 1, "1 argument")?;
            let mut items = iterate(&args[0])?;
            items.reverse();
            Ok(Value::Array(items))
        }
        "list" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::Array(iterate(&args[0])?))
        }
        "range" => {
            arity(name, &args, 1, 3, "1 to 3 arguments")?;
            let (start, stop, step) = match args.len() {
                1 => (0, expect_int(name, &args[0])?, 1),
                2 => (expect_int(name, &args[0])?, expect_int(name, &args[1])?, 1),
                _ => (
                    expect_int(name, &args[0])?,
                    expect_int(name, &args[1])?,
                    expect_int(name, &args[2])?,
                ),
            };
            if step == 0 {
                return Err(ExprError::Type("range() step must not be zero".to_string()));
            }
            let span = if step > 0 { stop.saturating_sub(start) } else { start.saturating_sub(stop) };
            let count = if span <= 0 {
                0
            } else {
                (span.unsigned_abs() - 1) / step.unsigned_abs() + 1
            };
            if count > limits.max_range as u64 {
                return Err(ExprError::Limit(format!(
                    "range() of {} items exceeds {}",
                    count, limits.max_range
                )));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut current = start;
            for _ in 0..count {
                items.push(int(current));
                current = current.saturating_add(step);
            }
            Ok(Value::Array(items))
        }
        "enumerate" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::Array(
                iterate(&args[0])?
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Value::Array(vec![int(i as i64), v]))
                    .collect(),
            ))
        }
        "zip" => {
            if args.is_empty() {
                return Ok(Value::Array(Vec::new()));
            }
            let columns = args.iter().map(iterate).collect::<ExprResult<Vec<_>>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::Array(
                (0..rows)
                    .map(|r| Value::Array(columns.iter().map(|c| c[r].clone()).collect()))
                    .collect(),
            ))
        }
        "any" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::Bool(iterate(&args[0])?.iter().any(is_truthy)))
        }
        "all" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::Bool(iterate(&args[0])?.iter().all(is_truthy)))
        }
        "keys" | "values" => {
            arity(name, &args, 1, 1, "1 argument")?;
            let Value::Object(map) = &args[0] else {
                return Err(ExprError::Type(format!("{}() expects a dict, got {}", name, type_name(&args[0]))));
            };
            let items = if name == "keys" {
                map.keys().map(|k| Value::String(k.clone())).collect()
            } else {
                map.values().cloned().collect()
            };
            Ok(Value::Array(items))
        }
        "lower" | "upper" | "strip" => {
            arity(name, &args, 1, 1, "1 argument")?;
            let s = expect_str(name, &args[0])?;
            Ok(Value::String(match name {
                "lower" => s.to_lowercase(),
                "upper" => s.to_uppercase(),
                _ => s.trim().to_string(),
            }))
        }
        "split" => {
            arity(name, &args, 1, 2, "1 or 2 arguments")?;
            let s = expect_str(name, &args[0])?;
            let parts: Vec<Value> = match args.get(1) {
                None | Some(Value::Null) => s.split_whitespace().map(|p| Value::String(p.to_string())).collect(),
                Some(sep) => {
                    let sep = expect_str(name, sep)?;
                    if sep.is_empty() {
                        return Err(ExprError::Type("split() separator must not be empty".to_string()));
                    }
                    s.split(sep).map(|p| Value::String(p.to_string())).collect()
                }
            };
            check_len(parts.len(), limits)?;
            Ok(Value::Array(parts))
        }
        "join" => {
            arity(name, &args, 2, 2, "2 arguments")?;
            // Accept both sep.join(items) and join(items, sep)
            let (sep, items) = match (&args[0], &args[1]) {
                (Value::String(sep), items @ Value::Array(_)) => (sep, items),
                (items @ Value::Array(_), Value::String(sep)) => (sep, items),
                _ => return Err(ExprError::Type("join() expects a str separator and a list".to_string())),
            };
            let parts: Vec<String> = iterate(items)?.iter().map(render).collect();
            Ok(Value::String(parts.join(sep.as_str())))
        }
        "replace" => {
            arity(name, &args, 3, 3, "3 arguments")?;
            let s = expect_str(name, &args[0])?;
            let from = expect_str(name, &args[1])?;
            let to = expect_str(name, &args[2])?;
            if from.is_empty() {
                return Err(ExprError::Type("replace() pattern must not be empty".to_string()));
            }
            let replaced = s.replace(from, to);
            check_len(replaced.len(), limits)?;
            Ok(Value::String(replaced))
        }
        "startswith" | "endswith" => {
            arity(name, &args, 2, 2, "2 arguments")?;
            let s = expect_str(name, &args[0])?;
            let affix = expect_str(name, &args[1])?;
            Ok(Value::Bool(if name == "startswith" {
                s.starts_with(affix)
            } else {
                s.ends_with(affix)
            }))
        }
        "contains" => {
            arity(name, &args, 2, 2, "2 arguments")?;
            Ok(Value::Bool(value::contains(&args[0], &args[1])?))
        }
        "type" => {
            arity(name, &args, 1, 1, "1 argument")?;
            Ok(Value::String(type_name(&args[0]).to_string()))
        }
        "get" => {
            arity(name, &args, 2, 3, "2 or 3 arguments")?;
            let default = args.get(2).cloned().unwrap_or(Value::Null);
            let found = match (&args[0], &args[1]) {
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                (Value::Array(items), index) => as_int(index).and_then(|i| {
                    let len = items.len() as i64;
                    let i = if i < 0 { i + len } else { i };
                    usize::try_from(i).ok().and_then(|i| items.get(i).cloned())
                }),
                (Value::Null, _) => None,
                (other, _) => {
                    return Err(ExprError::Type(format!("get() expects a dict or list, got {}", type_name(other))))
                }
            };
            Ok(found.unwrap_or(default))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// Build a map value, rendering non-string keys
pub fn map_from(entries: Vec<(Value, Value)>) -> Value {
    let mut map = Map::new();
    for (k, v) in entries {
        let key = match k {
            Value::String(s) => s,
            other => render(&other),
        };
        map.insert(key, v);
    }
    Value::Object(map)
}
