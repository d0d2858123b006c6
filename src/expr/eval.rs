//! Tree-walking evaluator

use serde_json::Value;
use std::collections::HashMap;

use super::builtins;
use super::parser::{BinOp, CmpOp, Expr, Program, Stmt};
use super::value::{self, as_f64, as_int, compare, float, int, is_truthy, iterate, type_name, values_equal};
use super::{ExprError, ExprResult};
use crate::Context;

/// Resource bounds for one evaluation
#[derive(Debug, Clone)]
pub struct EvalLimits {
    /// Node evaluations before giving up
    pub max_steps: usize,
    /// Largest list `range()` may build
    pub max_range: usize,
    /// Largest list or string an operation may produce
    pub max_collection_len: usize,
    /// Deepest expression nesting the evaluator will recurse into
    pub max_depth: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            max_range: 10_000,
            max_collection_len: 1_000_000,
            max_depth: 256,
        }
    }
}

/// Evaluates expressions and blocks against a read-only context
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    limits: EvalLimits,
}

impl Evaluator {
    pub fn new(limits: EvalLimits) -> Self {
        Self { limits }
    }

    pub fn evaluate(&self, expr: &Expr, context: &Context) -> ExprResult<Value> {
        Frame::new(context, &self.limits).eval(expr)
    }

    /// Run statements in order. Assignments bind block-local names that
    /// shadow the context; the block's value is the last statement's value.
    pub fn run(&self, program: &Program, context: &Context) -> ExprResult<Value> {
        let mut frame = Frame::new(context, &self.limits);
        let mut last = Value::Null;

        for statement in &program.statements {
            last = match statement {
                Stmt::Assign(name, expr) => {
                    let value = frame.eval(expr)?;
                    frame.bind(name, value.clone());
                    value
                }
                Stmt::Expr(expr) => frame.eval(expr)?,
            };
        }
        Ok(last)
    }
}

struct Frame<'a> {
    context: &'a Context,
    scopes: Vec<HashMap<String, Value>>,
    steps: usize,
    depth: usize,
    limits: &'a EvalLimits,
}

enum Operands {
    Ints(i64, i64),
    Floats(f64, f64),
}

impl<'a> Frame<'a> {
    fn new(context: &'a Context, limits: &'a EvalLimits) -> Self {
        Self {
            context,
            scopes: vec![HashMap::new()],
            steps: 0,
            depth: 0,
            limits,
        }
    }

    fn bind(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn lookup(&self, name: &str) -> ExprResult<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        self.context
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UndefinedVariable(name.to_string()))
    }

    fn tick(&mut self) -> ExprResult<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(ExprError::Limit(format!(
                "more than {} evaluation steps",
                self.limits.max_steps
            )));
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> ExprResult<()> {
        if len > self.limits.max_collection_len {
            return Err(ExprError::Limit(format!(
                "value of length {} exceeds {}",
                len, self.limits.max_collection_len
            )));
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> ExprResult<Value> {
        self.tick()?;
        if self.depth >= self.limits.max_depth {
            return Err(ExprError::Limit(format!(
                "nesting deeper than {}",
                self.limits.max_depth
            )));
        }

        self.depth += 1;
        let result = self.eval_node(expr);
        self.depth -= 1;
        result
    }

    fn eval_node(&mut self, expr: &Expr) -> ExprResult<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => self.lookup(name),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<ExprResult<Vec<_>>>()?;
                Ok(Value::Array(values))
            }
            Expr::Map(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    pairs.push((self.eval(k)?, self.eval(v)?));
                }
                Ok(builtins::map_from(pairs))
            }
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(&target, &index)
            }
            Expr::Field { target, name } => match self.eval(target)? {
                Value::Object(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ExprError::Index(format!("key '{}' not found", name))),
                other => Err(ExprError::Type(format!(
                    "{} has no field '{}'",
                    type_name(&other),
                    name
                ))),
            },
            Expr::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<ExprResult<Vec<_>>>()?;
                builtins::call(name, values, self.limits)
            }
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Number(n) if n.is_i64() || n.is_u64() => {
                    let i = n
                        .as_i64()
                        .ok_or_else(|| ExprError::Type("integer overflow".to_string()))?;
                    i.checked_neg()
                        .map(int)
                        .ok_or_else(|| ExprError::Type("integer overflow".to_string()))
                }
                other => match as_f64(&other) {
                    Some(f) => float(-f),
                    None => Err(ExprError::Type(format!("bad operand for unary -: {}", type_name(&other)))),
                },
            },
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner)?))),
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.arithmetic(*op, left, right)
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first)?;
                for (op, next) in rest {
                    let right = self.eval(next)?;
                    if !compare_op(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Comprehension {
                element,
                var,
                iterable,
                condition,
            } => {
                let items = iterate(&self.eval(iterable)?)?;
                self.scopes.push(HashMap::new());
                let result = self.comprehension(element, var, items, condition.as_deref());
                self.scopes.pop();
                result
            }
        }
    }

    fn comprehension(
        &mut self,
        element: &Expr,
        var: &str,
        items: Vec<Value>,
        condition: Option<&Expr>,
    ) -> ExprResult<Value> {
        let mut out = Vec::new();
        for item in items {
            self.bind(var, item);
            if let Some(condition) = condition {
                if !is_truthy(&self.eval(condition)?) {
                    continue;
                }
            }
            out.push(self.eval(element)?);
        }
        Ok(Value::Array(out))
    }

    fn arithmetic(&self, op: BinOp, left: Value, right: Value) -> ExprResult<Value> {
        if op == BinOp::Add {
            match (&left, &right) {
                (Value::String(a), Value::String(b)) => {
                    self.check_len(a.len() + b.len())?;
                    return Ok(Value::String(format!("{}{}", a, b)));
                }
                (Value::Array(a), Value::Array(b)) => {
                    self.check_len(a.len() + b.len())?;
                    let mut joined = a.clone();
                    joined.extend(b.iter().cloned());
                    return Ok(Value::Array(joined));
                }
                _ => {}
            }
        }

        let symbol = match op {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        };
        let overflow = || ExprError::Type(format!("integer overflow in '{}'", symbol));

        match operands(&left, &right).ok_or_else(|| {
            ExprError::Type(format!(
                "unsupported operand types for {}: {} and {}",
                symbol,
                type_name(&left),
                type_name(&right)
            ))
        })? {
            Operands::Ints(a, b) => match op {
                BinOp::Add => a.checked_add(b).map(int).ok_or_else(overflow),
                BinOp::Sub => a.checked_sub(b).map(int).ok_or_else(overflow),
                BinOp::Mul => a.checked_mul(b).map(int).ok_or_else(overflow),
                BinOp::Div => {
                    if b == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    float(a as f64 / b as f64)
                }
                BinOp::Mod => {
                    if b == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    // Result takes the divisor's sign
                    let r = a.checked_rem(b).ok_or_else(overflow)?;
                    Ok(int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
                }
            },
            Operands::Floats(a, b) => match op {
                BinOp::Add => float(a + b),
                BinOp::Sub => float(a - b),
                BinOp::Mul => float(a * b),
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    float(a / b)
                }
                BinOp::Mod => {
                    if b == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    let r = a % b;
                    float(if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r })
                }
            },
        }
    }
}

fn operands(left: &Value, right: &Value) -> Option<Operands> {
    let is_number = |v: &Value| matches!(v, Value::Number(_) | Value::Bool(_));
    if !is_number(left) || !is_number(right) {
        return None;
    }
    match (as_int(left), as_int(right)) {
        (Some(a), Some(b)) => Some(Operands::Ints(a, b)),
        _ => Some(Operands::Floats(as_f64(left)?, as_f64(right)?)),
    }
}

fn compare_op(op: CmpOp, left: &Value, right: &Value) -> ExprResult<bool> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Lt => compare(left, right)? == Less,
        CmpOp::Le => compare(left, right)? != Greater,
        CmpOp::Gt => compare(left, right)? == Greater,
        CmpOp::Ge => compare(left, right)? != Less,
        CmpOp::In => value::contains(right, left)?,
        CmpOp::NotIn => !value::contains(right, left)?,
    })
}

fn index_value(target: &Value, index: &Value) -> ExprResult<Value> {
    let position = |len: usize| -> ExprResult<usize> {
        let i = as_int(index)
            .ok_or_else(|| ExprError::Type(format!("indices must be integers, not {}", type_name(index))))?;
        let resolved = if i < 0 { i + len as i64 } else { i };
        usize::try_from(resolved)
            .ok()
            .filter(|r| *r < len)
            .ok_or_else(|| ExprError::Index(format!("index {} out of range for length {}", i, len)))
    };

    match target {
        Value::Array(items) => Ok(items[position(items.len())?].clone()),
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::String(chars[position(chars.len())?].to_string()))
        }
        Value::Object(map) => {
            let key = index
                .as_str()
                .ok_or_else(|| ExprError::Type(format!("dict keys must be str, not {}", type_name(index))))?;
            map.get(key)
                .cloned()
                .ok_or_else(|| ExprError::Index(format!("key '{}' not found", key)))
        }
        other => Err(ExprError::Type(format!("{} is not subscriptable", type_name(other)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{parse_expression, parse_program};
    use serde_json::json;

    fn eval_with(source: &str, context: Value) -> ExprResult<Value> {
        let context = context.as_object().cloned().unwrap_or_default();
        Evaluator::default().evaluate(&parse_expression(source)?, &context)
    }

    fn eval(source: &str) -> ExprResult<Value> {
        eval_with(source, json!({}))
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(eval("7 / 2").unwrap(), json!(3.5));
        assert_eq!(eval("-7 % 3").unwrap(), json!(2));
        assert_eq!(eval("1 + 0.5").unwrap(), json!(1.5));
        assert_eq!(eval("'a' + 'b'").unwrap(), json!("ab"));
        assert_eq!(eval("[1] + [2]").unwrap(), json!([1, 2]));
        assert!(matches!(eval("1 / 0"), Err(ExprError::DivisionByZero)));
        assert!(matches!(eval("'a' - 1"), Err(ExprError::Type(_))));
        assert!(matches!(eval("9223372036854775807 + 1"), Err(ExprError::Type(_))));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("1 == 1.0").unwrap(), json!(true));
        assert_eq!(eval("1 < 2 < 3").unwrap(), json!(true));
        assert_eq!(eval("1 < 3 < 2").unwrap(), json!(false));
        assert_eq!(eval("'b' > 'a'").unwrap(), json!(true));
        assert_eq!(eval("'ell' in 'hello'").unwrap(), json!(true));
        assert_eq!(eval("3 not in [1, 2]").unwrap(), json!(true));
        assert!(eval("'a' < 1").is_err());
    }

    #[test]
    fn test_boolean_short_circuit() {
        // Right side would fail if evaluated
        assert_eq!(eval("false and missing").unwrap(), json!(false));
        assert_eq!(eval("true or missing").unwrap(), json!(true));
        assert_eq!(eval("'' or 'fallback'").unwrap(), json!("fallback"));
        assert!(matches!(eval("true and missing"), Err(ExprError::UndefinedVariable(_))));
    }

    #[test]
    fn test_context_access() {
        let context = json!({
            "result": { "status": "ok", "items": [10, 20, 30] },
            "name": "Deploy"
        });
        assert_eq!(eval_with("result.status", context.clone()).unwrap(), json!("ok"));
        assert_eq!(eval_with("result['items'][-1]", context.clone()).unwrap(), json!(30));
        assert_eq!(eval_with("name.lower()", context.clone()).unwrap(), json!("deploy"));
        assert_eq!(eval_with("name[0]", context.clone()).unwrap(), json!("D"));
        assert!(matches!(
            eval_with("result.missing", context.clone()),
            Err(ExprError::Index(_))
        ));
        assert!(matches!(eval_with("result['items'][5]", context), Err(ExprError::Index(_))));
    }

    #[test]
    fn test_comprehension_scoping() {
        let context = json!({ "x": "outer", "files": ["a.rs", "b.py", "c.rs"] });
        assert_eq!(
            eval_with("[f.upper() for f in files if f.endswith('.rs')]", context.clone()).unwrap(),
            json!(["A.RS", "C.RS"])
        );
        assert_eq!(
            eval_with("[[x, i] for i in range(2)]", context.clone()).unwrap(),
            json!([["outer", 0], ["outer", 1]])
        );
        // Loop variable does not leak
        assert_eq!(eval_with("[x for x in [1, 2]] + [x]", context).unwrap(), json!([1, 2, "outer"]));
    }

    #[test]
    fn test_block_locals_shadow_context() {
        let context = json!({ "count": 1 }).as_object().cloned().unwrap();
        let program = parse_program("count = count + 1\ndoubled = count * 2\n{'count': count, 'doubled': doubled}").unwrap();
        let value = Evaluator::default().run(&program, &context).unwrap();

        assert_eq!(value, json!({ "count": 2, "doubled": 4 }));
        assert_eq!(context["count"], json!(1));
    }

    #[test]
    fn test_step_budget() {
        let evaluator = Evaluator::new(EvalLimits {
            max_steps: 50,
            ..Default::default()
        });
        let expr = parse_expression("[i * 2 for i in range(1000)]").unwrap();
        let err = evaluator.evaluate(&expr, &Context::new()).unwrap_err();
        assert!(matches!(err, ExprError::Limit(_)));
    }

    #[test]
    fn test_collection_growth_bounded() {
        let evaluator = Evaluator::new(EvalLimits {
            max_collection_len: 8,
            ..Default::default()
        });
        let program = parse_program("s = 'abc'\ns = s + s\ns = s + s").unwrap();
        assert!(matches!(evaluator.run(&program, &Context::new()), Err(ExprError::Limit(_))));
    }

    #[test]
    fn test_deep_tree_is_refused() {
        // Built by hand, bypassing the parser's own bounds
        let mut expr = Expr::Literal(json!(1));
        for _ in 0..10_000 {
            expr = Expr::Neg(Box::new(expr));
        }
        let err = Evaluator::default().evaluate(&expr, &Context::new()).unwrap_err();
        assert!(matches!(err, ExprError::Limit(_)));

        // Unwind iteratively; dropping the chain recursively would need a deep stack
        while let Expr::Neg(inner) = expr {
            expr = *inner;
        }
    }
}
