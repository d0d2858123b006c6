//! Sandboxed Expression Language
//!
//! Interpreter used for skill conditionals and `evaluate` actions. It is an
//! explicit grammar over JSON values, not a host-language `eval`:
//!
//! - literals: numbers, strings, `true`/`false`/`null` (`True`/`False`/`None`),
//!   lists `[..]`, maps `{"k": v}`
//! - variables from the execution context, `x[i]`, `x.field`
//! - arithmetic `+ - * / %`, comparisons, `in` / `not in`
//! - boolean `and` / `or` / `not` (also `&&` / `||` / `!`)
//! - comprehensions `[expr for x in xs if cond]`
//! - calls to a fixed allow-list of builtins, as `f(x)` or `x.f()`
//!
//! # Sandbox
//!
//! The only data reachable is the variable mapping handed to the evaluator.
//! No builtin touches the filesystem, network, environment or processes, and
//! unknown function names are rejected while parsing. Evaluation is bounded
//! by a step budget so a hostile block cannot spin forever.

pub mod builtins;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

use thiserror::Error;

pub use eval::{EvalLimits, Evaluator};
pub use parser::{parse_expression, parse_program, Expr, Program, Stmt};
pub use value::{is_truthy, render, type_name};

use crate::Context;

/// Expression errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("Function '{0}' is not available")]
    UnknownFunction(String),
    #[error("{name}() expects {expected}, got {got} argument(s)")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },
    #[error("Type error: {0}")]
    Type(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Index error: {0}")]
    Index(String),
    #[error("Evaluation limit exceeded: {0}")]
    Limit(String),
}

pub type ExprResult<T> = Result<T, ExprError>;

/// Parse and evaluate a condition to a boolean
pub fn eval_condition(source: &str, context: &Context) -> ExprResult<bool> {
    let expr = parse_expression(source)?;
    let value = Evaluator::default().evaluate(&expr, context)?;
    Ok(is_truthy(&value))
}

/// Parse and run a statement block, returning the last statement's value
pub fn run_block(source: &str, context: &Context) -> ExprResult<serde_json::Value> {
    let program = parse_program(source)?;
    Evaluator::default().run(&program, context)
}
