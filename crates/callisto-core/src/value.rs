//! Runtime values.

use crate::ast::Expr;
use crate::env::EnvId;
use crate::error::{EvalError, Result};
use crate::scheduler::ThreadId;
use crate::symbol::Symbol;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A value produced by evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The "nothing" sentinel: result of an empty block, a missing else
    /// branch, or a statement-like builtin.
    Nil,
    Number(f64),
    String(String),
    Symbol(Symbol),
    Bool(bool),
    Sequence(Vec<Value>),
    Closure(Closure),
    /// Handle to a scheduled thread, returned by `every`.
    Thread(ThreadId),
}

/// A function value: parameters, body and the environment it closes over.
#[derive(Clone, Debug)]
pub struct Closure {
    pub params: Arc<[Symbol]>,
    pub body: Arc<Expr>,
    pub env: EnvId,
}

/// Closures are equal when they share a body and a captured scope.
impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.body, &other.body) && self.env == other.env
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Bool(_) => "bool",
            Value::Sequence(_) => "sequence",
            Value::Closure(_) => "closure",
            Value::Thread(_) => "thread",
        }
    }

    /// Everything is truthy except `false` and nil.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Sequence(a), Value::Sequence(b)) => {
                let mut joined = a.clone();
                joined.extend(b.iter().cloned());
                Ok(Value::Sequence(joined))
            }
            _ => Err(mismatch("+", self, other)),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value> {
        let (a, b) = numbers("-", self, other)?;
        Ok(Value::Number(a - b))
    }

    pub fn mul(&self, other: &Value) -> Result<Value> {
        let (a, b) = numbers("*", self, other)?;
        Ok(Value::Number(a * b))
    }

    pub fn div(&self, other: &Value) -> Result<Value> {
        let (a, b) = numbers("/", self, other)?;
        if b == 0.0 {
            return Err(EvalError::DivisionByZero);
        }
        Ok(Value::Number(a / b))
    }

    pub fn rem(&self, other: &Value) -> Result<Value> {
        let (a, b) = numbers("%", self, other)?;
        if b == 0.0 {
            return Err(EvalError::DivisionByZero);
        }
        Ok(Value::Number(a % b))
    }

    /// Order two numbers or two strings.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        let ordering = match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => return Err(mismatch("comparison", self, other)),
        };
        ordering.ok_or_else(|| EvalError::Type(format!("cannot order {} and {}", self, other)))
    }

    /// Push the environments reachable from this value.
    pub(crate) fn trace_envs(&self, out: &mut Vec<EnvId>) {
        match self {
            Value::Closure(closure) => out.push(closure.env),
            Value::Sequence(items) => items.iter().for_each(|item| item.trace_envs(out)),
            _ => {}
        }
    }
}

fn numbers(op: &str, a: &Value, b: &Value) -> Result<(f64, f64)> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => Ok((*a, *b)),
        _ => Err(mismatch(op, a, b)),
    }
}

fn mismatch(op: &str, a: &Value, b: &Value) -> EvalError {
    EvalError::Type(format!(
        "cannot apply {} to {} and {}",
        op,
        a.type_name(),
        b.type_name()
    ))
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Value::Symbol(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Sequence(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Sequence(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Closure(closure) => write!(f, "<closure/{}>", closure.params.len()),
            Value::Thread(id) => write!(f, "<thread {}>", id),
        }
    }
}
