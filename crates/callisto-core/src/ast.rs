//! Expression tree consumed by the interpreter.
//!
//! Parsing lives outside this crate; a front-end builds [`Expr`] values
//! directly (the constructor helpers below keep that terse). Sub-trees that
//! scheduled threads or suspended continuations hold on to are behind `Arc`
//! so they are shared rather than copied.

use crate::error::ArgCount;
use crate::symbol::Symbol;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Nil,
    Number(f64),
    String(String),
    Symbol(Symbol),
    Bool(bool),
}

/// Pure operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn token(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Rem => "%",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }

    /// `+` and `*` fold over any number of operands; the rest are binary.
    pub fn arg_count(self) -> ArgCount {
        match self {
            Operator::Add | Operator::Mul => ArgCount::AtLeast(2),
            _ => ArgCount::Exactly(2),
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        let op = match token {
            "+" => Operator::Add,
            "-" => Operator::Sub,
            "*" => Operator::Mul,
            "/" => Operator::Div,
            "%" => Operator::Rem,
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            _ => return None,
        };
        Some(op)
    }
}

/// Mutating operators: `=`, `+=`, `-=`, `*=`, `/=`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn token(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// Variable reference.
    Ref(Symbol),
    /// `[a b c]`, evaluated element-wise into a sequence.
    List(Vec<Expr>),
    Let {
        name: Symbol,
        value: Box<Expr>,
    },
    /// `(let ((a 1) (b a)) body)`: bindings made in order in a fresh scope,
    /// then `body` evaluated in it.
    LetIn {
        bindings: Vec<(Symbol, Expr)>,
        body: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        name: Symbol,
        value: Box<Expr>,
    },
    Op {
        op: Operator,
        args: Vec<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    Do(Arc<[Expr]>),
    /// Call a builtin or a closure bound to `name`.
    Call {
        name: Symbol,
        args: Vec<Expr>,
    },
    Lambda {
        params: Arc<[Symbol]>,
        body: Arc<Expr>,
    },
    /// Named function definition; the name is visible inside the body.
    Func {
        name: Symbol,
        params: Arc<[Symbol]>,
        body: Arc<Expr>,
    },
    /// Synchronous repetition.
    Loop {
        count: Box<Expr>,
        body: Arc<Expr>,
    },
    Every {
        period: Box<Expr>,
        body: Arc<Expr>,
    },
    Sleep(Box<Expr>),
    WithFx {
        tag: Box<Expr>,
        params: Vec<(Symbol, Expr)>,
        body: Arc<Expr>,
    },
}

impl Expr {
    pub fn nil() -> Self {
        Expr::Literal(Literal::Nil)
    }

    pub fn num(value: f64) -> Self {
        Expr::Literal(Literal::Number(value))
    }

    pub fn str(value: &str) -> Self {
        Expr::Literal(Literal::String(value.to_string()))
    }

    /// Symbol literal; `sym("quarter")` is `:quarter`.
    pub fn sym(name: &str) -> Self {
        Expr::Literal(Literal::Symbol(Symbol::new(name)))
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal(Literal::Bool(value))
    }

    pub fn var(name: &str) -> Self {
        Expr::Ref(Symbol::new(name))
    }

    pub fn list(items: Vec<Expr>) -> Self {
        Expr::List(items)
    }

    pub fn let_(name: &str, value: Expr) -> Self {
        Expr::Let {
            name: Symbol::new(name),
            value: Box::new(value),
        }
    }

    pub fn let_in(bindings: Vec<(&str, Expr)>, body: Expr) -> Self {
        Expr::LetIn {
            bindings: bindings
                .into_iter()
                .map(|(name, value)| (Symbol::new(name), value))
                .collect(),
            body: Box::new(body),
        }
    }

    pub fn assign(op: AssignOp, name: &str, value: Expr) -> Self {
        Expr::Assign {
            op,
            name: Symbol::new(name),
            value: Box::new(value),
        }
    }

    pub fn op(op: Operator, args: Vec<Expr>) -> Self {
        Expr::Op { op, args }
    }

    pub fn binary(op: Operator, lhs: Expr, rhs: Expr) -> Self {
        Expr::Op {
            op,
            args: vec![lhs, rhs],
        }
    }

    pub fn if_(cond: Expr, then: Expr, otherwise: Option<Expr>) -> Self {
        Expr::If {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: otherwise.map(Box::new),
        }
    }

    pub fn do_(body: Vec<Expr>) -> Self {
        Expr::Do(Arc::from(body))
    }

    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: Symbol::new(name),
            args,
        }
    }

    pub fn lambda(params: &[&str], body: Expr) -> Self {
        Expr::Lambda {
            params: symbols(params),
            body: Arc::new(body),
        }
    }

    pub fn func(name: &str, params: &[&str], body: Expr) -> Self {
        Expr::Func {
            name: Symbol::new(name),
            params: symbols(params),
            body: Arc::new(body),
        }
    }

    pub fn loop_(count: Expr, body: Expr) -> Self {
        Expr::Loop {
            count: Box::new(count),
            body: Arc::new(body),
        }
    }

    pub fn every(period: Expr, body: Expr) -> Self {
        Expr::Every {
            period: Box::new(period),
            body: Arc::new(body),
        }
    }

    pub fn sleep(duration: Expr) -> Self {
        Expr::Sleep(Box::new(duration))
    }

    pub fn with_fx(tag: &str, params: Vec<(&str, Expr)>, body: Expr) -> Self {
        Expr::WithFx {
            tag: Box::new(Expr::sym(tag)),
            params: params
                .into_iter()
                .map(|(name, value)| (Symbol::new(name), value))
                .collect(),
            body: Arc::new(body),
        }
    }
}

fn symbols(names: &[&str]) -> Arc<[Symbol]> {
    names.iter().map(|name| Symbol::new(name)).collect()
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Nil => f.write_str("nil"),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Symbol(s) => write!(f, ":{}", s),
            Literal::Bool(b) => write!(f, "{}", b),
        }
    }
}

fn write_all(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for item in items {
        write!(f, " {}", item)?;
    }
    Ok(())
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[Symbol]) -> fmt::Result {
    f.write_str("(")?;
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{}", param)?;
    }
    f.write_str(")")
}

/// S-expression rendering, used in logs and failure reports.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::Ref(name) => write!(f, "{}", name),
            Expr::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Expr::Let { name, value } => write!(f, "(let {} {})", name, value),
            Expr::LetIn { bindings, body } => {
                f.write_str("(let (")?;
                for (i, (name, value)) in bindings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "({} {})", name, value)?;
                }
                write!(f, ") {})", body)
            }
            Expr::Assign { op, name, value } => write!(f, "({} {} {})", op.token(), name, value),
            Expr::Op { op, args } => {
                write!(f, "({}", op.token())?;
                write_all(f, args)?;
                f.write_str(")")
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                write!(f, "(if {} {}", cond, then)?;
                if let Some(otherwise) = otherwise {
                    write!(f, " {}", otherwise)?;
                }
                f.write_str(")")
            }
            Expr::Do(body) => {
                f.write_str("(do")?;
                write_all(f, body)?;
                f.write_str(")")
            }
            Expr::Call { name, args } => {
                write!(f, "({}", name)?;
                write_all(f, args)?;
                f.write_str(")")
            }
            Expr::Lambda { params, body } => {
                f.write_str("(fn ")?;
                write_params(f, params)?;
                write!(f, " {})", body)
            }
            Expr::Func { name, params, body } => {
                write!(f, "(func {} ", name)?;
                write_params(f, params)?;
                write!(f, " {})", body)
            }
            Expr::Loop { count, body } => write!(f, "(loop {} {})", count, body),
            Expr::Every { period, body } => write!(f, "(every {} {})", period, body),
            Expr::Sleep(duration) => write!(f, "(sleep {})", duration),
            Expr::WithFx { tag, params, body } => {
                write!(f, "(with_fx {}", tag)?;
                for (name, value) in params {
                    write!(f, " :{} {}", name, value)?;
                }
                write!(f, " {})", body)
            }
        }
    }
}
