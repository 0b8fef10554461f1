//! Error types for the Callisto core.

use std::fmt;
use thiserror::Error;

/// Result type alias using [`EvalError`].
pub type Result<T> = std::result::Result<T, EvalError>;

/// Number of arguments a form or builtin accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgCount {
    Exactly(usize),
    AtLeast(usize),
}

impl ArgCount {
    /// Check `found` against the contract.
    pub fn accepts(self, found: usize) -> bool {
        match self {
            ArgCount::Exactly(n) => found == n,
            ArgCount::AtLeast(n) => found >= n,
        }
    }
}

impl fmt::Display for ArgCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgCount::Exactly(n) => write!(f, "{}", n),
            ArgCount::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

/// Errors raised while evaluating expressions or driving the clock.
///
/// Errors inside a scheduled thread are caught at the thread boundary and
/// reported; everything else propagates to the caller of the interpreter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// A name was looked up or assigned but is bound in no enclosing scope.
    #[error("Unbound name: {0}")]
    UnboundName(String),

    /// `let` on a name that already exists in the same scope frame.
    #[error("Name already defined in this scope: {0}")]
    Redefinition(String),

    /// A form, operator or function was called with the wrong number of arguments.
    #[error("Wrong arity for {name}: expected {expected}, got {found}")]
    Arity {
        name: String,
        expected: ArgCount,
        found: usize,
    },

    #[error("Invalid tempo: {0} (must be greater than zero)")]
    InvalidTempo(f64),

    #[error("Invalid time signature: {numerator}/{denominator}")]
    InvalidTimeSignature { numerator: f64, denominator: f64 },

    /// Attempt to move logical time backwards.
    #[error("Clock regression: cannot move from {now:.6}s back to {requested:.6}s")]
    ClockRegression { now: f64, requested: f64 },

    /// A builtin rejected its arguments or its collaborator failed.
    #[error("Builtin {name} failed: {detail}")]
    Builtin { name: String, detail: String },

    /// A call named neither a builtin nor a bound function.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A call named a binding that does not hold a closure.
    #[error("Not callable: {0}")]
    NotCallable(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// `sleep` reached a position whose value is still needed.
    #[error("sleep can only suspend a block, loop or effect body, not an operand")]
    InvalidSuspension,

    #[error("Call depth limit of {0} exceeded")]
    RecursionLimit(usize),
}

/// Errors loading or validating a [`Config`](crate::config::Config).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid duration '{value}': {source}")]
    Duration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    /// Clock settings rejected by the clock itself.
    #[error("Invalid clock settings: {0}")]
    Clock(#[from] EvalError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl EvalError {
    pub(crate) fn builtin(name: &str, detail: impl Into<String>) -> Self {
        EvalError::Builtin {
            name: name.to_string(),
            detail: detail.into(),
        }
    }
}
