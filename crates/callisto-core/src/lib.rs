//! Callisto Core - evaluator, musical clock and cooperative scheduler for
//! the Callisto live-coding language.
//!
//! This crate provides the pieces a host needs to run Callisto programs:
//!
//! - **AST** - Expression tree handed over by the parser
//! - **Interpreter** - Tree-walking evaluator with first-class closures
//! - **Timing** - Tempo map, time signature and note-value durations
//! - **Pitch** - Note names such as `c4` or `fs3` to MIDI note numbers
//! - **Scheduler** - `every` threads on a drift-free grid and `sleep` continuations
//! - **Effects** - Dynamically scoped `with_fx` stack
//! - **Builtins** - `play`, `bang`, `tempo` and friends, routed to an [`AudioEngine`]
//! - **Runtime** - Driver thread that ticks an interpreter from the wall clock
//!
//! # Architecture
//!
//! A single [`Interpreter`] owns its clock, scheduler, environments and
//! effect stack, and is driven by calls to [`Interpreter::eval`] and
//! [`Interpreter::advance_to`]. Threads are cooperative: they interleave
//! only at `sleep` points and at firing boundaries. [`Runtime`] moves an
//! interpreter onto its own thread and exposes it through a
//! [`RuntimeHandle`].

pub mod ast;
pub mod builtins;
pub mod config;
pub mod effects;
pub mod env;
pub mod error;
pub mod interpreter;
pub mod pitch;
pub mod runtime;
pub mod scheduler;
pub mod symbol;
pub mod timing;
pub mod value;

// Re-export main types for convenience
pub use ast::{AssignOp, Expr, Literal, Operator};
pub use builtins::{
    AudioEngine, BangRequest, Builtin, ConsoleSink, LogEngine, LogSink, NullEngine, PlayRequest,
};
pub use config::Config;
pub use effects::{EffectHost, EffectScope, EffectStack};
pub use error::{ArgCount, ConfigError, EvalError, Result};
pub use interpreter::{ErrorContext, Interpreter};
pub use pitch::note_number;
pub use runtime::{Runtime, RuntimeHandle, RuntimeMessage, RuntimeStatus};
pub use scheduler::{ScheduleWarning, ThreadFailure, ThreadId, ThreadStatus, TickReport};
pub use symbol::Symbol;
pub use timing::{Clock, NoteValue, Span, TimeMode, TimeSignature};
pub use value::Value;
