//! Native builtins and the collaborators they forward to.
//!
//! Builtins form a closed set resolved by name once, when the table is
//! built. Audio output and console output are reached only through the
//! [`AudioEngine`] and [`ConsoleSink`] traits.

use crate::effects::EffectScope;
use crate::env::EnvId;
use crate::error::{ArgCount, EvalError, Result};
use crate::interpreter::{Flow, Interpreter};
use crate::pitch;
use crate::symbol::Symbol;
use crate::timing::TimeSignature;
use crate::value::Value;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    Tempo,
    Time,
    Play,
    Bang,
    Print,
    Now,
    Beat,
    Cancel,
    /// `apply(target, [args])`: call a builtin, operator or closure with a
    /// sequence of already-evaluated arguments.
    Apply,
}

impl Builtin {
    pub const ALL: [Builtin; 9] = [
        Builtin::Tempo,
        Builtin::Time,
        Builtin::Play,
        Builtin::Bang,
        Builtin::Print,
        Builtin::Now,
        Builtin::Beat,
        Builtin::Cancel,
        Builtin::Apply,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Tempo => "tempo",
            Builtin::Time => "time",
            Builtin::Play => "play",
            Builtin::Bang => "bang",
            Builtin::Print => "print",
            Builtin::Now => "now",
            Builtin::Beat => "beat",
            Builtin::Cancel => "cancel",
            Builtin::Apply => "apply",
        }
    }

    pub fn arity(self) -> ArgCount {
        match self {
            Builtin::Now | Builtin::Beat => ArgCount::Exactly(0),
            Builtin::Time | Builtin::Play | Builtin::Apply => ArgCount::Exactly(2),
            _ => ArgCount::Exactly(1),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|builtin| builtin.name() == name)
    }
}

/// Name lookup for builtins, keyed by interned symbol.
#[derive(Clone, Debug)]
pub struct BuiltinTable {
    by_name: HashMap<Symbol, Builtin>,
}

impl Default for BuiltinTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinTable {
    pub fn new() -> Self {
        let by_name = Builtin::ALL
            .into_iter()
            .map(|builtin| (Symbol::new(builtin.name()), builtin))
            .collect();
        Self { by_name }
    }

    pub fn lookup(&self, name: Symbol) -> Option<Builtin> {
        self.by_name.get(&name).copied()
    }
}

/// A `play` call as seen by the audio engine.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayRequest {
    /// MIDI note numbers; note symbols such as `:c4` are already resolved.
    pub notes: Vec<f64>,
    pub synthdef: String,
    /// Active `with_fx` scopes, outermost first.
    pub effects: Vec<EffectScope>,
    /// Logical time of the calling thread, in seconds.
    pub time: f64,
}

/// A `bang` call as seen by the audio engine.
#[derive(Clone, Debug, PartialEq)]
pub struct BangRequest {
    pub target: String,
    pub effects: Vec<EffectScope>,
    pub time: f64,
}

/// Sink for sound-producing builtins.
///
/// An `Err` is surfaced to the script as a builtin failure.
pub trait AudioEngine: Send {
    fn play(&mut self, request: &PlayRequest) -> std::result::Result<(), String>;
    fn bang(&mut self, request: &BangRequest) -> std::result::Result<(), String>;
}

/// Sink for `print`.
pub trait ConsoleSink: Send {
    fn print(&mut self, value: &Value);
}

/// Engine that accepts and discards every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEngine;

impl AudioEngine for NullEngine {
    fn play(&mut self, _request: &PlayRequest) -> std::result::Result<(), String> {
        Ok(())
    }

    fn bang(&mut self, _request: &BangRequest) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Engine that logs every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogEngine;

fn effect_path(effects: &[EffectScope]) -> String {
    if effects.is_empty() {
        return "-".to_string();
    }
    effects
        .iter()
        .map(|scope| scope.tag.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

impl AudioEngine for LogEngine {
    fn play(&mut self, request: &PlayRequest) -> std::result::Result<(), String> {
        log::info!(
            "[AUDIO] play {:?} {} at {:.3}s (fx: {})",
            request.notes,
            request.synthdef,
            request.time,
            effect_path(&request.effects)
        );
        Ok(())
    }

    fn bang(&mut self, request: &BangRequest) -> std::result::Result<(), String> {
        log::info!(
            "[AUDIO] bang {} at {:.3}s (fx: {})",
            request.target,
            request.time,
            effect_path(&request.effects)
        );
        Ok(())
    }
}

/// Console sink that routes script output to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ConsoleSink for LogSink {
    fn print(&mut self, value: &Value) {
        log::info!("[script] {}", value);
    }
}

fn number_arg(builtin: Builtin, value: &Value) -> Result<f64> {
    value.as_number().ok_or_else(|| {
        EvalError::builtin(
            builtin.name(),
            format!("expected a number, got {}", value.type_name()),
        )
    })
}

fn name_arg(builtin: Builtin, value: &Value) -> Result<String> {
    match value {
        Value::Symbol(name) => Ok(name.as_str().to_string()),
        Value::String(name) => Ok(name.clone()),
        other => Err(EvalError::builtin(
            builtin.name(),
            format!("expected a symbol or string, got {}", other.type_name()),
        )),
    }
}

/// Resolve one `play` note: a number, or a note symbol/string like `:fs3`.
fn note_arg(builtin: Builtin, value: &Value) -> Result<f64> {
    let name = match value {
        Value::Number(n) => return Ok(*n),
        Value::Symbol(name) => name.as_str(),
        Value::String(name) => name.as_str(),
        other => {
            return Err(EvalError::builtin(
                builtin.name(),
                format!("expected a note, got {}", other.type_name()),
            ))
        }
    };
    pitch::note_number(name)
        .map(f64::from)
        .ok_or_else(|| EvalError::builtin(builtin.name(), format!("unknown note {}", value)))
}

impl Interpreter {
    /// Run `builtin` on already-evaluated arguments whose count has been
    /// checked against [`Builtin::arity`]. `env` is the caller's scope,
    /// used by `apply` to resolve closures by name.
    pub(crate) fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        env: EnvId,
    ) -> Result<Flow> {
        let value = match (builtin, args.as_slice()) {
            (Builtin::Tempo, [bpm]) => {
                self.clock
                    .set_tempo_at(self.thread_time, number_arg(builtin, bpm)?)?;
                Value::Nil
            }
            (Builtin::Time, [numerator, denominator]) => {
                let signature = TimeSignature::from_numbers(
                    number_arg(builtin, numerator)?,
                    number_arg(builtin, denominator)?,
                )?;
                self.clock.set_time_signature_at(self.thread_time, signature);
                Value::Nil
            }
            (Builtin::Play, [notes, synthdef]) => {
                let notes = match notes {
                    Value::Sequence(items) => items
                        .iter()
                        .map(|note| note_arg(builtin, note))
                        .collect::<Result<Vec<_>>>()?,
                    single => vec![note_arg(builtin, single)?],
                };
                let request = PlayRequest {
                    notes,
                    synthdef: name_arg(builtin, synthdef)?,
                    effects: self.effects.snapshot(),
                    time: self.thread_time,
                };
                self.engine
                    .play(&request)
                    .map_err(|detail| EvalError::builtin(builtin.name(), detail))?;
                Value::Nil
            }
            (Builtin::Bang, [target]) => {
                let request = BangRequest {
                    target: name_arg(builtin, target)?,
                    effects: self.effects.snapshot(),
                    time: self.thread_time,
                };
                self.engine
                    .bang(&request)
                    .map_err(|detail| EvalError::builtin(builtin.name(), detail))?;
                Value::Nil
            }
            (Builtin::Print, [value]) => {
                self.console.print(value);
                Value::Nil
            }
            (Builtin::Now, []) => Value::Number(self.thread_time),
            (Builtin::Beat, []) => Value::Number(self.clock.beat_at(self.thread_time).to_float()),
            (Builtin::Cancel, [Value::Thread(id)]) => Value::Bool(self.scheduler.cancel(*id)),
            (Builtin::Cancel, [other]) => {
                return Err(EvalError::builtin(
                    builtin.name(),
                    format!("expected a thread, got {}", other.type_name()),
                ))
            }
            (Builtin::Apply, [target, Value::Sequence(items)]) => {
                return self.apply_value(target.clone(), items.clone(), env);
            }
            (Builtin::Apply, [_, other]) => {
                return Err(EvalError::builtin(
                    builtin.name(),
                    format!("expected an argument sequence, got {}", other.type_name()),
                ))
            }
            (builtin, args) => {
                return Err(EvalError::Arity {
                    name: builtin.name().to_string(),
                    expected: builtin.arity(),
                    found: args.len(),
                })
            }
        };
        Ok(Flow::Value(value))
    }
}
