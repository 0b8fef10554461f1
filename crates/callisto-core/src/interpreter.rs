//! Tree-walking evaluator and the loop that drives scheduled threads.
//!
//! Evaluation of one expression either produces a value or, when it reaches
//! a `sleep`, a [`Suspension`]: the wake time plus the work the enclosing
//! blocks, loops and effect scopes still have to do. Top-level suspensions
//! become one-shot threads; suspensions inside a firing park that thread.
//! `sleep` is only accepted where nothing is waiting for its value (block
//! statements, loop bodies, effect bodies, `if` branches and function
//! bodies reached from those); anywhere else it fails with
//! [`EvalError::InvalidSuspension`].

use crate::ast::{AssignOp, Expr, Literal, Operator};
use crate::builtins::{AudioEngine, BuiltinTable, ConsoleSink, LogSink, NullEngine};
use crate::config::Config;
use crate::effects::{EffectHost, EffectScope, EffectStack};
use crate::env::{EnvId, Environments};
use crate::error::{ArgCount, ConfigError, EvalError, Result};
use crate::scheduler::{
    Activation, Firing, ResumeFrame, ScheduleWarning, Scheduler, Suspension, ThreadFailure,
    ThreadId, ThreadSnapshot, ThreadStatus, TickReport,
};
use crate::symbol::Symbol;
use crate::timing::{Clock, Span, TimeMap, TimeMode};
use crate::value::{Closure, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of evaluating an expression in a position that may suspend.
pub(crate) enum Flow {
    Value(Value),
    Suspend(Suspension),
}

/// Where the most recent error was raised.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorContext {
    /// Innermost failing expression.
    pub expr: String,
    /// Functions active at the failure, outermost first.
    pub calls: Vec<Symbol>,
}

#[derive(Clone, Copy, Debug)]
struct Limits {
    max_call_depth: usize,
    gc_threshold: usize,
    max_catch_up: u64,
}

impl Limits {
    fn from_config(config: &Config) -> Self {
        Self {
            max_call_depth: config.interpreter.max_call_depth,
            gc_threshold: config.interpreter.gc_threshold,
            max_catch_up: config.scheduler.max_catch_up,
        }
    }
}

/// One evaluator with its own clock, scheduler, environments and effect
/// stack.
pub struct Interpreter {
    envs: Environments,
    pub(crate) clock: Clock,
    pub(crate) scheduler: Scheduler,
    pub(crate) effects: EffectStack,
    builtins: BuiltinTable,
    pub(crate) engine: Box<dyn AudioEngine>,
    pub(crate) console: Box<dyn ConsoleSink>,
    time_map: TimeMap,
    call_stack: Vec<Symbol>,
    /// Logical time of the thread being evaluated.
    pub(crate) thread_time: f64,
    failing: Option<ErrorContext>,
    limits: Limits,
}

impl EffectHost for Interpreter {
    fn effect_stack(&mut self) -> &mut EffectStack {
        &mut self.effects
    }
}

impl Interpreter {
    /// Create an interpreter with default limits, a silent audio engine and
    /// `print` routed to the log.
    pub fn new(clock: Clock) -> Self {
        let config = Config::default();
        Self {
            envs: Environments::new(),
            thread_time: clock.now(),
            clock,
            scheduler: Scheduler::new(),
            effects: EffectStack::new(),
            builtins: BuiltinTable::new(),
            engine: Box::new(NullEngine),
            console: Box::new(LogSink),
            time_map: TimeMap::new(config.scheduler.time_mode),
            call_stack: Vec::new(),
            failing: None,
            limits: Limits::from_config(&config),
        }
    }

    /// Create an interpreter from a validated [`Config`]: its clock, limits
    /// and time mode.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let mut interpreter = Self::new(config.clock()?);
        interpreter.limits = Limits::from_config(config);
        interpreter.time_map = TimeMap::new(config.scheduler.time_mode);
        Ok(interpreter)
    }

    /// Route `play` and `bang` to `engine`.
    pub fn with_engine(mut self, engine: impl AudioEngine + 'static) -> Self {
        self.engine = Box::new(engine);
        self
    }

    /// Route `print` to `console`.
    pub fn with_console(mut self, console: impl ConsoleSink + 'static) -> Self {
        self.console = Box::new(console);
        self
    }

    /// The musical clock, including its tempo history.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current logical time in seconds.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Effect scopes active at top level. Empty between evaluations.
    pub fn effects(&self) -> &EffectStack {
        &self.effects
    }

    pub fn environments(&self) -> &Environments {
        &self.envs
    }

    pub fn time_mode(&self) -> TimeMode {
        self.time_map.mode()
    }

    /// Change how [`Interpreter::tick`] maps wall readings. Takes effect
    /// from the next tick.
    pub fn set_time_mode(&mut self, mode: TimeMode) {
        log::info!("[CLOCK] Time mode set to {:?}", mode);
        self.time_map.set_mode(mode);
    }

    /// Snapshots of every thread still in the table, in creation order.
    pub fn threads(&self) -> Vec<ThreadSnapshot> {
        self.scheduler.snapshot()
    }

    /// Status of `id`, or `None` if it was never spawned or has been
    /// removed.
    pub fn thread_status(&self, id: ThreadId) -> Option<ThreadStatus> {
        self.scheduler.status(id)
    }

    /// Earliest logical time at which a thread is due.
    pub fn next_due(&self) -> Option<f64> {
        self.scheduler.next_due()
    }

    /// Cancel a scheduled thread. Returns `false` for unknown or already
    /// cancelled ids.
    pub fn cancel(&mut self, id: ThreadId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Where the last evaluation error was raised, if the last evaluation
    /// failed.
    pub fn last_error_context(&self) -> Option<&ErrorContext> {
        self.failing.as_ref()
    }

    /// Bind `name` in the global scope, replacing any previous binding.
    pub fn define_global(&mut self, name: &str, value: Value) -> Result<()> {
        let global = self.envs.global();
        self.envs.define(global, Symbol::new(name), value)
    }

    /// Read a global binding; [`EvalError::UnboundName`] if there is none.
    pub fn get_global(&self, name: &str) -> Result<Value> {
        self.envs.get(self.envs.global(), Symbol::new(name))
    }

    /// Evaluate `expr` at top level, in the global scope, at the current
    /// logical time.
    ///
    /// If the evaluation sleeps, the rest of it becomes a one-shot thread
    /// and its handle is returned. Errors propagate to the caller.
    /// Values returned here are not roots for environment reclamation: a
    /// closure over a block-local scope may go stale after a later tick.
    pub fn eval(&mut self, expr: &Expr) -> Result<Value> {
        let global = self.envs.global();
        self.thread_time = self.clock.now();
        self.failing = None;
        self.call_stack.clear();
        let depth = self.effects.depth();

        let result = self.eval_flow(expr, global);

        self.effects.truncate(depth);
        self.call_stack.clear();
        match result? {
            Flow::Value(value) => Ok(value),
            Flow::Suspend(suspension) => {
                let id = self.scheduler.spawn_continuation(suspension, global);
                Ok(Value::Thread(id))
            }
        }
    }

    /// Map a wall-clock reading in seconds to logical time through the
    /// configured [`TimeMode`] and advance to it.
    pub fn tick(&mut self, wall_seconds: f64) -> Result<TickReport> {
        let delta = self.time_map.advance(wall_seconds);
        self.advance_to(self.clock.now() + delta)
    }

    /// Move logical time to `t` and run every thread that is due, in
    /// (due time, creation order) order, until nothing is due.
    pub fn advance_to(&mut self, t: f64) -> Result<TickReport> {
        self.clock.advance_to(t)?;
        let now = self.clock.now();
        let mut report = TickReport {
            now,
            ..TickReport::default()
        };

        let mut fired: HashMap<ThreadId, u64> = HashMap::new();
        let mut deferred: HashSet<ThreadId> = HashSet::new();
        while let Some((_, id)) = self.scheduler.next_ready(now, &deferred) {
            let count = fired.entry(id).or_insert(0);
            if *count >= self.limits.max_catch_up {
                deferred.insert(id);
                if let Some(skipped) = self.scheduler.rephase(id, now) {
                    let warning = ScheduleWarning::CatchUpLimit {
                        thread: id,
                        skipped,
                    };
                    log::warn!("[SCHEDULER] {}", warning);
                    report.warnings.push(warning);
                }
                continue;
            }
            *count += 1;
            self.fire(id, &mut report);
        }

        self.scheduler.reap();
        let horizon = self.scheduler.next_due().map_or(now, |due| due.min(now));
        self.clock.forget_before(horizon);
        self.maybe_collect();
        Ok(report)
    }

    /// Reclaim scope frames unreachable from the global scope and live
    /// threads. Returns the number of frames freed.
    pub fn collect_garbage(&mut self) -> usize {
        let freed = self.envs.collect(self.scheduler.roots());
        log::trace!(
            "[GC] Reclaimed {} scope frame(s), {} live",
            freed,
            self.envs.live_frames()
        );
        freed
    }

    fn maybe_collect(&mut self) {
        if self.envs.allocated_since_collect() >= self.limits.gc_threshold {
            self.collect_garbage();
        }
    }

    /// Run one firing or resumption of `id`, catching its errors at the
    /// thread boundary.
    fn fire(&mut self, id: ThreadId, report: &mut TickReport) {
        let Some(activation) = self.scheduler.begin_firing(id) else {
            return;
        };
        let at = activation.at();
        let resumed = matches!(activation, Activation::Resume { .. });
        log::debug!(
            "[SCHEDULER] {} thread {} at {:.3}s",
            if resumed { "Resuming" } else { "Firing" },
            id,
            at
        );
        report.firings.push(Firing {
            thread: id,
            at,
            resumed,
        });

        self.thread_time = at;
        self.failing = None;
        self.call_stack.clear();
        let depth = self.effects.depth();

        let result = match activation {
            Activation::Fire { body, env, .. } => {
                let frame = self.envs.child(env);
                self.eval_flow(&body, frame)
            }
            Activation::Resume { frames, .. } => self.resume(frames),
        };

        self.effects.truncate(depth);
        self.call_stack.clear();
        match result {
            Ok(Flow::Value(_)) => {
                if let Some(warning) = self.scheduler.complete(id, self.thread_time, &self.clock) {
                    log::warn!("[SCHEDULER] {}", warning);
                    report.warnings.push(warning);
                }
            }
            Ok(Flow::Suspend(suspension)) => self.scheduler.suspend(id, suspension),
            Err(error) => {
                let context = self.failing.take().unwrap_or_else(|| ErrorContext {
                    expr: "<thread>".to_string(),
                    calls: Vec::new(),
                });
                let failure = ThreadFailure {
                    thread: id,
                    error,
                    expr: context.expr,
                    calls: context.calls,
                };
                log::error!("[SCHEDULER] {}", failure);
                self.scheduler.cancel(id);
                report.failures.push(failure);
            }
        }
    }

    /// Continue a suspended evaluation. Frames are innermost first.
    fn resume(&mut self, frames: Vec<ResumeFrame>) -> Result<Flow> {
        let depth = self.effects.depth();
        for frame in frames.iter().rev() {
            if let ResumeFrame::Effect(scope) = frame {
                self.effects.push(scope.clone());
            }
        }
        let result = self.unwind(frames);
        self.effects.truncate(depth);
        result
    }

    fn unwind(&mut self, frames: Vec<ResumeFrame>) -> Result<Flow> {
        // `sleep` itself evaluates to nil.
        let mut last = Value::Nil;
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            let flow = match frame {
                ResumeFrame::Block { exprs, next, env } => self.run_block(&exprs, next, env, last)?,
                ResumeFrame::Repeat {
                    body,
                    remaining,
                    env,
                } => self.run_repeat(&body, remaining, env, last)?,
                ResumeFrame::Effect(_) => {
                    self.effects.pop();
                    Flow::Value(last)
                }
            };
            match flow {
                Flow::Value(value) => last = value,
                Flow::Suspend(mut suspension) => {
                    suspension.frames.extend(frames);
                    return Ok(Flow::Suspend(suspension));
                }
            }
        }
        Ok(Flow::Value(last))
    }

    fn eval_flow(&mut self, expr: &Expr, env: EnvId) -> Result<Flow> {
        let result = self.eval_node(expr, env);
        if result.is_err() {
            self.note_failure(expr);
        }
        result
    }

    /// Evaluate where the value is needed; `sleep` is not allowed here.
    fn eval_value(&mut self, expr: &Expr, env: EnvId) -> Result<Value> {
        match self.eval_flow(expr, env)? {
            Flow::Value(value) => Ok(value),
            Flow::Suspend(_) => {
                self.note_failure(expr);
                Err(EvalError::InvalidSuspension)
            }
        }
    }

    /// Remember the innermost failing expression.
    fn note_failure(&mut self, expr: &Expr) {
        if self.failing.is_none() {
            self.failing = Some(ErrorContext {
                expr: expr.to_string(),
                calls: self.call_stack.clone(),
            });
        }
    }

    fn eval_node(&mut self, expr: &Expr, env: EnvId) -> Result<Flow> {
        let value = match expr {
            Expr::Literal(literal) => literal_value(literal),
            Expr::Ref(name) => self.envs.get(env, *name)?,
            Expr::List(items) => Value::Sequence(self.eval_args(items, env)?),
            Expr::Let { name, value } => {
                let value = self.eval_value(value, env)?;
                self.envs.define(env, *name, value.clone())?;
                value
            }
            Expr::LetIn { bindings, body } => {
                let scope = self.envs.child(env);
                for (name, value) in bindings {
                    let value = self.eval_value(value, scope)?;
                    self.envs.define(scope, *name, value)?;
                }
                return self.eval_flow(body, scope);
            }
            Expr::Assign { op, name, value } => self.eval_assign(*op, *name, value, env)?,
            Expr::Op { op, args } => {
                check_arity(op.token(), op.arg_count(), args.len())?;
                let values = self.eval_args(args, env)?;
                apply_operator(*op, &values)?
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                return if self.eval_value(cond, env)?.is_truthy() {
                    self.eval_flow(then, env)
                } else if let Some(otherwise) = otherwise {
                    self.eval_flow(otherwise, env)
                } else {
                    Ok(Flow::Value(Value::Nil))
                };
            }
            Expr::Do(exprs) => {
                let scope = self.envs.child(env);
                return self.run_block(exprs, 0, scope, Value::Nil);
            }
            Expr::Call { name, args } => return self.eval_call(*name, args, env),
            Expr::Lambda { params, body } => Value::Closure(Closure {
                params: Arc::clone(params),
                body: Arc::clone(body),
                env,
            }),
            Expr::Func { name, params, body } => {
                let closure = Value::Closure(Closure {
                    params: Arc::clone(params),
                    body: Arc::clone(body),
                    env,
                });
                self.envs.define(env, *name, closure.clone())?;
                closure
            }
            Expr::Loop { count, body } => {
                let count = self.eval_value(count, env)?;
                let times = loop_count(&count)?;
                return self.run_repeat(body, times, env, Value::Nil);
            }
            Expr::Every { period, body } => self.eval_every(period, body, env)?,
            Expr::Sleep(duration) => {
                let duration = self.eval_value(duration, env)?;
                let span = Span::from_value(&duration)?;
                let seconds = self.clock.duration_at(span, self.thread_time);
                return Ok(Flow::Suspend(Suspension {
                    wake_at: self.thread_time + seconds,
                    frames: Vec::new(),
                }));
            }
            Expr::WithFx { tag, params, body } => return self.eval_with_fx(tag, params, body, env),
        };
        Ok(Flow::Value(value))
    }

    fn eval_args(&mut self, args: &[Expr], env: EnvId) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_value(arg, env)?);
        }
        Ok(values)
    }

    /// Statements of a block from `start` on, in the block's own frame.
    fn run_block(
        &mut self,
        exprs: &Arc<[Expr]>,
        start: usize,
        env: EnvId,
        mut last: Value,
    ) -> Result<Flow> {
        for index in start..exprs.len() {
            match self.eval_flow(&exprs[index], env)? {
                Flow::Value(value) => last = value,
                Flow::Suspend(mut suspension) => {
                    if index + 1 < exprs.len() {
                        suspension.frames.push(ResumeFrame::Block {
                            exprs: Arc::clone(exprs),
                            next: index + 1,
                            env,
                        });
                    }
                    return Ok(Flow::Suspend(suspension));
                }
            }
        }
        Ok(Flow::Value(last))
    }

    /// `remaining` iterations of a loop body, each in a fresh child of `env`.
    fn run_repeat(
        &mut self,
        body: &Arc<Expr>,
        mut remaining: u64,
        env: EnvId,
        mut last: Value,
    ) -> Result<Flow> {
        while remaining > 0 {
            remaining -= 1;
            let scope = self.envs.child(env);
            match self.eval_flow(body, scope)? {
                Flow::Value(value) => last = value,
                Flow::Suspend(mut suspension) => {
                    if remaining > 0 {
                        suspension.frames.push(ResumeFrame::Repeat {
                            body: Arc::clone(body),
                            remaining,
                            env,
                        });
                    }
                    return Ok(Flow::Suspend(suspension));
                }
            }
        }
        Ok(Flow::Value(last))
    }

    fn eval_assign(&mut self, op: AssignOp, name: Symbol, value: &Expr, env: EnvId) -> Result<Value> {
        let current = match op {
            AssignOp::Set => None,
            _ => Some(self.envs.get(env, name)?),
        };
        let value = self.eval_value(value, env)?;
        let updated = match (op, current) {
            (AssignOp::Add, Some(current)) => current.add(&value)?,
            (AssignOp::Sub, Some(current)) => current.sub(&value)?,
            (AssignOp::Mul, Some(current)) => current.mul(&value)?,
            (AssignOp::Div, Some(current)) => current.div(&value)?,
            _ => value,
        };
        self.envs.set(env, name, updated.clone())?;
        Ok(updated)
    }

    fn eval_call(&mut self, name: Symbol, args: &[Expr], env: EnvId) -> Result<Flow> {
        if let Some(builtin) = self.builtins.lookup(name) {
            check_arity(name.as_str(), builtin.arity(), args.len())?;
            let values = self.eval_args(args, env)?;
            return self.call_builtin(builtin, values, env);
        }

        let closure = self.lookup_closure(name, env)?;
        check_arity(
            name.as_str(),
            ArgCount::Exactly(closure.params.len()),
            args.len(),
        )?;
        let values = self.eval_args(args, env)?;
        self.apply(name, &closure, values)
    }

    fn lookup_closure(&self, name: Symbol, env: EnvId) -> Result<Closure> {
        match self.envs.get(env, name) {
            Ok(Value::Closure(closure)) => Ok(closure),
            Ok(other) => Err(EvalError::NotCallable(format!(
                "{} is a {}",
                name,
                other.type_name()
            ))),
            Err(EvalError::UnboundName(_)) => Err(EvalError::UnknownFunction(name.to_string())),
            Err(error) => Err(error),
        }
    }

    /// Call `target` with evaluated `args`. The target is a closure, or a
    /// name resolved as an operator token, then a builtin, then a closure
    /// bound in `env`.
    pub(crate) fn apply_value(
        &mut self,
        target: Value,
        args: Vec<Value>,
        env: EnvId,
    ) -> Result<Flow> {
        let name = match target {
            Value::Closure(closure) => {
                let name = Symbol::new("lambda");
                check_arity(
                    name.as_str(),
                    ArgCount::Exactly(closure.params.len()),
                    args.len(),
                )?;
                return self.apply(name, &closure, args);
            }
            Value::Symbol(name) => name,
            Value::String(name) => Symbol::new(&name),
            other => {
                return Err(EvalError::NotCallable(format!(
                    "{} is a {}",
                    other,
                    other.type_name()
                )))
            }
        };

        if let Some(op) = Operator::from_token(name.as_str()) {
            check_arity(op.token(), op.arg_count(), args.len())?;
            return apply_operator(op, &args).map(Flow::Value);
        }
        if let Some(builtin) = self.builtins.lookup(name) {
            check_arity(name.as_str(), builtin.arity(), args.len())?;
            return self.call_builtin(builtin, args, env);
        }
        let closure = self.lookup_closure(name, env)?;
        check_arity(
            name.as_str(),
            ArgCount::Exactly(closure.params.len()),
            args.len(),
        )?;
        self.apply(name, &closure, args)
    }

    fn apply(&mut self, name: Symbol, closure: &Closure, args: Vec<Value>) -> Result<Flow> {
        if self.call_stack.len() >= self.limits.max_call_depth {
            return Err(EvalError::RecursionLimit(self.limits.max_call_depth));
        }
        let frame = self.envs.child(closure.env);
        for (param, value) in closure.params.iter().zip(args) {
            self.envs.define(frame, *param, value)?;
        }
        self.call_stack.push(name);
        let result = self.eval_flow(&closure.body, frame);
        self.call_stack.pop();
        result
    }

    fn eval_every(&mut self, period: &Expr, body: &Arc<Expr>, env: EnvId) -> Result<Value> {
        let period = self.eval_value(period, env)?;
        let span = Span::from_value(&period)?;
        let seconds = self.clock.duration_at(span, self.thread_time);
        if seconds.is_nan() || seconds <= 0.0 {
            return Err(EvalError::InvalidDuration(format!(
                "every needs a positive period, got {}",
                period
            )));
        }
        let id = self
            .scheduler
            .spawn_every(span, seconds, Arc::clone(body), env, self.thread_time);
        Ok(Value::Thread(id))
    }

    fn eval_with_fx(
        &mut self,
        tag: &Expr,
        params: &[(Symbol, Expr)],
        body: &Arc<Expr>,
        env: EnvId,
    ) -> Result<Flow> {
        let tag = match self.eval_value(tag, env)? {
            Value::Symbol(tag) => tag,
            Value::String(tag) => Symbol::new(&tag),
            other => {
                return Err(EvalError::Type(format!(
                    "with_fx expects a symbol tag, got {}",
                    other.type_name()
                )))
            }
        };
        let mut scope = EffectScope::new(tag);
        for (name, value) in params {
            let value = self.eval_value(value, env)?;
            scope = scope.with_param(*name, value);
        }

        let frame = self.envs.child(env);
        self.with_effect(scope.clone(), |interpreter| {
            match interpreter.eval_flow(body, frame)? {
                Flow::Value(value) => Ok(Flow::Value(value)),
                Flow::Suspend(mut suspension) => {
                    suspension.frames.push(ResumeFrame::Effect(scope));
                    Ok(Flow::Suspend(suspension))
                }
            }
        })
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Nil => Value::Nil,
        Literal::Number(n) => Value::Number(*n),
        Literal::String(s) => Value::String(s.clone()),
        Literal::Symbol(s) => Value::Symbol(*s),
        Literal::Bool(b) => Value::Bool(*b),
    }
}

fn check_arity(name: &str, expected: ArgCount, found: usize) -> Result<()> {
    if expected.accepts(found) {
        Ok(())
    } else {
        Err(EvalError::Arity {
            name: name.to_string(),
            expected,
            found,
        })
    }
}

fn loop_count(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) if n.is_finite() && *n >= 0.0 && n.fract() == 0.0 => Ok(*n as u64),
        other => Err(EvalError::Type(format!(
            "loop count must be a non-negative integer, got {}",
            other
        ))),
    }
}

fn apply_operator(op: Operator, values: &[Value]) -> Result<Value> {
    match (op, values) {
        (Operator::Add, [first, rest @ ..]) => {
            rest.iter().try_fold(first.clone(), |acc, value| acc.add(value))
        }
        (Operator::Mul, [first, rest @ ..]) => {
            rest.iter().try_fold(first.clone(), |acc, value| acc.mul(value))
        }
        (Operator::Sub, [a, b]) => a.sub(b),
        (Operator::Div, [a, b]) => a.div(b),
        (Operator::Rem, [a, b]) => a.rem(b),
        (Operator::Eq, [a, b]) => Ok(Value::Bool(a == b)),
        (Operator::Ne, [a, b]) => Ok(Value::Bool(a != b)),
        (Operator::Lt, [a, b]) => Ok(Value::Bool(a.compare(b)? == Ordering::Less)),
        (Operator::Le, [a, b]) => Ok(Value::Bool(a.compare(b)? != Ordering::Greater)),
        (Operator::Gt, [a, b]) => Ok(Value::Bool(a.compare(b)? == Ordering::Greater)),
        (Operator::Ge, [a, b]) => Ok(Value::Bool(a.compare(b)? != Ordering::Less)),
        (op, values) => Err(EvalError::Arity {
            name: op.token().to_string(),
            expected: op.arg_count(),
            found: values.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::{BangRequest, PlayRequest};
    use crate::timing::TimeSignature;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    enum Event {
        Play {
            notes: Vec<f64>,
            synthdef: String,
            fx: String,
            time: f64,
        },
        Bang {
            target: String,
            fx: String,
            time: f64,
        },
        Print(String),
    }

    /// Records every engine and console call for deterministic traces.
    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
    }

    fn fx_path(effects: &[EffectScope]) -> String {
        effects
            .iter()
            .map(|scope| scope.tag.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    impl AudioEngine for Recorder {
        fn play(&mut self, request: &PlayRequest) -> std::result::Result<(), String> {
            self.events.lock().unwrap().push(Event::Play {
                notes: request.notes.clone(),
                synthdef: request.synthdef.clone(),
                fx: fx_path(&request.effects),
                time: request.time,
            });
            Ok(())
        }

        fn bang(&mut self, request: &BangRequest) -> std::result::Result<(), String> {
            self.events.lock().unwrap().push(Event::Bang {
                target: request.target.clone(),
                fx: fx_path(&request.effects),
                time: request.time,
            });
            Ok(())
        }
    }

    impl ConsoleSink for Recorder {
        fn print(&mut self, value: &Value) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Print(value.to_string()));
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        /// `(target, time)` of every bang, in order.
        fn bangs(&self) -> Vec<(String, f64)> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Bang { target, time, .. } => Some((target, time)),
                    _ => None,
                })
                .collect()
        }

        fn bang_times(&self, wanted: &str) -> Vec<f64> {
            self.bangs()
                .into_iter()
                .filter(|(target, _)| target == wanted)
                .map(|(_, time)| time)
                .collect()
        }

        fn prints(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Print(text) => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    struct FailingEngine;

    impl AudioEngine for FailingEngine {
        fn play(&mut self, _request: &PlayRequest) -> std::result::Result<(), String> {
            Err("device gone".to_string())
        }

        fn bang(&mut self, _request: &BangRequest) -> std::result::Result<(), String> {
            Err("device gone".to_string())
        }
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn setup() -> (Interpreter, Recorder) {
        init_logger();
        let recorder = Recorder::default();
        let interpreter = Interpreter::new(Clock::default())
            .with_engine(recorder.clone())
            .with_console(recorder.clone());
        (interpreter, recorder)
    }

    fn setup_with(config: &Config) -> (Interpreter, Recorder) {
        init_logger();
        let recorder = Recorder::default();
        let interpreter = Interpreter::from_config(config)
            .unwrap()
            .with_engine(recorder.clone())
            .with_console(recorder.clone());
        (interpreter, recorder)
    }

    fn bang(target: &str) -> Expr {
        Expr::call("bang", vec![Expr::sym(target)])
    }

    fn print(expr: Expr) -> Expr {
        Expr::call("print", vec![expr])
    }

    fn thread_id(value: Value) -> ThreadId {
        match value {
            Value::Thread(id) => id,
            other => panic!("expected a thread handle, got {}", other),
        }
    }

    #[test]
    fn test_scenario_tempo_sleep_and_mutation() {
        let (mut interp, recorder) = setup();
        interp
            .eval(&Expr::call("tempo", vec![Expr::num(120.0)]))
            .unwrap();
        interp
            .eval(&Expr::call("time", vec![Expr::num(4.0), Expr::num(4.0)]))
            .unwrap();

        let program = Expr::do_(vec![
            bang("before"),
            Expr::sleep(Expr::sym("quarter")),
            bang("after"),
        ]);
        let handle = interp.eval(&program).unwrap();
        assert!(matches!(handle, Value::Thread(_)));

        interp.advance_to(0.49).unwrap();
        assert_eq!(recorder.bangs(), vec![("before".to_string(), 0.0)]);
        interp.advance_to(0.5).unwrap();
        assert_eq!(recorder.bang_times("after"), vec![0.5]);

        interp.eval(&Expr::let_("foo", Expr::num(5.0))).unwrap();
        let updated = interp
            .eval(&Expr::assign(AssignOp::Add, "foo", Expr::num(2.0)))
            .unwrap();
        assert_eq!(updated, Value::from(7.0));
        assert_eq!(interp.get_global("foo").unwrap(), Value::from(7.0));

        let choice = Expr::if_(
            Expr::binary(Operator::Eq, Expr::var("foo"), Expr::num(42.0)),
            Expr::str("A"),
            Some(Expr::str("B")),
        );
        assert_eq!(interp.eval(&choice).unwrap(), Value::from("B"));
    }

    #[test]
    fn test_get_set_roundtrip_through_eval() {
        let (mut interp, _) = setup();
        interp.eval(&Expr::let_("x", Expr::num(1.0))).unwrap();
        interp
            .eval(&Expr::assign(
                AssignOp::Set,
                "x",
                Expr::binary(Operator::Add, Expr::var("x"), Expr::num(1.0)),
            ))
            .unwrap();
        assert_eq!(interp.eval(&Expr::var("x")).unwrap(), Value::from(2.0));

        assert_eq!(
            interp.eval(&Expr::let_("x", Expr::num(3.0))),
            Err(EvalError::Redefinition("x".to_string()))
        );
        assert_eq!(
            interp.eval(&Expr::assign(AssignOp::Add, "nope", Expr::num(1.0))),
            Err(EvalError::UnboundName("nope".to_string()))
        );
    }

    #[test]
    fn test_every_is_drift_free() {
        let (mut interp, recorder) = setup();
        interp.advance_to(1.0).unwrap();
        interp
            .eval(&Expr::every(Expr::num(100.0), bang("tick")))
            .unwrap();

        // Uneven ticks that never land on the grid.
        for i in 0..28 {
            interp.advance_to(1.0 + i as f64 * 0.037).unwrap();
        }
        interp.advance_to(2.05).unwrap();

        let expected: Vec<f64> = (0..=10).map(|k| 1.0 + k as f64 * 0.1).collect();
        assert_eq!(recorder.bang_times("tick"), expected);
    }

    #[test]
    fn test_same_tick_fires_in_creation_order() {
        let (mut interp, recorder) = setup();
        interp
            .eval(&Expr::every(Expr::sym("quarter"), bang("a")))
            .unwrap();
        interp
            .eval(&Expr::every(Expr::sym("quarter"), bang("b")))
            .unwrap();
        interp.advance_to(1.2).unwrap();

        let order: Vec<String> = recorder.bangs().into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec!["a", "b", "a", "b", "a", "b"]);
    }

    #[test]
    fn test_with_fx_restores_depth_on_error() {
        let (mut interp, recorder) = setup();
        let body = Expr::do_(vec![
            bang("inside"),
            Expr::binary(Operator::Div, Expr::num(1.0), Expr::num(0.0)),
        ]);
        let result = interp.eval(&Expr::with_fx("reverb", vec![], body));
        assert_eq!(result, Err(EvalError::DivisionByZero));
        assert_eq!(interp.effects().depth(), 0);
        assert_eq!(
            interp.last_error_context().map(|ctx| ctx.expr.as_str()),
            Some("(/ 1 0)")
        );
        assert_eq!(
            recorder.events(),
            vec![Event::Bang {
                target: "inside".to_string(),
                fx: "reverb".to_string(),
                time: 0.0
            }]
        );

        interp
            .eval(&Expr::with_fx("echo", vec![], bang("ok")))
            .unwrap();
        assert_eq!(interp.effects().depth(), 0);
    }

    #[test]
    fn test_cancel_prevents_future_firings() {
        let (mut interp, recorder) = setup();
        interp
            .eval(&Expr::let_(
                "t",
                Expr::every(Expr::sym("quarter"), bang("k")),
            ))
            .unwrap();
        interp.advance_to(0.0).unwrap();
        assert_eq!(recorder.bang_times("k"), vec![0.0]);

        let cancel = Expr::call("cancel", vec![Expr::var("t")]);
        assert_eq!(interp.eval(&cancel).unwrap(), Value::Bool(true));
        assert_eq!(interp.eval(&cancel).unwrap(), Value::Bool(false));
        let id = thread_id(interp.get_global("t").unwrap());
        assert!(!interp.cancel(id));

        interp.advance_to(2.0).unwrap();
        assert_eq!(recorder.bang_times("k"), vec![0.0]);
        assert_eq!(interp.thread_status(id), None);
    }

    #[test]
    fn test_sleep_inside_every_resumes_same_firing() {
        let (mut interp, recorder) = setup();
        interp
            .eval(&Expr::every(
                Expr::sym("bar"),
                Expr::do_(vec![
                    bang("a"),
                    Expr::sleep(Expr::sym("quarter")),
                    bang("b"),
                ]),
            ))
            .unwrap();

        let report = interp.advance_to(2.6).unwrap();
        assert_eq!(
            recorder.bangs(),
            vec![
                ("a".to_string(), 0.0),
                ("b".to_string(), 0.5),
                ("a".to_string(), 2.0),
                ("b".to_string(), 2.5),
            ]
        );
        let resumed: Vec<bool> = report.firings.iter().map(|f| f.resumed).collect();
        assert_eq!(resumed, vec![false, true, false, true]);
        assert!(report.warnings.is_empty());
        assert_eq!(interp.next_due(), Some(4.0));
    }

    #[test]
    fn test_overrun_warns_and_fires_immediately() {
        let (mut interp, recorder) = setup();
        let id = thread_id(
            interp
                .eval(&Expr::every(
                    Expr::num(500.0),
                    Expr::do_(vec![Expr::sleep(Expr::num(750.0)), bang("late")]),
                ))
                .unwrap(),
        );

        let report = interp.advance_to(1.0).unwrap();
        assert_eq!(
            report.warnings,
            vec![ScheduleWarning::Overrun {
                thread: id,
                scheduled: 0.5,
                finished: 0.75
            }]
        );
        assert_eq!(recorder.bang_times("late"), vec![0.75]);
        assert!(report.failures.is_empty());
        // The next firing started at 0.75 and sleeps until 1.5.
        assert_eq!(interp.next_due(), Some(1.5));
    }

    #[test]
    fn test_failing_thread_is_isolated() {
        let (mut interp, recorder) = setup();
        interp
            .eval(&Expr::every(Expr::sym("quarter"), bang("good")))
            .unwrap();
        let bad = thread_id(
            interp
                .eval(&Expr::every(
                    Expr::sym("quarter"),
                    Expr::do_(vec![bang("bad"), print(Expr::var("missing"))]),
                ))
                .unwrap(),
        );

        let report = interp.advance_to(1.0).unwrap();
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.thread, bad);
        assert_eq!(failure.error, EvalError::UnboundName("missing".to_string()));
        assert_eq!(failure.expr, "missing");

        assert_eq!(recorder.bang_times("good"), vec![0.0, 0.5, 1.0]);
        assert_eq!(recorder.bang_times("bad"), vec![0.0]);
        assert_eq!(interp.thread_status(bad), None);
    }

    #[test]
    fn test_failure_reports_call_stack() {
        let (mut interp, _) = setup();
        interp
            .eval(&Expr::func(
                "explode",
                &[],
                Expr::binary(Operator::Sub, Expr::num(1.0), Expr::str("x")),
            ))
            .unwrap();
        interp
            .eval(&Expr::every(
                Expr::sym("beat"),
                Expr::call("explode", vec![]),
            ))
            .unwrap();

        let report = interp.advance_to(0.0).unwrap();
        let failure = &report.failures[0];
        assert!(matches!(failure.error, EvalError::Type(_)));
        assert_eq!(failure.calls, vec![Symbol::new("explode")]);
        assert!(failure.to_string().contains("via explode"));
    }

    #[test]
    fn test_fx_reentered_on_resume() {
        let (mut interp, recorder) = setup();
        let program = Expr::with_fx(
            "reverb",
            vec![("room", Expr::num(0.8))],
            Expr::do_(vec![
                bang("kick"),
                Expr::sleep(Expr::sym("quarter")),
                bang("snare"),
            ]),
        );
        interp.eval(&program).unwrap();
        assert_eq!(interp.effects().depth(), 0);

        interp.eval(&bang("dry")).unwrap();
        interp.advance_to(0.5).unwrap();
        assert_eq!(interp.effects().depth(), 0);
        assert_eq!(
            recorder.events(),
            vec![
                Event::Bang {
                    target: "kick".to_string(),
                    fx: "reverb".to_string(),
                    time: 0.0
                },
                Event::Bang {
                    target: "dry".to_string(),
                    fx: String::new(),
                    time: 0.0
                },
                Event::Bang {
                    target: "snare".to_string(),
                    fx: "reverb".to_string(),
                    time: 0.5
                },
            ]
        );
    }

    #[test]
    fn test_loop_runs_synchronously_and_can_sleep() {
        let (mut interp, recorder) = setup();
        interp.eval(&Expr::let_("n", Expr::num(0.0))).unwrap();
        let result = interp
            .eval(&Expr::loop_(
                Expr::num(3.0),
                Expr::assign(AssignOp::Add, "n", Expr::num(1.0)),
            ))
            .unwrap();
        assert_eq!(result, Value::from(3.0));
        assert_eq!(
            interp
                .eval(&Expr::loop_(Expr::num(0.0), bang("never")))
                .unwrap(),
            Value::Nil
        );
        assert!(matches!(
            interp.eval(&Expr::loop_(Expr::num(-1.0), Expr::nil())),
            Err(EvalError::Type(_))
        ));

        interp
            .eval(&Expr::loop_(
                Expr::num(3.0),
                Expr::do_(vec![bang("x"), Expr::sleep(Expr::sym("beat"))]),
            ))
            .unwrap();
        interp.advance_to(5.0).unwrap();
        assert_eq!(recorder.bang_times("x"), vec![0.0, 0.5, 1.0]);
        assert!(interp.threads().is_empty());
    }

    #[test]
    fn test_sleep_in_operand_position_fails() {
        let (mut interp, _) = setup();
        let expr = Expr::binary(
            Operator::Add,
            Expr::num(1.0),
            Expr::sleep(Expr::num(100.0)),
        );
        assert_eq!(interp.eval(&expr), Err(EvalError::InvalidSuspension));
        assert!(interp.threads().is_empty());
    }

    #[test]
    fn test_functions_and_recursion_limit() {
        let mut config = Config::default();
        config.interpreter.max_call_depth = 32;
        let (mut interp, _) = setup_with(&config);

        let fact = Expr::func(
            "fact",
            &["n"],
            Expr::if_(
                Expr::binary(Operator::Le, Expr::var("n"), Expr::num(1.0)),
                Expr::num(1.0),
                Some(Expr::op(
                    Operator::Mul,
                    vec![
                        Expr::var("n"),
                        Expr::call(
                            "fact",
                            vec![Expr::binary(Operator::Sub, Expr::var("n"), Expr::num(1.0))],
                        ),
                    ],
                )),
            ),
        );
        interp.eval(&fact).unwrap();
        assert_eq!(
            interp
                .eval(&Expr::call("fact", vec![Expr::num(5.0)]))
                .unwrap(),
            Value::from(120.0)
        );

        interp
            .eval(&Expr::func(
                "forever",
                &["n"],
                Expr::call("forever", vec![Expr::var("n")]),
            ))
            .unwrap();
        assert_eq!(
            interp.eval(&Expr::call("forever", vec![Expr::num(1.0)])),
            Err(EvalError::RecursionLimit(32))
        );

        let add = Expr::let_(
            "add",
            Expr::lambda(
                &["a", "b"],
                Expr::binary(Operator::Add, Expr::var("a"), Expr::var("b")),
            ),
        );
        interp.eval(&add).unwrap();
        assert_eq!(
            interp
                .eval(&Expr::call("add", vec![Expr::num(2.0), Expr::num(3.0)]))
                .unwrap(),
            Value::from(5.0)
        );
    }

    #[test]
    fn test_arity_and_dispatch_errors() {
        let (mut interp, _) = setup();
        assert_eq!(
            interp.eval(&Expr::call("bang", vec![])),
            Err(EvalError::Arity {
                name: "bang".to_string(),
                expected: ArgCount::Exactly(1),
                found: 0
            })
        );
        assert_eq!(
            interp.eval(&Expr::op(Operator::Add, vec![Expr::num(1.0)])),
            Err(EvalError::Arity {
                name: "+".to_string(),
                expected: ArgCount::AtLeast(2),
                found: 1
            })
        );
        assert_eq!(
            interp
                .eval(&Expr::op(
                    Operator::Add,
                    vec![Expr::num(1.0), Expr::num(2.0), Expr::num(3.0)]
                ))
                .unwrap(),
            Value::from(6.0)
        );
        assert_eq!(
            interp.eval(&Expr::call("wobble", vec![Expr::num(1.0)])),
            Err(EvalError::UnknownFunction("wobble".to_string()))
        );

        interp.eval(&Expr::let_("x", Expr::num(1.0))).unwrap();
        assert!(matches!(
            interp.eval(&Expr::call("x", vec![])),
            Err(EvalError::NotCallable(_))
        ));

        interp
            .eval(&Expr::func("one", &["a"], Expr::var("a")))
            .unwrap();
        assert_eq!(
            interp.eval(&Expr::call("one", vec![])),
            Err(EvalError::Arity {
                name: "one".to_string(),
                expected: ArgCount::Exactly(1),
                found: 0
            })
        );
    }

    #[test]
    fn test_clock_builtins_validate() {
        let (mut interp, _) = setup();
        assert_eq!(
            interp.eval(&Expr::call("tempo", vec![Expr::num(0.0)])),
            Err(EvalError::InvalidTempo(0.0))
        );
        assert!(matches!(
            interp.eval(&Expr::call("time", vec![Expr::num(3.0), Expr::num(6.0)])),
            Err(EvalError::InvalidTimeSignature { .. })
        ));
        assert!(matches!(
            interp.eval(&Expr::call("tempo", vec![Expr::str("fast")])),
            Err(EvalError::Builtin { .. })
        ));

        interp
            .eval(&Expr::call("tempo", vec![Expr::num(60.0)]))
            .unwrap();
        interp
            .eval(&Expr::call("time", vec![Expr::num(3.0), Expr::num(8.0)]))
            .unwrap();
        assert_eq!(interp.clock().bpm(), 60.0);
        assert_eq!(
            interp.clock().time_signature(),
            TimeSignature::new(3, 8).unwrap()
        );
    }

    #[test]
    fn test_play_forwards_notes_effects_and_time() {
        let (mut interp, recorder) = setup();
        let chord = Expr::list(vec![Expr::num(60.0), Expr::num(64.0), Expr::num(67.0)]);
        interp.advance_to(1.5).unwrap();
        interp
            .eval(&Expr::with_fx(
                "reverb",
                vec![("room", Expr::num(0.8))],
                Expr::call("play", vec![chord, Expr::sym("piano")]),
            ))
            .unwrap();

        assert_eq!(
            recorder.events(),
            vec![Event::Play {
                notes: vec![60.0, 64.0, 67.0],
                synthdef: "piano".to_string(),
                fx: "reverb".to_string(),
                time: 1.5
            }]
        );
    }

    #[test]
    fn test_engine_failure_is_builtin_error() {
        init_logger();
        let mut interp = Interpreter::new(Clock::default()).with_engine(FailingEngine);
        assert_eq!(
            interp.eval(&bang("kick")),
            Err(EvalError::Builtin {
                name: "bang".to_string(),
                detail: "device gone".to_string()
            })
        );
    }

    #[test]
    fn test_threads_observe_shared_mutation() {
        let (mut interp, recorder) = setup();
        interp.eval(&Expr::let_("x", Expr::num(1.0))).unwrap();
        interp
            .eval(&Expr::every(Expr::sym("quarter"), print(Expr::var("x"))))
            .unwrap();
        interp.advance_to(0.0).unwrap();
        interp
            .eval(&Expr::assign(AssignOp::Set, "x", Expr::num(5.0)))
            .unwrap();
        interp.advance_to(0.5).unwrap();
        assert_eq!(recorder.prints(), vec!["1", "5"]);
    }

    #[test]
    fn test_reclamation_keeps_thread_scopes() {
        let mut config = Config::default();
        config.interpreter.gc_threshold = 1;
        let (mut interp, recorder) = setup_with(&config);

        let program = Expr::do_(vec![
            Expr::let_("count", Expr::num(0.0)),
            Expr::every(
                Expr::sym("quarter"),
                Expr::do_(vec![
                    Expr::assign(AssignOp::Add, "count", Expr::num(1.0)),
                    print(Expr::var("count")),
                ]),
            ),
        ]);
        interp.eval(&program).unwrap();
        // Throwaway scopes that nothing keeps alive.
        for _ in 0..4 {
            interp.eval(&Expr::do_(vec![Expr::nil()])).unwrap();
        }

        for step in 0..3 {
            let report = interp.advance_to(step as f64 * 0.5).unwrap();
            assert!(report.failures.is_empty());
        }
        assert_eq!(recorder.prints(), vec!["1", "2", "3"]);
        assert_eq!(interp.collect_garbage(), 0);
    }

    #[test]
    fn test_time_modes_map_wall_ticks() {
        let mut config = Config::default();
        config.scheduler.time_mode = TimeMode::Scaled { rate: 2.0 };
        let (mut interp, recorder) = setup_with(&config);
        interp
            .eval(&Expr::every(Expr::sym("beat"), bang("b")))
            .unwrap();

        interp.tick(100.0).unwrap();
        interp.tick(100.5).unwrap();
        assert_eq!(interp.now(), 1.0);

        interp.set_time_mode(TimeMode::Paused);
        interp.tick(105.0).unwrap();
        assert_eq!(interp.now(), 1.0);

        interp.set_time_mode(TimeMode::Wall);
        interp.tick(105.5).unwrap();
        assert_eq!(interp.now(), 1.5);
        assert_eq!(recorder.bang_times("b"), vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_catch_up_limit_rephases() {
        let mut config = Config::default();
        config.scheduler.max_catch_up = 4;
        let (mut interp, recorder) = setup_with(&config);
        let id = thread_id(
            interp
                .eval(&Expr::every(Expr::num(100.0), bang("fast")))
                .unwrap(),
        );

        let report = interp.advance_to(10.05).unwrap();
        assert_eq!(recorder.bang_times("fast").len(), 4);
        assert_eq!(
            report.warnings,
            vec![ScheduleWarning::CatchUpLimit {
                thread: id,
                skipped: 97
            }]
        );
        assert_eq!(interp.next_due(), Some(101.0 * 0.1));
    }

    #[test]
    fn test_now_and_beat_follow_thread_time() {
        let (mut interp, recorder) = setup();
        interp
            .eval(&Expr::every(
                Expr::sym("half"),
                print(Expr::list(vec![
                    Expr::call("now", vec![]),
                    Expr::call("beat", vec![]),
                ])),
            ))
            .unwrap();
        interp.advance_to(2.5).unwrap();
        assert_eq!(recorder.prints(), vec!["[0 0]", "[1 2]", "[2 4]"]);
    }

    #[test]
    fn test_play_resolves_note_names() {
        let (mut interp, recorder) = setup();
        let notes = Expr::list(vec![Expr::sym("c4"), Expr::str("fs3"), Expr::num(67.0)]);
        interp
            .eval(&Expr::call("play", vec![notes, Expr::sym("piano")]))
            .unwrap();
        assert_eq!(
            recorder.events(),
            vec![Event::Play {
                notes: vec![60.0, 54.0, 67.0],
                synthdef: "piano".to_string(),
                fx: String::new(),
                time: 0.0
            }]
        );

        let err = interp
            .eval(&Expr::call("play", vec![Expr::sym("reverb"), Expr::sym("piano")]))
            .unwrap_err();
        assert!(matches!(err, EvalError::Builtin { .. }));
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn test_tempo_change_inside_thread_applies_at_thread_time() {
        let program = [
            Expr::every(Expr::num(500.0), print(Expr::call("beat", vec![]))),
            Expr::do_(vec![
                Expr::sleep(Expr::num(250.0)),
                Expr::call("tempo", vec![Expr::num(60.0)]),
            ]),
        ];
        let expected = vec!["0", "0.75", "1.25", "1.75", "2.25"];

        let (mut interp, recorder) = setup();
        for expr in &program {
            interp.eval(expr).unwrap();
        }
        interp.advance_to(2.0).unwrap();
        assert_eq!(recorder.prints(), expected);
        assert_eq!(interp.clock().bpm(), 60.0);

        // Finer ticks must not change where the tempo change lands.
        let (mut interp, recorder) = setup();
        for expr in &program {
            interp.eval(expr).unwrap();
        }
        for step in 0..=20 {
            interp.advance_to(step as f64 / 10.0).unwrap();
        }
        assert_eq!(recorder.prints(), expected);
    }

    #[test]
    fn test_every_restarts_grid_after_tempo_change() {
        let (mut interp, recorder) = setup();
        interp
            .eval(&Expr::every(Expr::sym("beat"), bang("tick")))
            .unwrap();
        interp.advance_to(0.6).unwrap();
        assert_eq!(recorder.bang_times("tick"), vec![0.0, 0.5]);

        interp
            .eval(&Expr::call("tempo", vec![Expr::num(60.0)]))
            .unwrap();
        interp.advance_to(3.0).unwrap();
        assert_eq!(recorder.bang_times("tick"), vec![0.0, 0.5, 1.0, 2.0, 3.0]);

        assert_eq!(interp.eval(&Expr::call("now", vec![])).unwrap(), Value::from(3.0));
        match interp.eval(&Expr::call("beat", vec![])).unwrap() {
            Value::Number(beat) => assert!((beat - 3.6).abs() < 1e-9, "beat was {}", beat),
            other => panic!("expected a number, got {}", other),
        }
    }

    #[test]
    fn test_apply_resolves_operators_builtins_and_closures() {
        let (mut interp, _) = setup();
        let apply = |target: Expr, args: Vec<Expr>| Expr::call("apply", vec![target, Expr::list(args)]);

        assert_eq!(
            interp
                .eval(&apply(Expr::sym("+"), vec![Expr::num(1.0), Expr::num(2.0)]))
                .unwrap(),
            Value::from(3.0)
        );
        assert_eq!(
            interp.eval(&apply(Expr::sym("now"), vec![])).unwrap(),
            Value::from(0.0)
        );

        let double = Expr::binary(Operator::Mul, Expr::var("x"), Expr::num(2.0));
        assert_eq!(
            interp
                .eval(&apply(Expr::lambda(&["x"], double.clone()), vec![Expr::num(21.0)]))
                .unwrap(),
            Value::from(42.0)
        );
        interp.eval(&Expr::func("double", &["x"], double)).unwrap();
        assert_eq!(
            interp
                .eval(&apply(Expr::str("double"), vec![Expr::num(5.0)]))
                .unwrap(),
            Value::from(10.0)
        );

        assert!(matches!(
            interp.eval(&apply(Expr::sym("double"), vec![])),
            Err(EvalError::Arity { .. })
        ));
        assert!(matches!(
            interp.eval(&Expr::call("apply", vec![Expr::sym("+"), Expr::num(1.0)])),
            Err(EvalError::Builtin { .. })
        ));
        assert!(matches!(
            interp.eval(&apply(Expr::num(3.0), vec![])),
            Err(EvalError::NotCallable(_))
        ));
        assert_eq!(
            interp.eval(&apply(Expr::sym("missing"), vec![])),
            Err(EvalError::UnknownFunction("missing".to_string()))
        );
    }

    #[test]
    fn test_let_in_scopes_bindings_to_its_body() {
        let (mut interp, recorder) = setup();
        let sum = Expr::let_in(
            vec![("a", Expr::num(1.0)), ("b", Expr::var("a"))],
            Expr::binary(Operator::Add, Expr::var("a"), Expr::var("b")),
        );
        assert_eq!(interp.eval(&sum).unwrap(), Value::from(2.0));
        assert!(matches!(
            interp.get_global("a"),
            Err(EvalError::UnboundName(_))
        ));

        let delayed = Expr::let_in(
            vec![("n", Expr::num(7.0))],
            Expr::do_(vec![Expr::sleep(Expr::sym("quarter")), print(Expr::var("n"))]),
        );
        assert!(matches!(interp.eval(&delayed).unwrap(), Value::Thread(_)));
        interp.advance_to(0.5).unwrap();
        assert_eq!(recorder.prints(), vec!["7"]);
    }
}
