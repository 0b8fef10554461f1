//! Cooperative scheduler for `every` threads and suspended continuations.
//!
//! The scheduler only keeps bookkeeping: which logical threads exist, when
//! each is next due, and what a suspended thread still has to run. The
//! interpreter asks it for the next due thread, evaluates, and reports back
//! through [`Scheduler::complete`], [`Scheduler::suspend`] or
//! [`Scheduler::cancel`]. Threads never run in parallel; ordering is by due
//! time, then by creation order.

use crate::ast::Expr;
use crate::effects::EffectScope;
use crate::env::EnvId;
use crate::error::EvalError;
use crate::symbol::Symbol;
use crate::timing::{Clock, Span};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Slack allowed when comparing a firing's end against the next grid point.
const OVERRUN_EPSILON: f64 = 1e-9;

/// Identifier of a logical thread. Ids grow monotonically, so comparing ids
/// compares creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Waiting for its next firing.
    Pending,
    /// Currently being evaluated.
    Running,
    /// Stopped at a `sleep`, waiting to resume.
    Suspended,
    /// Terminal; the thread will not fire again.
    Cancelled,
}

#[derive(Clone, Debug)]
pub enum ThreadKind {
    /// Repeats `body` once per `period`.
    Every { period: Span, body: Arc<Expr> },
    /// The remainder of a top-level evaluation that slept; runs until done.
    Once,
}

/// The remainder of an evaluation interrupted by `sleep`, one entry per
/// enclosing construct that still has work to do.
#[derive(Clone, Debug)]
pub enum ResumeFrame {
    /// Remaining statements of a `do` block.
    Block {
        exprs: Arc<[Expr]>,
        next: usize,
        env: EnvId,
    },
    /// Remaining iterations of a `loop`.
    Repeat {
        body: Arc<Expr>,
        remaining: u64,
        env: EnvId,
    },
    /// A `with_fx` scope to re-enter on resume and leave when the frames
    /// inside it finish.
    Effect(EffectScope),
}

impl ResumeFrame {
    fn trace_envs(&self, out: &mut Vec<EnvId>) {
        match self {
            ResumeFrame::Block { env, .. } | ResumeFrame::Repeat { env, .. } => out.push(*env),
            ResumeFrame::Effect(scope) => {
                for (_, value) in &scope.params {
                    value.trace_envs(out);
                }
            }
        }
    }
}

/// A pending `sleep`: when to wake and what to run then.
///
/// Frames are ordered innermost first.
#[derive(Clone, Debug)]
pub struct Suspension {
    pub wake_at: f64,
    pub frames: Vec<ResumeFrame>,
}

/// What the interpreter should evaluate for one firing.
#[derive(Clone, Debug)]
pub enum Activation {
    /// Start a fresh firing of an `every` body.
    Fire { body: Arc<Expr>, env: EnvId, at: f64 },
    /// Continue a suspended thread.
    Resume { frames: Vec<ResumeFrame>, at: f64 },
}

impl Activation {
    pub fn at(&self) -> f64 {
        match self {
            Activation::Fire { at, .. } | Activation::Resume { at, .. } => *at,
        }
    }
}

/// Non-fatal scheduling problems, reported but never propagated.
#[derive(Clone, Debug, PartialEq)]
pub enum ScheduleWarning {
    /// A firing ended after its next grid point; the next firing is due
    /// immediately.
    Overrun {
        thread: ThreadId,
        scheduled: f64,
        finished: f64,
    },
    /// A thread fell too far behind within one tick and was moved to the
    /// next grid point after the current time.
    CatchUpLimit { thread: ThreadId, skipped: u64 },
}

impl fmt::Display for ScheduleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleWarning::Overrun {
                thread,
                scheduled,
                finished,
            } => write!(
                f,
                "thread {} overran its period: next firing was due at {:.3}s, finished at {:.3}s",
                thread, scheduled, finished
            ),
            ScheduleWarning::CatchUpLimit { thread, skipped } => write!(
                f,
                "thread {} fell behind and skipped {} firing(s)",
                thread, skipped
            ),
        }
    }
}

/// One run of a thread during a tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Firing {
    pub thread: ThreadId,
    pub at: f64,
    pub resumed: bool,
}

/// A thread that failed and was cancelled.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadFailure {
    pub thread: ThreadId,
    pub error: EvalError,
    /// Innermost expression that failed, rendered as an s-expression.
    pub expr: String,
    /// Functions active at the failure, outermost first.
    pub calls: Vec<Symbol>,
}

impl fmt::Display for ThreadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {} failed in {}", self.thread, self.expr)?;
        if !self.calls.is_empty() {
            let calls: Vec<&str> = self.calls.iter().map(|name| name.as_str()).collect();
            write!(f, " (via {})", calls.join(" > "))?;
        }
        write!(f, ": {}", self.error)
    }
}

/// Everything that happened while advancing the clock once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub now: f64,
    pub firings: Vec<Firing>,
    pub warnings: Vec<ScheduleWarning>,
    pub failures: Vec<ThreadFailure>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.firings.is_empty() && self.warnings.is_empty() && self.failures.is_empty()
    }
}

/// A logical thread owned by the scheduler.
#[derive(Clone, Debug)]
pub struct ScheduledThread {
    pub id: ThreadId,
    pub kind: ThreadKind,
    pub env: EnvId,
    pub status: ThreadStatus,
    pub next_fire: f64,
    /// Start of the firing in progress (or the last one).
    pub fire_start: f64,
    /// Grid origin and firing count, so fire times are `origin + n * period`
    /// rather than an accumulated sum.
    origin: f64,
    fired: u64,
    period_secs: f64,
    continuation: Option<Vec<ResumeFrame>>,
}

/// Read-only view of a thread for introspection.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub status: ThreadStatus,
    pub next_fire: f64,
    pub period: Option<Span>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    threads: BTreeMap<ThreadId, ScheduledThread>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> ThreadId {
        self.next_id += 1;
        ThreadId(self.next_id)
    }

    /// Register a repeating thread whose first firing is at `start`.
    ///
    /// `period_secs` is the period resolved at creation time; later firings
    /// re-resolve `period` against the clock.
    pub fn spawn_every(
        &mut self,
        period: Span,
        period_secs: f64,
        body: Arc<Expr>,
        env: EnvId,
        start: f64,
    ) -> ThreadId {
        let id = self.allocate_id();
        log::debug!(
            "[SCHEDULER] Spawned thread {} every {} starting at {:.3}s",
            id,
            period,
            start
        );
        self.threads.insert(
            id,
            ScheduledThread {
                id,
                kind: ThreadKind::Every { period, body },
                env,
                status: ThreadStatus::Pending,
                next_fire: start,
                fire_start: start,
                origin: start,
                fired: 0,
                period_secs,
                continuation: None,
            },
        );
        id
    }

    /// Register a one-shot thread that resumes `suspension` when it wakes.
    pub fn spawn_continuation(&mut self, suspension: Suspension, env: EnvId) -> ThreadId {
        let id = self.allocate_id();
        log::debug!(
            "[SCHEDULER] Spawned continuation {} waking at {:.3}s",
            id,
            suspension.wake_at
        );
        self.threads.insert(
            id,
            ScheduledThread {
                id,
                kind: ThreadKind::Once,
                env,
                status: ThreadStatus::Suspended,
                next_fire: suspension.wake_at,
                fire_start: suspension.wake_at,
                origin: suspension.wake_at,
                fired: 0,
                period_secs: 0.0,
                continuation: Some(suspension.frames),
            },
        );
        id
    }

    /// Cancel a thread. Returns whether anything changed.
    ///
    /// Unknown and already-cancelled ids are a no-op. A thread cancelled
    /// while it is running finishes the current firing and then stops.
    pub fn cancel(&mut self, id: ThreadId) -> bool {
        let Some(thread) = self.threads.get_mut(&id) else {
            return false;
        };
        if thread.status == ThreadStatus::Cancelled {
            return false;
        }
        thread.status = ThreadStatus::Cancelled;
        thread.continuation = None;
        log::debug!("[SCHEDULER] Cancelled thread {}", id);
        true
    }

    /// Current status of `id`, or `None` once it has been removed.
    pub fn status(&self, id: ThreadId) -> Option<ThreadStatus> {
        self.threads.get(&id).map(|thread| thread.status)
    }

    /// The first due thread not in `skip`.
    pub fn next_ready(&self, now: f64, skip: &HashSet<ThreadId>) -> Option<(f64, ThreadId)> {
        self.threads
            .values()
            .filter(|thread| is_waiting(thread) && thread.next_fire <= now)
            .filter(|thread| !skip.contains(&thread.id))
            .map(|thread| (thread.next_fire, thread.id))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
    }

    /// Earliest time at which any live thread is due.
    pub fn next_due(&self) -> Option<f64> {
        self.threads
            .values()
            .filter(|thread| is_waiting(thread))
            .map(|thread| thread.next_fire)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Mark `id` running and hand out what to evaluate.
    pub fn begin_firing(&mut self, id: ThreadId) -> Option<Activation> {
        let thread = self.threads.get_mut(&id)?;
        let at = thread.next_fire;
        let activation = match (thread.status, &thread.kind) {
            (ThreadStatus::Suspended, _) => Activation::Resume {
                frames: thread.continuation.take().unwrap_or_default(),
                at,
            },
            (ThreadStatus::Pending, ThreadKind::Every { body, .. }) => {
                thread.fire_start = at;
                Activation::Fire {
                    body: Arc::clone(body),
                    env: thread.env,
                    at,
                }
            }
            _ => return None,
        };
        thread.status = ThreadStatus::Running;
        Some(activation)
    }

    /// Park a running thread at a `sleep`.
    pub fn suspend(&mut self, id: ThreadId, suspension: Suspension) {
        let Some(thread) = self.threads.get_mut(&id) else {
            return;
        };
        if thread.status == ThreadStatus::Cancelled {
            return;
        }
        thread.status = ThreadStatus::Suspended;
        thread.next_fire = suspension.wake_at;
        thread.continuation = Some(suspension.frames);
    }

    /// Finish the current firing of `id`, which ended at logical time
    /// `finished_at`.
    ///
    /// Repeating threads are rescheduled on their grid; one-shot and
    /// cancelled threads are removed.
    pub fn complete(
        &mut self,
        id: ThreadId,
        finished_at: f64,
        clock: &Clock,
    ) -> Option<ScheduleWarning> {
        let thread = self.threads.get_mut(&id)?;
        let period = match &thread.kind {
            ThreadKind::Every { period, .. } if thread.status != ThreadStatus::Cancelled => {
                Some(*period)
            }
            _ => None,
        };
        let Some(period) = period else {
            self.threads.remove(&id);
            return None;
        };

        let period_secs = clock.duration_at(period, finished_at);
        if period_secs != thread.period_secs {
            // Tempo changed: restart the grid at this firing.
            thread.origin = thread.fire_start;
            thread.fired = 0;
            thread.period_secs = period_secs;
        }
        thread.fired += 1;
        let scheduled = thread.origin + thread.fired as f64 * period_secs;
        thread.status = ThreadStatus::Pending;

        if finished_at > scheduled + OVERRUN_EPSILON {
            thread.origin = finished_at;
            thread.fired = 0;
            thread.next_fire = finished_at;
            return Some(ScheduleWarning::Overrun {
                thread: id,
                scheduled,
                finished: finished_at,
            });
        }
        thread.next_fire = scheduled;
        None
    }

    /// Move a repeating thread that is behind to its first grid point after
    /// `now`. Returns the number of firings skipped.
    pub fn rephase(&mut self, id: ThreadId, now: f64) -> Option<u64> {
        let thread = self.threads.get_mut(&id)?;
        if thread.status != ThreadStatus::Pending || thread.period_secs <= 0.0 {
            return None;
        }
        let elapsed = (now - thread.origin).max(0.0);
        let target = (elapsed / thread.period_secs).floor() as u64 + 1;
        let skipped = target.saturating_sub(thread.fired);
        thread.fired = target;
        thread.next_fire = thread.origin + target as f64 * thread.period_secs;
        Some(skipped)
    }

    /// Drop cancelled threads.
    pub fn reap(&mut self) -> usize {
        let before = self.threads.len();
        self.threads
            .retain(|_, thread| thread.status != ThreadStatus::Cancelled);
        before - self.threads.len()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        self.threads
            .values()
            .map(|thread| ThreadSnapshot {
                id: thread.id,
                status: thread.status,
                next_fire: thread.next_fire,
                period: match &thread.kind {
                    ThreadKind::Every { period, .. } => Some(*period),
                    ThreadKind::Once => None,
                },
            })
            .collect()
    }

    /// Environments reachable from live threads and their continuations.
    pub fn roots(&self) -> Vec<EnvId> {
        let mut roots = Vec::new();
        for thread in self.threads.values() {
            if thread.status == ThreadStatus::Cancelled {
                continue;
            }
            roots.push(thread.env);
            if let Some(frames) = &thread.continuation {
                for frame in frames {
                    frame.trace_envs(&mut roots);
                }
            }
        }
        roots
    }
}

fn is_waiting(thread: &ScheduledThread) -> bool {
    matches!(
        thread.status,
        ThreadStatus::Pending | ThreadStatus::Suspended
    )
}
