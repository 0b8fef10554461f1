//! Driver thread that owns an [`Interpreter`] and ticks it from the wall
//! clock.
//!
//! Other threads never touch the interpreter. They talk to it through a
//! [`RuntimeHandle`], which sends [`RuntimeMessage`]s over a channel; the
//! driver drains the channel, ticks, and sleeps for the configured interval.

use crate::ast::Expr;
use crate::builtins::{AudioEngine, ConsoleSink, LogSink, NullEngine};
use crate::config::Config;
use crate::error::EvalError;
use crate::interpreter::Interpreter;
use crate::scheduler::{ThreadId, ThreadSnapshot, TickReport};
use crate::timing::TimeMode;
use crate::value::Value;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Reports kept for the host before new ones are dropped.
const REPORT_BACKLOG: usize = 256;

/// Messages accepted by the driver thread.
pub enum RuntimeMessage {
    /// Evaluate at top level. The result is sent to `reply` if present.
    Eval {
        expr: Expr,
        reply: Option<Sender<std::result::Result<Value, EvalError>>>,
    },
    Cancel {
        thread: ThreadId,
    },
    SetTimeMode {
        mode: TimeMode,
    },
    Status {
        reply: Sender<RuntimeStatus>,
    },
}

/// Point-in-time view of the driver.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeStatus {
    pub now: f64,
    pub bpm: f64,
    pub beat: f64,
    pub threads: Vec<ThreadSnapshot>,
}

/// Handle to the running driver thread.
#[derive(Clone)]
pub struct RuntimeHandle {
    message_tx: Sender<RuntimeMessage>,
    report_rx: Receiver<TickReport>,
    shutdown: Arc<AtomicBool>,
}

impl RuntimeHandle {
    /// Send a message to the runtime thread.
    pub fn send(&self, msg: RuntimeMessage) -> Result<()> {
        self.message_tx
            .send(msg)
            .map_err(|e| anyhow::anyhow!("Failed to send message: {}", e))
    }

    /// Evaluate `expr` on the driver thread and wait for the result.
    pub fn eval(&self, expr: Expr) -> Result<Value> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(RuntimeMessage::Eval {
            expr,
            reply: Some(reply_tx),
        })?;
        let result = reply_rx
            .recv()
            .context("Runtime thread stopped before replying")?;
        Ok(result?)
    }

    /// Queue `expr` for evaluation without waiting.
    pub fn eval_detached(&self, expr: Expr) -> Result<()> {
        self.send(RuntimeMessage::Eval { expr, reply: None })
    }

    /// Cancel a scheduled thread on the driver thread.
    pub fn cancel(&self, thread: ThreadId) -> Result<()> {
        self.send(RuntimeMessage::Cancel { thread })
    }

    /// Switch the wall-to-logical mapping from the next tick on.
    pub fn set_time_mode(&self, mode: TimeMode) -> Result<()> {
        self.send(RuntimeMessage::SetTimeMode { mode })
    }

    /// Query logical time, tempo, beat and live threads.
    pub fn status(&self) -> Result<RuntimeStatus> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(RuntimeMessage::Status { reply: reply_tx })?;
        reply_rx
            .recv()
            .context("Runtime thread stopped before replying")
    }

    /// Tick reports with firings, warnings or failures since the last call.
    pub fn drain_reports(&self) -> Vec<TickReport> {
        self.report_rx.try_iter().collect()
    }

    /// Signal the runtime to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Owns the driver thread. Dropping it shuts the thread down and joins it.
pub struct Runtime {
    handle: RuntimeHandle,
    thread_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Start with a silent audio engine and `print` routed to the log.
    pub fn start(config: Config) -> Result<Self> {
        Self::start_with(config, NullEngine, LogSink)
    }

    /// Build an interpreter from `config` with the given engine and console
    /// and spawn the driver thread that owns it.
    pub fn start_with(
        config: Config,
        engine: impl AudioEngine + 'static,
        console: impl ConsoleSink + 'static,
    ) -> Result<Self> {
        let interval = config.tick_interval().context("Invalid tick interval")?;
        let interpreter = Interpreter::from_config(&config)
            .context("Invalid runtime configuration")?
            .with_engine(engine)
            .with_console(console);

        let (message_tx, message_rx) = unbounded();
        let (report_tx, report_rx) = bounded(REPORT_BACKLOG);
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = RuntimeHandle {
            message_tx,
            report_rx,
            shutdown: shutdown.clone(),
        };

        log::info!(
            "[RUNTIME] Starting driver thread (tick every {})",
            humantime::format_duration(interval)
        );
        let thread_shutdown = shutdown.clone();
        let thread_handle = thread::Builder::new()
            .name("callisto-runtime".to_string())
            .spawn(move || {
                let mut rt = RuntimeThread {
                    interpreter,
                    message_rx,
                    report_tx,
                    started: Instant::now(),
                };
                rt.run(thread_shutdown, interval);
            })
            .context("Failed to spawn runtime thread")?;

        Ok(Self {
            handle,
            thread_handle: Some(thread_handle),
        })
    }

    /// Get a handle to interact with the runtime.
    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    /// Shut down the runtime gracefully.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("[RUNTIME] Driver thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RuntimeThread {
    interpreter: Interpreter,
    message_rx: Receiver<RuntimeMessage>,
    report_tx: Sender<TickReport>,
    started: Instant,
}

impl RuntimeThread {
    fn run(&mut self, shutdown: Arc<AtomicBool>, interval: Duration) {
        while !shutdown.load(Ordering::Relaxed) {
            self.drain_messages();
            self.tick();
            thread::sleep(interval);
        }
        log::info!("[RUNTIME] Driver thread stopped");
    }

    fn drain_messages(&mut self) {
        while let Ok(msg) = self.message_rx.try_recv() {
            self.handle_message(msg);
        }
    }

    fn handle_message(&mut self, msg: RuntimeMessage) {
        match msg {
            RuntimeMessage::Eval { expr, reply } => {
                let result = self.interpreter.eval(&expr);
                if let Err(e) = &result {
                    log::warn!("[RUNTIME] Evaluation failed: {}", e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            RuntimeMessage::Cancel { thread } => {
                self.interpreter.cancel(thread);
            }
            RuntimeMessage::SetTimeMode { mode } => {
                self.interpreter.set_time_mode(mode);
            }
            RuntimeMessage::Status { reply } => {
                let clock = self.interpreter.clock();
                let _ = reply.send(RuntimeStatus {
                    now: clock.now(),
                    bpm: clock.bpm(),
                    beat: clock.current_beat(),
                    threads: self.interpreter.threads(),
                });
            }
        }
    }

    fn tick(&mut self) {
        let wall = self.started.elapsed().as_secs_f64();
        match self.interpreter.tick(wall) {
            Ok(report) if !report.is_quiet() => {
                if let Err(TrySendError::Full(_)) = self.report_tx.try_send(report) {
                    log::trace!("[RUNTIME] Report backlog full, dropping tick report");
                }
            }
            Ok(_) => {}
            Err(e) => log::error!("[RUNTIME] Tick failed: {}", e),
        }
    }
}
