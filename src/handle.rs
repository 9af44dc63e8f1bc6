//! First-class handles to in-flight executions.
//!
//! A [`RunningHandle`] is the ownership-strict rendering of a
//! promise-with-methods: owned stdout/stderr byte streams, an stdin sink,
//! control methods, and a completion future reachable through `IntoFuture`.
//!
//! The underlying task starts lazily — on the first stream access or on
//! await — so the fluent configuration (`timeout`, `quiet`, `no_throw`)
//! can never race the spawn.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, SignalOverride};
use crate::engine::{Engine, RunFlags};
use crate::error::{ExecutionError, Result};
use crate::result::ExecResult;

struct Pending {
    engine: Engine,
    command: Command,
}

/// An in-flight (or not-yet-started) execution.
pub struct RunningHandle {
    pending: Option<Pending>,
    task: Option<JoinHandle<Result<ExecResult>>>,
    stdout_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stderr_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    cancel: CancellationToken,
    timeout_override: Option<u64>,
    signal_override: SignalOverride,
    default_kill_signal: String,
    no_throw: bool,
    quiet: bool,
}

impl std::fmt::Debug for RunningHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningHandle")
            .field("started", &self.pending.is_none())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RunningHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: Engine,
        command: Command,
        cancel: CancellationToken,
        stdout_rx: mpsc::Receiver<Vec<u8>>,
        stderr_rx: mpsc::Receiver<Vec<u8>>,
        stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
        signal_override: SignalOverride,
        default_kill_signal: String,
    ) -> Self {
        Self {
            pending: Some(Pending { engine, command }),
            task: None,
            stdout_rx: Some(stdout_rx),
            stderr_rx: Some(stderr_rx),
            stdin_tx,
            cancel,
            timeout_override: None,
            signal_override,
            default_kill_signal,
            no_throw: false,
            quiet: false,
        }
    }

    // ---- fluent configuration (before start) -------------------------

    /// Override the wall-clock cutoff for this run.
    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_override = Some(ms);
        self
    }

    /// Suppress the verbose command echo for this run.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Override throw-on-nonzero for this run: a non-zero exit resolves as
    /// a normal result.
    pub fn no_throw(mut self) -> Self {
        self.no_throw = true;
        self
    }

    // ---- control ------------------------------------------------------

    /// Cancel the execution. Before start this prevents the spawn entirely;
    /// after start the child is signalled. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Kill the running child with `signal` (the engine's kill signal when
    /// `None`). Starts the execution if it has not started yet, so the kill
    /// has something to act on.
    pub fn kill(&mut self, signal: Option<&str>) {
        let chosen = signal
            .map(str::to_string)
            .unwrap_or_else(|| self.default_kill_signal.clone());
        if let Ok(mut slot) = self.signal_override.lock() {
            *slot = Some(chosen);
        }
        self.ensure_started();
        self.cancel.cancel();
    }

    // ---- streams ------------------------------------------------------

    /// Take the live stdout byte stream. Starts the execution.
    pub fn stdout(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.ensure_started();
        self.stdout_rx.take()
    }

    /// Take the live stderr byte stream. Starts the execution.
    pub fn stderr(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.ensure_started();
        self.stderr_rx.take()
    }

    /// A sink feeding the child's stdin. `None` when the command carried
    /// its own stdin source. The child sees EOF once every sender clone is
    /// dropped (the handle drops its own on await).
    pub fn stdin(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.stdin_tx.clone()
    }

    // ---- completion ---------------------------------------------------

    fn ensure_started(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let Pending {
            engine,
            mut command,
        } = pending;
        if let Some(ms) = self.timeout_override {
            command.timeout_ms = Some(ms);
        }
        let flags = RunFlags {
            no_throw: self.no_throw,
            quiet: self.quiet,
        };
        self.task = Some(tokio::spawn(async move {
            engine.execute_with(command, flags).await
        }));
    }

    /// Await completion. Drops the handle's stdin sender so a child reading
    /// stdin sees EOF.
    pub async fn wait(mut self) -> Result<ExecResult> {
        self.ensure_started();
        drop(self.stdin_tx.take());
        let Some(task) = self.task.take() else {
            return Err(ExecutionError::adapter(
                "engine",
                "handle",
                "execution task vanished",
            ));
        };
        match task.await {
            Ok(result) => result,
            Err(join_err) => Err(ExecutionError::adapter(
                "engine",
                "handle",
                join_err.to_string(),
            )),
        }
    }

    /// The exit code, regardless of the throw policy.
    pub async fn exit_code(self) -> Result<i32> {
        match self.wait().await {
            Ok(result) => Ok(result.exit_code),
            Err(ExecutionError::CommandFailed { result, .. }) => Ok(result.exit_code),
            Err(other) => Err(other),
        }
    }
}

impl IntoFuture for RunningHandle {
    type Output = Result<ExecResult>;
    type IntoFuture = BoxFuture<'static, Result<ExecResult>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
