//! The adapter contract and the shared execution services.
//!
//! Every backend — local process, SSH, Docker, mock, custom — implements
//! [`ExecAdapter`]. The engine never talks to a backend any other way, and an
//! adapter never holds a reference back to the engine: the per-command
//! [`ExecDefaults`] are passed into every `execute` call instead, so chained
//! engine views can share adapter instances freely.
//!
//! The free functions in this module are the "base class" services the spec
//! groups under the adapter base: default merging, environment composition,
//! the timeout/cancellation race, and result assembly with the
//! throw-on-nonzero policy. Adapters call them rather than reimplementing
//! the discipline, which keeps the semantics identical across backends.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, ShellSpec, StdioMode};
use crate::constants::{DEFAULT_MAX_BUFFER_BYTES, DEFAULT_TIMEOUT_MS, DEFAULT_TIMEOUT_SIGNAL};
use crate::error::{ExecutionError, Result};
use crate::result::ExecResult;
use crate::stream::Encoding;

/// Per-execution defaults the engine resolves before dispatch.
///
/// A command's own fields always win; these fill the gaps.
#[derive(Debug, Clone)]
pub struct ExecDefaults {
    /// `None` disables the wall-clock cutoff.
    pub timeout_ms: Option<u64>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub shell: ShellSpec,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
    pub encoding: Encoding,
    pub max_buffer_bytes: usize,
    pub throw_on_nonzero: bool,
    pub timeout_signal: String,
    /// Directory prepended to the composed PATH when set.
    pub prefer_local: Option<PathBuf>,
    /// Script fragments wrapped around shell-mode expressions.
    pub prefix: String,
    pub postfix: String,
    pub detached: bool,
}

impl Default for ExecDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            cwd: None,
            env: HashMap::new(),
            shell: ShellSpec::Off,
            stdout: StdioMode::Pipe,
            stderr: StdioMode::Pipe,
            encoding: Encoding::Utf8,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            throw_on_nonzero: false,
            timeout_signal: DEFAULT_TIMEOUT_SIGNAL.to_string(),
            prefer_local: None,
            prefix: String::new(),
            postfix: String::new(),
            detached: false,
        }
    }
}

/// A pluggable execution backend.
#[async_trait]
pub trait ExecAdapter: Send + Sync {
    /// Short stable adapter tag ("local", "ssh", "docker", "mock", ...).
    fn name(&self) -> &'static str;

    /// Run one command to completion, failing with the crate taxonomy.
    async fn execute(&self, command: Command, defaults: &ExecDefaults) -> Result<ExecResult>;

    /// Blocking variant. Adapters that cannot support it report
    /// `AdapterUnavailable`.
    fn execute_sync(&self, _command: Command, _defaults: &ExecDefaults) -> Result<ExecResult> {
        Err(ExecutionError::adapter(
            self.name(),
            "execute_sync",
            "synchronous execution is not supported by this adapter",
        ))
    }

    /// Cheap availability probe used by the engine for graceful degradation.
    async fn is_available(&self) -> bool {
        true
    }

    /// Idempotent release of pooled resources.
    async fn dispose(&self) {}
}

/// Outcome of racing an adapter's work against its limits.
#[derive(Debug)]
pub enum RaceOutcome<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

/// Race `work` against the wall-clock cutoff and the cancellation token.
///
/// The caller performs its own cleanup (signalling the child, evicting a
/// pool entry) on the `TimedOut`/`Cancelled` arms — cleanup differs per
/// adapter, the race does not.
pub async fn await_with_limits<F, T>(
    work: F,
    limit: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> RaceOutcome<T>
where
    F: Future<Output = T>,
{
    let timer = async {
        match limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = work => RaceOutcome::Completed(result),
        () = timer => RaceOutcome::TimedOut,
        () = cancelled => RaceOutcome::Cancelled,
    }
}

/// The effective wall-clock cutoff for a command. An explicit `0` disables
/// the cutoff regardless of defaults.
pub fn effective_timeout(command: &Command, defaults: &ExecDefaults) -> Option<Duration> {
    let ms = match command.timeout_ms {
        Some(0) => return None,
        Some(ms) => ms,
        None => match defaults.timeout_ms {
            Some(0) | None => return None,
            Some(ms) => ms,
        },
    };
    Some(Duration::from_millis(ms))
}

/// The signal delivered on timeout or post-start cancellation.
pub fn effective_timeout_signal(command: &Command, defaults: &ExecDefaults) -> String {
    command
        .timeout_signal
        .clone()
        .unwrap_or_else(|| defaults.timeout_signal.clone())
}

pub fn effective_shell(command: &Command, defaults: &ExecDefaults) -> ShellSpec {
    command.shell.clone().unwrap_or_else(|| defaults.shell.clone())
}

pub fn effective_cwd(command: &Command, defaults: &ExecDefaults) -> Option<PathBuf> {
    command.cwd.clone().or_else(|| defaults.cwd.clone())
}

pub fn effective_stdout(command: &Command, defaults: &ExecDefaults) -> StdioMode {
    command.stdout.unwrap_or(defaults.stdout)
}

pub fn effective_stderr(command: &Command, defaults: &ExecDefaults) -> StdioMode {
    command.stderr.unwrap_or(defaults.stderr)
}

/// Fail fast when the caller cancelled before the adapter did anything.
pub fn ensure_not_cancelled(adapter: &str, command: &Command) -> Result<()> {
    if command
        .cancel
        .as_ref()
        .is_some_and(CancellationToken::is_cancelled)
    {
        return Err(ExecutionError::aborted(adapter));
    }
    Ok(())
}

/// Compose the environment overlay for a command: engine defaults first,
/// per-command entries on top. Empty-string values are preserved.
///
/// A PATH supplied by either layer is concatenated in front of the process
/// PATH rather than replacing it, and `prefer_local` (when set) is prepended
/// in front of everything.
pub fn compose_env(command: &Command, defaults: &ExecDefaults) -> HashMap<String, String> {
    let mut env = defaults.env.clone();
    for (key, value) in &command.env {
        env.insert(key.clone(), value.clone());
    }

    let path_override = env.remove("PATH");
    let mut path_parts: Vec<String> = Vec::new();
    if let Some(dir) = &defaults.prefer_local {
        path_parts.push(dir.to_string_lossy().into_owned());
    }
    if let Some(supplied) = path_override {
        path_parts.push(supplied);
    }
    if !path_parts.is_empty() {
        if let Ok(process_path) = std::env::var("PATH") {
            path_parts.push(process_path);
        }
        let sep = if cfg!(windows) { ";" } else { ":" };
        env.insert("PATH".to_string(), path_parts.join(sep));
    }

    env
}

/// Wall-clock bookkeeping for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimer {
    started_at: SystemTime,
    started: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Finish the timer and assemble a result skeleton. Output fields are
    /// filled by the caller via [`ResultParts`].
    pub fn finish(self, parts: ResultParts<'_>) -> ExecResult {
        let finished_at = SystemTime::now();
        ExecResult {
            command: parts.command.to_string(),
            stdout: parts.encoding.decode(&parts.stdout),
            stderr: parts.encoding.decode(&parts.stderr),
            stdout_bytes: parts.stdout,
            stderr_bytes: parts.stderr,
            exit_code: parts.exit_code,
            signal: parts.signal,
            started_at: self.started_at,
            finished_at,
            duration_ms: self.elapsed_ms(),
            adapter: parts.adapter.to_string(),
            host: parts.host,
            container: parts.container,
        }
    }
}

/// Raw output of a finished child, ready for assembly.
#[derive(Debug)]
pub struct ResultParts<'a> {
    pub command: &'a str,
    pub adapter: &'a str,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub signal: Option<String>,
    pub encoding: Encoding,
    pub host: Option<String>,
    pub container: Option<String>,
}

/// Apply the throw-on-nonzero policy at the adapter boundary.
pub fn apply_throw_policy(result: ExecResult, throw_on_nonzero: bool) -> Result<ExecResult> {
    if throw_on_nonzero {
        result.checked()
    } else {
        Ok(result)
    }
}

/// Wrap an otherwise-unclassified adapter failure into the taxonomy,
/// preserving the cause text.
pub fn wrap_unexpected(adapter: &str, operation: &str, err: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::adapter(adapter, operation, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_zero_timeout_disables_cutoff() {
        let defaults = ExecDefaults::default();
        let cmd = Command::new("sleep").timeout_ms(0);
        assert_eq!(effective_timeout(&cmd, &defaults), None);

        let cmd = Command::new("sleep");
        assert_eq!(
            effective_timeout(&cmd, &defaults),
            Some(Duration::from_millis(DEFAULT_TIMEOUT_MS))
        );

        let cmd = Command::new("sleep").timeout_ms(250);
        assert_eq!(
            effective_timeout(&cmd, &defaults),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn env_composition_layers_and_preserves_empty() {
        let mut defaults = ExecDefaults::default();
        defaults.env.insert("A".into(), "default".into());
        defaults.env.insert("B".into(), "kept".into());

        let cmd = Command::new("true").env("A", "override").env("C", "");
        let env = compose_env(&cmd, &defaults);
        assert_eq!(env.get("A").map(String::as_str), Some("override"));
        assert_eq!(env.get("B").map(String::as_str), Some("kept"));
        assert_eq!(env.get("C").map(String::as_str), Some(""));
    }

    #[test]
    fn path_override_concatenates() {
        let defaults = ExecDefaults::default();
        let cmd = Command::new("true").env("PATH", "/custom/bin");
        let env = compose_env(&cmd, &defaults);
        let path = env.get("PATH").expect("PATH composed");
        assert!(path.starts_with("/custom/bin"));
        if let Ok(process_path) = std::env::var("PATH") {
            assert!(path.ends_with(&process_path));
        }
    }

    #[tokio::test]
    async fn race_completes_before_limits() {
        let outcome = await_with_limits(
            async { 7 },
            Some(Duration::from_secs(5)),
            None,
        )
        .await;
        assert!(matches!(outcome, RaceOutcome::Completed(7)));
    }

    #[tokio::test]
    async fn race_times_out() {
        let outcome = await_with_limits(
            std::future::pending::<()>(),
            Some(Duration::from_millis(20)),
            None,
        )
        .await;
        assert!(matches!(outcome, RaceOutcome::TimedOut));
    }

    #[tokio::test]
    async fn race_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome =
            await_with_limits(std::future::pending::<()>(), None, Some(&token)).await;
        assert!(matches!(outcome, RaceOutcome::Cancelled));
    }

    #[test]
    fn pre_start_cancel_is_aborted() {
        let token = CancellationToken::new();
        token.cancel();
        let cmd = Command::new("true").cancel_token(token);
        let err = ensure_not_cancelled("local", &cmd).unwrap_err();
        match err {
            ExecutionError::AdapterUnavailable { operation, .. } => {
                assert_eq!(operation, "aborted");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
