//! Local process adapter.
//!
//! Runs commands as child processes on the host, either by direct exec or
//! through a discovered POSIX shell. This is the default backend and the one
//! every engine instance always carries.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;

use crate::adapter::{
    ExecAdapter, ExecDefaults, ExecutionTimer, ResultParts, apply_throw_policy, compose_env,
    effective_cwd, effective_shell, effective_stderr, effective_stdout, effective_timeout,
    effective_timeout_signal, ensure_not_cancelled, wrap_unexpected,
};
use crate::adapters::child::{ChildLimits, Supervised, supervise};
use crate::command::{Command, ShellSpec, StdinSource, StdioMode};
use crate::constants::SHELL_CANDIDATES;
use crate::error::{ExecutionError, Result};
use crate::quote::escape;
use crate::result::ExecResult;

/// Host-process execution backend.
#[derive(Debug, Default)]
pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// The program + argv an invocation resolves to, plus its display line.
struct Invocation {
    program: String,
    argv: Vec<String>,
    display: String,
}

/// Pick the first POSIX shell present on this host.
#[cfg(not(windows))]
fn find_default_shell() -> Result<String> {
    for candidate in SHELL_CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok((*candidate).to_string());
        }
    }
    Err(ExecutionError::adapter(
        "local",
        "no_shell",
        format!("no POSIX shell found among {SHELL_CANDIDATES:?}"),
    ))
}

#[cfg(windows)]
fn find_default_shell() -> Result<String> {
    Ok("cmd.exe".to_string())
}

/// Resolve shell interpretation for a command.
///
/// In shell mode any explicit args are inlined into the expression,
/// shell-escaped, and the configured prefix/postfix fragments wrap the
/// script.
fn resolve_invocation(
    command: &Command,
    shell: &ShellSpec,
    defaults: &ExecDefaults,
) -> Result<Invocation> {
    match shell {
        ShellSpec::Off => Ok(Invocation {
            program: command.program.clone(),
            argv: command.args.clone(),
            display: command.display_line(),
        }),
        ShellSpec::Default | ShellSpec::Program(_) => {
            let interpreter = match shell {
                ShellSpec::Program(path) => path.clone(),
                _ => find_default_shell()?,
            };
            let mut script = command.program.clone();
            for arg in &command.args {
                script.push(' ');
                script.push_str(&escape(arg));
            }
            let wrapped = format!("{}{}{}", defaults.prefix, script, defaults.postfix);
            let flag = if cfg!(windows) { "/C" } else { "-c" };
            Ok(Invocation {
                program: interpreter,
                argv: vec![flag.to_string(), wrapped],
                display: script,
            })
        }
    }
}

fn stdio_for(mode: StdioMode) -> Stdio {
    match mode {
        StdioMode::Pipe => Stdio::piped(),
        StdioMode::Inherit => Stdio::inherit(),
        StdioMode::Ignore => Stdio::null(),
    }
}

/// Reject a missing working directory up front so the failure is
/// distinguishable from a missing executable.
fn check_cwd(cwd: Option<&Path>) -> Result<()> {
    if let Some(dir) = cwd
        && !dir.is_dir()
    {
        return Err(ExecutionError::adapter(
            "local",
            "chdir",
            format!("working directory does not exist: {}", dir.display()),
        ));
    }
    Ok(())
}

fn map_spawn_error(err: std::io::Error, program: &str, cwd: Option<&Path>) -> ExecutionError {
    if err.kind() == std::io::ErrorKind::NotFound {
        let cwd_note = cwd
            .map(|d| format!(" (cwd: {})", d.display()))
            .unwrap_or_default();
        ExecutionError::adapter(
            "local",
            "spawn_enoent",
            format!("program not found: {program}{cwd_note}"),
        )
    } else {
        wrap_unexpected("local", "spawn", err)
    }
}

#[async_trait]
impl ExecAdapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(&self, mut command: Command, defaults: &ExecDefaults) -> Result<ExecResult> {
        ensure_not_cancelled("local", &command)?;

        let cwd = effective_cwd(&command, defaults);
        check_cwd(cwd.as_deref())?;

        let shell = effective_shell(&command, defaults);
        let invocation = resolve_invocation(&command, &shell, defaults)?;
        let timeout = effective_timeout(&command, defaults);
        let signal = effective_timeout_signal(&command, defaults);
        let detached = command.detached || defaults.detached;

        tracing::debug!(
            adapter = "local",
            command = %invocation.display,
            ?timeout,
            "spawning child process"
        );

        let mut proc = tokio::process::Command::new(&invocation.program);
        proc.args(&invocation.argv)
            .envs(compose_env(&command, defaults))
            .stdin(if command.stdin.is_null() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(stdio_for(effective_stdout(&command, defaults)))
            .stderr(stdio_for(effective_stderr(&command, defaults)))
            .kill_on_drop(false);
        if let Some(dir) = &cwd {
            proc.current_dir(dir);
        }
        #[cfg(unix)]
        if detached {
            proc.process_group(0);
        }

        let timer = ExecutionTimer::start();
        let child = proc
            .spawn()
            .map_err(|e| map_spawn_error(e, &invocation.program, cwd.as_deref()))?;

        let stdin = std::mem::take(&mut command.stdin);
        let observers = std::mem::take(&mut command.observers);
        let limits = ChildLimits {
            timeout,
            cancel: command.cancel.clone(),
            signal,
            signal_override: observers.kill_signal.clone(),
            process_group: detached,
        };

        let supervised = supervise(
            "local",
            child,
            stdin,
            observers,
            defaults.max_buffer_bytes,
            defaults.encoding,
            limits,
        )
        .await?;

        match supervised {
            Supervised::Finished {
                exit_code,
                signal,
                stdout,
                stderr,
            } => {
                let result = timer.finish(ResultParts {
                    command: &invocation.display,
                    adapter: "local",
                    stdout,
                    stderr,
                    exit_code,
                    signal,
                    encoding: defaults.encoding,
                    host: None,
                    container: None,
                });
                apply_throw_policy(result, defaults.throw_on_nonzero)
            }
            Supervised::TimedOut => Err(ExecutionError::Timeout {
                command: invocation.display,
                limit_ms: timeout.map(|d| d.as_millis() as u64).unwrap_or_default(),
            }),
            Supervised::Cancelled {
                signal,
                stdout,
                stderr,
            } => {
                let result = timer.finish(ResultParts {
                    command: &invocation.display,
                    adapter: "local",
                    stdout,
                    stderr,
                    exit_code: 0,
                    signal: Some(signal),
                    encoding: defaults.encoding,
                    host: None,
                    container: None,
                });
                apply_throw_policy(result, defaults.throw_on_nonzero)
            }
        }
    }

    /// Blocking variant on `std::process`. The wall-clock cutoff is not
    /// enforced here; callers needing timeouts use the async path. A live
    /// stdin stream cannot be driven without a runtime and is refused.
    fn execute_sync(&self, command: Command, defaults: &ExecDefaults) -> Result<ExecResult> {
        ensure_not_cancelled("local", &command)?;
        if command.stdin.is_stream() {
            return Err(ExecutionError::adapter(
                "local",
                "stdin_stream",
                "streamed stdin requires asynchronous execution",
            ));
        }

        let cwd = effective_cwd(&command, defaults);
        check_cwd(cwd.as_deref())?;
        let shell = effective_shell(&command, defaults);
        let invocation = resolve_invocation(&command, &shell, defaults)?;

        let mut proc = std::process::Command::new(&invocation.program);
        proc.args(&invocation.argv)
            .envs(compose_env(&command, defaults))
            .stdin(match &command.stdin {
                StdinSource::Null => Stdio::null(),
                _ => Stdio::piped(),
            })
            .stdout(stdio_for(effective_stdout(&command, defaults)))
            .stderr(stdio_for(effective_stderr(&command, defaults)));
        if let Some(dir) = &cwd {
            proc.current_dir(dir);
        }

        let timer = ExecutionTimer::start();
        let mut child = proc
            .spawn()
            .map_err(|e| map_spawn_error(e, &invocation.program, cwd.as_deref()))?;

        if let Some(mut pipe) = child.stdin.take() {
            use std::io::Write;
            let write = match &command.stdin {
                StdinSource::Text(text) => pipe.write_all(text.as_bytes()),
                StdinSource::Bytes(bytes) => pipe.write_all(bytes),
                _ => Ok(()),
            };
            if let Err(e) = write
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(wrap_unexpected("local", "stdin", e));
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| wrap_unexpected("local", "wait", e))?;

        if output.stdout.len() > defaults.max_buffer_bytes
            || output.stderr.len() > defaults.max_buffer_bytes
        {
            return Err(ExecutionError::BufferOverflow {
                limit: defaults.max_buffer_bytes,
            });
        }

        let result = timer.finish(ResultParts {
            command: &invocation.display,
            adapter: "local",
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(0),
            signal: crate::adapters::child::exit_signal_name(&output.status),
            encoding: defaults.encoding,
            host: None,
            container: None,
        });
        apply_throw_policy(result, defaults.throw_on_nonzero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ExecDefaults {
        ExecDefaults::default()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let adapter = LocalAdapter::new();
        let cmd = Command::script("echo \"Hello, World!\"");
        let result = adapter.execute(cmd, &defaults()).await.unwrap();
        assert_eq!(result.stdout, "Hello, World!\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.adapter, "local");
    }

    #[tokio::test]
    async fn direct_exec_passes_args_verbatim() {
        let adapter = LocalAdapter::new();
        let cmd = Command::new("echo").arg("no shell involved; $HOME");
        let result = adapter.execute(cmd, &defaults()).await.unwrap();
        assert_eq!(result.stdout.trim(), "no shell involved; $HOME");
    }

    #[tokio::test]
    async fn missing_program_maps_to_spawn_enoent() {
        let adapter = LocalAdapter::new();
        let cmd = Command::new("definitely-not-a-real-binary-uxec");
        let err = adapter.execute(cmd, &defaults()).await.unwrap_err();
        match err {
            ExecutionError::AdapterUnavailable { operation, .. } => {
                assert_eq!(operation, "spawn_enoent");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_cwd_is_distinguishable_from_missing_program() {
        let adapter = LocalAdapter::new();
        let cmd = Command::new("echo").cwd("/definitely/not/a/dir/uxec");
        let err = adapter.execute(cmd, &defaults()).await.unwrap_err();
        match err {
            ExecutionError::AdapterUnavailable { operation, .. } => {
                assert_eq!(operation, "chdir");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_text_reaches_the_child() {
        let adapter = LocalAdapter::new();
        let cmd = Command::script("cat").stdin_text("from stdin");
        let result = adapter.execute(cmd, &defaults()).await.unwrap();
        assert_eq!(result.stdout, "from stdin");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result_without_throw() {
        let adapter = LocalAdapter::new();
        let cmd = Command::script("exit 7");
        let result = adapter.execute(cmd, &defaults()).await.unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn nonzero_exit_throws_under_policy() {
        let adapter = LocalAdapter::new();
        let mut d = defaults();
        d.throw_on_nonzero = true;
        let cmd = Command::script("exit 1");
        let err = adapter.execute(cmd, &d).await.unwrap_err();
        match err {
            ExecutionError::CommandFailed { command, result } => {
                assert!(command.contains("exit 1"));
                assert_eq!(result.exit_code, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let adapter = LocalAdapter::new();
        let started = std::time::Instant::now();
        let cmd = Command::script("sleep 10").timeout_ms(100);
        let err = adapter.execute(cmd, &defaults()).await.unwrap_err();
        match err {
            ExecutionError::Timeout { limit_ms, .. } => assert_eq!(limit_ms, 100),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[tokio::test]
    async fn buffer_overflow_aborts_execution() {
        let adapter = LocalAdapter::new();
        let mut d = defaults();
        d.max_buffer_bytes = 1024;
        let cmd = Command::script("yes uxec | head -c 100000");
        let err = adapter.execute(cmd, &d).await.unwrap_err();
        match err {
            ExecutionError::BufferOverflow { limit } => assert_eq!(limit, 1024),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_start_cancel_spawns_nothing() {
        use tokio_util::sync::CancellationToken;
        let adapter = LocalAdapter::new();
        let token = CancellationToken::new();
        token.cancel();
        let marker = "uxec-never-spawned-marker";
        let cmd = Command::script(format!("echo {marker} > /tmp/{marker}"))
            .cancel_token(token);
        let err = adapter.execute(cmd, &defaults()).await.unwrap_err();
        match err {
            ExecutionError::AdapterUnavailable { operation, .. } => {
                assert_eq!(operation, "aborted");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!Path::new(&format!("/tmp/{marker}")).exists());
    }

    #[tokio::test]
    async fn cancel_after_start_resolves_with_signal() {
        use tokio_util::sync::CancellationToken;
        let adapter = LocalAdapter::new();
        let token = CancellationToken::new();
        let late = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            late.cancel();
        });
        let cmd = Command::script("sleep 10").cancel_token(token);
        let result = adapter.execute(cmd, &defaults()).await.unwrap();
        assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn sync_variant_captures_output() {
        let adapter = LocalAdapter::new();
        let cmd = Command::script("printf sync-ok");
        let result = adapter.execute_sync(cmd, &defaults()).unwrap();
        assert_eq!(result.stdout, "sync-ok");
    }

    #[test]
    fn sync_variant_refuses_stream_stdin() {
        let adapter = LocalAdapter::new();
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        let cmd = Command::script("cat").stdin_stream(rx);
        let err = adapter.execute_sync(cmd, &defaults()).unwrap_err();
        match err {
            ExecutionError::AdapterUnavailable { operation, .. } => {
                assert_eq!(operation, "stdin_stream");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shell_discovery_finds_a_shell() {
        let shell = find_default_shell().unwrap();
        assert!(Path::new(&shell).exists());
    }
}
