//! Subprocess supervision shared by the local and Docker adapters.
//!
//! One entry point, [`supervise`], owns the full lifecycle of a spawned
//! child: stdin delivery, bounded stdout/stderr collection with optional
//! live observers, the timeout/cancellation race, and signal delivery on
//! the losing arms. Both adapters get identical semantics by construction.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::adapter::{RaceOutcome, await_with_limits, wrap_unexpected};
use crate::command::{Observers, SignalOverride, StdinSource};
use crate::error::{ExecutionError, Result};
use crate::stream::{Encoding, OutputCollector};

/// Limits applied to one supervised child.
pub(crate) struct ChildLimits {
    pub timeout: Option<std::time::Duration>,
    pub cancel: Option<CancellationToken>,
    /// Signal delivered when a limit fires.
    pub signal: String,
    /// Handle-installed replacement for `signal`, read at delivery time.
    pub signal_override: Option<SignalOverride>,
    /// Deliver the signal to the whole process group.
    pub process_group: bool,
}

impl ChildLimits {
    fn effective_signal(&self) -> String {
        self.signal_override
            .as_ref()
            .and_then(|slot| slot.lock().ok().and_then(|guard| guard.clone()))
            .unwrap_or_else(|| self.signal.clone())
    }
}

/// How a supervised child ended.
pub(crate) enum Supervised {
    Finished {
        exit_code: i32,
        signal: Option<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// The wall-clock cutoff fired; the child was signalled.
    TimedOut,
    /// The caller cancelled after start; the child was signalled and the
    /// partial output is preserved.
    Cancelled {
        signal: String,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

/// Drive a spawned child to one of the [`Supervised`] outcomes.
///
/// Buffer overflow and stdio errors kill the child and surface as `Err`.
pub(crate) async fn supervise(
    adapter: &'static str,
    mut child: Child,
    stdin: StdinSource,
    observers: Observers,
    max_buffer_bytes: usize,
    encoding: Encoding,
    limits: ChildLimits,
) -> Result<Supervised> {
    let pid = child.id();
    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stdout_col = Arc::new(Mutex::new(OutputCollector::new(max_buffer_bytes, encoding)));
    let stderr_col = Arc::new(Mutex::new(OutputCollector::new(max_buffer_bytes, encoding)));

    let work = {
        let stdout_col = stdout_col.clone();
        let stderr_col = stderr_col.clone();
        async move {
            let stdin_fut = write_stdin(adapter, stdin_pipe, stdin);
            let stdout_fut = pump(adapter, stdout_pipe, stdout_col, observers.stdout);
            let stderr_fut = pump(adapter, stderr_pipe, stderr_col, observers.stderr);
            let wait_fut = async {
                child
                    .wait()
                    .await
                    .map_err(|e| wrap_unexpected(adapter, "wait", e))
            };

            let joined = tokio::try_join!(stdin_fut, stdout_fut, stderr_fut, wait_fut);
            match joined {
                Ok(((), (), (), status)) => Ok(status),
                Err(err) => {
                    // Overflow or stdio failure: the child is of no further
                    // use, take it down before surfacing the error.
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Err(err)
                }
            }
        }
    };

    let outcome = await_with_limits(work, limits.timeout, limits.cancel.as_ref()).await;
    match outcome {
        RaceOutcome::Completed(Ok(status)) => {
            let (stdout, stderr) = take_buffers(stdout_col, stderr_col);
            Ok(Supervised::Finished {
                exit_code: status.code().unwrap_or(0),
                signal: exit_signal_name(&status),
                stdout,
                stderr,
            })
        }
        RaceOutcome::Completed(Err(err)) => Err(err),
        RaceOutcome::TimedOut => {
            deliver_signal(pid, &limits.effective_signal(), limits.process_group);
            Ok(Supervised::TimedOut)
        }
        RaceOutcome::Cancelled => {
            let signal = limits.effective_signal();
            deliver_signal(pid, &signal, limits.process_group);
            let (stdout, stderr) = take_buffers(stdout_col, stderr_col);
            Ok(Supervised::Cancelled {
                signal,
                stdout,
                stderr,
            })
        }
    }
}

/// Recover the collected bytes once the work future is gone. By then the
/// supervisor holds the only strong references.
fn take_buffers(
    stdout: Arc<Mutex<OutputCollector>>,
    stderr: Arc<Mutex<OutputCollector>>,
) -> (Vec<u8>, Vec<u8>) {
    (unwrap_collector(stdout), unwrap_collector(stderr))
}

fn unwrap_collector(collector: Arc<Mutex<OutputCollector>>) -> Vec<u8> {
    match Arc::try_unwrap(collector) {
        Ok(mutex) => mutex.into_inner().into_bytes(),
        Err(_) => Vec::new(),
    }
}

async fn pump<R>(
    adapter: &'static str,
    reader: Option<R>,
    collector: Arc<Mutex<OutputCollector>>,
    observer: Option<mpsc::Sender<Vec<u8>>>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| wrap_unexpected(adapter, "read", e))?;
        if n == 0 {
            return Ok(());
        }
        collector.lock().await.write(&buf[..n])?;
        if let Some(tx) = &observer {
            let _ = tx.send(buf[..n].to_vec()).await;
        }
    }
}

async fn write_stdin(
    adapter: &'static str,
    pipe: Option<tokio::process::ChildStdin>,
    source: StdinSource,
) -> Result<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let result = match source {
        StdinSource::Null => Ok(()),
        StdinSource::Text(text) => pipe.write_all(text.as_bytes()).await,
        StdinSource::Bytes(bytes) => pipe.write_all(&bytes).await,
        StdinSource::Stream(mut rx) => {
            let mut write = Ok(());
            while let Some(chunk) = rx.recv().await {
                write = pipe.write_all(&chunk).await;
                if write.is_err() {
                    break;
                }
            }
            write
        }
    };
    // A child that exits without draining its stdin is not an execution
    // failure; everything else is.
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(wrap_unexpected(adapter, "stdin", e)),
    }
}

/// Deliver a named signal to a child (or its process group) by pid.
/// Best-effort: a child that already exited is not an error.
pub(crate) fn deliver_signal(pid: Option<u32>, signal: &str, process_group: bool) {
    #[cfg(unix)]
    {
        let Some(pid) = pid else { return };
        let Ok(sig) = parse_signal(signal) else {
            tracing::warn!("unknown signal name '{signal}', falling back to SIGKILL");
            let raw = if process_group { -(pid as i32) } else { pid as i32 };
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(raw),
                nix::sys::signal::Signal::SIGKILL,
            );
            return;
        };
        let raw = if process_group { -(pid as i32) } else { pid as i32 };
        if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), sig) {
            tracing::debug!("signal {signal} to pid {pid} failed: {e}");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal, process_group);
    }
}

/// Parse a signal name ("SIGTERM", "TERM", "15") into a [`nix`] signal.
#[cfg(unix)]
pub(crate) fn parse_signal(name: &str) -> Result<nix::sys::signal::Signal, ExecutionError> {
    use std::str::FromStr;

    let upper = name.to_ascii_uppercase();
    let canonical = if upper.starts_with("SIG") {
        upper.clone()
    } else if let Ok(number) = upper.parse::<i32>() {
        return nix::sys::signal::Signal::try_from(number).map_err(|_| {
            ExecutionError::Config {
                key: "signal".into(),
                message: format!("unknown signal number {number}"),
            }
        });
    } else {
        format!("SIG{upper}")
    };

    nix::sys::signal::Signal::from_str(&canonical).map_err(|_| ExecutionError::Config {
        key: "signal".into(),
        message: format!("unknown signal name '{name}'"),
    })
}

/// Name of the signal that terminated a child, if any.
#[cfg(unix)]
pub(crate) fn exit_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|raw| {
        nix::sys::signal::Signal::try_from(raw)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("SIG{raw}"))
    })
}

#[cfg(not(unix))]
pub(crate) fn exit_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn signal_names_parse() {
        assert_eq!(
            parse_signal("SIGTERM").unwrap(),
            nix::sys::signal::Signal::SIGTERM
        );
        assert_eq!(
            parse_signal("kill").unwrap(),
            nix::sys::signal::Signal::SIGKILL
        );
        assert_eq!(
            parse_signal("9").unwrap(),
            nix::sys::signal::Signal::SIGKILL
        );
        assert!(parse_signal("SIGNOPE").is_err());
    }
}
