//! Structured execution results.
//!
//! An [`ExecResult`] captures everything one finished execution produced:
//! decoded output, the raw bytes it was decoded from, exit status, timings,
//! and which adapter ran it. Conversions cover the common consumption shapes
//! (trimmed text, parsed JSON, line lists, raw bytes).

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::{ExecutionError, Result};

/// The outcome of one successful (possibly non-zero) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// The command line as submitted, for error context.
    pub command: String,
    /// Decoded stdout.
    pub stdout: String,
    /// Decoded stderr.
    pub stderr: String,
    /// Raw captured stdout bytes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stdout_bytes: Vec<u8>,
    /// Raw captured stderr bytes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_bytes: Vec<u8>,
    /// Exit code; `0` when the child was killed by a signal (see `signal`).
    pub exit_code: i32,
    /// Name of the terminating signal, if any.
    pub signal: Option<String>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub duration_ms: u64,
    /// Which adapter produced this result ("local", "ssh", "docker", ...).
    pub adapter: String,
    /// Remote host, for SSH executions.
    pub host: Option<String>,
    /// Container name, for Docker executions.
    pub container: Option<String>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Trimmed stdout — the "just give me the value" accessor.
    pub fn text(&self) -> String {
        self.stdout.trim().to_string()
    }

    /// Parse stdout as JSON into `T`.
    ///
    /// Invalid input yields a typed error whose message carries a prefix of
    /// the offending text.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.stdout).map_err(|e| ExecutionError::InvalidJson {
            snippet: snippet(&self.stdout),
            message: e.to_string(),
        })
    }

    /// Stdout split into lines; a trailing empty line (from a final `\n`) is
    /// dropped.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.stdout.split('\n').map(str::to_string).collect();
        if lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
        lines
    }

    /// Raw captured stdout bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.stdout_bytes
    }

    /// Apply the throw-on-nonzero policy: a non-zero exit becomes
    /// [`ExecutionError::CommandFailed`] carrying this result.
    pub fn checked(self) -> Result<ExecResult> {
        if self.exit_code == 0 {
            Ok(self)
        } else {
            Err(ExecutionError::CommandFailed {
                command: self.command.clone(),
                result: Box::new(self),
            })
        }
    }
}

impl std::fmt::Display for ExecResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.stdout.trim())
    }
}

fn snippet(text: &str) -> String {
    const MAX: usize = 80;
    let trimmed = text.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let mut end = MAX;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}
