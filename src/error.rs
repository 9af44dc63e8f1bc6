//! Failure taxonomy for command execution.
//!
//! Every execution resolves to exactly one [`crate::result::ExecResult`] or
//! exactly one [`ExecutionError`] — never both, never neither. Each variant
//! carries a stable string code (see [`ExecutionError::code`]) so telemetry
//! and retry layers can match on codes instead of display text.

use crate::result::ExecResult;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = ExecutionError> = std::result::Result<T, E>;

/// The disjoint failure kinds an execution can resolve to.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Non-zero exit under the throw-on-nonzero policy. Carries the full
    /// result so callers can still inspect stdout/stderr and timings.
    #[error("command failed with exit code {}: {command}", result.exit_code)]
    CommandFailed {
        command: String,
        result: Box<ExecResult>,
    },

    /// The wall-clock cutoff fired before the command completed.
    #[error("command timed out after {limit_ms}ms: {command}")]
    Timeout { command: String, limit_ms: u64 },

    /// Opening a connection to a remote host failed.
    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    /// An adapter could not perform (or begin) the requested operation.
    ///
    /// `operation` is a short stable tag ("aborted", "spawn_enoent",
    /// "pool_full", "sftp_disabled", "no_mock", ...) identifying what was
    /// being attempted; `message` carries the human-readable cause.
    #[error("adapter '{adapter}' failed during {operation}: {message}")]
    AdapterUnavailable {
        adapter: String,
        operation: String,
        message: String,
    },

    /// A container management operation failed at the CLI boundary.
    #[error("container operation '{operation}' failed for '{container}': {message}")]
    ContainerOp {
        container: String,
        operation: String,
        message: String,
    },

    /// Captured output would have exceeded the configured buffer cap.
    #[error("captured output exceeded the {limit} byte limit")]
    BufferOverflow { limit: usize },

    /// Malformed engine or environment configuration.
    #[error("invalid configuration for {key}: {message}")]
    Config { key: String, message: String },

    /// A result conversion found text that is not valid JSON.
    #[error("output is not valid JSON ({message}): {snippet}")]
    InvalidJson { snippet: String, message: String },
}

impl ExecutionError {
    /// Stable telemetry code for this failure kind.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::CommandFailed { .. } => "COMMAND_FAILED",
            ExecutionError::Timeout { .. } => "TIMEOUT",
            ExecutionError::Connection { .. } => "CONNECTION_FAILED",
            ExecutionError::AdapterUnavailable { .. } => "ADAPTER_ERROR",
            ExecutionError::ContainerOp { .. } => "DOCKER_ERROR",
            ExecutionError::BufferOverflow { .. } => "BUFFER_OVERFLOW",
            ExecutionError::Config { .. } => "CONFIG_INVALID",
            ExecutionError::InvalidJson { .. } => "INVALID_JSON",
        }
    }

    /// Whether a retry at a higher layer could plausibly succeed.
    ///
    /// The engine itself never retries; this classification exists for
    /// caller-side retry policies.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout { .. } | ExecutionError::Connection { .. }
        )
    }

    /// Shorthand constructor for [`ExecutionError::AdapterUnavailable`].
    pub(crate) fn adapter(
        adapter: &str,
        operation: &str,
        message: impl Into<String>,
    ) -> Self {
        ExecutionError::AdapterUnavailable {
            adapter: adapter.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Pre-start cancellation outcome shared by every adapter.
    pub(crate) fn aborted(adapter: &str) -> Self {
        ExecutionError::adapter(adapter, "aborted", "cancelled before the command started")
    }
}
