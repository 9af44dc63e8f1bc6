//! Shared defaults and tunables.
//!
//! Centralizes the documented engine defaults and the environment variable
//! names recognized by [`crate::settings`], so the values referenced in docs,
//! code, and tests stay in one place.

use std::time::Duration;

/// Default wall-clock cutoff applied by the engine when a command does not
/// carry its own timeout. `0` on a command disables the cutoff entirely.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default cap on captured stdout/stderr bytes (10 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Signal delivered to a child when the wall-clock cutoff fires or the
/// execution is cancelled after start.
pub const DEFAULT_TIMEOUT_SIGNAL: &str = "SIGTERM";

/// POSIX shells probed in order when a command asks for `shell = true`
/// without naming a specific interpreter.
pub const SHELL_CANDIDATES: &[&str] = &["/bin/bash", "/bin/sh", "/usr/bin/bash", "/usr/bin/sh"];

/// Container CLI binary driven by the Docker adapter.
pub const DOCKER_BINARY: &str = "docker";

/// Name prefix for containers synthesized by the Docker adapter.
pub const EPHEMERAL_CONTAINER_PREFIX: &str = "uxec-tmp";

/// How often the SSH pool sweeper scans for idle connections.
pub const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle lifetime of a pooled SSH connection before the sweeper evicts it.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of concurrently pooled SSH connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// TCP connect timeout for new SSH sessions.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Prefix of every environment variable consumed by the engine itself.
pub const ENV_PREFIX: &str = "UXEC_";

/// Recognized engine environment variables. Unknown `UXEC_*` keys are
/// ignored; malformed values for these raise a configuration error.
pub const ENV_TIMEOUT: &str = "UXEC_TIMEOUT";
pub const ENV_VERBOSE: &str = "UXEC_VERBOSE";
pub const ENV_QUIET: &str = "UXEC_QUIET";
pub const ENV_SHELL: &str = "UXEC_SHELL";
pub const ENV_PREFIX_CMD: &str = "UXEC_PREFIX";
pub const ENV_POSTFIX_CMD: &str = "UXEC_POSTFIX";
pub const ENV_KILL_SIGNAL: &str = "UXEC_KILL_SIGNAL";
pub const ENV_TIMEOUT_SIGNAL: &str = "UXEC_TIMEOUT_SIGNAL";
pub const ENV_DETACHED: &str = "UXEC_DETACHED";
pub const ENV_PREFER_LOCAL: &str = "UXEC_PREFER_LOCAL";
