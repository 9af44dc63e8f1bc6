//! Engine configuration.
//!
//! [`EngineConfig`] is the construction-time shape of an engine: documented
//! defaults, adapter blocks, and the ambient behavior knobs. Per-command
//! overrides layered by chained engine views live in the engine itself; this
//! type is plain data and serializes cleanly.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::adapters::{DockerAdapterConfig, SshAdapterConfig};
use crate::command::ShellSpec;
use crate::constants::{DEFAULT_MAX_BUFFER_BYTES, DEFAULT_TIMEOUT_MS, DEFAULT_TIMEOUT_SIGNAL};
use crate::error::{ExecutionError, Result};
use crate::stream::Encoding;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Applied when a command has no timeout of its own; `0` disables the
    /// cutoff.
    pub default_timeout_ms: u64,
    pub default_cwd: Option<PathBuf>,
    pub default_env: HashMap<String, String>,
    pub default_shell: ShellSpec,
    /// Output text encoding; must name a member of the known set.
    pub encoding: String,
    pub max_buffer_bytes: usize,
    pub throw_on_nonzero: bool,
    pub timeout_signal: String,
    /// Signal used by `RunningHandle::kill` when the caller names none.
    pub kill_signal: String,
    /// Script fragments wrapped around every shell-mode expression.
    pub prefix: String,
    pub postfix: String,
    /// Echo command lines through tracing before dispatch.
    pub verbose: bool,
    pub quiet: bool,
    /// Spawn local children in their own process group.
    pub detached: bool,
    /// Directory prepended to the composed PATH.
    pub prefer_local: Option<PathBuf>,
    /// Present ⇒ the SSH adapter is instantiated.
    pub ssh: Option<SshAdapterConfig>,
    /// Present ⇒ the Docker adapter is instantiated.
    pub docker: Option<DockerAdapterConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            default_cwd: None,
            default_env: HashMap::new(),
            default_shell: ShellSpec::Off,
            encoding: "utf-8".to_string(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            throw_on_nonzero: false,
            timeout_signal: DEFAULT_TIMEOUT_SIGNAL.to_string(),
            kill_signal: DEFAULT_TIMEOUT_SIGNAL.to_string(),
            prefix: String::new(),
            postfix: String::new(),
            verbose: false,
            quiet: false,
            detached: false,
            prefer_local: None,
            ssh: Some(SshAdapterConfig::default()),
            docker: Some(DockerAdapterConfig::default()),
        }
    }
}

impl EngineConfig {
    /// Check the config and resolve the encoding.
    pub fn validate(&self) -> Result<Encoding> {
        Encoding::parse(&self.encoding).ok_or_else(|| ExecutionError::Config {
            key: "encoding".to_string(),
            message: format!("unknown encoding '{}'", self.encoding),
        })
    }

    /// Defaults overlaid with the recognized `UXEC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        crate::settings::EnvSettings::from_env()?.apply(&mut config);
        Ok(config)
    }
}
