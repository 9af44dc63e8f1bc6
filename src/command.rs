//! The command model.
//!
//! A [`Command`] is a pure description of one intended execution: what to
//! run, where, with which stdio wiring, under which limits, and through which
//! backend. It is never mutated after submission — adapters receive it by
//! value, which also guarantees the stdin source is consumed exactly once.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::quote::escape;

/// What the child reads on standard input.
#[derive(Debug, Default)]
pub enum StdinSource {
    /// No input; the child sees a closed stream.
    #[default]
    Null,
    /// Inline text, written once, then the stream is closed.
    Text(String),
    /// Inline bytes, written once, then the stream is closed.
    Bytes(Vec<u8>),
    /// A live byte stream; chunks are piped through until the sender closes.
    Stream(mpsc::Receiver<Vec<u8>>),
}

impl StdinSource {
    pub fn is_stream(&self) -> bool {
        matches!(self, StdinSource::Stream(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StdinSource::Null)
    }
}

/// Where a captured stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Captured into the result (the default).
    #[default]
    Pipe,
    /// Passed through to the parent untouched.
    Inherit,
    /// Discarded.
    Ignore,
}

/// Whether (and how) the command string is handed to a shell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShellSpec {
    /// Direct exec: `program` is an executable name, `args` are its argv.
    #[default]
    Off,
    /// Interpret `program` as a shell expression via the platform default
    /// shell.
    Default,
    /// Interpret `program` via this specific interpreter.
    Program(String),
}

impl From<bool> for ShellSpec {
    fn from(value: bool) -> Self {
        if value { ShellSpec::Default } else { ShellSpec::Off }
    }
}

impl From<&str> for ShellSpec {
    fn from(value: &str) -> Self {
        ShellSpec::Program(value.to_string())
    }
}

impl ShellSpec {
    pub fn is_off(&self) -> bool {
        matches!(self, ShellSpec::Off)
    }
}

/// Which backend executes the command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterSelector {
    /// Engine decides: adapter options tag if present, local otherwise.
    #[default]
    Auto,
    Local,
    Ssh,
    Docker,
    /// A custom adapter registered on the engine under this name.
    Named(String),
}

/// SSH authentication material.
///
/// The `Debug` impl redacts secrets; neither passwords nor passphrases ever
/// reach logs.
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    KeyData {
        data: String,
        passphrase: Option<String>,
    },
    Agent,
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            SshAuth::KeyData { passphrase, .. } => f
                .debug_struct("KeyData")
                .field("data", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            SshAuth::Agent => f.write_str("Agent"),
        }
    }
}

/// Sudo wrapping applied to the remote command line.
#[derive(Clone, Default)]
pub struct SudoOptions {
    pub enabled: bool,
    pub password: Option<String>,
}

impl std::fmt::Debug for SudoOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SudoOptions")
            .field("enabled", &self.enabled)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Per-command SSH target and behavior.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub auth: SshAuth,
    pub sudo: SudoOptions,
    /// When false, the file-transfer surface reports `sftp_disabled`.
    pub sftp: bool,
}

impl SshOptions {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port: crate::constants::DEFAULT_SSH_PORT,
            auth,
            sudo: SudoOptions::default(),
            sftp: true,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn sudo(mut self, password: Option<String>) -> Self {
        self.sudo = SudoOptions {
            enabled: true,
            password,
        };
        self
    }

    pub fn without_sftp(mut self) -> Self {
        self.sftp = false;
        self
    }
}

/// Per-command Docker target and behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerOptions {
    /// Existing container to exec into. When absent (or missing on the
    /// host) and `auto_create` is set, an ephemeral container is synthesized
    /// from `image`.
    pub container: Option<String>,
    pub image: Option<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub tty: bool,
    pub privileged: bool,
    pub auto_create: bool,
    /// Remove synthesized containers on adapter disposal.
    pub auto_remove: bool,
    /// `-v` volume specs applied when synthesizing a container.
    pub volumes: Vec<String>,
}

impl DockerOptions {
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            container: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn ephemeral(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            auto_create: true,
            auto_remove: true,
            ..Self::default()
        }
    }
}

/// Adapter-specific extras carried by a command.
#[derive(Debug, Clone)]
pub enum AdapterOptions {
    Ssh(SshOptions),
    Docker(DockerOptions),
}

impl AdapterOptions {
    /// The selector implied by this options tag.
    pub fn selector(&self) -> AdapterSelector {
        match self {
            AdapterOptions::Ssh(_) => AdapterSelector::Ssh,
            AdapterOptions::Docker(_) => AdapterSelector::Docker,
        }
    }
}

/// Shared slot through which a running handle can swap the termination
/// signal after the command already started.
pub(crate) type SignalOverride = std::sync::Arc<std::sync::Mutex<Option<String>>>;

/// Live wiring installed by the running handle. Internal.
#[derive(Debug, Default)]
pub(crate) struct Observers {
    pub stdout: Option<mpsc::Sender<Vec<u8>>>,
    pub stderr: Option<mpsc::Sender<Vec<u8>>>,
    pub kill_signal: Option<SignalOverride>,
}

impl Observers {
    /// The handle-installed signal override, when one is set.
    pub fn signal_override(&self) -> Option<String> {
        self.kill_signal
            .as_ref()
            .and_then(|slot| slot.lock().ok().and_then(|guard| guard.clone()))
    }
}

/// Immutable description of one intended execution.
#[derive(Debug, Default)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: StdinSource,
    pub stdout: Option<StdioMode>,
    pub stderr: Option<StdioMode>,
    pub shell: Option<ShellSpec>,
    /// Wall-clock cutoff. `Some(0)` disables the cutoff; `None` defers to
    /// the engine default.
    pub timeout_ms: Option<u64>,
    pub timeout_signal: Option<String>,
    /// Spawn the child in its own process group so signals reach its
    /// descendants.
    pub detached: bool,
    pub cancel: Option<CancellationToken>,
    pub selector: AdapterSelector,
    pub options: Option<AdapterOptions>,
    pub(crate) observers: Observers,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// A shell expression, interpreted by the platform default shell.
    pub fn script(expression: impl Into<String>) -> Self {
        Self {
            program: expression.into(),
            shell: Some(ShellSpec::Default),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn stdin_text(mut self, text: impl Into<String>) -> Self {
        self.stdin = StdinSource::Text(text.into());
        self
    }

    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = StdinSource::Bytes(bytes);
        self
    }

    pub fn stdin_stream(mut self, stream: mpsc::Receiver<Vec<u8>>) -> Self {
        self.stdin = StdinSource::Stream(stream);
        self
    }

    pub fn stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = Some(mode);
        self
    }

    pub fn stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = Some(mode);
        self
    }

    pub fn shell(mut self, shell: impl Into<ShellSpec>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn timeout_signal(mut self, signal: impl Into<String>) -> Self {
        self.timeout_signal = Some(signal.into());
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_adapter(mut self, selector: AdapterSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn via_ssh(mut self, options: SshOptions) -> Self {
        self.options = Some(AdapterOptions::Ssh(options));
        self
    }

    pub fn in_docker(mut self, options: DockerOptions) -> Self {
        self.options = Some(AdapterOptions::Docker(options));
        self
    }

    /// Human-readable single line for results and error messages.
    ///
    /// Shell expressions render verbatim; direct-exec commands render with
    /// each argument shell-escaped so the line is unambiguous.
    pub fn display_line(&self) -> String {
        let shell_mode = self
            .shell
            .as_ref()
            .is_some_and(|spec| !spec.is_off());
        if shell_mode || self.args.is_empty() {
            self.program.clone()
        } else {
            let mut line = self.program.clone();
            for arg in &self.args {
                line.push(' ');
                line.push_str(&escape(arg));
            }
            line
        }
    }
}
