//! SSH adapter with a pooled connection cache.
//!
//! ## Pooling
//!
//! Connections are keyed by `(user, host, port)`. The first execution for a
//! key opens and authenticates a session; later executions reuse it while it
//! stays healthy. A background sweeper scans the pool periodically and
//! evicts entries idle longer than the configured idle timeout. When the
//! pool is at `max_connections`, a request for a *new* key fails fast with
//! `AdapterUnavailable("pool_full")` — it does not queue. Disposal
//! disconnects everything and is idempotent.
//!
//! ## Blocking discipline
//!
//! libssh2 is a synchronous library, so every session operation runs on the
//! tokio blocking pool. The async side races the blocking work against the
//! timeout and cancellation limits; the session read timeout is set to the
//! same budget so the worker thread always unblocks shortly after the race
//! resolves.
//!
//! ## Remote termination
//!
//! Killing the remote process on a local timeout or cancellation is
//! best-effort only: the channel is torn down and the pool entry evicted,
//! but plain SSH offers no reliable cross-server way to signal the remote
//! process, which may keep running until it exits on its own.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::adapter::{
    ExecAdapter, ExecDefaults, ExecutionTimer, RaceOutcome, ResultParts, apply_throw_policy,
    await_with_limits, effective_shell, effective_timeout, effective_timeout_signal,
    ensure_not_cancelled, wrap_unexpected,
};
use crate::command::{
    AdapterOptions, Command, Observers, ShellSpec, SshAuth, SshOptions, StdinSource, SudoOptions,
};
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_POOL_IDLE_TIMEOUT,
    POOL_SWEEP_INTERVAL,
};
use crate::error::{ExecutionError, Result};
use crate::quote::escape_unix;
use crate::result::ExecResult;

/// Engine-level SSH adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshAdapterConfig {
    /// When false every execution opens a one-shot connection and closes it
    /// afterwards.
    pub pool_enabled: bool,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for SshAdapterConfig {
    fn default() -> Self {
        Self {
            pool_enabled: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            sweep_interval: POOL_SWEEP_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Point-in-time pool usage.
#[derive(Debug, Clone)]
pub struct SshPoolStats {
    pub open_connections: usize,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PoolKey {
    user: String,
    host: String,
    port: u16,
}

impl PoolKey {
    fn for_options(options: &SshOptions) -> Self {
        Self {
            user: options.username.clone(),
            host: options.host.clone(),
            port: options.port,
        }
    }
}

type SharedSession = Arc<StdMutex<ssh2::Session>>;

struct PoolEntry {
    session: SharedSession,
    last_used: Instant,
    active_uses: usize,
}

/// Remote execution backend over libssh2.
pub struct SshAdapter {
    config: SshAdapterConfig,
    pool: Arc<Mutex<HashMap<PoolKey, PoolEntry>>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SshAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Output of one finished remote command.
struct RemoteOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
    exit_signal: Option<String>,
}

/// Stdin material shipped into the blocking worker.
enum StdinPayload {
    None,
    Bytes(Vec<u8>),
    Stream(mpsc::Receiver<Vec<u8>>),
}

impl SshAdapter {
    pub fn new(config: SshAdapterConfig) -> Self {
        Self {
            config,
            pool: Arc::new(Mutex::new(HashMap::new())),
            sweeper: StdMutex::new(None),
        }
    }

    pub async fn stats(&self) -> SshPoolStats {
        SshPoolStats {
            open_connections: self.pool.lock().await.len(),
            max_connections: self.config.max_connections,
        }
    }

    /// Start the idle sweeper on first use. Runs until disposal.
    fn ensure_sweeper(&self) {
        let Ok(mut guard) = self.sweeper.lock() else {
            return;
        };
        if guard.is_some() {
            return;
        }
        let pool = self.pool.clone();
        let idle = self.config.idle_timeout;
        let interval = self.config.sweep_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let mut pool = pool.lock().await;
                let before = pool.len();
                pool.retain(|key, entry| {
                    let keep = entry.active_uses > 0 || entry.last_used.elapsed() <= idle;
                    if !keep {
                        tracing::debug!(
                            host = %key.host,
                            user = %key.user,
                            "evicting idle ssh connection"
                        );
                    }
                    keep
                });
                if pool.len() != before {
                    tracing::info!(
                        evicted = before - pool.len(),
                        remaining = pool.len(),
                        "ssh pool sweep complete"
                    );
                }
            }
        }));
    }

    /// Borrow (or open) the pooled session for these options.
    ///
    /// The pool lock is held across the connect so that N concurrent
    /// executions against one key open at most one TCP connection.
    async fn checkout(&self, options: &SshOptions) -> Result<SharedSession> {
        let key = PoolKey::for_options(options);
        let mut pool = self.pool.lock().await;

        if let Some(entry) = pool.get_mut(&key) {
            entry.active_uses += 1;
            entry.last_used = Instant::now();
            tracing::debug!(host = %key.host, "reusing pooled ssh connection");
            return Ok(entry.session.clone());
        }

        if pool.len() >= self.config.max_connections {
            return Err(ExecutionError::adapter(
                "ssh",
                "pool_full",
                format!(
                    "connection pool is at capacity ({})",
                    self.config.max_connections
                ),
            ));
        }

        let session = Self::open_session(options, self.config.connect_timeout).await?;
        pool.insert(
            key.clone(),
            PoolEntry {
                session: session.clone(),
                last_used: Instant::now(),
                active_uses: 1,
            },
        );
        drop(pool);
        self.ensure_sweeper();
        tracing::info!(host = %key.host, user = %key.user, port = key.port, "opened ssh connection");
        Ok(session)
    }

    /// Return a borrowed session. Unhealthy sessions are evicted so the next
    /// execution reconnects.
    async fn checkin(&self, options: &SshOptions, healthy: bool) {
        let key = PoolKey::for_options(options);
        let mut pool = self.pool.lock().await;
        if let Some(entry) = pool.get_mut(&key) {
            entry.active_uses = entry.active_uses.saturating_sub(1);
            entry.last_used = Instant::now();
            if !healthy {
                pool.remove(&key);
                tracing::warn!(host = %key.host, "evicted broken ssh connection");
            }
        }
    }

    async fn open_session(
        options: &SshOptions,
        connect_timeout: Duration,
    ) -> Result<SharedSession> {
        let options = options.clone();
        let session = tokio::task::spawn_blocking(move || {
            connect_blocking(&options, connect_timeout)
        })
        .await
        .map_err(|e| wrap_unexpected("ssh", "connect", e))??;
        Ok(Arc::new(StdMutex::new(session)))
    }

    /// Upload one local file over the session's SFTP subsystem.
    pub async fn upload_file(
        &self,
        options: &SshOptions,
        local: &Path,
        remote: &Path,
    ) -> Result<()> {
        let local = local.to_path_buf();
        let remote = remote.to_path_buf();
        self.with_sftp(options, move |sftp| {
            use std::io::Write;
            let data = std::fs::read(&local)?;
            let mut file = sftp.create(&remote)?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
    }

    /// Download one remote file over the session's SFTP subsystem.
    pub async fn download_file(
        &self,
        options: &SshOptions,
        remote: &Path,
        local: &Path,
    ) -> Result<()> {
        let remote = remote.to_path_buf();
        let data = self
            .with_sftp(options, move |sftp| {
                let mut file = sftp.open(&remote)?;
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            })
            .await?;
        tokio::fs::write(local, data)
            .await
            .map_err(|e| wrap_unexpected("ssh", "sftp", e))
    }

    /// Recursively upload a directory tree, creating remote directories as
    /// needed.
    pub async fn upload_directory(
        &self,
        options: &SshOptions,
        local: &Path,
        remote: &Path,
    ) -> Result<()> {
        let mut files = Vec::new();
        let mut dirs = vec![remote.to_path_buf()];
        for entry in walkdir::WalkDir::new(local) {
            let entry = entry.map_err(|e| wrap_unexpected("ssh", "sftp", e))?;
            let relative = entry
                .path()
                .strip_prefix(local)
                .map_err(|e| wrap_unexpected("ssh", "sftp", e))?;
            if relative.as_os_str().is_empty() {
                continue;
            }
            let target = remote.join(relative);
            if entry.file_type().is_dir() {
                dirs.push(target);
            } else if entry.file_type().is_file() {
                files.push((entry.path().to_path_buf(), target));
            }
        }

        self.with_sftp(options, move |sftp| {
            use std::io::Write;
            for dir in &dirs {
                // Already-present directories are fine.
                let _ = sftp.mkdir(dir, 0o755);
            }
            for (local_path, remote_path) in &files {
                let data = std::fs::read(local_path)?;
                let mut file = sftp.create(remote_path)?;
                file.write_all(&data)?;
            }
            Ok(())
        })
        .await
    }

    /// Run an SFTP closure on the pooled session, honoring the `sftp`
    /// option and evicting the connection when the subsystem fails.
    async fn with_sftp<T, F>(&self, options: &SshOptions, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Sftp) -> std::result::Result<T, SftpError> + Send + 'static,
    {
        if !options.sftp {
            return Err(ExecutionError::adapter(
                "ssh",
                "sftp_disabled",
                "file transfer is disabled for this target",
            ));
        }

        let session = self.checkout(options).await?;
        let outcome = tokio::task::spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| SftpError::Io(std::io::Error::other("session lock poisoned")))?;
            let sftp = session.sftp().map_err(SftpError::Ssh)?;
            work(&sftp)
        })
        .await
        .map_err(|e| wrap_unexpected("ssh", "sftp", e))?;

        match outcome {
            Ok(value) => {
                self.checkin(options, true).await;
                Ok(value)
            }
            Err(err) => {
                self.checkin(options, false).await;
                Err(ExecutionError::adapter("ssh", "sftp", err.to_string()))
            }
        }
    }
}

/// Errors inside an SFTP closure: libssh2 or local filesystem.
enum SftpError {
    Ssh(ssh2::Error),
    Io(std::io::Error),
}

impl From<ssh2::Error> for SftpError {
    fn from(e: ssh2::Error) -> Self {
        SftpError::Ssh(e)
    }
}

impl From<std::io::Error> for SftpError {
    fn from(e: std::io::Error) -> Self {
        SftpError::Io(e)
    }
}

impl std::fmt::Display for SftpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SftpError::Ssh(e) => write!(f, "{e}"),
            SftpError::Io(e) => write!(f, "{e}"),
        }
    }
}

/// Build the remote command line for a command.
///
/// The remote side always interprets a shell line, so direct-exec commands
/// are rendered with every argument escaped; shell-mode commands inline
/// their args into the expression and take the configured prefix/postfix.
fn remote_command_line(command: &Command, shell: &ShellSpec, defaults: &ExecDefaults) -> String {
    match shell {
        ShellSpec::Off => {
            let mut line = escape_unix(&command.program);
            for arg in &command.args {
                line.push(' ');
                line.push_str(&escape_unix(arg));
            }
            line
        }
        ShellSpec::Default | ShellSpec::Program(_) => {
            let mut script = command.program.clone();
            for arg in &command.args {
                script.push(' ');
                script.push_str(&escape_unix(arg));
            }
            format!("{}{}{}", defaults.prefix, script, defaults.postfix)
        }
    }
}

/// Prepend the sudo invocation unless the line already carries one.
///
/// The password (when present) travels only inside the command line sent to
/// the server; it is never logged.
fn wrap_sudo(line: String, sudo: &SudoOptions) -> String {
    if !sudo.enabled || line.trim_start().starts_with("sudo ") {
        return line;
    }
    match &sudo.password {
        None => format!("sudo {line}"),
        Some(password) => format!("echo {} | sudo -S {line}", escape_unix(password)),
    }
}

fn connection_error(host: &str, err: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Connection {
        host: host.to_string(),
        message: err.to_string(),
    }
}

/// Open, handshake, and authenticate one session. Blocking.
fn connect_blocking(options: &SshOptions, connect_timeout: Duration) -> Result<ssh2::Session> {
    use std::net::{TcpStream, ToSocketAddrs};

    let host = options.host.as_str();
    let addr = (host, options.port)
        .to_socket_addrs()
        .map_err(|e| connection_error(host, e))?
        .next()
        .ok_or_else(|| connection_error(host, "address resolved to nothing"))?;

    let tcp =
        TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| connection_error(host, e))?;
    let mut session = ssh2::Session::new().map_err(|e| connection_error(host, e))?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| connection_error(host, e))?;

    let auth = match &options.auth {
        SshAuth::Password(password) => session.userauth_password(&options.username, password),
        SshAuth::KeyFile { path, passphrase } => session.userauth_pubkey_file(
            &options.username,
            None,
            path,
            passphrase.as_deref(),
        ),
        SshAuth::KeyData { data, passphrase } => session.userauth_pubkey_memory(
            &options.username,
            None,
            data,
            passphrase.as_deref(),
        ),
        SshAuth::Agent => session.userauth_agent(&options.username),
    };
    auth.map_err(|e| connection_error(host, e))?;

    if !session.authenticated() {
        return Err(connection_error(host, "authentication rejected"));
    }
    Ok(session)
}

/// Run one remote command over an authenticated session. Blocking.
fn exec_blocking(
    session: SharedSession,
    command_line: &str,
    stdin: StdinPayload,
    observers: Observers,
    max_buffer_bytes: usize,
    read_timeout: Option<Duration>,
) -> Result<RemoteOutput> {
    let session = session
        .lock()
        .map_err(|_| ExecutionError::adapter("ssh", "ssh", "session lock poisoned"))?;

    // The read timeout mirrors the outer race so this thread always
    // unblocks; 0 means wait forever.
    let timeout_ms = read_timeout
        .map(|d| u32::try_from(d.as_millis().saturating_add(100)).unwrap_or(u32::MAX))
        .unwrap_or(0);
    session.set_timeout(timeout_ms);

    let channel_err = |e: ssh2::Error| ExecutionError::adapter("ssh", "ssh", e.to_string());

    let mut channel = session.channel_session().map_err(channel_err)?;
    channel.exec(command_line).map_err(channel_err)?;

    match stdin {
        StdinPayload::None => {}
        StdinPayload::Bytes(bytes) => {
            use std::io::Write;
            channel.write_all(&bytes).map_err(|e| {
                ExecutionError::adapter("ssh", "stdin", e.to_string())
            })?;
        }
        StdinPayload::Stream(mut rx) => {
            use std::io::Write;
            while let Some(chunk) = rx.blocking_recv() {
                channel.write_all(&chunk).map_err(|e| {
                    ExecutionError::adapter("ssh", "stdin", e.to_string())
                })?;
            }
        }
    }
    let _ = channel.send_eof();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = channel.read(&mut buf).map_err(|e| {
            ExecutionError::adapter("ssh", "ssh", e.to_string())
        })?;
        if n == 0 {
            break;
        }
        if stdout.len() + n > max_buffer_bytes {
            return Err(ExecutionError::BufferOverflow {
                limit: max_buffer_bytes,
            });
        }
        stdout.extend_from_slice(&buf[..n]);
        if let Some(tx) = &observers.stdout {
            let _ = tx.blocking_send(buf[..n].to_vec());
        }
    }
    loop {
        let n = channel.stderr().read(&mut buf).map_err(|e| {
            ExecutionError::adapter("ssh", "ssh", e.to_string())
        })?;
        if n == 0 {
            break;
        }
        if stderr.len() + n > max_buffer_bytes {
            return Err(ExecutionError::BufferOverflow {
                limit: max_buffer_bytes,
            });
        }
        stderr.extend_from_slice(&buf[..n]);
        if let Some(tx) = &observers.stderr {
            let _ = tx.blocking_send(buf[..n].to_vec());
        }
    }

    let _ = channel.wait_close();
    let exit_code = channel.exit_status().map_err(channel_err)?;
    let exit_signal = channel
        .exit_signal()
        .ok()
        .and_then(|signal| signal.exit_signal);

    Ok(RemoteOutput {
        stdout,
        stderr,
        exit_code,
        exit_signal,
    })
}

#[async_trait]
impl ExecAdapter for SshAdapter {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn execute(&self, mut command: Command, defaults: &ExecDefaults) -> Result<ExecResult> {
        ensure_not_cancelled("ssh", &command)?;

        let options = match &command.options {
            Some(AdapterOptions::Ssh(opts)) => opts.clone(),
            _ => {
                return Err(ExecutionError::adapter(
                    "ssh",
                    "options",
                    "command carries no ssh target",
                ));
            }
        };

        let shell = effective_shell(&command, defaults);
        let display_line_str = remote_command_line(&command, &shell, defaults);
        let wrapped = wrap_sudo(display_line_str.clone(), &options.sudo);
        let timeout = effective_timeout(&command, defaults);
        let timeout_signal = effective_timeout_signal(&command, defaults);

        tracing::debug!(adapter = "ssh", host = %options.host, command = %display_line_str, "executing remote command");

        let stdin = match std::mem::take(&mut command.stdin) {
            StdinSource::Null => StdinPayload::None,
            StdinSource::Text(text) => StdinPayload::Bytes(text.into_bytes()),
            StdinSource::Bytes(bytes) => StdinPayload::Bytes(bytes),
            StdinSource::Stream(rx) => StdinPayload::Stream(rx),
        };
        let observers = std::mem::take(&mut command.observers);
        let signal_override = observers.kill_signal.clone();

        let pooled = self.config.pool_enabled;
        let session = if pooled {
            self.checkout(&options).await?
        } else {
            Self::open_session(&options, self.config.connect_timeout).await?
        };

        let timer = ExecutionTimer::start();
        let worker_session = session.clone();
        let worker_line = wrapped;
        let max_buffer = defaults.max_buffer_bytes;
        let work = tokio::task::spawn_blocking(move || {
            exec_blocking(
                worker_session,
                &worker_line,
                stdin,
                observers,
                max_buffer,
                timeout,
            )
        });

        let outcome = await_with_limits(work, timeout, command.cancel.as_ref()).await;
        let finish_one_shot = |session: SharedSession| {
            // One-shot mode: close eagerly instead of waiting for drop.
            tokio::task::spawn_blocking(move || {
                if let Ok(session) = session.lock() {
                    let _ = session.disconnect(None, "uxec session complete", None);
                }
            });
        };

        match outcome {
            RaceOutcome::Completed(Ok(Ok(remote))) => {
                if pooled {
                    self.checkin(&options, true).await;
                } else {
                    finish_one_shot(session);
                }
                let result = timer.finish(ResultParts {
                    command: &display_line_str,
                    adapter: "ssh",
                    stdout: remote.stdout,
                    stderr: remote.stderr,
                    exit_code: remote.exit_code,
                    signal: remote.exit_signal,
                    encoding: defaults.encoding,
                    host: Some(options.host.clone()),
                    container: None,
                });
                apply_throw_policy(result, defaults.throw_on_nonzero)
            }
            RaceOutcome::Completed(Ok(Err(err))) => {
                if pooled {
                    self.checkin(&options, false).await;
                } else {
                    finish_one_shot(session);
                }
                Err(err)
            }
            RaceOutcome::Completed(Err(join_err)) => {
                if pooled {
                    self.checkin(&options, false).await;
                }
                Err(wrap_unexpected("ssh", "ssh", join_err))
            }
            RaceOutcome::TimedOut => {
                // Best-effort remote termination: drop the session so the
                // channel closes; the remote process may outlive it.
                if pooled {
                    self.checkin(&options, false).await;
                }
                Err(ExecutionError::Timeout {
                    command: display_line_str,
                    limit_ms: timeout.map(|d| d.as_millis() as u64).unwrap_or_default(),
                })
            }
            RaceOutcome::Cancelled => {
                if pooled {
                    self.checkin(&options, false).await;
                }
                let delivered = signal_override
                    .as_ref()
                    .and_then(|slot| slot.lock().ok().and_then(|guard| guard.clone()))
                    .unwrap_or(timeout_signal);
                let result = timer.finish(ResultParts {
                    command: &display_line_str,
                    adapter: "ssh",
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    exit_code: 0,
                    signal: Some(delivered),
                    encoding: defaults.encoding,
                    host: Some(options.host.clone()),
                    container: None,
                });
                apply_throw_policy(result, defaults.throw_on_nonzero)
            }
        }
    }

    /// Disconnect every pooled session and stop the sweeper. Idempotent.
    async fn dispose(&self) {
        {
            let Ok(mut guard) = self.sweeper.lock() else {
                return;
            };
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }

        let entries: Vec<PoolEntry> = {
            let mut pool = self.pool.lock().await;
            pool.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let session = entry.session;
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(session) = session.lock() {
                    let _ = session.disconnect(None, "uxec dispose", None);
                }
            })
            .await;
        }
        tracing::info!("ssh adapter disposed");
    }
}
