//! The execution engine.
//!
//! The engine is the front door: it owns the adapter instances, resolves
//! per-command defaults, selects the backend for each command, and offers
//! the chainable configuration surface. Chained views are copy-on-chain —
//! they clone the override scope but share the adapter instances through an
//! `Arc`, so SSH pools and ephemeral-container bookkeeping survive chaining.
//!
//! Adapters never hold a reference back to the engine; the engine passes a
//! resolved [`ExecDefaults`] into every `execute` call instead, which keeps
//! ownership acyclic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use tokio::sync::mpsc;

use crate::adapter::{ExecAdapter, ExecDefaults};
use crate::adapters::{DockerAdapter, LocalAdapter, MockAdapter, SshAdapter};
use crate::command::{
    AdapterOptions, AdapterSelector, Command, DockerOptions, ShellSpec, SshOptions, StdinSource,
};
use crate::config::EngineConfig;
use crate::error::{ExecutionError, Result};
use crate::handle::RunningHandle;
use crate::quote::{QuoteFn, ShellValue, escape, interpolate_with};
use crate::result::ExecResult;
use crate::stream::Encoding;

/// Per-run flags a [`RunningHandle`] can override.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunFlags {
    pub no_throw: bool,
    pub quiet: bool,
}

/// Overrides layered onto the engine by a chained view.
#[derive(Debug, Clone, Default)]
pub struct EngineOverrides {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub shell: Option<ShellSpec>,
    pub throw_on_nonzero: Option<bool>,
    pub selector: Option<AdapterSelector>,
    pub options: Option<AdapterOptions>,
    pub quiet: Option<bool>,
}

impl EngineOverrides {
    /// Layer `other` on top of `self`; `other` wins, env composes.
    fn merged(&self, other: EngineOverrides) -> EngineOverrides {
        let mut env = self.env.clone();
        env.extend(other.env);
        EngineOverrides {
            cwd: other.cwd.or_else(|| self.cwd.clone()),
            env,
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            shell: other.shell.or_else(|| self.shell.clone()),
            throw_on_nonzero: other.throw_on_nonzero.or(self.throw_on_nonzero),
            selector: other.selector.or_else(|| self.selector.clone()),
            options: other.options.or_else(|| self.options.clone()),
            quiet: other.quiet.or(self.quiet),
        }
    }
}

struct EngineShared {
    config: EngineConfig,
    encoding: Encoding,
    local: Arc<LocalAdapter>,
    ssh: Option<Arc<SshAdapter>>,
    docker: Option<Arc<DockerAdapter>>,
    custom: RwLock<HashMap<String, Arc<dyn ExecAdapter>>>,
    quoter: Option<QuoteFn>,
}

/// The execution façade. Cheap to clone; clones share adapters.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
    scope: EngineOverrides,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine, validating the config and instantiating the local
    /// adapter plus every adapter whose config block is present.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let encoding = config.validate()?;
        Ok(Self::assemble(config, encoding, None))
    }

    /// Build an engine with the documented defaults. Infallible.
    pub fn with_defaults() -> Self {
        Self::assemble(EngineConfig::default(), Encoding::Utf8, None)
    }

    /// `new` with a custom quoter overriding the escape uniformly.
    pub fn with_quoter(config: EngineConfig, quoter: QuoteFn) -> Result<Self> {
        let encoding = config.validate()?;
        Ok(Self::assemble(config, encoding, Some(quoter)))
    }

    fn assemble(config: EngineConfig, encoding: Encoding, quoter: Option<QuoteFn>) -> Self {
        let ssh = config.ssh.clone().map(|c| Arc::new(SshAdapter::new(c)));
        let docker = config
            .docker
            .clone()
            .map(|c| Arc::new(DockerAdapter::new(c)));
        Self {
            shared: Arc::new(EngineShared {
                config,
                encoding,
                local: Arc::new(LocalAdapter::new()),
                ssh,
                docker,
                custom: RwLock::new(HashMap::new()),
                quoter,
            }),
            scope: EngineOverrides::default(),
        }
    }

    /// Register a custom adapter reachable through
    /// `AdapterSelector::Named`. Visible to every view sharing this engine.
    pub fn register_adapter(&self, name: impl Into<String>, adapter: Arc<dyn ExecAdapter>) {
        if let Ok(mut custom) = self.shared.custom.write() {
            custom.insert(name.into(), adapter);
        }
    }

    /// Register a fresh mock adapter under "mock" and return it.
    pub fn with_mock(&self) -> Arc<MockAdapter> {
        let mock = Arc::new(MockAdapter::new());
        self.register_adapter("mock", mock.clone());
        mock
    }

    // ---- chainable configuration -------------------------------------

    /// A view with `overrides` layered on top of this view's scope.
    pub fn with(&self, overrides: EngineOverrides) -> Engine {
        Engine {
            shared: self.shared.clone(),
            scope: self.scope.merged(overrides),
        }
    }

    /// A view routing commands to the SSH adapter with these options.
    pub fn ssh(&self, options: SshOptions) -> Engine {
        self.with(EngineOverrides {
            selector: Some(AdapterSelector::Ssh),
            options: Some(AdapterOptions::Ssh(options)),
            ..EngineOverrides::default()
        })
    }

    /// A view routing commands into a Docker container.
    pub fn docker(&self, options: DockerOptions) -> Engine {
        self.with(EngineOverrides {
            selector: Some(AdapterSelector::Docker),
            options: Some(AdapterOptions::Docker(options)),
            ..EngineOverrides::default()
        })
    }

    /// A view routing commands back to the local adapter.
    pub fn local(&self) -> Engine {
        self.with(EngineOverrides {
            selector: Some(AdapterSelector::Local),
            ..EngineOverrides::default()
        })
    }

    /// A view with a different working directory.
    pub fn cd(&self, dir: impl Into<PathBuf>) -> Engine {
        self.with(EngineOverrides {
            cwd: Some(dir.into()),
            ..EngineOverrides::default()
        })
    }

    /// A view whose environment is this view's ⊕ `vars`.
    pub fn env(&self, vars: HashMap<String, String>) -> Engine {
        self.with(EngineOverrides {
            env: vars,
            ..EngineOverrides::default()
        })
    }

    /// A view with a different default timeout.
    pub fn timeout(&self, ms: u64) -> Engine {
        self.with(EngineOverrides {
            timeout_ms: Some(ms),
            ..EngineOverrides::default()
        })
    }

    /// A view with different shell interpretation.
    pub fn shell(&self, shell: impl Into<ShellSpec>) -> Engine {
        self.with(EngineOverrides {
            shell: Some(shell.into()),
            ..EngineOverrides::default()
        })
    }

    // ---- execution ----------------------------------------------------

    /// Interpolate a template with this engine's quoter.
    pub fn interpolate(&self, parts: &[&str], values: &[ShellValue]) -> String {
        match &self.shared.quoter {
            Some(quoter) => {
                let quoter = quoter.clone();
                interpolate_with(parts, values, &move |s: &str| quoter(s))
            }
            None => interpolate_with(parts, values, &escape),
        }
    }

    /// Template entry point: interpolate, then run as a shell expression.
    pub async fn run(&self, parts: &[&str], values: &[ShellValue]) -> Result<ExecResult> {
        let script = self.interpolate(parts, values);
        self.execute(Command::script(script)).await
    }

    /// Run a raw shell expression (no interpolation).
    pub async fn sh(&self, script: impl Into<String>) -> Result<ExecResult> {
        self.execute(Command::script(script)).await
    }

    /// Dispatch one command to its adapter and await the result.
    pub async fn execute(&self, command: Command) -> Result<ExecResult> {
        self.execute_with(command, RunFlags::default()).await
    }

    pub(crate) async fn execute_with(
        &self,
        mut command: Command,
        flags: RunFlags,
    ) -> Result<ExecResult> {
        self.apply_scope(&mut command);
        let adapter = self.select_adapter(&command)?;
        let mut defaults = self.defaults_for();
        if flags.no_throw {
            defaults.throw_on_nonzero = false;
        }

        let quiet =
            flags.quiet || self.scope.quiet.unwrap_or(self.shared.config.quiet);
        if self.shared.config.verbose && !quiet {
            tracing::info!(target: "uxec::echo", "$ {}", command.display_line());
        }

        adapter.execute(command, &defaults).await
    }

    /// Synchronous dispatch; availability depends on the selected adapter.
    pub fn execute_sync(&self, mut command: Command) -> Result<ExecResult> {
        self.apply_scope(&mut command);
        let adapter = self.select_adapter(&command)?;
        let defaults = self.defaults_for();
        adapter.execute_sync(command, &defaults)
    }

    /// Start a command and return a first-class handle to the in-flight
    /// execution.
    pub fn execute_handle(&self, mut command: Command) -> RunningHandle {
        let cancel = command
            .cancel
            .clone()
            .unwrap_or_default();
        command.cancel = Some(cancel.clone());

        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        command.observers.stdout = Some(stdout_tx);
        command.observers.stderr = Some(stderr_tx);
        let signal_override: crate::command::SignalOverride = Arc::default();
        command.observers.kill_signal = Some(signal_override.clone());

        let stdin_tx = if command.stdin.is_null() {
            let (tx, rx) = mpsc::channel(16);
            command.stdin = StdinSource::Stream(rx);
            Some(tx)
        } else {
            None
        };

        RunningHandle::new(
            self.clone(),
            command,
            cancel,
            stdout_rx,
            stderr_rx,
            stdin_tx,
            signal_override,
            self.shared.config.kill_signal.clone(),
        )
    }

    fn apply_scope(&self, command: &mut Command) {
        if command.options.is_none()
            && let Some(options) = &self.scope.options
        {
            command.options = Some(options.clone());
        }
        if command.selector == AdapterSelector::Auto
            && let Some(selector) = &self.scope.selector
        {
            command.selector = selector.clone();
        }
    }

    /// Resolve which adapter runs this command (spec order: explicit
    /// selector, then options tag, then local).
    fn select_adapter(&self, command: &Command) -> Result<Arc<dyn ExecAdapter>> {
        let selector = match &command.selector {
            AdapterSelector::Auto => match &command.options {
                Some(options) => options.selector(),
                None => AdapterSelector::Local,
            },
            explicit => explicit.clone(),
        };

        match selector {
            AdapterSelector::Auto | AdapterSelector::Local => {
                Ok(self.shared.local.clone() as Arc<dyn ExecAdapter>)
            }
            AdapterSelector::Ssh => self
                .shared
                .ssh
                .clone()
                .map(|a| a as Arc<dyn ExecAdapter>)
                .ok_or_else(|| {
                    ExecutionError::adapter("ssh", "select", "ssh adapter is not configured")
                }),
            AdapterSelector::Docker => self
                .shared
                .docker
                .clone()
                .map(|a| a as Arc<dyn ExecAdapter>)
                .ok_or_else(|| {
                    ExecutionError::adapter("docker", "select", "docker adapter is not configured")
                }),
            AdapterSelector::Named(name) => self
                .shared
                .custom
                .read()
                .ok()
                .and_then(|custom| custom.get(&name).cloned())
                .ok_or_else(|| {
                    ExecutionError::adapter(
                        &name,
                        "select",
                        "no adapter registered under this name",
                    )
                }),
        }
    }

    fn defaults_for(&self) -> ExecDefaults {
        let config = &self.shared.config;
        let mut env = config.default_env.clone();
        env.extend(self.scope.env.clone());
        ExecDefaults {
            timeout_ms: Some(
                self.scope
                    .timeout_ms
                    .unwrap_or(config.default_timeout_ms),
            ),
            cwd: self
                .scope
                .cwd
                .clone()
                .or_else(|| config.default_cwd.clone()),
            env,
            shell: self
                .scope
                .shell
                .clone()
                .unwrap_or_else(|| config.default_shell.clone()),
            stdout: crate::command::StdioMode::Pipe,
            stderr: crate::command::StdioMode::Pipe,
            encoding: self.shared.encoding,
            max_buffer_bytes: config.max_buffer_bytes,
            throw_on_nonzero: self
                .scope
                .throw_on_nonzero
                .unwrap_or(config.throw_on_nonzero),
            timeout_signal: config.timeout_signal.clone(),
            prefer_local: config.prefer_local.clone(),
            prefix: config.prefix.clone(),
            postfix: config.postfix.clone(),
            detached: config.detached,
        }
    }

    // ---- utilities ----------------------------------------------------

    /// First path `which` (or `where` on Windows) reports for `name`.
    pub async fn which(&self, name: &str) -> Result<Option<String>> {
        let finder = if cfg!(windows) { "where" } else { "which" };
        let mut defaults = self.defaults_for();
        defaults.throw_on_nonzero = false;
        defaults.shell = ShellSpec::Off;
        let command = Command::new(finder).arg(name);
        let result = self.shared.local.execute(command, &defaults).await?;
        if result.exit_code == 0 {
            Ok(result.lines().into_iter().next().filter(|l| !l.is_empty()))
        } else {
            Ok(None)
        }
    }

    /// Boolean form of [`Engine::which`].
    pub async fn command_available(&self, name: &str) -> bool {
        matches!(self.which(name).await, Ok(Some(_)))
    }

    /// Whether the adapter behind `selector` reports itself usable.
    pub async fn adapter_available(&self, selector: &AdapterSelector) -> bool {
        match selector {
            AdapterSelector::Auto | AdapterSelector::Local => {
                self.shared.local.is_available().await
            }
            AdapterSelector::Ssh => match &self.shared.ssh {
                Some(adapter) => adapter.is_available().await,
                None => false,
            },
            AdapterSelector::Docker => match &self.shared.docker {
                Some(adapter) => adapter.is_available().await,
                None => false,
            },
            AdapterSelector::Named(name) => {
                let adapter = self
                    .shared
                    .custom
                    .read()
                    .ok()
                    .and_then(|custom| custom.get(name).cloned());
                match adapter {
                    Some(adapter) => adapter.is_available().await,
                    None => false,
                }
            }
        }
    }

    /// The SSH adapter instance, for the file-transfer surface and pool
    /// statistics.
    pub fn ssh_adapter(&self) -> Option<Arc<SshAdapter>> {
        self.shared.ssh.clone()
    }

    /// The Docker adapter instance, for the container management surface.
    pub fn docker_adapter(&self) -> Option<Arc<DockerAdapter>> {
        self.shared.docker.clone()
    }

    /// Release every adapter's pooled resources. Idempotent; chained views
    /// sharing this engine are all affected.
    pub async fn dispose(&self) {
        self.shared.local.dispose().await;
        if let Some(ssh) = &self.shared.ssh {
            ssh.dispose().await;
        }
        if let Some(docker) = &self.shared.docker {
            docker.dispose().await;
        }
        let custom: Vec<Arc<dyn ExecAdapter>> = self
            .shared
            .custom
            .read()
            .map(|custom| custom.values().cloned().collect())
            .unwrap_or_default();
        for adapter in custom {
            adapter.dispose().await;
        }
    }
}

static DEFAULT_ENGINE: OnceLock<Engine> = OnceLock::new();

/// The lazily constructed process-wide engine with documented defaults.
pub fn default_engine() -> &'static Engine {
    DEFAULT_ENGINE.get_or_init(Engine::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn template_entry_runs_through_the_shell() {
        let engine = Engine::with_defaults();
        let result = engine
            .run(&["echo \"Hello, World!\""], &[])
            .await
            .unwrap();
        assert_eq!(result.stdout, "Hello, World!\n");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn interpolated_values_survive_the_shell() {
        let engine = Engine::with_defaults();
        let filename = "my file.txt";
        let result = engine
            .run(&["echo ", ""], &[filename.into()])
            .await
            .unwrap();
        assert_eq!(result.text(), filename);
    }

    #[tokio::test]
    async fn injection_is_inert_end_to_end() {
        let engine = Engine::with_defaults();
        let dangerous = "'; rm -rf /; echo '";
        let result = engine
            .run(&["echo ", ""], &[dangerous.into()])
            .await
            .unwrap();
        assert_eq!(result.text(), dangerous);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn chained_views_share_adapters() {
        let engine = Engine::with_defaults();
        let chained = engine.cd("/tmp").timeout(5_000);
        assert!(Arc::ptr_eq(&engine.shared.local, &chained.shared.local));
        let ssh_a = engine.ssh_adapter().unwrap();
        let ssh_b = chained.ssh_adapter().unwrap();
        assert!(Arc::ptr_eq(&ssh_a, &ssh_b));
    }

    #[tokio::test]
    async fn cd_applies_to_executions() {
        let engine = Engine::with_defaults().cd("/");
        let result = engine.sh("pwd").await.unwrap();
        assert_eq!(result.text(), "/");
    }

    #[tokio::test]
    async fn env_views_compose() {
        let engine = Engine::with_defaults();
        let first = engine.env(HashMap::from([
            ("UXEC_TEST_A".to_string(), "1".to_string()),
        ]));
        let second = first.env(HashMap::from([
            ("UXEC_TEST_B".to_string(), "2".to_string()),
        ]));
        let result = second
            .sh("echo $UXEC_TEST_A$UXEC_TEST_B")
            .await
            .unwrap();
        assert_eq!(result.text(), "12");
    }

    #[tokio::test]
    async fn unconfigured_adapter_is_reported() {
        let config = EngineConfig {
            ssh: None,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        let err = engine
            .execute(Command::script("true").on_adapter(AdapterSelector::Ssh))
            .await
            .unwrap_err();
        match err {
            ExecutionError::AdapterUnavailable { adapter, .. } => assert_eq!(adapter, "ssh"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_named_adapter_is_reported() {
        let engine = Engine::with_defaults();
        let err = engine
            .execute(
                Command::script("true").on_adapter(AdapterSelector::Named("missing".into())),
            )
            .await
            .unwrap_err();
        match err {
            ExecutionError::AdapterUnavailable { adapter, .. } => {
                assert_eq!(adapter, "missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn registered_mock_is_selectable() {
        let engine = Engine::with_defaults();
        let mock = engine.with_mock();
        mock.mock("deploy --check", "all green");

        let result = engine
            .execute(
                Command::script("deploy --check")
                    .on_adapter(AdapterSelector::Named("mock".into())),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, "all green");
        assert_eq!(mock.execution_count("deploy --check"), 1);
    }

    #[tokio::test]
    async fn scope_throw_override_applies() {
        let engine = Engine::with_defaults().with(EngineOverrides {
            throw_on_nonzero: Some(true),
            ..EngineOverrides::default()
        });
        let err = engine.sh("exit 1").await.unwrap_err();
        match err {
            ExecutionError::CommandFailed { command, result } => {
                assert!(command.contains("exit 1"));
                assert_eq!(result.exit_code, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn which_finds_common_binaries() {
        let engine = Engine::with_defaults();
        let path = engine.which("sh").await.unwrap();
        assert!(path.is_some_and(|p| p.ends_with("sh")));
        assert!(engine.which("definitely-missing-uxec").await.unwrap().is_none());
        assert!(engine.command_available("sh").await);
    }

    #[tokio::test]
    async fn default_engine_is_shared() {
        let a = default_engine();
        let b = default_engine();
        assert!(Arc::ptr_eq(&a.shared.local, &b.shared.local));
    }

    #[tokio::test]
    async fn custom_quoter_flows_through_templates() {
        let quoter: QuoteFn = Arc::new(|s: &str| format!("[{s}]"));
        let engine = Engine::with_quoter(EngineConfig::default(), quoter).unwrap();
        let script = engine.interpolate(&["echo ", ""], &["x y".into()]);
        assert_eq!(script, "echo [x y]");
    }
}
