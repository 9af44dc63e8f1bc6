//! Docker adapter.
//!
//! Drives the host's `docker` CLI rather than the daemon API: every
//! operation is a `docker …` subprocess supervised exactly like a local
//! command. Containers are either named explicitly or synthesized on demand
//! (`docker create … sh -c 'sleep infinity'`) and tracked for cleanup.
//!
//! A client-side wall-clock cutoff can only kill the local `docker exec`
//! invocation; the in-container process may keep running until it exits on
//! its own. That is a property of `docker exec`, not a defect here.

use std::collections::HashSet;
use std::process::Stdio;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};

use crate::adapter::{
    ExecAdapter, ExecDefaults, ExecutionTimer, ResultParts, apply_throw_policy, effective_shell,
    effective_stderr, effective_stdout, effective_timeout, effective_timeout_signal,
    ensure_not_cancelled, wrap_unexpected,
};
use crate::adapters::child::{ChildLimits, Supervised, supervise};
use crate::command::{Command, DockerOptions, ShellSpec, StdioMode};
use crate::constants::{DOCKER_BINARY, EPHEMERAL_CONTAINER_PREFIX};
use crate::error::{ExecutionError, Result};
use crate::quote::escape;
use crate::result::ExecResult;

/// Engine-level Docker adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerAdapterConfig {
    /// Container CLI binary ("docker" unless overridden, e.g. "podman").
    pub binary: String,
}

impl Default for DockerAdapterConfig {
    fn default() -> Self {
        Self {
            binary: DOCKER_BINARY.to_string(),
        }
    }
}

/// Container-CLI execution backend.
pub struct DockerAdapter {
    binary: String,
    available: OnceCell<bool>,
    /// Containers synthesized by this adapter, removed on dispose when the
    /// options asked for auto-removal.
    ephemeral: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for DockerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerAdapter")
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

impl DockerAdapter {
    pub fn new(config: DockerAdapterConfig) -> Self {
        Self {
            binary: config.binary,
            available: OnceCell::new(),
            ephemeral: Mutex::new(HashSet::new()),
        }
    }

    /// Run a management CLI call to completion, capturing output.
    async fn cli(&self, args: &[String]) -> Result<std::process::Output> {
        tracing::debug!(adapter = "docker", ?args, "running container CLI");
        tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExecutionError::adapter(
                        "docker",
                        "spawn_enoent",
                        format!("container CLI not found: {}", self.binary),
                    )
                } else {
                    wrap_unexpected("docker", "spawn", e)
                }
            })
    }

    /// Run a management CLI call, mapping a non-zero exit to `ContainerOp`.
    async fn cli_expect(
        &self,
        container: &str,
        operation: &str,
        args: &[String],
    ) -> Result<String> {
        let output = self.cli(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ExecutionError::ContainerOp {
                container: container.to_string(),
                operation: operation.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            name.to_string(),
        ];
        Ok(self.cli(&args).await?.status.success())
    }

    /// Resolve the target container, synthesizing an ephemeral one when the
    /// options allow it.
    async fn resolve_container(&self, options: &DockerOptions) -> Result<String> {
        if let Some(name) = &options.container
            && self.container_exists(name).await?
        {
            return Ok(name.clone());
        }

        if !options.auto_create {
            let wanted = options.container.as_deref().unwrap_or("<unset>");
            return Err(ExecutionError::ContainerOp {
                container: wanted.to_string(),
                operation: "resolve".to_string(),
                message: "container does not exist and auto-create is disabled".to_string(),
            });
        }

        let image = options.image.as_deref().ok_or_else(|| {
            ExecutionError::ContainerOp {
                container: options.container.clone().unwrap_or_default(),
                operation: "create".to_string(),
                message: "auto-create requires an image".to_string(),
            }
        })?;

        let name = format!(
            "{}-{:08x}",
            EPHEMERAL_CONTAINER_PREFIX,
            rand::rng().random::<u32>()
        );
        self.create_container(&name, image, &options.volumes).await?;
        self.start_container(&name).await?;
        if options.auto_remove {
            self.ephemeral.lock().await.insert(name.clone());
        }
        tracing::info!(adapter = "docker", container = %name, %image, "synthesized ephemeral container");
        Ok(name)
    }

    /// List container names known to the CLI (running and stopped).
    pub async fn list_containers(&self) -> Result<Vec<String>> {
        let args: Vec<String> = ["ps", "--all", "--format", "{{.Names}}"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let stdout = self.cli_expect("<all>", "list", &args).await?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Create a long-lived idle container from an image.
    pub async fn create_container(
        &self,
        name: &str,
        image: &str,
        volumes: &[String],
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.into(),
            "-it".into(),
        ];
        for volume in volumes {
            args.push("-v".into());
            args.push(volume.clone());
        }
        args.extend([
            image.to_string(),
            "sh".into(),
            "-c".into(),
            "sleep infinity".into(),
        ]);
        self.cli_expect(name, "create", &args).await.map(|_| ())
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        let args = vec!["start".to_string(), name.to_string()];
        self.cli_expect(name, "start", &args).await.map(|_| ())
    }

    pub async fn stop_container(&self, name: &str) -> Result<()> {
        let args = vec!["stop".to_string(), name.to_string()];
        self.cli_expect(name, "stop", &args).await.map(|_| ())
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        self.cli_expect(name, "remove", &args).await.map(|_| ())?;
        self.ephemeral.lock().await.remove(name);
        Ok(())
    }
}

/// Assemble the `docker exec` argument vector for one command.
///
/// Env entries are sorted so the produced argv is deterministic.
fn build_exec_args(
    container: &str,
    command: &Command,
    shell: &ShellSpec,
    defaults: &ExecDefaults,
    options: &DockerOptions,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["exec".into()];
    if !command.stdin.is_null() {
        args.push("-i".into());
    }
    if options.tty {
        args.push("-t".into());
    }
    if let Some(user) = &options.user {
        args.push("-u".into());
        args.push(user.clone());
    }
    if let Some(workdir) = &options.workdir {
        args.push("-w".into());
        args.push(workdir.clone());
    }

    let mut env: std::collections::BTreeMap<String, String> = defaults
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in &command.env {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    if options.privileged {
        args.push("--privileged".into());
    }
    args.push(container.to_string());

    match shell {
        ShellSpec::Off => {
            args.push(command.program.clone());
            args.extend(command.args.iter().cloned());
        }
        ShellSpec::Default | ShellSpec::Program(_) => {
            let interpreter = match shell {
                ShellSpec::Program(path) => path.clone(),
                _ => "sh".to_string(),
            };
            let mut script = command.program.clone();
            for arg in &command.args {
                script.push(' ');
                script.push_str(&escape(arg));
            }
            args.push(interpreter);
            args.push("-c".into());
            args.push(format!("{}{}{}", defaults.prefix, script, defaults.postfix));
        }
    }
    args
}

#[async_trait]
impl ExecAdapter for DockerAdapter {
    fn name(&self) -> &'static str {
        "docker"
    }

    /// Probe `docker version --format json` once and cache the verdict.
    async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let args: Vec<String> = ["version", "--format", "json"]
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                match self.cli(&args).await {
                    Ok(output) => {
                        output.status.success()
                            && serde_json::from_slice::<serde_json::Value>(&output.stdout)
                                .is_ok()
                    }
                    Err(_) => false,
                }
            })
            .await
    }

    async fn execute(&self, mut command: Command, defaults: &ExecDefaults) -> Result<ExecResult> {
        ensure_not_cancelled("docker", &command)?;

        let options = match &command.options {
            Some(crate::command::AdapterOptions::Docker(opts)) => opts.clone(),
            _ => DockerOptions::default(),
        };
        let container = self.resolve_container(&options).await?;

        let shell = effective_shell(&command, defaults);
        let exec_args = build_exec_args(&container, &command, &shell, defaults, &options);
        let display_line_str = command.display_line();
        let timeout = effective_timeout(&command, defaults);
        let signal = effective_timeout_signal(&command, defaults);

        tracing::debug!(
            adapter = "docker",
            container = %container,
            command = %display_line_str,
            "executing in container"
        );

        let mut proc = tokio::process::Command::new(&self.binary);
        proc.args(&exec_args)
            .stdin(if command.stdin.is_null() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(stdio_for(effective_stdout(&command, defaults)))
            .stderr(stdio_for(effective_stderr(&command, defaults)))
            .kill_on_drop(false);

        let timer = ExecutionTimer::start();
        let child = proc.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutionError::adapter(
                    "docker",
                    "spawn_enoent",
                    format!("container CLI not found: {}", self.binary),
                )
            } else {
                wrap_unexpected("docker", "spawn", e)
            }
        })?;

        let stdin = std::mem::take(&mut command.stdin);
        let observers = std::mem::take(&mut command.observers);
        let limits = ChildLimits {
            timeout,
            cancel: command.cancel.clone(),
            signal,
            signal_override: observers.kill_signal.clone(),
            process_group: false,
        };

        let supervised = supervise(
            "docker",
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
                    command: &display_line_str,
                    adapter: "docker",
                    stdout,
                    stderr,
                    exit_code,
                    signal,
                    encoding: defaults.encoding,
                    host: None,
                    container: Some(container),
                });
                apply_throw_policy(result, defaults.throw_on_nonzero)
            }
            // Only the local `docker exec` process is killed here; the
            // in-container process may run on.
            Supervised::TimedOut => Err(ExecutionError::Timeout {
                command: display_line_str,
                limit_ms: timeout.map(|d| d.as_millis() as u64).unwrap_or_default(),
            }),
            Supervised::Cancelled {
                signal,
                stdout,
                stderr,
            } => {
                let result = timer.finish(ResultParts {
                    command: &display_line_str,
                    adapter: "docker",
                    stdout,
                    stderr,
                    exit_code: 0,
                    signal: Some(signal),
                    encoding: defaults.encoding,
                    host: None,
                    container: Some(container),
                });
                apply_throw_policy(result, defaults.throw_on_nonzero)
            }
        }
    }

    /// Remove every tracked ephemeral container. Safe to call repeatedly.
    async fn dispose(&self) {
        let names: Vec<String> = {
            let mut tracked = self.ephemeral.lock().await;
            tracked.drain().collect()
        };
        for name in names {
            let args = vec!["rm".to_string(), "--force".to_string(), name.clone()];
            if let Err(e) = self.cli(&args).await {
                tracing::warn!(adapter = "docker", container = %name, "cleanup failed: {e}");
            } else {
                tracing::debug!(adapter = "docker", container = %name, "removed ephemeral container");
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> DockerOptions {
        DockerOptions {
            container: Some("web".into()),
            user: Some("app".into()),
            workdir: Some("/srv".into()),
            tty: true,
            privileged: true,
            ..DockerOptions::default()
        }
    }

    #[test]
    fn exec_args_follow_flag_order() {
        let mut defaults = ExecDefaults::default();
        defaults.env.insert("B".into(), "2".into());
        let command = Command::new("ls").arg("-la").stdin_text("x");
        let args = build_exec_args("web", &command, &ShellSpec::Off, &defaults, &options());

        assert_eq!(
            args,
            vec![
                "exec", "-i", "-t", "-u", "app", "-w", "/srv", "-e", "B=2", "--privileged",
                "web", "ls", "-la",
            ]
        );
    }

    #[test]
    fn shell_mode_wraps_with_sh_dash_c() {
        let defaults = ExecDefaults::default();
        let command = Command::script("echo hi && echo bye");
        let args = build_exec_args(
            "web",
            &command,
            &ShellSpec::Default,
            &defaults,
            &DockerOptions::container("web"),
        );
        assert_eq!(args, vec!["exec", "web", "sh", "-c", "echo hi && echo bye"]);
    }

    #[test]
    fn command_env_overrides_defaults_in_flags() {
        let mut defaults = ExecDefaults::default();
        defaults.env.insert("K".into(), "default".into());
        let command = Command::new("true").env("K", "override");
        let args = build_exec_args(
            "c",
            &command,
            &ShellSpec::Off,
            &defaults,
            &DockerOptions::container("c"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-e K=override"));
        assert!(!joined.contains("K=default"));
    }

    #[test]
    fn no_stdin_means_no_dash_i() {
        let defaults = ExecDefaults::default();
        let command = Command::new("true");
        let args = build_exec_args(
            "c",
            &command,
            &ShellSpec::Off,
            &defaults,
            &DockerOptions::container("c"),
        );
        assert!(!args.contains(&"-i".to_string()));
    }
}
