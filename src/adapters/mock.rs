//! Deterministic in-memory adapter for tests.
//!
//! Commands never leave the process: each execution is recorded, matched
//! against an ordered registry of `(matcher, response)` pairs, and answered
//! from the first hit. Responses can delay asynchronously so timeout and
//! cancellation behavior is testable without real children.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::adapter::{
    ExecAdapter, ExecDefaults, ExecutionTimer, RaceOutcome, ResultParts, apply_throw_policy,
    await_with_limits, effective_shell, effective_timeout, effective_timeout_signal,
    ensure_not_cancelled,
};
use crate::command::{Command, ShellSpec};
use crate::error::{ExecutionError, Result};
use crate::result::ExecResult;

/// How an incoming command line is matched.
#[derive(Debug, Clone)]
pub enum MockMatcher {
    /// Full-string equality.
    Exact(String),
    /// Regular-expression match anywhere in the line.
    Pattern(Regex),
}

impl MockMatcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            MockMatcher::Exact(expected) => expected == line,
            MockMatcher::Pattern(re) => re.is_match(line),
        }
    }
}

/// The canned outcome a matched command produces.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub signal: Option<String>,
    /// Asynchronous delay before the response lands, so timeout tests work.
    pub delay_ms: Option<u64>,
}

impl MockResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failing(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }
}

struct MockRule {
    matcher: MockMatcher,
    response: MockResponse,
}

/// In-memory execution backend.
#[derive(Default)]
pub struct MockAdapter {
    rules: Mutex<Vec<MockRule>>,
    default_response: Mutex<Option<MockResponse>>,
    executed: Mutex<Vec<String>>,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter").finish_non_exhaustive()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exact-match rule answering with the given stdout.
    pub fn mock(&self, command: impl Into<String>, stdout: impl Into<String>) {
        self.mock_response(MockMatcher::Exact(command.into()), MockResponse::ok(stdout));
    }

    /// Register a regex rule.
    pub fn mock_pattern(&self, pattern: Regex, response: MockResponse) {
        self.mock_response(MockMatcher::Pattern(pattern), response);
    }

    /// Register a rule. First match wins, ties broken by insertion order.
    pub fn mock_response(&self, matcher: MockMatcher, response: MockResponse) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(MockRule { matcher, response });
        }
    }

    /// Answer for any command no rule matches.
    pub fn set_default_response(&self, response: MockResponse) {
        if let Ok(mut default) = self.default_response.lock() {
            *default = Some(response);
        }
    }

    /// Every command line executed so far, in order.
    pub fn executed_commands(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|executed| executed.clone())
            .unwrap_or_default()
    }

    /// How many times this exact command line was executed.
    pub fn execution_count(&self, command: &str) -> usize {
        self.executed
            .lock()
            .map(|executed| executed.iter().filter(|c| *c == command).count())
            .unwrap_or(0)
    }

    /// Forget all rules, the default response, and the execution record.
    pub fn reset(&self) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.clear();
        }
        if let Ok(mut default) = self.default_response.lock() {
            *default = None;
        }
        if let Ok(mut executed) = self.executed.lock() {
            executed.clear();
        }
    }

    fn lookup(&self, line: &str) -> Option<MockResponse> {
        if let Ok(rules) = self.rules.lock()
            && let Some(rule) = rules.iter().find(|rule| rule.matcher.matches(line))
        {
            return Some(rule.response.clone());
        }
        self.default_response
            .lock()
            .ok()
            .and_then(|default| default.clone())
    }
}

/// The line the registry matches against: shell expressions verbatim,
/// direct-exec commands as "program arg arg".
fn command_line(command: &Command, shell: &ShellSpec) -> String {
    if shell.is_off() && !command.args.is_empty() {
        let mut line = command.program.clone();
        for arg in &command.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    } else {
        command.program.clone()
    }
}

#[async_trait]
impl ExecAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, command: Command, defaults: &ExecDefaults) -> Result<ExecResult> {
        ensure_not_cancelled("mock", &command)?;

        let shell = effective_shell(&command, defaults);
        let line = command_line(&command, &shell);
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(line.clone());
        }

        let Some(response) = self.lookup(&line) else {
            return Err(ExecutionError::adapter(
                "mock",
                "no_mock",
                format!("no mock registered for: {line}"),
            ));
        };

        let timeout = effective_timeout(&command, defaults);
        let timeout_signal = effective_timeout_signal(&command, defaults);
        let timer = ExecutionTimer::start();

        if let Some(delay_ms) = response.delay_ms {
            let nap = tokio::time::sleep(Duration::from_millis(delay_ms));
            match await_with_limits(nap, timeout, command.cancel.as_ref()).await {
                RaceOutcome::Completed(()) => {}
                RaceOutcome::TimedOut => {
                    return Err(ExecutionError::Timeout {
                        command: line,
                        limit_ms: timeout.map(|d| d.as_millis() as u64).unwrap_or_default(),
                    });
                }
                RaceOutcome::Cancelled => {
                    let delivered = command
                        .observers
                        .signal_override()
                        .unwrap_or(timeout_signal);
                    let result = timer.finish(ResultParts {
                        command: &line,
                        adapter: "mock",
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                        exit_code: 0,
                        signal: Some(delivered),
                        encoding: defaults.encoding,
                        host: None,
                        container: None,
                    });
                    return apply_throw_policy(result, defaults.throw_on_nonzero);
                }
            }
        }

        let result = timer.finish(ResultParts {
            command: &line,
            adapter: "mock",
            stdout: response.stdout.clone().into_bytes(),
            stderr: response.stderr.clone().into_bytes(),
            exit_code: response.exit_code,
            signal: response.signal.clone(),
            encoding: defaults.encoding,
            host: None,
            container: None,
        });
        apply_throw_policy(result, defaults.throw_on_nonzero)
    }

    fn execute_sync(&self, command: Command, defaults: &ExecDefaults) -> Result<ExecResult> {
        ensure_not_cancelled("mock", &command)?;

        let shell = effective_shell(&command, defaults);
        let line = command_line(&command, &shell);
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(line.clone());
        }

        let Some(response) = self.lookup(&line) else {
            return Err(ExecutionError::adapter(
                "mock",
                "no_mock",
                format!("no mock registered for: {line}"),
            ));
        };

        let timer = ExecutionTimer::start();
        let result = timer.finish(ResultParts {
            command: &line,
            adapter: "mock",
            stdout: response.stdout.clone().into_bytes(),
            stderr: response.stderr.clone().into_bytes(),
            exit_code: response.exit_code,
            signal: response.signal.clone(),
            encoding: defaults.encoding,
            host: None,
            container: None,
        });
        apply_throw_policy(result, defaults.throw_on_nonzero)
    }
}
