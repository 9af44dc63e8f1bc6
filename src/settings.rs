//! Environment-variable configuration layer.
//!
//! A process embedding the engine can tune it without code changes through
//! `UXEC_*` variables. Unknown keys under the prefix are ignored; malformed
//! values for recognized keys raise [`ExecutionError::Config`] so typos fail
//! loudly instead of silently running with defaults.

use std::path::PathBuf;

use crate::command::ShellSpec;
use crate::config::EngineConfig;
use crate::constants::{
    ENV_DETACHED, ENV_KILL_SIGNAL, ENV_POSTFIX_CMD, ENV_PREFER_LOCAL, ENV_PREFIX_CMD, ENV_QUIET,
    ENV_SHELL, ENV_TIMEOUT, ENV_TIMEOUT_SIGNAL, ENV_VERBOSE,
};
use crate::error::{ExecutionError, Result};

/// Parse the duration grammar `<n>`, `<n>ms`, `<n>s`, `<n>m` into
/// milliseconds.
pub fn parse_duration_ms(key: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let malformed = || ExecutionError::Config {
        key: key.to_string(),
        message: format!("'{value}' is not a duration (<n>, <n>ms, <n>s, <n>m)"),
    };

    let (digits, scale) = if let Some(rest) = value.strip_suffix("ms") {
        (rest, 1)
    } else if let Some(rest) = value.strip_suffix('s') {
        (rest, 1_000)
    } else if let Some(rest) = value.strip_suffix('m') {
        (rest, 60_000)
    } else {
        (value, 1)
    };

    let number: u64 = digits.trim().parse().map_err(|_| malformed())?;
    number.checked_mul(scale).ok_or_else(malformed)
}

/// Parse a boolean setting.
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ExecutionError::Config {
            key: key.to_string(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

/// The recognized `UXEC_*` settings, each optional.
#[derive(Debug, Default)]
pub struct EnvSettings {
    pub timeout_ms: Option<u64>,
    pub verbose: Option<bool>,
    pub quiet: Option<bool>,
    pub shell: Option<ShellSpec>,
    pub prefix: Option<String>,
    pub postfix: Option<String>,
    pub kill_signal: Option<String>,
    pub timeout_signal: Option<String>,
    pub detached: Option<bool>,
    pub prefer_local: Option<PathBuf>,
}

impl EnvSettings {
    /// Read the recognized keys from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Read the recognized keys from an explicit variable set (testable).
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in vars {
            match key.as_str() {
                ENV_TIMEOUT => settings.timeout_ms = Some(parse_duration_ms(&key, &value)?),
                ENV_VERBOSE => settings.verbose = Some(parse_bool(&key, &value)?),
                ENV_QUIET => settings.quiet = Some(parse_bool(&key, &value)?),
                ENV_SHELL => {
                    settings.shell = Some(match parse_bool(&key, &value) {
                        Ok(true) => ShellSpec::Default,
                        Ok(false) => ShellSpec::Off,
                        Err(_) => ShellSpec::Program(value),
                    });
                }
                ENV_PREFIX_CMD => settings.prefix = Some(value),
                ENV_POSTFIX_CMD => settings.postfix = Some(value),
                ENV_KILL_SIGNAL => settings.kill_signal = Some(value),
                ENV_TIMEOUT_SIGNAL => settings.timeout_signal = Some(value),
                ENV_DETACHED => settings.detached = Some(parse_bool(&key, &value)?),
                ENV_PREFER_LOCAL => {
                    // Accepts a directory, or a boolean where false disables.
                    match parse_bool(&key, &value) {
                        Ok(false) => settings.prefer_local = None,
                        Ok(true) => {
                            return Err(ExecutionError::Config {
                                key,
                                message: "expects a directory path (or false)".to_string(),
                            });
                        }
                        Err(_) => settings.prefer_local = Some(PathBuf::from(value)),
                    }
                }
                // Unknown keys — including other UXEC_* names — are ignored.
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Overlay these settings onto an engine config.
    pub fn apply(self, config: &mut EngineConfig) {
        if let Some(timeout_ms) = self.timeout_ms {
            config.default_timeout_ms = timeout_ms;
        }
        if let Some(verbose) = self.verbose {
            config.verbose = verbose;
        }
        if let Some(quiet) = self.quiet {
            config.quiet = quiet;
        }
        if let Some(shell) = self.shell {
            config.default_shell = shell;
        }
        if let Some(prefix) = self.prefix {
            config.prefix = prefix;
        }
        if let Some(postfix) = self.postfix {
            config.postfix = postfix;
        }
        if let Some(kill_signal) = self.kill_signal {
            config.kill_signal = kill_signal;
        }
        if let Some(timeout_signal) = self.timeout_signal {
            config.timeout_signal = timeout_signal;
        }
        if let Some(detached) = self.detached {
            config.detached = detached;
        }
        if let Some(prefer_local) = self.prefer_local {
            config.prefer_local = Some(prefer_local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration_ms("k", "500").unwrap(), 500);
        assert_eq!(parse_duration_ms("k", "500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("k", "30s").unwrap(), 30_000);
        assert_eq!(parse_duration_ms("k", "5m").unwrap(), 300_000);
        assert!(parse_duration_ms("k", "5h").is_err());
        assert!(parse_duration_ms("k", "soon").is_err());
    }

    #[test]
    fn malformed_duration_names_the_key() {
        let err = parse_duration_ms(ENV_TIMEOUT, "junk").unwrap_err();
        match err {
            ExecutionError::Config { key, .. } => assert_eq!(key, ENV_TIMEOUT),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn recognized_keys_are_collected() {
        let vars = [
            (ENV_TIMEOUT.to_string(), "45s".to_string()),
            (ENV_VERBOSE.to_string(), "true".to_string()),
            (ENV_SHELL.to_string(), "/bin/zsh".to_string()),
            ("UXEC_SOMETHING_ELSE".to_string(), "ignored".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let settings = EnvSettings::from_vars(vars).unwrap();
        assert_eq!(settings.timeout_ms, Some(45_000));
        assert_eq!(settings.verbose, Some(true));
        assert_eq!(settings.shell, Some(ShellSpec::Program("/bin/zsh".into())));
    }

    #[test]
    fn malformed_bool_is_a_config_error() {
        let vars = [(ENV_QUIET.to_string(), "maybe".to_string())];
        assert!(EnvSettings::from_vars(vars).is_err());
    }

    #[test]
    fn apply_overlays_only_present_values() {
        let mut config = EngineConfig::default();
        let settings = EnvSettings {
            timeout_ms: Some(1_000),
            quiet: Some(true),
            ..EnvSettings::default()
        };
        settings.apply(&mut config);
        assert_eq!(config.default_timeout_ms, 1_000);
        assert!(config.quiet);
        // Untouched fields keep their defaults.
        assert!(!config.verbose);
        assert_eq!(config.timeout_signal, "SIGTERM");
    }
}
