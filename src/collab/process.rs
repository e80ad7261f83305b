//! CLI invocation
//!
//! [`ProcessInvoker`] spawns the binary under test with tokio. The argument
//! helpers here own the CLI's conventions: `-o/--output` injection and the
//! `--profile` flag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{CommandInvoker, CommandResult, Invocation};
use crate::common::logging::redact;
use crate::common::{Error, Result};

/// Output format used when a command does not choose one
pub const DEFAULT_OUTPUT: &str = "json";

/// Conventions of the CLI under test
#[derive(Debug, Clone)]
pub struct CliSettings {
    /// Appended as `--profile <p>` unless the args already carry one
    pub profile: Option<String>,
    /// Injected as `-o <fmt>` for commands that inherit the output format
    pub default_output: Option<String>,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            profile: None,
            default_output: Some(DEFAULT_OUTPUT.to_string()),
        }
    }
}

/// True when the args already choose an output format
pub fn has_output_arg(args: &[String]) -> bool {
    args.iter()
        .any(|a| a == "-o" || a == "--output" || a.starts_with("--output="))
}

fn has_profile_arg(args: &[String]) -> bool {
    args.iter()
        .any(|a| a == "--profile" || a.starts_with("--profile="))
}

/// Finish rendered arguments for one invocation.
///
/// `output_format` is the command's `outputFormat`: `json`, `yaml` or
/// `text` inject `-o <fmt>`; `none`/`disable` inject nothing; empty or
/// `inherit` use the configured default. Existing `-o/--output` args are
/// never overridden.
pub fn finish_args(
    mut args: Vec<String>,
    output_format: Option<&str>,
    settings: &CliSettings,
) -> Result<Vec<String>> {
    let requested = output_format.map(str::trim).unwrap_or_default();
    let inject = match requested.to_ascii_lowercase().as_str() {
        "" | "inherit" => settings.default_output.clone().filter(|o| !o.trim().is_empty()),
        "none" | "disable" => None,
        "json" | "yaml" | "text" => Some(requested.to_string()),
        _ => {
            return Err(Error::InvalidScenario(format!(
                "unsupported output format '{}'",
                requested
            )))
        }
    };

    if let Some(profile) = settings.profile.as_deref().filter(|p| !p.is_empty()) {
        if !has_profile_arg(&args) {
            args.push("--profile".to_string());
            args.push(profile.to_string());
        }
    }
    if let Some(fmt) = inject {
        if !has_output_arg(&args) {
            args.push("-o".to_string());
            args.push(fmt);
        }
    }
    Ok(args)
}

/// Arguments for a fresh `get` read used by assertions; always JSON
pub fn get_args(resource: &str, settings: &CliSettings) -> Vec<String> {
    let mut args = vec!["get".to_string()];
    args.extend(resource.split_whitespace().map(String::from));
    // "json" is always accepted by finish_args
    finish_args(args.clone(), Some("json"), settings).unwrap_or(args)
}

/// Locate the binary under test: an existing path, or a name on `PATH`
pub fn resolve_binary(bin: &str) -> Result<PathBuf> {
    let path = Path::new(bin);
    if path.components().count() > 1 || path.exists() {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Config(format!("CLI binary not found at {}", path.display())));
    }
    which::which(bin).map_err(|_| Error::Config(format!("CLI binary '{}' not found on PATH", bin)))
}

/// Spawns the CLI under test once per invocation
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    bin: PathBuf,
    timeout: Duration,
    env: BTreeMap<String, String>,
}

impl ProcessInvoker {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
            env: BTreeMap::new(),
        }
    }

    /// Environment applied beneath every invocation's own env
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

#[async_trait]
impl CommandInvoker for ProcessInvoker {
    async fn invoke(&self, invocation: &Invocation) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&invocation.args)
            .envs(&self.env)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.workdir {
            cmd.current_dir(dir);
        }

        for (key, value) in &invocation.env {
            debug!("env {}={}", key, redact(key, value));
        }
        debug!("Run: {} {}", self.bin.display(), invocation.args.join(" "));

        let start = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", self.bin.display(), e)))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(Error::Timeout(self.timeout.as_secs())),
        };

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        };
        debug!("Run: exit={} duration={:?}", result.exit_code, result.duration);
        Ok(result)
    }

    fn program(&self) -> String {
        self.bin.display().to_string()
    }
}
