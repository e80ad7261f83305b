//! Error types for the scenario harness
//!
//! Every error that aborts a run carries enough context (unit path,
//! output snippet, artifact location) to diagnose it without re-running.

use std::io;
use thiserror::Error;

use crate::collab::CommandResult;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of bytes of captured output quoted in error messages
pub const SNIPPET_LIMIT: usize = 2048;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Load Errors ===
    #[error("Failed to load '{path}': {message}")]
    Load { path: String, message: String },

    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    // === Overlay Errors ===
    #[error("Template error: {0}")]
    Template(String),

    #[error("Overlay error: {0}")]
    Overlay(String),

    #[error("Invalid match expression '{expr}': {reason}")]
    MatchExpr { expr: String, reason: String },

    // === Command Errors ===
    #[error("{message}")]
    Command {
        name: String,
        message: String,
        result: Box<CommandResult>,
    },

    #[error("Command '{name}': {message}")]
    ExpectedFailure { name: String, message: String },

    #[error("Unexpected status {status} (expected {expected}): {body}")]
    HttpStatus {
        status: u16,
        expected: u16,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Failed to start process: {0}")]
    SpawnFailed(String),

    #[error("Unparsable command output (parseAs={mode}): {message}")]
    OutputParse { mode: String, message: String },

    // === Assertion Errors ===
    #[error("Selector '{expr}' failed: {message}")]
    Selector { expr: String, message: String },

    #[error("Expectation error: {0}")]
    Expectation(String),

    #[error("Assertion mismatch{}\n{diff}", .artifacts.as_ref().map(|a| format!("; see {a}")).unwrap_or_default())]
    AssertionMismatch {
        diff: String,
        artifacts: Option<String>,
    },

    // === Retry / Context ===
    #[error("Retries exhausted after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("{source}\nartifacts: {location}")]
    Artifacts {
        location: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{path}: {source}")]
    Unit {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{failed} of {total} scenario(s) failed")]
    RunFailed { failed: usize, total: usize },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO / Serialization Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a load error for a definition or expectation file
    pub fn load(path: impl AsRef<std::path::Path>, message: impl std::fmt::Display) -> Self {
        Self::Load {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    /// Create an invalid match expression error
    pub fn match_expr(expr: &str, reason: impl Into<String>) -> Self {
        Self::MatchExpr {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach a `scenario/step/command[/assertion]` path to an error
    pub fn in_unit(self, path: impl Into<String>) -> Self {
        Self::Unit {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Point at the directory holding the failed unit's artifacts, when the
    /// sink has one on disk
    pub fn with_artifacts(self, location: Option<std::path::PathBuf>) -> Self {
        match location {
            Some(dir) => Self::Artifacts {
                location: dir.display().to_string(),
                source: Box::new(self),
            },
            None => self,
        }
    }

    /// The innermost error, looking through context and retry wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Unit { source, .. }
            | Error::RetryExhausted { source, .. }
            | Error::Artifacts { source, .. } => source.root(),
            other => other,
        }
    }

    /// Captured process result, if this error came from a command invocation
    pub fn command_result(&self) -> Option<&CommandResult> {
        match self.root() {
            Error::Command { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Errors caused by malformed test authoring; these never retry
    pub fn is_authoring(&self) -> bool {
        matches!(
            self.root(),
            Error::Load { .. }
                | Error::InvalidScenario(_)
                | Error::Template(_)
                | Error::Overlay(_)
                | Error::MatchExpr { .. }
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }

    /// Text used by retry classification.
    ///
    /// Only the innermost failure and the captured output count. Unit paths,
    /// artifact locations and command names stay out so they cannot match a
    /// pattern by accident.
    pub fn detail(&self) -> String {
        match self.root() {
            Error::Command { result, .. } => {
                let mut detail = format!("exit status {}", result.exit_code);
                for output in [&result.stderr, &result.stdout] {
                    if !output.is_empty() {
                        detail.push('\n');
                        detail.push_str(output);
                    }
                }
                detail
            }
            Error::AssertionMismatch { diff, .. } => diff.clone(),
            other => other.to_string(),
        }
    }
}

/// Truncate captured output for inclusion in error messages
pub fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= SNIPPET_LIMIT {
        return trimmed.to_string();
    }
    let mut end = SNIPPET_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}
