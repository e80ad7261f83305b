//! External collaborators
//!
//! The orchestrator talks to the outside world only through the traits in
//! this module: a process invoker for the CLI under test, a resource client
//! for structured HTTP calls, a destructive state reset, and a write-only
//! artifact sink. Default implementations live in the submodules; tests
//! substitute their own.

pub mod artifacts;
pub mod http;
pub mod process;
pub mod reset;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::common::Result;
use crate::value::Value;

pub use artifacts::{FsArtifacts, MemoryArtifacts};
pub use http::{HttpResourceClient, Method, Unauthenticated};
pub use process::{CliSettings, ProcessInvoker};
pub use reset::{ApiReset, NoReset};

/// Captured outcome of one process invocation
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was killed or never reported a code
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr followed by stdout, as searched by expected-failure checks
    pub fn combined_output(&self) -> String {
        format!("{}{}", self.stderr, self.stdout)
    }
}

/// A fully rendered process invocation
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: Vec<String>,
    /// Layered scenario and command environment
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

/// Runs the CLI under test
#[async_trait]
pub trait CommandInvoker: Send + Sync {
    /// A non-zero exit is `Ok`; only failing to start or timing out is an
    /// error.
    async fn invoke(&self, invocation: &Invocation) -> Result<CommandResult>;

    /// Executable shown in `command.txt`
    fn program(&self) -> String;
}

/// One structured HTTP call
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path below the base URL, already expanded
    pub path: String,
    /// Route to the global base URL instead of the regional one
    pub global: bool,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub url: String,
    pub duration: Duration,
}

impl HttpResponse {
    /// Body as JSON, or `None` when empty or not JSON
    pub fn parsed(&self) -> Option<Value> {
        if self.body.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }
}

/// Issues resource-creation and listing calls against the system under test
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Any HTTP status is `Ok`; transport failures are errors.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Wipes remote state for a `resetOrg` directive
#[async_trait]
pub trait StateReset: Send + Sync {
    async fn reset(&self, label: &str) -> Result<()>;
}

/// Write-only persistence for postmortem files. Writes never fail the run.
pub trait ArtifactSink: Send + Sync {
    /// Store `contents` at `rel`, relative to the run directory
    fn write(&self, rel: &Path, contents: &[u8]);

    /// Absolute location of `rel`, when the sink is backed by a directory
    fn location(&self, rel: &Path) -> Option<PathBuf>;
}
