//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::paths::config_path;
use super::{Error, Result};
use crate::collab::reset::{default_reset_endpoints, ResetEndpoint};

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// CLI under test
    #[serde(default)]
    pub cli: CliConfig,

    /// HTTP API used by create commands and reset
    #[serde(default)]
    pub api: ApiConfig,

    /// Artifact locations
    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// Remote-state reset
    #[serde(default)]
    pub reset: ResetConfig,
}

/// CLI under test
#[derive(Debug, Deserialize, Clone)]
pub struct CliConfig {
    /// Binary path or name on PATH
    pub bin: Option<String>,

    /// Profile passed as `--profile`
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Output format injected when a command inherits it
    #[serde(default = "default_output")]
    pub output: String,

    /// Per-invocation timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bin: None,
            profile: default_profile(),
            output: default_output(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_profile() -> String {
    "e2e".to_string()
}
fn default_output() -> String {
    "json".to_string()
}
fn default_timeout() -> u64 {
    60
}

/// HTTP API settings
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Base URL for endpoints served globally
    #[serde(default = "default_global_base_url")]
    pub global_base_url: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            global_base_url: default_global_base_url(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://us.api.konghq.com".to_string()
}
fn default_global_base_url() -> String {
    "https://global.api.konghq.com".to_string()
}
fn default_token_env() -> String {
    "E2E_API_TOKEN".to_string()
}
fn default_request_timeout() -> u64 {
    30
}

impl ApiConfig {
    /// Token from the configured environment variable, if set and non-empty
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// Artifact settings
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ArtifactsConfig {
    /// Root for run directories; platform data dir when unset
    pub dir: Option<PathBuf>,
}

/// Reset settings
#[derive(Debug, Deserialize, Clone)]
pub struct ResetConfig {
    /// `resetOrg` directives are honored only when enabled
    #[serde(default = "default_reset_enabled")]
    pub enabled: bool,

    /// Collections emptied in order
    #[serde(default = "default_reset_endpoints")]
    pub endpoints: Vec<ResetEndpoint>,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            enabled: default_reset_enabled(),
            endpoints: default_reset_endpoints(),
        }
    }
}

fn default_reset_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::load(path, e))?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
    }
}
