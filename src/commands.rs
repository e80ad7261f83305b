//! CLI command definitions
//!
//! Defines the clap commands for the harness CLI.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Discover and run scenarios
    Run(RunArgs),

    /// List discovered scenarios and whether they would be skipped
    List {
        /// Scenario files or directories to search
        #[arg(default_value = "scenarios")]
        paths: Vec<PathBuf>,

        /// Only list the scenario with this path or directory name
        #[arg(long, env = "E2E_SCENARIO")]
        scenario: Option<String>,
    },

    /// Materialize one step's inputs without running any command
    Render {
        /// Path to scenario.yaml
        scenario: PathBuf,

        /// Step name (or step-NNN for unnamed steps)
        #[arg(long)]
        step: String,

        /// Directory to write the inputs into; must be empty or missing
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Scenario files or directories to search
    #[arg(default_value = "scenarios")]
    pub paths: Vec<PathBuf>,

    /// Run only the scenario with this path or directory name
    #[arg(long, env = "E2E_SCENARIO")]
    pub scenario: Option<String>,

    /// Comma-separated globs of step names to skip
    #[arg(long, env = "E2E_SKIP_STEPS")]
    pub skip_steps: Option<String>,

    /// Halt after `step` or `step/command`
    #[arg(long, env = "E2E_STOP_AFTER")]
    pub stop_after: Option<String>,

    /// Rewrite expectation files from observed output
    #[arg(
        long,
        env = "E2E_UPDATE_EXPECT",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub update_expect: Option<String>,

    /// Run directory for artifacts and step inputs
    #[arg(long, env = "E2E_ARTIFACTS_DIR")]
    pub artifacts_dir: Option<PathBuf>,

    /// CLI binary under test (path or name on PATH)
    #[arg(long, env = "E2E_BIN")]
    pub bin: Option<String>,

    /// Regional API base URL for create commands and reset
    #[arg(long, env = "E2E_API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// API bearer token
    #[arg(long, env = "E2E_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Honor resetOrg directives (set to a falsy value to disable)
    #[arg(long, env = "E2E_RESET")]
    pub reset: Option<String>,
}
