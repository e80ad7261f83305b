//! Scenario definition types
//!
//! Defines the data structures for deserializing `scenario.yaml` files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::common::{Error, Result};
use crate::overlay::OverlayOp;
use crate::retry::RetryPolicy;
use crate::value::{Map, Value};

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// Fixture tree copied into each step's working directory
    #[serde(default)]
    pub base_inputs_path: Option<String>,
    /// Environment applied to every command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Initial variable namespace
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default)]
    pub defaults: Defaults,
    /// Preflight gates evaluated before anything runs
    #[serde(default)]
    pub test: TestGate,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Scenario-wide retry and mask defaults
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Defaults {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub mask: Mask,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TestGate {
    pub enabled: Option<bool>,
    /// Env var that must hold a truthy value
    pub enabled_by_env_var: Option<String>,
    /// Env vars that must be set and non-empty
    #[serde(default)]
    pub required_env_vars: Vec<String>,
    /// Prefix for skip reasons
    pub info: Option<String>,
}

/// Keys removed recursively from both sides of a comparison
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Mask {
    #[serde(default)]
    pub drop_keys: Vec<String>,
}

/// Union of mask scopes, first occurrence order, blanks dropped
pub fn union_keys(scopes: &[&Mask]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in scopes.iter().flat_map(|m| m.drop_keys.iter()) {
        if !key.is_empty() && !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub name: String,
    /// Run without copying the base fixture or applying overlays
    #[serde(default)]
    pub skip_inputs: bool,
    #[serde(default)]
    pub input_overlay_dirs: Vec<String>,
    #[serde(default)]
    pub input_overlay_ops_files: Vec<String>,
    #[serde(default)]
    pub input_overlay_ops: Vec<OverlayOp>,
    #[serde(default)]
    pub mask: Mask,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Step {
    /// Declared name, or `step-NNN` by position
    pub fn display_name(&self, index: usize) -> String {
        unit_name(&self.name, "step", index)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(default)]
    pub name: String,
    /// CLI argument templates
    #[serde(default)]
    pub run: Vec<String>,
    pub create: Option<CreateSpec>,
    /// Synthetic directive: wipe remote state
    #[serde(default)]
    pub reset_org: bool,
    /// Per-invocation environment, layered over the scenario env
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mask: Mask,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    pub expect_failure: Option<ExpectedFailure>,
    /// `json`, `yaml`, `text`, `none`/`disable`, or empty/`inherit`
    pub output_format: Option<String>,
    /// `json` (default), `yaml` or `raw`
    pub parse_as: Option<String>,
    /// Path receiving raw stdout, relative to the step directory
    pub stdout_file: Option<String>,
    pub record_var: Option<RecordVar>,
}

/// What a command does, once validated
#[derive(Debug, Clone, Copy)]
pub enum CommandKind<'a> {
    Reset,
    Create(&'a CreateSpec),
    Run(&'a [String]),
}

impl Command {
    /// Declared name, or `command-NNN` by position
    pub fn display_name(&self, index: usize) -> String {
        unit_name(&self.name, "command", index)
    }

    pub fn kind(&self) -> CommandKind<'_> {
        if self.reset_org {
            CommandKind::Reset
        } else if let Some(create) = &self.create {
            CommandKind::Create(create)
        } else {
            CommandKind::Run(&self.run)
        }
    }

    /// `recordVar` from either the command or its create block
    pub fn record_var(&self) -> Option<&RecordVar> {
        self.record_var
            .as_ref()
            .or_else(|| self.create.as_ref().and_then(|c| c.record_var.as_ref()))
    }
}

/// Structured resource-creation call
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSpec {
    /// Logical resource name from the endpoint table
    pub resource: String,
    #[serde(default)]
    pub payload: Payload,
    pub expect_status: Option<u16>,
    #[serde(default)]
    pub path_params: BTreeMap<String, String>,
    pub record_var: Option<RecordVar>,
}

/// Request body: a templated file, or an inline document
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Payload {
    pub file: Option<String>,
    pub inline: Option<Value>,
}

/// Store one scalar from the parsed output into the variable namespace
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RecordVar {
    pub name: String,
    /// Query path, `id` when omitted
    #[serde(default, alias = "responsePath")]
    pub path: Option<String>,
}

impl RecordVar {
    pub fn query(&self) -> &str {
        match self.path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p,
            _ => "id",
        }
    }
}

/// A command that must fail, optionally in a specific way
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedFailure {
    pub exit_code: Option<i32>,
    pub contains: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Assertion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source: AssertionSource,
    /// Selector evaluated against the source
    pub select: Option<String>,
    #[serde(default)]
    pub expect: Expect,
    #[serde(default)]
    pub mask: Mask,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Assertion {
    /// Declared name, or `assert-NNN` by position
    pub fn display_name(&self, index: usize) -> String {
        unit_name(&self.name, "assert", index)
    }
}

/// Parent command output when `get` is absent
#[derive(Deserialize, Debug, Clone, Default)]
pub struct AssertionSource {
    pub get: Option<String>,
}

/// Inline `fields` win over `file` when both are present
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Expect {
    pub file: Option<String>,
    #[serde(default)]
    pub overlays: Vec<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Expect {
    pub fn is_inline(&self) -> bool {
        !self.fields.is_empty()
    }
}

fn unit_name(declared: &str, prefix: &str, index: usize) -> String {
    let trimmed = declared.trim();
    if trimmed.is_empty() {
        format!("{}-{:03}", prefix, index)
    } else {
        trimmed.to_string()
    }
}

impl Scenario {
    /// Load and validate a scenario definition
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::load(path, e))?;
        let scenario: Scenario = serde_yaml::from_str(&content).map_err(|e| Error::load(path, e))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Structural checks that do not depend on the system under test
    pub fn validate(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            let step_name = step.display_name(i);
            if !step.skip_inputs && blank(self.base_inputs_path.as_deref()) {
                return Err(Error::InvalidScenario(format!(
                    "step {}: baseInputsPath is required unless skipInputs is set",
                    step_name
                )));
            }
            for (j, cmd) in step.commands.iter().enumerate() {
                let unit = format!("{}/{}", step_name, cmd.display_name(j));
                validate_command(&unit, cmd)?;
            }
        }
        Ok(())
    }
}

fn validate_command(unit: &str, cmd: &Command) -> Result<()> {
    let invalid = |msg: &str| Err(Error::InvalidScenario(format!("command {}: {}", unit, msg)));

    if cmd.reset_org && (cmd.create.is_some() || !cmd.run.is_empty()) {
        return invalid("resetOrg commands cannot set run or create");
    }

    if let Some(create) = &cmd.create {
        if !cmd.run.is_empty() {
            return invalid("create commands cannot set run");
        }
        if cmd.expect_failure.is_some() {
            return invalid("expectFailure not supported for create commands");
        }
        if create.resource.trim().is_empty() {
            return invalid("create.resource is required");
        }
        if !blank(create.payload.file.as_deref()) && create.payload.inline.is_some() {
            return invalid("create.payload takes either file or inline, not both");
        }
    } else if !cmd.reset_org && cmd.run.is_empty() {
        return invalid("one of run, create or resetOrg is required");
    }

    if let Some(rv) = cmd.record_var() {
        if rv.name.trim().is_empty() {
            return invalid("recordVar name is required");
        }
    }

    for (k, assertion) in cmd.assertions.iter().enumerate() {
        if !assertion.expect.is_inline() && blank(assertion.expect.file.as_deref()) {
            return Err(Error::InvalidScenario(format!(
                "assertion {}/{}: expect.file not set and no expect.fields provided",
                unit,
                assertion.display_name(k)
            )));
        }
    }
    Ok(())
}

fn blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}
