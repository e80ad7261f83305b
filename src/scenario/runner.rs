//! Scenario execution
//!
//! Walks a scenario's steps and commands strictly in order. Each step gets
//! a fresh working directory built from the base fixture and its overlays;
//! each command is a reset, a resource creation or a CLI invocation,
//! optionally followed by assertions against its parsed output. The first
//! failure aborts the scenario with its unit path attached.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use colored::Colorize;
use serde_json::json;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::config::{
    union_keys, Command, CommandKind, CreateSpec, ExpectedFailure, RecordVar, Scenario, Step,
};
use super::filter::{SkipList, StopAfter};
use super::preflight::{process_env, skip_reason};
use crate::assertion::{self, AssertionEnv, SourceReader};
use crate::collab::artifacts::{sanitize_name, seq_dir};
use crate::collab::http::find_endpoint;
use crate::collab::process::{finish_args, get_args};
use crate::collab::{
    ArtifactSink, CliSettings, CommandInvoker, CommandResult, HttpRequest, Invocation,
    ResourceClient, StateReset,
};
use crate::common::logging::redact;
use crate::common::{snippet, Error, Result};
use crate::overlay::{
    apply_overlay_dir, apply_overlay_ops, apply_overlay_ops_file, render, render_value,
    TemplateContext,
};
use crate::retry::{Retrier, RetryPolicy};
use crate::value::query::search;
use crate::value::{parse_json, parse_yaml, scalar_text, Map, Value};

/// Run-shaping controls supplied from outside the scenario document
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub skip_steps: SkipList,
    pub stop_after: Option<StopAfter>,
    /// Rewrite file expectations from observed output instead of failing
    pub update_expect: bool,
    /// Run directory; step working directories are created beneath it
    pub work_root: PathBuf,
}

/// Everything the runner delegates to
#[derive(Clone)]
pub struct Collaborators {
    pub invoker: Arc<dyn CommandInvoker>,
    pub resources: Arc<dyn ResourceClient>,
    pub reset: Arc<dyn StateReset>,
    /// Rooted at the same run directory as [`RunOptions::work_root`]
    pub artifacts: Arc<dyn ArtifactSink>,
    pub cli: CliSettings,
}

/// Mutable state carried through one scenario run
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    /// Display name, used as the first segment of unit paths
    pub name: String,
    /// Directory holding `scenario.yaml`; relative references resolve here
    pub dir: PathBuf,
    /// Variable namespace; written only by `recordVar`
    pub vars: Map<String, Value>,
    /// Scenario directory relative to the run root
    rel_root: PathBuf,
}

impl ScenarioContext {
    pub fn new(name: &str, dir: &Path, vars: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            vars,
            rel_root: PathBuf::from("scenarios").join(sanitize_name(name)),
        }
    }

    pub fn template(&self, step: &str, workdir: &Path) -> TemplateContext {
        TemplateContext::new(self.vars.clone(), &self.dir, step, workdir)
    }

    fn step_rel(&self, index: usize, step: &str) -> PathBuf {
        self.rel_root.join("steps").join(seq_dir(index, step))
    }
}

/// Per-step record in a [`ScenarioResult`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub skipped: bool,
    pub commands_run: usize,
}

/// What happened during a scenario that did not fail
#[derive(Debug, Clone, Default)]
pub struct ScenarioResult {
    pub name: String,
    /// Preflight skip reason; no step ran
    pub skipped: Option<String>,
    pub steps: Vec<StepReport>,
    /// Stop-after target that halted the run
    pub stopped_after: Option<String>,
    /// Final variable namespace
    pub vars: Map<String, Value>,
}

impl ScenarioResult {
    pub fn commands_run(&self) -> usize {
        self.steps.iter().map(|s| s.commands_run).sum()
    }
}

/// Executes scenarios against a fixed set of collaborators
pub struct Runner {
    collab: Collaborators,
    options: RunOptions,
}

impl Runner {
    pub fn new(collab: Collaborators, options: RunOptions) -> Self {
        Self { collab, options }
    }

    /// Load, gate and run the scenario at `path`
    pub async fn run_path(&self, name: &str, path: &Path) -> Result<ScenarioResult> {
        let scenario = Scenario::load(path).map_err(|e| e.in_unit(name))?;
        let dir = path.parent().unwrap_or(Path::new("."));

        if let Some(reason) = skip_reason(&scenario, process_env) {
            println!("{} {} {}", "↷".yellow(), name.white().bold(), reason.dimmed());
            return Ok(ScenarioResult {
                name: name.to_string(),
                skipped: Some(reason),
                ..Default::default()
            });
        }
        self.run(name, &scenario, dir).await
    }

    /// Run an already loaded scenario whose relative references resolve
    /// against `dir`
    pub async fn run(&self, name: &str, scenario: &Scenario, dir: &Path) -> Result<ScenarioResult> {
        let mut ctx = ScenarioContext::new(name, dir, scenario.vars.clone());
        let mut result = ScenarioResult {
            name: name.to_string(),
            ..Default::default()
        };

        println!("\n{} {}", "Scenario:".blue().bold(), name.white().bold());

        for (i, step) in scenario.steps.iter().enumerate() {
            let step_name = step.display_name(i);
            if self.options.skip_steps.skips(&step_name) {
                warn!("Skipping step {} (matched skip list)", step_name);
                println!("  {} {}", "↷".yellow(), step_name.dimmed());
                result.steps.push(StepReport {
                    name: step_name,
                    skipped: true,
                    commands_run: 0,
                });
                continue;
            }

            let halted = self
                .run_step(scenario, step, i, &step_name, &mut ctx, &mut result)
                .await?;
            if halted {
                break;
            }
        }

        result.vars = ctx.vars;
        Ok(result)
    }

    /// Returns true when the stop-after target was reached
    async fn run_step(
        &self,
        scenario: &Scenario,
        step: &Step,
        index: usize,
        step_name: &str,
        ctx: &mut ScenarioContext,
        result: &mut ScenarioResult,
    ) -> Result<bool> {
        let step_unit = format!("{}/{}", ctx.name, step_name);
        let step_rel = ctx.step_rel(index, step_name);
        let step_dir = self.options.work_root.join(&step_rel);
        let inputs = step_dir.join("inputs");

        info!("Step {}", step_unit);
        let tmpl = ctx.template(step_name, &inputs);
        prepare_step_inputs(scenario, step, &ctx.dir, &inputs, &tmpl)
            .map_err(|e| e.in_unit(&step_unit))?;
        println!("  {} {}", "▸".cyan(), step_name.white());

        result.steps.push(StepReport {
            name: step_name.to_string(),
            skipped: false,
            commands_run: 0,
        });

        let total = step.commands.len();
        for (j, cmd) in step.commands.iter().enumerate() {
            let cmd_name = cmd.display_name(j);
            let unit = Unit {
                path: format!("{}/{}", step_unit, cmd_name),
                name: &cmd_name,
                step_name,
                step_dir: &step_dir,
                inputs: &inputs,
                rel: step_rel.join("commands").join(seq_dir(j, &cmd_name)),
            };

            match self.run_command(scenario, step, cmd, &unit, ctx).await {
                Ok(()) => println!("    {} {}", "✓".green(), cmd_name),
                Err(e) => {
                    println!("    {} {}", "✗".red(), cmd_name);
                    return Err(e);
                }
            }
            if let Some(report) = result.steps.last_mut() {
                report.commands_run += 1;
            }

            if let Some(stop) = &self.options.stop_after {
                if stop.reached_after_command(step_name, &cmd_name, j + 1 == total) {
                    info!("Stop-after target {} reached; halting", stop);
                    result.stopped_after = Some(stop.to_string());
                    return Ok(true);
                }
            }
        }

        if let Some(stop) = &self.options.stop_after {
            if total == 0 && stop.reached_after_empty_step(step_name) {
                info!("Stop-after target {} reached; halting", stop);
                result.stopped_after = Some(stop.to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn run_command(
        &self,
        scenario: &Scenario,
        step: &Step,
        cmd: &Command,
        unit: &Unit<'_>,
        ctx: &mut ScenarioContext,
    ) -> Result<()> {
        let tmpl = ctx.template(unit.step_name, unit.inputs);

        let stdout = match cmd.kind() {
            CommandKind::Reset => {
                self.collab
                    .artifacts
                    .write(&unit.rel.join("command.txt"), b"resetOrg\n");
                return self
                    .collab
                    .reset
                    .reset(&unit.path)
                    .await
                    .map_err(|e| e.in_unit(&unit.path));
            }
            CommandKind::Create(spec) => {
                let retrier = command_retrier(scenario, step, cmd).map_err(|e| e.in_unit(&unit.path))?;
                self.create(spec, unit, &ctx.dir, &tmpl, &retrier)
                    .await
                    .map_err(|e| e.in_unit(&unit.path))?
            }
            CommandKind::Run(args) => {
                let retrier = command_retrier(scenario, step, cmd).map_err(|e| e.in_unit(&unit.path))?;
                match self
                    .invoke(args, scenario, cmd, unit, &tmpl, &retrier)
                    .await
                    .map_err(|e| e.in_unit(&unit.path))?
                {
                    Some(stdout) => stdout,
                    // expected failure satisfied; no assertions
                    None => return Ok(()),
                }
            }
        };

        let parent = self
            .after_output(cmd, unit, &stdout, ctx)
            .map_err(|e| e.in_unit(&unit.path))?;
        self.run_assertions(scenario, step, cmd, unit, ctx, &parent)
            .await
    }

    /// Invoke the CLI. `None` means an expected failure was satisfied.
    async fn invoke(
        &self,
        args: &[String],
        scenario: &Scenario,
        cmd: &Command,
        unit: &Unit<'_>,
        tmpl: &TemplateContext,
        retrier: &Retrier,
    ) -> Result<Option<String>> {
        let rendered = args
            .iter()
            .map(|a| render(a, tmpl))
            .collect::<Result<Vec<_>>>()?;
        let args = finish_args(rendered, cmd.output_format.as_deref(), &self.collab.cli)?;

        let mut env = scenario.env.clone();
        env.extend(cmd.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let invocation = Invocation {
            args,
            env,
            workdir: Some(unit.step_dir.to_path_buf()),
        };

        if let Some(expected) = &cmd.expect_failure {
            let result = self.collab.invoker.invoke(&invocation).await?;
            self.write_command_artifacts(unit, &invocation, &result);
            check_expected_failure(unit.name, expected, &result)
                .map_err(|e| e.with_artifacts(self.collab.artifacts.location(&unit.rel)))?;
            debug!("{}: failed as expected (exit={})", unit.path, result.exit_code);
            return Ok(None);
        }

        let invocation = &invocation;
        retrier
            .run(&unit.path, |e| retrier.should_retry(e), move |attempt| async move {
                debug!("{}: attempt {}", unit.path, attempt + 1);
                let result = self.collab.invoker.invoke(invocation).await?;
                self.write_command_artifacts(unit, invocation, &result);
                if !result.success() {
                    return Err(command_failure(unit, result));
                }
                Ok(Some(result.stdout))
            })
            .await
            .map_err(|e| e.with_artifacts(self.collab.artifacts.location(&unit.rel)))
    }

    fn write_command_artifacts(&self, unit: &Unit<'_>, invocation: &Invocation, result: &CommandResult) {
        let sink = &self.collab.artifacts;
        let mut line = String::new();
        for (key, value) in &invocation.env {
            line.push_str(&format!("{}={} ", key, redact(key, value)));
        }
        line.push_str(&self.collab.invoker.program());
        for arg in &invocation.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line.push('\n');
        sink.write(&unit.rel.join("command.txt"), line.as_bytes());
        sink.write(&unit.rel.join("stdout.txt"), result.stdout.as_bytes());
        sink.write(&unit.rel.join("stderr.txt"), result.stderr.as_bytes());

        let meta = json!({
            "name": unit.name,
            "kind": "run",
            "args": invocation.args,
            "exitCode": result.exit_code,
            "durationMs": result.duration.as_millis() as u64,
        });
        if let Ok(text) = serde_json::to_string_pretty(&meta) {
            sink.write(&unit.rel.join("meta.json"), text.as_bytes());
        }
    }

    /// Resource creation through the endpoint table; returns the response body
    async fn create(
        &self,
        spec: &CreateSpec,
        unit: &Unit<'_>,
        scenario_dir: &Path,
        tmpl: &TemplateContext,
        retrier: &Retrier,
    ) -> Result<String> {
        let endpoint = find_endpoint(&spec.resource).ok_or_else(|| {
            Error::InvalidScenario(format!("unknown create resource '{}'", spec.resource.trim()))
        })?;
        let mut params = BTreeMap::new();
        for (key, value) in &spec.path_params {
            params.insert(key.clone(), render(value, tmpl)?);
        }
        let path = endpoint.expand_path(&params)?;
        let expected = spec
            .expect_status
            .unwrap_or_else(|| endpoint.method.default_status());

        let request = &HttpRequest {
            method: endpoint.method,
            path,
            global: endpoint.global,
            body: Some(build_payload(spec, scenario_dir, tmpl)?),
        };
        if let Some(body) = &request.body {
            if let Ok(text) = serde_json::to_string_pretty(body) {
                self.collab
                    .artifacts
                    .write(&unit.rel.join("request.json"), text.as_bytes());
            }
        }

        let body = retrier
            .run(&unit.path, |e| retrier.should_retry(e), move |attempt| async move {
                debug!("{}: attempt {}", unit.path, attempt + 1);
                let response = self.collab.resources.send(request).await?;

                let sink = &self.collab.artifacts;
                let line = format!("{} {}\n", request.method, response.url);
                sink.write(&unit.rel.join("command.txt"), line.as_bytes());
                sink.write(&unit.rel.join("stdout.txt"), response.body.as_bytes());
                let meta = json!({
                    "name": unit.name,
                    "kind": "create",
                    "resource": spec.resource.trim(),
                    "status": response.status,
                    "expectStatus": expected,
                    "durationMs": response.duration.as_millis() as u64,
                });
                if let Ok(text) = serde_json::to_string_pretty(&meta) {
                    sink.write(&unit.rel.join("meta.json"), text.as_bytes());
                }

                if response.status != expected {
                    return Err(Error::HttpStatus {
                        status: response.status,
                        expected,
                        body: snippet(&response.body),
                    });
                }
                Ok(response.body)
            })
            .await
            .map_err(|e| e.with_artifacts(self.collab.artifacts.location(&unit.rel)))?;

        info!("{}: created {}", unit.path, spec.resource.trim());
        Ok(body)
    }

    /// stdoutFile, parsing and recordVar; returns the parsed output
    fn after_output(
        &self,
        cmd: &Command,
        unit: &Unit<'_>,
        stdout: &str,
        ctx: &mut ScenarioContext,
    ) -> Result<Value> {
        if let Some(target) = cmd.stdout_file.as_deref().filter(|t| !t.trim().is_empty()) {
            let tmpl = ctx.template(unit.step_name, unit.inputs);
            write_stdout_file(target, stdout, unit.step_dir, &tmpl)?;
        }

        let parsed = parse_output(cmd.parse_as.as_deref(), stdout)?;

        if let Some(rv) = cmd.record_var() {
            let value = record_var(rv, &parsed)?;
            info!("{}: set var {}={}", unit.path, rv.name.trim(), value);
            ctx.vars
                .insert(rv.name.trim().to_string(), Value::String(value));
        }
        Ok(parsed)
    }

    async fn run_assertions(
        &self,
        scenario: &Scenario,
        step: &Step,
        cmd: &Command,
        unit: &Unit<'_>,
        ctx: &ScenarioContext,
        parent: &Value,
    ) -> Result<()> {
        if cmd.assertions.is_empty() {
            return Ok(());
        }
        let tmpl = ctx.template(unit.step_name, unit.inputs);
        let mut env = scenario.env.clone();
        env.extend(cmd.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let reader = CliReader {
            invoker: self.collab.invoker.as_ref(),
            cli: &self.collab.cli,
            env,
            workdir: unit.step_dir.to_path_buf(),
        };

        for (k, assertion) in cmd.assertions.iter().enumerate() {
            let name = assertion.display_name(k);
            let path = format!("{}/{}", unit.path, name);

            let policy = RetryPolicy::compose(&[
                &scenario.defaults.retry,
                &step.retry,
                &cmd.retry,
                &assertion.retry,
            ]);
            let retrier = Retrier::from_policy(&policy).map_err(|e| e.in_unit(&path))?;
            let mask = union_keys(&[&scenario.defaults.mask, &step.mask, &cmd.mask, &assertion.mask]);
            let assert_env = AssertionEnv {
                scenario_dir: &ctx.dir,
                template: &tmpl,
                mask: &mask,
                update: self.options.update_expect,
                artifacts: self.collab.artifacts.as_ref(),
                artifact_dir: unit.rel.join("assertions").join(sanitize_name(&name)),
            };

            assertion::check(&path, assertion, parent, &reader, &assert_env, &retrier)
                .await
                .map_err(|e| e.in_unit(&path))?;
            debug!("{}: passed", path);
        }
        Ok(())
    }
}

/// Location of one command within the run
struct Unit<'a> {
    /// `scenario/step/command`
    path: String,
    name: &'a str,
    step_name: &'a str,
    step_dir: &'a Path,
    inputs: &'a Path,
    /// Command artifact directory relative to the run root
    rel: PathBuf,
}

/// Fresh reads for `source.get`, issued through the CLI under test
struct CliReader<'a> {
    invoker: &'a dyn CommandInvoker,
    cli: &'a CliSettings,
    env: BTreeMap<String, String>,
    workdir: PathBuf,
}

#[async_trait]
impl<'a> SourceReader for CliReader<'a> {
    async fn read(&self, resource: &str) -> Result<Value> {
        let invocation = Invocation {
            args: get_args(resource, self.cli),
            env: self.env.clone(),
            workdir: Some(self.workdir.clone()),
        };
        let result = self.invoker.invoke(&invocation).await?;
        if !result.success() {
            let message = format!(
                "get {} failed (exit={})\nstderr:\n{}",
                resource,
                result.exit_code,
                snippet(&result.stderr)
            );
            return Err(Error::Command {
                name: format!("get {}", resource),
                message,
                result: Box::new(result),
            });
        }
        parse_output(Some("json"), &result.stdout)
    }
}

fn resolve(base: &Path, reference: &str) -> PathBuf {
    let path = Path::new(reference.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Build a step's working directory: a fresh copy of the base fixture with
/// overlay directories, ops files and inline ops applied in that order.
/// With `skipInputs` the directory is created empty.
pub fn prepare_step_inputs(
    scenario: &Scenario,
    step: &Step,
    scenario_dir: &Path,
    inputs: &Path,
    tmpl: &TemplateContext,
) -> Result<()> {
    if inputs.exists() {
        fs::remove_dir_all(inputs)?;
    }
    fs::create_dir_all(inputs)?;
    if step.skip_inputs {
        return Ok(());
    }

    let base = scenario
        .base_inputs_path
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| Error::InvalidScenario("baseInputsPath is required".to_string()))?;
    copy_tree(&resolve(scenario_dir, base), inputs)?;

    for dir in &step.input_overlay_dirs {
        debug!("Applying overlay dir {}", dir);
        apply_overlay_dir(inputs, &resolve(scenario_dir, dir), tmpl)?;
    }
    for file in &step.input_overlay_ops_files {
        debug!("Applying ops file {}", file);
        apply_overlay_ops_file(inputs, &resolve(scenario_dir, file), tmpl)?;
    }
    if !step.input_overlay_ops.is_empty() {
        apply_overlay_ops(inputs, &step.input_overlay_ops, tmpl)?;
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::load(src, "base inputs directory not found"));
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::load(src, e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Commands retry only when they declare their own retry block; the block
/// is then resolved against the step and scenario defaults. Expected
/// failures run once.
fn command_retrier(scenario: &Scenario, step: &Step, cmd: &Command) -> Result<Retrier> {
    if cmd.retry.is_empty() || cmd.expect_failure.is_some() {
        return Ok(Retrier::once());
    }
    Retrier::from_policy(&RetryPolicy::compose(&[
        &scenario.defaults.retry,
        &step.retry,
        &cmd.retry,
    ]))
}

fn command_failure(unit: &Unit<'_>, result: CommandResult) -> Error {
    let mut message = format!("command {} failed (exit={})", unit.name, result.exit_code);
    let stderr = snippet(&result.stderr);
    if !stderr.is_empty() {
        message.push_str(&format!("\nstderr:\n{}", stderr));
    }
    Error::Command {
        name: unit.name.to_string(),
        message,
        result: Box::new(result),
    }
}

fn check_expected_failure(name: &str, expected: &ExpectedFailure, result: &CommandResult) -> Result<()> {
    let fail = |message: String| {
        Err(Error::ExpectedFailure {
            name: name.to_string(),
            message,
        })
    };
    if result.success() {
        return fail("expected failure but succeeded".to_string());
    }
    if let Some(code) = expected.exit_code {
        if result.exit_code != code {
            return fail(format!(
                "expected exit code {} but got {}",
                code, result.exit_code
            ));
        }
    }
    if let Some(needle) = expected.contains.as_deref().map(str::trim) {
        if !needle.is_empty() && !result.combined_output().contains(needle) {
            return fail(format!(
                "expected failure output to contain {:?}\nstderr: {}",
                needle,
                snippet(&result.stderr)
            ));
        }
    }
    Ok(())
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Request body for a create command. Payload files are rendered as text
/// and parsed as JSON when named `*.json`, YAML otherwise; inline payloads
/// have their string leaves rendered.
fn build_payload(spec: &CreateSpec, scenario_dir: &Path, tmpl: &TemplateContext) -> Result<Value> {
    let file = spec.payload.file.as_deref().map(str::trim).filter(|f| !f.is_empty());
    match (file, &spec.payload.inline) {
        (Some(file), _) => {
            let path = resolve(scenario_dir, file);
            let raw = fs::read_to_string(&path).map_err(|e| Error::load(&path, e))?;
            let text = render(&raw, tmpl)?;
            let is_json = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            let parsed = if is_json { parse_json(&text) } else { parse_yaml(&text) };
            parsed.map_err(|e| Error::load(&path, e))
        }
        (None, Some(inline)) => render_value(inline, tmpl),
        (None, None) => Ok(Value::Object(Map::new())),
    }
}

fn write_stdout_file(target: &str, stdout: &str, step_dir: &Path, tmpl: &TemplateContext) -> Result<()> {
    let rendered = render(target, tmpl)?;
    if rendered.trim().is_empty() {
        return Err(Error::InvalidScenario(
            "stdoutFile resolved to empty path".to_string(),
        ));
    }
    let path = resolve(step_dir, &rendered);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, stdout)?;
    Ok(())
}

/// Parse command output per `parseAs`: `json` (default, also `inherit`),
/// `yaml`, or `raw`. Empty output is null; structured modes require an
/// object or an array.
pub fn parse_output(mode: Option<&str>, stdout: &str) -> Result<Value> {
    let requested = mode.map(str::trim).unwrap_or_default().to_ascii_lowercase();
    let mode = match requested.as_str() {
        "" | "inherit" | "json" => "json",
        "yaml" => "yaml",
        "raw" => "raw",
        other => {
            return Err(Error::InvalidScenario(format!(
                "unsupported parseAs '{}'",
                other
            )))
        }
    };
    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    if mode == "raw" {
        return Ok(json!({ "stdout": stdout }));
    }

    let parse_error = |message: String| Error::OutputParse {
        mode: mode.to_string(),
        message: format!("{}\nstdout: {}", message, snippet(stdout)),
    };
    let parsed = if mode == "yaml" {
        parse_yaml(stdout)
    } else {
        parse_json(stdout)
    }
    .map_err(|e| parse_error(e.to_string()))?;

    match parsed {
        Value::Object(_) | Value::Array(_) => Ok(parsed),
        _ => Err(parse_error("unrecognized structured output".to_string())),
    }
}

/// Evaluate a `recordVar` against parsed output. Non-string scalars are
/// stringified; null and blank results are errors.
pub fn record_var(spec: &RecordVar, parsed: &Value) -> Result<String> {
    let name = spec.name.trim();
    let query = spec.query();
    let missing = |message: String| Error::Selector {
        expr: query.to_string(),
        message,
    };
    if parsed.is_null() {
        return Err(missing(format!("no output to record '{}' from", name)));
    }

    let found = search(query, parsed)?;
    let text = match &found {
        Value::Array(_) | Value::Object(_) => Some(found.to_string()),
        other => scalar_text(other),
    };
    text.filter(|t| !t.trim().is_empty())
        .ok_or_else(|| missing(format!("recordVar '{}' resolved to no value", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{HttpResponse, MemoryArtifacts, Method};
    use std::sync::Mutex;

    /// Replies by first argument: `list`, `boom` (exit 2) or an empty object
    #[derive(Default)]
    struct FakeInvoker {
        calls: Mutex<Vec<Invocation>>,
    }

    #[async_trait]
    impl CommandInvoker for FakeInvoker {
        async fn invoke(&self, invocation: &Invocation) -> Result<CommandResult> {
            self.calls.lock().unwrap().push(invocation.clone());
            let first = invocation.args.first().map(String::as_str).unwrap_or("");
            Ok(match first {
                "list" => CommandResult {
                    stdout: r#"{"items":[{"id":"a1","name":"blue-1","created_at":"now"}]}"#.into(),
                    ..Default::default()
                },
                "get" => CommandResult {
                    stdout: r#"[{"name":"blue-1","id":"a1"}]"#.into(),
                    ..Default::default()
                },
                "boom" => CommandResult {
                    stderr: "kaboom".into(),
                    exit_code: 2,
                    ..Default::default()
                },
                _ => CommandResult {
                    stdout: "{}".into(),
                    ..Default::default()
                },
            })
        }

        fn program(&self) -> String {
            "fakectl".to_string()
        }
    }

    #[derive(Default)]
    struct FakeResources {
        requests: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl ResourceClient for FakeResources {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(HttpResponse {
                status: 201,
                body: r#"{"id":"p-1","name":"dev"}"#.into(),
                url: format!("https://api.test{}", request.path),
                ..Default::default()
            })
        }
    }

    struct Harness {
        invoker: Arc<FakeInvoker>,
        resources: Arc<FakeResources>,
        artifacts: Arc<MemoryArtifacts>,
        work: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                invoker: Arc::new(FakeInvoker::default()),
                resources: Arc::new(FakeResources::default()),
                artifacts: Arc::new(MemoryArtifacts::default()),
                work: tempfile::tempdir().unwrap(),
            }
        }

        fn runner(&self, skip: &str, stop: &str) -> Runner {
            let collab = Collaborators {
                invoker: self.invoker.clone(),
                resources: self.resources.clone(),
                reset: Arc::new(crate::collab::NoReset),
                artifacts: self.artifacts.clone(),
                cli: CliSettings::default(),
            };
            Runner::new(
                collab,
                RunOptions {
                    skip_steps: SkipList::parse(skip),
                    stop_after: StopAfter::parse(stop),
                    update_expect: false,
                    work_root: self.work.path().to_path_buf(),
                },
            )
        }

        fn args(&self) -> Vec<Vec<String>> {
            self.invoker
                .calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.args.clone())
                .collect()
        }
    }

    fn scenario(yaml: &str) -> Scenario {
        let s: Scenario = serde_yaml::from_str(yaml).unwrap();
        s.validate().unwrap();
        s
    }

    const LIST_SCENARIO: &str = r#"
vars: { team: blue }
env: { SHARED: "1" }
steps:
  - name: apply
    skipInputs: true
    commands:
      - name: list
        run: ["list", "{{ .vars.team }}"]
        env: { ONLY_LIST: "yes" }
        recordVar: { name: firstId, path: "items[0].id" }
        assertions:
          - select: "items[0]"
            mask: { dropKeys: [created_at] }
            expect:
              fields:
                name: "{{ .vars.team }}-1"
                id: "{{ .vars.firstId }}"
          - source: { get: things }
            expect:
              fields:
                "[0].name": blue-1
  - name: cleanup
    skipInputs: true
    commands:
      - run: ["delete"]
"#;

    #[tokio::test]
    async fn test_run_records_vars_and_asserts() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let result = h
            .runner("", "")
            .run("demo", &scenario(LIST_SCENARIO), dir.path())
            .await
            .unwrap();

        assert_eq!(result.commands_run(), 2);
        assert_eq!(result.vars.get("firstId"), Some(&Value::String("a1".into())));
        assert_eq!(
            h.args(),
            vec![
                vec!["list", "blue", "-o", "json"],
                vec!["get", "things", "-o", "json"],
                vec!["delete", "-o", "json"],
            ]
        );

        let calls = h.invoker.calls.lock().unwrap();
        assert_eq!(calls[0].env.get("SHARED").map(String::as_str), Some("1"));
        assert_eq!(calls[0].env.get("ONLY_LIST").map(String::as_str), Some("yes"));
        assert!(!calls[2].env.contains_key("ONLY_LIST"));
        drop(calls);

        let cmd = "scenarios/demo/steps/000-apply/commands/000-list";
        let command_txt = h.artifacts.read(format!("{}/command.txt", cmd)).unwrap();
        assert!(command_txt.contains("fakectl list blue -o json"));
        let result_txt = h
            .artifacts
            .read(format!("{}/assertions/assert-000/result.txt", cmd))
            .unwrap();
        assert!(result_txt.starts_with("pass\n"));
    }

    #[tokio::test]
    async fn test_skip_list_and_stop_after() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let result = h
            .runner("CLEAN*", "")
            .run("demo", &scenario(LIST_SCENARIO), dir.path())
            .await
            .unwrap();
        assert!(result.steps[1].skipped);
        assert_eq!(h.args().len(), 2);

        let h = Harness::new();
        let result = h
            .runner("", "apply/list")
            .run("demo", &scenario(LIST_SCENARIO), dir.path())
            .await
            .unwrap();
        assert_eq!(result.stopped_after.as_deref(), Some("apply/list"));
        assert_eq!(result.steps.len(), 1);
        assert!(!h.args().iter().any(|a| a[0] == "delete"));
    }

    #[tokio::test]
    async fn test_failing_command_aborts_with_context() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let s = scenario(
            r#"
steps:
  - name: apply
    skipInputs: true
    commands:
      - run: ["boom"]
      - run: ["list"]
"#,
        );
        let err = h.runner("", "").run("demo", &s, dir.path()).await.unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("demo/apply/command-000: "), "{}", text);
        assert!(text.contains("exit=2"));
        assert!(text.contains("kaboom"));
        assert_eq!(err.command_result().map(|r| r.exit_code), Some(2));
        assert_eq!(h.args().len(), 1);
    }

    #[tokio::test]
    async fn test_expected_failure() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let ok = scenario(
            r#"
steps:
  - skipInputs: true
    commands:
      - run: ["boom"]
        expectFailure: { exitCode: 2, contains: kaboom }
"#,
        );
        h.runner("", "").run("demo", &ok, dir.path()).await.unwrap();

        let wrong_code = scenario(
            r#"
steps:
  - skipInputs: true
    commands:
      - run: ["boom"]
        expectFailure: { exitCode: 3 }
"#,
        );
        let err = h
            .runner("", "")
            .run("demo", &wrong_code, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::ExpectedFailure { .. }));
        assert!(err.to_string().contains("expected exit code 3 but got 2"));

        let succeeded = scenario(
            r#"
steps:
  - skipInputs: true
    commands:
      - run: ["list"]
        expectFailure: {}
"#,
        );
        let err = h
            .runner("", "")
            .run("demo", &succeeded, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected failure but succeeded"));
    }

    #[tokio::test]
    async fn test_assertion_failure_reports_unit_path() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let s = scenario(
            r#"
steps:
  - name: apply
    skipInputs: true
    commands:
      - name: list
        run: ["list"]
        assertions:
          - name: names
            select: "items[0]"
            expect:
              fields:
                name: red-1
"#,
        );
        let err = h.runner("", "").run("demo", &s, dir.path()).await.unwrap_err();
        assert!(err.to_string().starts_with("demo/apply/list/names: "));
        assert!(matches!(err.root(), Error::AssertionMismatch { .. }));
        let result = h
            .artifacts
            .read("scenarios/demo/steps/000-apply/commands/000-list/assertions/names/result.txt")
            .unwrap();
        assert!(result.starts_with("fail\n"));
    }

    #[tokio::test]
    async fn test_create_command_posts_and_records() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let s = scenario(
            r#"
vars: { env: qa }
steps:
  - skipInputs: true
    commands:
      - create:
          resource: portal
          payload: { inline: { name: "dev-{{ .vars.env }}" } }
          recordVar: { name: portalId }
"#,
        );
        let result = h.runner("", "").run("demo", &s, dir.path()).await.unwrap();
        assert_eq!(result.vars.get("portalId"), Some(&Value::String("p-1".into())));

        let requests = h.resources.requests.lock().unwrap();
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].path, "/v3/portals");
        assert_eq!(requests[0].body, Some(json!({"name": "dev-qa"})));
    }

    #[tokio::test]
    async fn test_create_status_mismatch() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let s = scenario(
            r#"
steps:
  - skipInputs: true
    commands:
      - create:
          resource: api
          expectStatus: 200
"#,
        );
        let err = h.runner("", "").run("demo", &s, dir.path()).await.unwrap_err();
        assert!(matches!(
            err.root(),
            Error::HttpStatus {
                status: 201,
                expected: 200,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_step_inputs_from_base_and_overlays() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("base")).unwrap();
        fs::write(
            dir.path().join("base/portal.yaml"),
            "portals:\n  - name: dev\n    description: old\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("overlays/one")).unwrap();
        fs::write(dir.path().join("overlays/one/extra.txt"), "step={{ .step }}").unwrap();

        let s = scenario(
            r#"
baseInputsPath: base
steps:
  - name: apply
    inputOverlayDirs: [overlays/one]
    inputOverlayOps:
      - file: portal.yaml
        match: "portals[?name=='dev']"
        set: { description: new }
    commands:
      - run: ["apply", "{{ .workdir }}"]
        stdoutFile: out/apply.json
"#,
        );
        h.runner("", "").run("demo", &s, dir.path()).await.unwrap();

        let step_dir = h.work.path().join("scenarios/demo/steps/000-apply");
        let inputs = step_dir.join("inputs");
        assert_eq!(fs::read_to_string(inputs.join("extra.txt")).unwrap(), "step=apply");
        let portal = crate::value::read_document(&inputs.join("portal.yaml")).unwrap();
        assert_eq!(portal["portals"][0]["description"], json!("new"));
        assert_eq!(fs::read_to_string(step_dir.join("out/apply.json")).unwrap(), "{}");
        assert_eq!(h.args()[0][1], inputs.display().to_string());
    }

    #[test]
    fn test_parse_output_modes() {
        assert_eq!(parse_output(None, "  \n").unwrap(), Value::Null);
        assert_eq!(parse_output(Some("inherit"), "[1]").unwrap(), json!([1]));
        assert_eq!(parse_output(Some("yaml"), "a: 1\n").unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_output(Some("raw"), "hello").unwrap(),
            json!({"stdout": "hello"})
        );
        assert!(matches!(
            parse_output(Some("json"), "42"),
            Err(Error::OutputParse { .. })
        ));
        assert!(matches!(
            parse_output(Some("json"), "not json"),
            Err(Error::OutputParse { .. })
        ));
        assert!(matches!(
            parse_output(Some("xml"), "<a/>"),
            Err(Error::InvalidScenario(_))
        ));
    }

    #[test]
    fn test_record_var_values() {
        let rv = |path: Option<&str>| RecordVar {
            name: "v".into(),
            path: path.map(String::from),
        };
        let doc = json!({"id": 7, "name": "x", "blank": " ", "items": [{"id": "i1"}]});
        assert_eq!(record_var(&rv(None), &doc).unwrap(), "7");
        assert_eq!(record_var(&rv(Some("items[0].id")), &doc).unwrap(), "i1");
        assert!(record_var(&rv(Some("missing")), &doc).is_err());
        assert!(record_var(&rv(Some("blank")), &doc).is_err());
        assert!(record_var(&rv(None), &Value::Null).is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("get"), "get");
        assert_eq!(shell_quote("--output=json"), "--output=json");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_payload_file_formats() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("p.json"), r#"{"name": "{{ .vars.n }}"}"#).unwrap();
        fs::write(dir.path().join("p.yaml"), "name: {{ .vars.n }}\ncount: 2\n").unwrap();
        let mut vars = Map::new();
        vars.insert("n".into(), json!("x"));
        let tmpl = TemplateContext::new(vars, dir.path(), "s", dir.path());

        let spec = |file: &str| CreateSpec {
            resource: "portal".into(),
            payload: crate::scenario::config::Payload {
                file: Some(file.into()),
                inline: None,
            },
            ..Default::default()
        };
        assert_eq!(
            build_payload(&spec("p.json"), dir.path(), &tmpl).unwrap(),
            json!({"name": "x"})
        );
        assert_eq!(
            build_payload(&spec("p.yaml"), dir.path(), &tmpl).unwrap(),
            json!({"name": "x", "count": 2})
        );
        assert_eq!(
            build_payload(&CreateSpec::default(), dir.path(), &tmpl).unwrap(),
            json!({})
        );
    }
}
