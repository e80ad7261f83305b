//! CLI command handling
//!
//! Builds the collaborators from configuration and flags, runs scenarios
//! and formats the summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tracing::info;

use crate::collab::process::resolve_binary;
use crate::collab::reset::ApiReset;
use crate::collab::{
    CliSettings, FsArtifacts, HttpResourceClient, NoReset, ProcessInvoker, ResourceClient,
    StateReset, Unauthenticated,
};
use crate::commands::{Commands, RunArgs};
use crate::common::config::Config;
use crate::common::paths::default_artifacts_dir;
use crate::common::{logging, truthy, Error, Result};
use crate::scenario::preflight::{process_env, skip_reason};
use crate::scenario::runner::prepare_step_inputs;
use crate::scenario::{
    discover, scenario_matches, Collaborators, DiscoveredScenario, RunOptions, Runner, Scenario,
    SkipList, StopAfter,
};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands, verbose: bool, config_path: Option<PathBuf>) -> Result<()> {
    let config = match &config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match command {
        Commands::Run(args) => {
            let run_root = run_root(&args, &config);
            let _guard = logging::init_cli(verbose, Some(&run_root));
            run(args, &config, run_root).await
        }

        Commands::List { paths, scenario } => {
            let _guard = logging::init_cli(verbose, None);
            let found = select(&paths, scenario.as_deref())?;
            println!("{}", "Scenarios:".cyan());
            for s in &found {
                match Scenario::load(&s.path) {
                    Ok(loaded) => match skip_reason(&loaded, process_env) {
                        Some(reason) => println!("  {} {} {}", "↷".yellow(), s.id, reason.dimmed()),
                        None => println!("  {} {}", "•".green(), s.id),
                    },
                    Err(e) => println!("  {} {} {}", "✗".red(), s.id, e),
                }
            }
            Ok(())
        }

        Commands::Render { scenario, step, out } => {
            let _guard = logging::init_cli(verbose, None);
            render_step(&scenario, &step, &out)?;
            println!(
                "{} Rendered inputs for step {} into {}",
                "✓".green(),
                step,
                out.display()
            );
            Ok(())
        }
    }
}

/// `E2E_ARTIFACTS_DIR` is the run directory itself; otherwise a
/// timestamped directory under the configured or platform root
fn run_root(args: &RunArgs, config: &Config) -> PathBuf {
    if let Some(dir) = &args.artifacts_dir {
        return dir.clone();
    }
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    config
        .artifacts
        .dir
        .clone()
        .unwrap_or_else(default_artifacts_dir)
        .join(stamp)
}

fn select(paths: &[PathBuf], filter: Option<&str>) -> Result<Vec<DiscoveredScenario>> {
    let found: Vec<_> = discover(paths)
        .into_iter()
        .filter(|s| scenario_matches(s, filter.unwrap_or("")))
        .collect();
    if found.is_empty() {
        let roots: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        return Err(Error::Config(format!(
            "no scenarios found under {}{}",
            roots.join(", "),
            filter.map(|f| format!(" matching '{}'", f)).unwrap_or_default()
        )));
    }
    Ok(found)
}

fn collaborators(args: &RunArgs, config: &Config, run_root: &Path) -> Result<Collaborators> {
    let bin = args
        .bin
        .clone()
        .or_else(|| config.cli.bin.clone())
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| {
            Error::Config("no CLI binary configured; set E2E_BIN or [cli] bin".to_string())
        })?;
    let bin = resolve_binary(&bin)?;
    info!("CLI under test: {}", bin.display());
    let invoker = ProcessInvoker::new(bin, Duration::from_secs(config.cli.timeout_secs));

    let token = args
        .api_token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| config.api.token());
    let base_url = args
        .api_base_url
        .clone()
        .unwrap_or_else(|| config.api.base_url.clone());
    let client = match token {
        Some(token) => {
            let http = HttpResourceClient::new(
                &base_url,
                &config.api.global_base_url,
                token,
                Duration::from_secs(config.api.request_timeout_secs),
            )?;
            Some(Arc::new(http) as Arc<dyn ResourceClient>)
        }
        None => None,
    };

    let reset_enabled = args
        .reset
        .as_deref()
        .map(truthy)
        .unwrap_or(config.reset.enabled);
    let reset: Arc<dyn StateReset> = if reset_enabled {
        Arc::new(ApiReset::new(client.clone(), config.reset.endpoints.clone()))
    } else {
        Arc::new(NoReset)
    };

    let resources: Arc<dyn ResourceClient> = match client {
        Some(client) => client,
        None => Arc::new(Unauthenticated),
    };
    Ok(Collaborators {
        invoker: Arc::new(invoker),
        resources,
        reset,
        artifacts: Arc::new(FsArtifacts::new(run_root)),
        cli: CliSettings {
            profile: Some(config.cli.profile.clone()).filter(|p| !p.trim().is_empty()),
            default_output: Some(config.cli.output.clone()),
        },
    })
}

async fn run(args: RunArgs, config: &Config, run_root: PathBuf) -> Result<()> {
    let scenarios = select(&args.paths, args.scenario.as_deref())?;
    let collab = collaborators(&args, config, &run_root)?;
    let options = RunOptions {
        skip_steps: SkipList::parse(args.skip_steps.as_deref().unwrap_or("")),
        stop_after: StopAfter::parse(args.stop_after.as_deref().unwrap_or("")),
        update_expect: args.update_expect.as_deref().map(truthy).unwrap_or(false),
        work_root: run_root.clone(),
    };
    if options.update_expect {
        info!("Update mode: expectation files will be rewritten");
    }
    info!("Run directory: {}", run_root.display());

    let runner = Runner::new(collab, options);
    let (mut passed, mut failed, mut skipped) = (0usize, 0usize, 0usize);
    for s in &scenarios {
        match runner.run_path(&s.id, &s.path).await {
            Ok(result) if result.skipped.is_some() => skipped += 1,
            Ok(result) => {
                passed += 1;
                match result.stopped_after {
                    Some(target) => {
                        let note = format!("(stopped after {})", target);
                        println!("{} {} {}", "✓".green().bold(), s.id.green(), note.dimmed());
                        break;
                    }
                    None => println!("{} {}", "✓".green().bold(), s.id.green()),
                }
            }
            Err(e) => {
                failed += 1;
                println!("{} {}", "✗".red().bold(), s.id.red().bold());
                println!("  {}", e.to_string().replace('\n', "\n  "));
            }
        }
    }

    println!(
        "\n{} passed, {} failed, {} skipped",
        passed.to_string().green(),
        failed.to_string().red(),
        skipped.to_string().yellow()
    );
    println!("Artifacts: {}", run_root.display().to_string().dimmed());

    if failed > 0 {
        return Err(Error::RunFailed {
            failed,
            total: scenarios.len(),
        });
    }
    Ok(())
}

/// Materialize the inputs of one step into an empty directory
fn render_step(scenario_path: &Path, step_name: &str, out: &Path) -> Result<()> {
    let scenario = Scenario::load(scenario_path)?;
    let (index, step) = scenario
        .steps
        .iter()
        .enumerate()
        .find(|(i, s)| s.display_name(*i).eq_ignore_ascii_case(step_name.trim()))
        .ok_or_else(|| Error::Config(format!("step '{}' not found", step_name)))?;

    if out.exists() && std::fs::read_dir(out)?.next().is_some() {
        return Err(Error::Config(format!(
            "output directory {} is not empty",
            out.display()
        )));
    }

    let dir = scenario_path.parent().unwrap_or(Path::new("."));
    let tmpl = crate::overlay::TemplateContext::new(
        scenario.vars.clone(),
        dir,
        &step.display_name(index),
        out,
    );
    prepare_step_inputs(&scenario, step, dir, out, &tmpl)
}
