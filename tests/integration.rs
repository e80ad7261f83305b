//! End-to-end integration tests for the scenario harness
//!
//! These tests run complete scenarios through the library API:
//! 1. Writing a scenario, its base inputs and expectations into a temp dir
//! 2. Running it against the `mock_cli` binary as the CLI under test
//! 3. Checking outcomes, recorded variables and on-disk artifacts

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use harness::collab::reset::{ApiReset, ResetEndpoint};
use harness::collab::{
    CliSettings, FsArtifacts, HttpRequest, HttpResponse, Method, ProcessInvoker, ResourceClient,
};
use harness::scenario::{SkipList, StopAfter};
use harness::{Collaborators, Error, Result, RunOptions, Runner, ScenarioResult};

/// Fake API: lists two portals, accepts deletes, echoes creations
#[derive(Default)]
struct FakeApi {
    requests: Mutex<Vec<(Method, String)>>,
}

#[async_trait]
impl ResourceClient for FakeApi {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((request.method, request.path.clone()));
        let (status, body) = match request.method {
            Method::Get => (200, json!({"data": [{"id": "x1"}, {"id": "x2"}]})),
            Method::Delete => (204, json!(null)),
            _ => {
                let mut body = request.body.clone().unwrap_or_else(|| json!({}));
                body["id"] = json!("new-1");
                (201, body)
            }
        };
        Ok(HttpResponse {
            status,
            body: if body.is_null() {
                String::new()
            } else {
                body.to_string()
            },
            url: format!("https://api.test{}", request.path),
            ..Default::default()
        })
    }
}

/// Test context with a scenario directory and a run directory
struct TestContext {
    scenario_dir: tempfile::TempDir,
    run_dir: tempfile::TempDir,
    artifacts_root: PathBuf,
    state_dir: PathBuf,
    api: Arc<FakeApi>,
}

impl TestContext {
    fn new() -> Self {
        let scenario_dir = tempfile::tempdir().expect("scenario dir");
        let run_dir = tempfile::tempdir().expect("run dir");
        let state_dir = run_dir.path().join("mock-state");
        Self {
            scenario_dir,
            artifacts_root: run_dir.path().to_path_buf(),
            run_dir,
            state_dir,
            api: Arc::new(FakeApi::default()),
        }
    }

    /// Write artifacts under a named directory inside the run dir
    fn with_artifacts_root(mut self, name: &str) -> Self {
        self.artifacts_root = self.run_dir.path().join(name);
        self
    }

    fn dir(&self) -> &Path {
        self.scenario_dir.path()
    }

    /// Write a file relative to the scenario directory
    fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.dir().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    fn runner(&self, skip: &str, stop: &str, update: bool) -> Runner {
        let mut env = BTreeMap::new();
        env.insert(
            "MOCK_CLI_STATE".to_string(),
            self.state_dir.display().to_string(),
        );
        let invoker = ProcessInvoker::new(env!("CARGO_BIN_EXE_mock_cli"), Duration::from_secs(30))
            .with_env(env);
        let api = self.api.clone() as Arc<dyn ResourceClient>;

        let collab = Collaborators {
            invoker: Arc::new(invoker),
            resources: api.clone(),
            reset: Arc::new(ApiReset::new(
                Some(api),
                vec![ResetEndpoint::new("v3", "portals")],
            )),
            artifacts: Arc::new(FsArtifacts::new(&self.artifacts_root)),
            cli: CliSettings {
                profile: Some("e2e".to_string()),
                ..Default::default()
            },
        };
        Runner::new(
            collab,
            RunOptions {
                skip_steps: SkipList::parse(skip),
                stop_after: StopAfter::parse(stop),
                update_expect: update,
                work_root: self.run_dir.path().to_path_buf(),
            },
        )
    }

    async fn run(&self, yaml: &str) -> Result<ScenarioResult> {
        self.run_with(yaml, "", "", false).await
    }

    async fn run_with(&self, yaml: &str, skip: &str, stop: &str, update: bool) -> Result<ScenarioResult> {
        let path = self.write("scenario.yaml", yaml);
        self.runner(skip, stop, update).run_path("it", &path).await
    }

    fn artifact(&self, rel: &str) -> String {
        fs::read_to_string(self.artifacts_root.join("scenarios/it").join(rel))
            .unwrap_or_else(|e| panic!("artifact {}: {}", rel, e))
    }
}

const PORTALS: &str = "\
portals:
  - name: dev
    id: p-1
    description: old
  - name: prod
    id: p-2
    description: stable
";

const FLOW: &str = r#"
baseInputsPath: base
vars:
  wanted: dev
steps:
  - name: apply
    inputOverlayOps:
      - file: portals.yaml
        match: "portals[?name=='{{ .vars.wanted }}']"
        set: { description: new }
    commands:
      - name: put
        run: [put, portals, "{{ .workdir }}/portals.yaml"]
        assertions:
          - expect:
              fields:
                stored: portals
      - name: read
        run: [get, portals]
        recordVar: { name: devId, path: "portals[?name=='dev'] | [0].id" }
        assertions:
          - name: dev
            select: "portals[?name=='dev'] | [0]"
            mask: { dropKeys: [id] }
            expect:
              file: expect/dev.yaml
  - name: verify
    skipInputs: true
    commands:
      - run: [echo, '{"id": "{{ .vars.devId }}"}']
        assertions:
          - expect:
              fields:
                id: p-1
"#;

fn flow_fixture(ctx: &TestContext) {
    ctx.write("base/portals.yaml", PORTALS);
    ctx.write("expect/dev.yaml", "name: dev\ndescription: new\n");
}

#[tokio::test]
async fn test_full_flow_overlays_vars_and_expectations() {
    let ctx = TestContext::new();
    flow_fixture(&ctx);

    let result = ctx.run(FLOW).await.expect("scenario should pass");
    assert_eq!(result.commands_run(), 3);
    assert_eq!(result.vars.get("devId"), Some(&json!("p-1")));

    // the base fixture is untouched; the step copy carries the overlay
    let base = fs::read_to_string(ctx.dir().join("base/portals.yaml")).unwrap();
    assert!(base.contains("description: old"));
    let step_inputs = ctx.artifact("steps/000-apply/inputs/portals.yaml");
    assert!(step_inputs.contains("description: new"));
    assert!(step_inputs.contains("description: stable"));

    let command = ctx.artifact("steps/000-apply/commands/001-read/command.txt");
    assert!(command.contains("get portals --profile e2e -o json"));
    let result_txt = ctx.artifact("steps/000-apply/commands/001-read/assertions/dev/result.txt");
    assert!(result_txt.starts_with("pass\n------\n"));
    let observed = ctx.artifact("steps/000-apply/commands/001-read/assertions/dev/observed.json");
    assert!(!observed.contains("p-1"));
}

#[tokio::test]
async fn test_expectation_mismatch_fails_and_update_mode_rewrites() {
    let ctx = TestContext::new();
    flow_fixture(&ctx);
    let expect = ctx.write("expect/dev.yaml", "name: dev\ndescription: old\n");

    let err = ctx.run(FLOW).await.unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("it/apply/read/dev: "), "{}", text);
    assert!(text.contains("description"));
    assert!(matches!(err.root(), Error::AssertionMismatch { .. }));

    ctx.run_with(FLOW, "", "", true)
        .await
        .expect("update mode accepts the observed value");
    let rewritten = harness::value::read_document(&expect).unwrap();
    assert_eq!(rewritten, json!({"name": "dev", "description": "new"}));

    ctx.run(FLOW).await.expect("rewritten expectation now matches");
}

#[tokio::test]
async fn test_skip_and_stop_after() {
    let ctx = TestContext::new();
    flow_fixture(&ctx);

    let result = ctx.run_with(FLOW, "ver*", "", false).await.unwrap();
    assert_eq!(result.commands_run(), 2);
    assert!(result.steps[1].skipped);

    let result = ctx.run_with(FLOW, "", "apply/put", false).await.unwrap();
    assert_eq!(result.commands_run(), 1);
    assert_eq!(result.stopped_after.as_deref(), Some("apply/put"));
    assert!(!result.vars.contains_key("devId"));
}

#[tokio::test]
async fn test_command_retry_recovers_from_transient_failure() {
    let ctx = TestContext::new();
    let counter = ctx.run_dir.path().join("flaky-counter");
    let yaml = format!(
        r#"
steps:
  - skipInputs: true
    commands:
      - run: [flaky, "{}", "2", '{{"ok": true}}']
        retry: {{ attempts: 3, interval: 10ms }}
        assertions:
          - expect:
              fields:
                ok: true
"#,
        counter.display()
    );
    ctx.run(&yaml).await.expect("third attempt succeeds");
    assert_eq!(fs::read_to_string(&counter).unwrap(), "3");
}

#[tokio::test]
async fn test_command_without_retry_fails_fast() {
    let ctx = TestContext::new();
    let counter = ctx.run_dir.path().join("flaky-counter");
    let yaml = format!(
        r#"
steps:
  - name: apply
    skipInputs: true
    commands:
      - run: [flaky, "{}", "1", '{{}}']
"#,
        counter.display()
    );
    let err = ctx.run(&yaml).await.unwrap_err();
    assert_eq!(fs::read_to_string(&counter).unwrap(), "1");
    let text = err.to_string();
    assert!(text.starts_with("it/apply/command-000: "), "{}", text);
    assert!(text.contains("exit=1"));
    assert!(text.contains("connection refused"));
    assert!(text.contains("artifacts: "));

    let stderr = ctx.artifact("steps/000-apply/commands/000-command-000/stderr.txt");
    assert!(stderr.contains("connection refused"));
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried_because_of_names_or_paths() {
    // "429", "eof" and "timeout" are all transient patterns; only the
    // process output may decide
    let ctx = TestContext::new().with_artifacts_root("20261017-142905-429-eof");
    let log = ctx.run_dir.path().join("invocations.log");
    let yaml = format!(
        r#"
steps:
  - name: timeout-eof
    skipInputs: true
    commands:
      - name: retry-429
        run: [fail, "1", "validation failed: name required"]
        env: {{ MOCK_CLI_LOG: "{}" }}
        retry: {{ attempts: 3, interval: 1ms }}
"#,
        log.display()
    );
    let err = ctx.run(&yaml).await.unwrap_err();
    let invocations = fs::read_to_string(&log).unwrap();
    assert_eq!(invocations.lines().count(), 1, "{}", invocations);

    let text = err.to_string();
    assert!(!text.contains("Retries exhausted"), "{}", text);
    assert!(text.starts_with("it/timeout-eof/retry-429: "), "{}", text);
    assert!(text.contains("validation failed: name required"));
    let hint = ctx
        .artifacts_root
        .join("scenarios/it/steps/000-timeout-eof/commands/000-retry-429");
    assert!(text.ends_with(&format!("artifacts: {}", hint.display())), "{}", text);
}

#[tokio::test]
async fn test_expected_failure_and_output_modes() {
    let ctx = TestContext::new();
    let yaml = r#"
steps:
  - skipInputs: true
    commands:
      - run: [fail, "3", "portal not found"]
        expectFailure: { exitCode: 3, contains: "not found" }
      - run: [echo, '{"a": {"b": 1.0}}']
        outputFormat: yaml
        parseAs: yaml
        assertions:
          - select: a
            expect:
              fields:
                b: 1
      - run: [echo, '{"x": 1}']
        outputFormat: none
        parseAs: raw
        assertions:
          - expect:
              fields:
                "contains(stdout, '\"x\": 1')": true
      - name: env
        run: [env, TEAM]
        env: { TEAM: blue }
        assertions:
          - expect:
              fields:
                value: blue
"#;
    ctx.run(yaml).await.expect("scenario should pass");
}

#[tokio::test]
async fn test_source_get_reads_fresh_state() {
    let ctx = TestContext::new();
    ctx.write("base/apis.yaml", "- name: one\n- name: two\n");
    let yaml = r#"
baseInputsPath: base
steps:
  - commands:
      - run: [put, apis, "{{ .workdir }}/apis.yaml"]
        assertions:
          - source: { get: apis }
            select: "[].name"
            expect:
              fields:
                "length(@)": 2
                "[1]": two
"#;
    ctx.run(yaml).await.expect("scenario should pass");
}

#[tokio::test]
async fn test_create_and_reset_go_through_the_api() {
    let ctx = TestContext::new();
    let yaml = r#"
vars: { suffix: qa }
steps:
  - skipInputs: true
    commands:
      - resetOrg: true
      - name: make-portal
        create:
          resource: portal
          payload: { inline: { name: "dev-{{ .vars.suffix }}" } }
          recordVar: { name: portalId }
        assertions:
          - expect:
              fields:
                name: dev-qa
"#;
    let result = ctx.run(yaml).await.expect("scenario should pass");
    assert_eq!(result.vars.get("portalId"), Some(&json!("new-1")));

    let requests = ctx.api.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![
            (Method::Get, "/v3/portals".to_string()),
            (Method::Delete, "/v3/portals/x1".to_string()),
            (Method::Delete, "/v3/portals/x2".to_string()),
            (Method::Post, "/v3/portals".to_string()),
        ]
    );
    let meta = ctx.artifact("steps/000-step-000/commands/001-make-portal/meta.json");
    assert!(meta.contains("\"status\": 201"));
}

#[tokio::test]
async fn test_failed_create_points_at_its_artifacts() {
    let ctx = TestContext::new();
    let yaml = r#"
steps:
  - skipInputs: true
    commands:
      - name: make-portal
        create:
          resource: portal
          payload: { inline: { name: dev } }
          expectStatus: 200
"#;
    let err = ctx.run(yaml).await.unwrap_err();
    assert!(matches!(err.root(), Error::HttpStatus { status: 201, expected: 200, .. }));

    let text = err.to_string();
    assert!(text.starts_with("it/step-000/make-portal: "), "{}", text);
    let hint = ctx
        .artifacts_root
        .join("scenarios/it/steps/000-step-000/commands/000-make-portal");
    assert!(text.ends_with(&format!("artifacts: {}", hint.display())), "{}", text);

    let meta = ctx.artifact("steps/000-step-000/commands/000-make-portal/meta.json");
    assert!(meta.contains("\"status\": 201"));
    assert!(meta.contains("\"expectStatus\": 200"));
    assert_eq!(ctx.api.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_disabled_scenario_is_skipped() {
    let ctx = TestContext::new();
    let yaml = r#"
test:
  enabled: false
  info: Needs a real mailbox
steps:
  - skipInputs: true
    commands:
      - run: [fail, "1", "should not run"]
"#;
    let result = ctx.run(yaml).await.unwrap();
    assert_eq!(
        result.skipped.as_deref(),
        Some("Needs a real mailbox (skipping: scenario disabled via scenario.yaml)")
    );
    assert_eq!(result.commands_run(), 0);
}

#[tokio::test]
async fn test_invalid_scenario_is_rejected_before_running() {
    let ctx = TestContext::new();
    let yaml = r#"
steps:
  - skipInputs: true
    commands:
      - run: [echo, "{}"]
        create: { resource: portal }
"#;
    let err = ctx.run(yaml).await.unwrap_err();
    assert!(matches!(err.root(), Error::InvalidScenario(_)));
    assert!(ctx.api.requests.lock().unwrap().is_empty());
}
