//! Assertion/diff engine
//!
//! One assertion attempt resolves its source, applies the selector and the
//! union of masks, builds the expectation (inline fields or an expectation
//! document plus overlays), normalizes numbers on both sides and diffs.
//! [`check`] repeats attempts under the assertion's retry policy.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::collab::ArtifactSink;
use crate::common::{Error, Result};
use crate::overlay::{render, TemplateContext};
use crate::retry::Retrier;
use crate::scenario::config::Assertion;
use crate::value::diff::{diff, render_diff, Difference};
use crate::value::query::search;
use crate::value::{
    drop_keys_deep, merge_value, normalize_numbers_deep, read_document, to_pretty_json,
    write_document, Map, Value,
};

/// Issues a fresh read for `source.get`
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(&self, resource: &str) -> Result<Value>;
}

/// Everything an assertion needs from its surroundings
pub struct AssertionEnv<'a> {
    /// Root for expectation files
    pub scenario_dir: &'a Path,
    pub template: &'a TemplateContext,
    /// Union of mask keys from every scope
    pub mask: &'a [String],
    /// Accept any outcome and rewrite file-based expectations
    pub update: bool,
    pub artifacts: &'a dyn ArtifactSink,
    /// Artifact directory for this assertion, relative to the run root
    pub artifact_dir: PathBuf,
}

/// Result of one comparison
#[derive(Debug, Clone)]
pub struct Outcome {
    pub selector: Option<String>,
    /// Masked observed value, numbers as produced by the source
    pub observed: Value,
    /// Normalized expectation as compared
    pub expected: Value,
    pub diffs: Vec<Difference>,
    pub passed: bool,
}

/// Compare `source` against the assertion's expectation. Does not write
/// artifacts and does not fail on mismatch.
pub fn evaluate(assertion: &Assertion, source: &Value, env: &AssertionEnv<'_>) -> Result<Outcome> {
    let selector = match assertion.select.as_deref().map(str::trim) {
        Some(sel) if !sel.is_empty() => Some(render(sel, env.template)?),
        _ => None,
    };
    let observed = match &selector {
        Some(sel) => search(sel, source)?,
        None => source.clone(),
    };
    let observed = drop_keys_deep(&observed, env.mask);

    let (expected, actual, expect_path) = if assertion.expect.is_inline() {
        let (expected, actual) = inline_subsets(&assertion.expect.fields, &observed, env.template)?;
        (expected, actual, None)
    } else {
        let path = expectation_path(assertion, env.scenario_dir)?;
        let mut doc = read_document(&path)?;
        for overlay in &assertion.expect.overlays {
            let overlay_doc = read_document(&env.scenario_dir.join(overlay))?;
            doc = merge_value(doc, overlay_doc);
        }
        (drop_keys_deep(&doc, env.mask), observed.clone(), Some(path))
    };

    let expected = normalize_numbers_deep(expected);
    let actual = normalize_numbers_deep(actual);
    let diffs = diff(&expected, &actual);

    let mut passed = diffs.is_empty();
    if env.update {
        passed = true;
        if let (Some(path), false) = (&expect_path, diffs.is_empty()) {
            info!("Updating expectation {}", path.display());
            write_document(path, &observed)?;
        }
    }

    Ok(Outcome {
        selector,
        observed,
        expected,
        diffs,
        passed,
    })
}

fn expectation_path(assertion: &Assertion, scenario_dir: &Path) -> Result<PathBuf> {
    match assertion.expect.file.as_deref().map(str::trim) {
        Some(file) if !file.is_empty() => Ok(scenario_dir.join(file)),
        _ => Err(Error::Expectation(
            "expect.file not set and no expect.fields provided".to_string(),
        )),
    }
}

/// Build parallel expected/actual maps keyed by query path. A path that
/// cannot be evaluated against `observed` records null.
fn inline_subsets(
    fields: &Map<String, Value>,
    observed: &Value,
    ctx: &TemplateContext,
) -> Result<(Value, Value)> {
    let mut expected = Map::new();
    let mut actual = Map::new();
    for (path, want) in fields {
        let want = match want {
            Value::String(s) => Value::String(render(s, ctx)?),
            other => other.clone(),
        };
        expected.insert(path.clone(), want);
        actual.insert(path.clone(), search(path, observed).unwrap_or(Value::Null));
    }
    Ok((Value::Object(expected), Value::Object(actual)))
}

/// One attempt: evaluate, persist artifacts, turn a mismatch into an error
pub fn check_once(assertion: &Assertion, source: &Value, env: &AssertionEnv<'_>) -> Result<Outcome> {
    let outcome = evaluate(assertion, source, env)?;
    write_artifacts(&outcome, env);

    if outcome.passed {
        return Ok(outcome);
    }
    Err(Error::AssertionMismatch {
        diff: render_diff(&outcome.diffs),
        artifacts: env
            .artifacts
            .location(&env.artifact_dir)
            .map(|p| p.display().to_string()),
    })
}

fn write_artifacts(outcome: &Outcome, env: &AssertionEnv<'_>) {
    let dir = &env.artifact_dir;
    if let Some(sel) = &outcome.selector {
        env.artifacts.write(&dir.join("select.txt"), format!("{}\n", sel).as_bytes());
    }
    for (name, value) in [("observed.json", &outcome.observed), ("expected.json", &outcome.expected)] {
        if let Ok(text) = to_pretty_json(value) {
            env.artifacts.write(&dir.join(name), text.as_bytes());
        }
    }

    let mut result = String::from(if outcome.passed { "pass\n" } else { "fail\n" });
    result.push_str("------\n");
    if outcome.diffs.is_empty() {
        result.push_str("(no diff)\n");
    } else {
        result.push_str(&render_diff(&outcome.diffs));
        result.push('\n');
    }
    env.artifacts.write(&dir.join("result.txt"), result.as_bytes());
}

/// Run an assertion to success or retry exhaustion. `parent` is the parsed
/// output of the command the assertion belongs to.
pub async fn check(
    label: &str,
    assertion: &Assertion,
    parent: &Value,
    reader: &dyn SourceReader,
    env: &AssertionEnv<'_>,
    retrier: &Retrier,
) -> Result<()> {
    retrier
        .run(label, |e| retrier.permits(e), move |attempt| async move {
            let fetched;
            let source = match assertion.source.get.as_deref().map(str::trim) {
                Some(resource) if !resource.is_empty() => {
                    let resource = render(resource, env.template)?;
                    debug!("{}: attempt {} reading {}", label, attempt + 1, resource);
                    fetched = reader.read(&resource).await?;
                    &fetched
                }
                _ => parent,
            };
            check_once(assertion, source, env).map(|_| ())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::artifacts::MemoryArtifacts;
    use crate::retry::RetryPolicy;
    use crate::scenario::config::{AssertionSource, Expect};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn ctx() -> TemplateContext {
        let Value::Object(vars) = json!({"portalName": "dev"}) else { unreachable!() };
        TemplateContext::new(vars, Path::new("."), "step-000", Path::new("/tmp"))
    }

    fn env<'a>(
        dir: &'a Path,
        ctx: &'a TemplateContext,
        mask: &'a [String],
        sink: &'a MemoryArtifacts,
    ) -> AssertionEnv<'a> {
        AssertionEnv {
            scenario_dir: dir,
            template: ctx,
            mask,
            update: false,
            artifacts: sink,
            artifact_dir: PathBuf::from("assertions/a"),
        }
    }

    fn inline(select: Option<&str>, fields: Value) -> Assertion {
        let Value::Object(fields) = fields else { unreachable!() };
        Assertion {
            select: select.map(String::from),
            expect: Expect {
                fields,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_inline_fields_pass_with_templates_and_numbers() {
        let ctx = ctx();
        let sink = MemoryArtifacts::default();
        let env = env(Path::new("."), &ctx, &[], &sink);
        let source = json!({"portals": [{"name": "dev", "pages": 3}]});
        let assertion = inline(
            Some("portals[0]"),
            json!({"name": "{{ .vars.portalName }}", "pages": 3.0}),
        );

        let outcome = check_once(&assertion, &source, &env).unwrap();
        assert!(outcome.passed);
        assert_eq!(sink.read("assertions/a/select.txt").as_deref(), Some("portals[0]\n"));
        assert!(sink.read("assertions/a/result.txt").unwrap().starts_with("pass\n"));
    }

    #[test]
    fn test_inline_missing_path_records_null_and_fails() {
        let ctx = ctx();
        let sink = MemoryArtifacts::default();
        let env = env(Path::new("."), &ctx, &[], &sink);
        let assertion = inline(None, json!({"description": "x"}));

        let outcome = evaluate(&assertion, &json!({"name": "dev"}), &env).unwrap();
        assert!(!outcome.passed);

        let err = check_once(&assertion, &json!({"name": "dev"}), &env).unwrap_err();
        assert!(matches!(err, Error::AssertionMismatch { .. }));
        assert!(err.to_string().contains("got null"));
        assert!(sink.read("assertions/a/result.txt").unwrap().starts_with("fail\n"));
    }

    #[test]
    fn test_file_expectation_with_overlays_and_mask() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("expect.yaml"),
            "name: dev\ncount: 2\nlabels:\n  team: core\n  tier: gold\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("overlay.yaml"), "labels:\n  tier: silver\n").unwrap();

        let ctx = ctx();
        let sink = MemoryArtifacts::default();
        let mask = vec!["id".to_string()];
        let env = env(dir.path(), &ctx, &mask, &sink);
        let assertion = Assertion {
            expect: Expect {
                file: Some("expect.yaml".into()),
                overlays: vec!["overlay.yaml".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let observed = json!({"id": "abc", "name": "dev", "count": 2.0, "labels": {"team": "core", "tier": "silver"}});

        assert!(evaluate(&assertion, &observed, &env).unwrap().passed);
        // Same inputs, same outcome.
        assert!(evaluate(&assertion, &observed, &env).unwrap().passed);
    }

    #[test]
    fn test_update_mode_rewrites_file_expectation_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expect.json");
        std::fs::write(&path, r#"{"name": "old"}"#).unwrap();

        let ctx = ctx();
        let sink = MemoryArtifacts::default();
        let mut env = env(dir.path(), &ctx, &[], &sink);
        env.update = true;

        let file_assertion = Assertion {
            expect: Expect {
                file: Some("expect.json".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let observed = json!({"name": "new"});
        assert!(check_once(&file_assertion, &observed, &env).unwrap().passed);
        assert_eq!(read_document(&path).unwrap(), observed);

        let inline_assertion = inline(None, json!({"name": "other"}));
        assert!(check_once(&inline_assertion, &observed, &env).unwrap().passed);
    }

    #[test]
    fn test_missing_expectation_file_is_load_error() {
        let ctx = ctx();
        let sink = MemoryArtifacts::default();
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path(), &ctx, &[], &sink);
        let assertion = Assertion {
            expect: Expect {
                file: Some("nope.yaml".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = evaluate(&assertion, &json!({}), &env).unwrap_err();
        assert!(err.is_authoring());
    }

    struct CountingReader {
        calls: Arc<AtomicU32>,
        ready_after: u32,
    }

    #[async_trait]
    impl SourceReader for CountingReader {
        async fn read(&self, resource: &str) -> Result<Value> {
            assert_eq!(resource, "portals");
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(json!({"name": "dev"}))
            } else {
                Ok(json!({"name": "pending"}))
            }
        }
    }

    #[tokio::test]
    async fn test_check_retries_fresh_reads_until_converged() {
        let ctx = ctx();
        let sink = MemoryArtifacts::default();
        let env = env(Path::new("."), &ctx, &[], &sink);
        let mut assertion = inline(None, json!({"name": "dev"}));
        assertion.source = AssertionSource {
            get: Some("portals".into()),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let reader = CountingReader {
            calls: calls.clone(),
            ready_after: 3,
        };
        let retrier = Retrier::from_policy(&RetryPolicy {
            attempts: Some(5),
            interval: Some("1ms".into()),
            ..Default::default()
        })
        .unwrap();

        check("s/a", &assertion, &Value::Null, &reader, &env, &retrier)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_check_exhausts_and_reports_mismatch() {
        let ctx = ctx();
        let sink = MemoryArtifacts::default();
        let env = env(Path::new("."), &ctx, &[], &sink);
        let assertion = inline(None, json!({"name": "prod"}));
        let reader = CountingReader {
            calls: Arc::new(AtomicU32::new(0)),
            ready_after: 1,
        };
        let retrier = Retrier::from_policy(&RetryPolicy {
            attempts: Some(2),
            interval: Some("1ms".into()),
            ..Default::default()
        })
        .unwrap();

        let err = check("s/a", &assertion, &json!({"name": "dev"}), &reader, &env, &retrier)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 2, .. }));
        assert!(matches!(err.root(), Error::AssertionMismatch { .. }));
    }
}
