//! Variable substitution for overlays, arguments and expectations
//!
//! The only supported expression is a dotted reference rooted at the
//! context: `{{ .vars.NAME }}`, `{{ .step }}`, `{{ .workdir }}` and
//! `{{ .scenario }}`. Anything else between braces is rejected, and so is
//! a reference that does not resolve.

use std::path::{Path, PathBuf};

use crate::common::{Error, Result};
use crate::value::{number_text, Map, Value};

/// Values visible to templates while one step is being prepared or run
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub vars: Map<String, Value>,
    /// Directory holding the scenario definition
    pub scenario: PathBuf,
    pub step: String,
    /// Step-scoped working directory
    pub workdir: PathBuf,
}

impl TemplateContext {
    pub fn new(vars: Map<String, Value>, scenario: &Path, step: &str, workdir: &Path) -> Self {
        Self {
            vars,
            scenario: scenario.to_path_buf(),
            step: step.to_string(),
            workdir: workdir.to_path_buf(),
        }
    }

    fn lookup(&self, reference: &str) -> Option<Value> {
        let mut parts = reference.split('.');
        let root = parts.next()?;
        let mut current = match root {
            "vars" => Value::Object(self.vars.clone()),
            "step" => Value::String(self.step.clone()),
            "workdir" => Value::String(self.workdir.display().to_string()),
            "scenario" => Value::String(self.scenario.display().to_string()),
            _ => return None,
        };
        for part in parts {
            current = current.as_object()?.get(part)?.clone();
        }
        Some(current)
    }
}

/// Render every `{{ .ref }}` in `input`
pub fn render(input: &str, ctx: &TemplateContext) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Template(format!("unterminated '{{{{' in {:?}", input)))?;
        let expr = after[..end].trim();

        let reference = expr
            .strip_prefix('.')
            .filter(|r| is_reference(r))
            .ok_or_else(|| Error::Template(format!("unsupported template expression '{{{{ {} }}}}'", expr)))?;
        let value = ctx
            .lookup(reference)
            .ok_or_else(|| Error::Template(format!("unresolved variable '.{}'", reference)))?;
        out.push_str(&value_text(&value));

        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Render every string leaf of `value`; keys and other scalars are kept
pub fn render_value(value: &Value, ctx: &TemplateContext) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(render(s, ctx)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, ctx))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn is_reference(r: &str) -> bool {
    !r.is_empty()
        && r.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_text(n),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
