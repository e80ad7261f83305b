//! Structural diff between two value trees

use std::fmt;

use super::{number_text, Value};

/// Differences beyond this count are summarized in [`render_diff`]
const MAX_RENDERED: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum DiffKind {
    Changed { expected: Value, actual: Value },
    Missing { expected: Value },
    Unexpected { actual: Value },
}

/// One difference, located by a `$.a[0].b` style path
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub path: String,
    pub kind: DiffKind,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DiffKind::Changed { expected, actual } => write!(
                f,
                "~ {}: expected {}, got {}",
                self.path,
                compact(expected),
                compact(actual)
            ),
            DiffKind::Missing { expected } => {
                write!(f, "- {}: missing (expected {})", self.path, compact(expected))
            }
            DiffKind::Unexpected { actual } => {
                write!(f, "+ {}: unexpected {}", self.path, compact(actual))
            }
        }
    }
}

/// Compare `expected` against `actual`; an empty result means equal
pub fn diff(expected: &Value, actual: &Value) -> Vec<Difference> {
    let mut out = Vec::new();
    walk("$".to_string(), expected, actual, &mut out);
    out
}

fn walk(path: String, expected: &Value, actual: &Value, out: &mut Vec<Difference>) {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            for (key, exp_val) in exp {
                let child = key_path(&path, key);
                match act.get(key) {
                    Some(act_val) => walk(child, exp_val, act_val, out),
                    None => out.push(Difference {
                        path: child,
                        kind: DiffKind::Missing {
                            expected: exp_val.clone(),
                        },
                    }),
                }
            }
            for (key, act_val) in act {
                if !exp.contains_key(key) {
                    out.push(Difference {
                        path: key_path(&path, key),
                        kind: DiffKind::Unexpected {
                            actual: act_val.clone(),
                        },
                    });
                }
            }
        }
        (Value::Array(exp), Value::Array(act)) => {
            for i in 0..exp.len().max(act.len()) {
                let child = format!("{}[{}]", path, i);
                match (exp.get(i), act.get(i)) {
                    (Some(e), Some(a)) => walk(child, e, a, out),
                    (Some(e), None) => out.push(Difference {
                        path: child,
                        kind: DiffKind::Missing { expected: e.clone() },
                    }),
                    (None, Some(a)) => out.push(Difference {
                        path: child,
                        kind: DiffKind::Unexpected { actual: a.clone() },
                    }),
                    (None, None) => {}
                }
            }
        }
        (e, a) if e == a => {}
        (e, a) => out.push(Difference {
            path,
            kind: DiffKind::Changed {
                expected: e.clone(),
                actual: a.clone(),
            },
        }),
    }
}

fn key_path(parent: &str, key: &str) -> String {
    let plain = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if plain {
        format!("{}.{}", parent, key)
    } else {
        format!("{}[{:?}]", parent, key)
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::Number(n) => number_text(n),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}

/// One line per difference, truncated after a fixed number of entries
pub fn render_diff(diffs: &[Difference]) -> String {
    let mut lines: Vec<String> = diffs.iter().take(MAX_RENDERED).map(|d| d.to_string()).collect();
    if diffs.len() > MAX_RENDERED {
        lines.push(format!("… and {} more", diffs.len() - MAX_RENDERED));
    }
    lines.join("\n")
}
