//! Generic value model
//!
//! Scenario inputs, command output and expectations are all handled as
//! `serde_json::Value` trees (key order preserved). This module holds the
//! recursive transforms shared by the overlay and assertion engines.

pub mod diff;
pub mod path;
pub mod query;

use std::path::Path;

use serde_json::Number;
pub use serde_json::{Map, Value};

use crate::common::{Error, Result};

/// Type-directed merge of `src` onto `dst`.
///
/// Mappings merge recursively by key, keeping `dst` keys absent from
/// `src` and appending new ones. Anything else, arrays included, is
/// replaced wholesale by `src`.
pub fn merge_value(dst: Value, src: Value) -> Value {
    match (dst, src) {
        (Value::Object(mut dst), Value::Object(src)) => {
            for (key, src_val) in src {
                match dst.get_mut(&key) {
                    Some(dst_val) => {
                        let current = dst_val.take();
                        *dst_val = merge_value(current, src_val);
                    }
                    None => {
                        dst.insert(key, src_val);
                    }
                }
            }
            Value::Object(dst)
        }
        (_, src) => src,
    }
}

/// Recursively remove the named keys from every mapping, including
/// mappings nested inside arrays.
pub fn drop_keys_deep<S: AsRef<str>>(value: &Value, keys: &[S]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !keys.iter().any(|drop| drop.as_ref() == k.as_str()))
                .map(|(k, v)| (k.clone(), drop_keys_deep(v, keys)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| drop_keys_deep(v, keys)).collect()),
        other => other.clone(),
    }
}

/// Coerce every number to a 64-bit float so integer and float encodings
/// of the same quantity compare equal. Integers beyond 2^53 lose precision.
pub fn normalize_numbers_deep(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64().and_then(Number::from_f64) {
            Some(f) => Value::Number(f),
            None => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers_deep).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers_deep(v)))
                .collect(),
        ),
        other => other,
    }
}

/// True for `.yaml` / `.yml` paths (case-insensitive)
pub fn is_yaml_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Parse YAML text into the value model; an empty document is null
pub fn parse_yaml(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_yaml::from_str(text)?)
}

/// Parse JSON text into the value model; an empty document is null
pub fn parse_json(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text)?)
}

/// Read a document, choosing YAML or JSON by extension
pub fn read_document(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::load(path, e))?;
    let parsed = if is_yaml_path(path) {
        parse_yaml(&text)
    } else {
        parse_json(&text)
    };
    parsed.map_err(|e| Error::load(path, e))
}

/// Write a document in the format its extension implies
pub fn write_document(path: &Path, value: &Value) -> Result<()> {
    let text = if is_yaml_path(path) {
        serde_yaml::to_string(value)?
    } else {
        to_pretty_json(value)?
    };
    std::fs::write(path, text)?;
    Ok(())
}

/// Pretty JSON with a trailing newline
pub fn to_pretty_json(value: &Value) -> Result<String> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    Ok(text)
}

/// Scalar text used for equality in match filters and template output
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(number_text(n)),
        _ => None,
    }
}

/// Render a number without a trailing `.0` when it is integral
pub fn number_text(n: &Number) -> String {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                return format!("{}", f as i64);
            }
        }
    }
    n.to_string()
}
