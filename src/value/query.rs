//! Structured selector evaluation
//!
//! Selectors and `recordVar` paths are JMESPath expressions evaluated over
//! the value model. Results are converted back to `serde_json::Value`
//! immediately, so nothing non-`Send` escapes this module.

use super::Value;
use crate::common::{Error, Result};

/// Evaluate `expr` against `data`. A blank expression or `@` returns the
/// input unchanged.
pub fn search(expr: &str, data: &Value) -> Result<Value> {
    let expr = expr.trim();
    if expr.is_empty() || expr == "@" {
        return Ok(data.clone());
    }

    let selector_err = |message: String| Error::Selector {
        expr: expr.to_string(),
        message,
    };

    let compiled = jmespath::compile(expr).map_err(|e| selector_err(e.to_string()))?;
    let found = compiled.search(data).map_err(|e| selector_err(e.to_string()))?;
    serde_json::to_value(&*found).map_err(|e| selector_err(e.to_string()))
}
