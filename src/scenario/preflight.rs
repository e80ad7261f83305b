//! Scenario gating: decide whether a scenario should run in this environment

use super::config::Scenario;
use crate::common::truthy;

/// Names from `required` whose variables are unset or blank. Blank names
/// are ignored.
pub fn missing_env_vars<F>(required: &[String], lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    required
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .filter(|name| {
            lookup(name)
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
        })
        .map(str::to_string)
        .collect()
}

/// Combine the scenario's informational text with a gate message
///
/// The gate message is always shown as `skipping: ...`; when `info` is set
/// it leads and the gate message follows in parentheses.
pub fn format_skip_reason(info: &str, fallback: &str) -> String {
    let info = info.trim();
    let fallback = fallback.trim();
    let gate = if fallback.is_empty() || fallback.starts_with("skipping:") {
        fallback.to_string()
    } else {
        format!("skipping: {}", fallback)
    };
    match (info.is_empty(), gate.is_empty()) {
        (true, _) => gate,
        (false, true) => info.to_string(),
        (false, false) => format!("{} ({})", info, gate),
    }
}

/// Reason to skip `scenario`, or `None` when it should run
///
/// Gates are checked in order: explicit disable, opt-in variable, required
/// variables.
pub fn skip_reason<F>(scenario: &Scenario, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let gate = &scenario.test;
    let info = gate.info.as_deref().unwrap_or("");

    if gate.enabled == Some(false) {
        return Some(format_skip_reason(info, "scenario disabled via scenario.yaml"));
    }

    if let Some(var) = gate.enabled_by_env_var.as_deref().map(str::trim) {
        if !var.is_empty() && !lookup(var).map(|v| truthy(&v)).unwrap_or(false) {
            return Some(format_skip_reason(info, &format!("{} not enabled", var)));
        }
    }

    let missing = missing_env_vars(&gate.required_env_vars, &lookup);
    if !missing.is_empty() {
        return Some(format_skip_reason(
            info,
            &format!("missing required env {}", missing.join(", ")),
        ));
    }

    None
}

/// Process-environment lookup for [`skip_reason`]
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
