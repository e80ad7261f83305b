//! Run-shaping controls: scenario selection, step skip globs, stop-after

use std::path::{Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

/// File name that marks a scenario directory
pub const SCENARIO_FILE: &str = "scenario.yaml";

/// A scenario found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredScenario {
    pub path: PathBuf,
    /// Scenario directory relative to its search root, `/`-separated
    pub id: String,
}

/// Find `scenario.yaml` files under each root. A root may also name a
/// scenario file directly. Results are sorted by path.
pub fn discover(roots: &[PathBuf]) -> Vec<DiscoveredScenario> {
    let mut found = Vec::new();
    for root in roots {
        if root.is_file() {
            let id = root
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            found.push(DiscoveredScenario {
                path: root.clone(),
                id,
            });
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || entry.file_name() != SCENARIO_FILE {
                continue;
            }
            let dir = entry.path().parent().unwrap_or(root);
            let mut id = dir
                .strip_prefix(root)
                .map(to_slash)
                .unwrap_or_else(|_| to_slash(dir));
            if id.is_empty() {
                // root is itself a scenario directory
                id = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
            }
            found.push(DiscoveredScenario {
                path: entry.path().to_path_buf(),
                id,
            });
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found.dedup_by(|a, b| a.path == b.path);
    found
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize_scenario_ref(s: &str) -> &str {
    let s = s.strip_suffix(&format!("/{}", SCENARIO_FILE)).unwrap_or(s);
    let s = s.strip_prefix("test/e2e/scenarios/").unwrap_or(s);
    s.strip_prefix("scenarios/").unwrap_or(s)
}

/// Exact scenario selection. The filter may be the full path, or the
/// scenario directory with or without a `scenarios/` prefix and
/// `/scenario.yaml` suffix. An empty filter selects everything.
pub fn scenario_matches(scenario: &DiscoveredScenario, filter: &str) -> bool {
    let filter = filter.trim().replace('\\', "/");
    if filter.is_empty() {
        return true;
    }
    let path = to_slash(&scenario.path);
    if path == filter {
        return true;
    }
    let wanted = normalize_scenario_ref(&filter);
    normalize_scenario_ref(&path) == wanted || scenario.id == wanted
}

/// Glob match in the style of shell patterns: `*`, `?`, `[...]` (`^` or `!`
/// negates) and `\` escapes. A malformed pattern falls back to a substring
/// test.
pub fn matches_glob(text: &str, pattern: &str) -> bool {
    match glob_regex(pattern) {
        Some(re) => re.is_match(text),
        None => text.contains(pattern),
    }
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => {
                i += 1;
                let c = chars.get(i)?;
                out.push_str(&regex::escape(&c.to_string()));
            }
            '[' => {
                let mut j = i + 1;
                let mut class = String::from("[");
                if matches!(chars.get(j), Some('^') | Some('!')) {
                    class.push('^');
                    j += 1;
                }
                let start = j;
                while j < chars.len() && chars[j] != ']' {
                    let c = chars[j];
                    if c == '-' && j > start && j + 1 < chars.len() && chars[j + 1] != ']' {
                        class.push('-');
                    } else {
                        class.push_str(&regex::escape(&c.to_string()));
                    }
                    j += 1;
                }
                if j >= chars.len() || j == start {
                    return None;
                }
                class.push(']');
                out.push_str(&class);
                i = j;
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out).ok()
}

/// Comma-separated step-skip globs, matched case-insensitively
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    patterns: Vec<String>,
}

impl SkipList {
    pub fn parse(list: &str) -> Self {
        let patterns = list
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True when any pattern matches `step_name`
    pub fn skips(&self, step_name: &str) -> bool {
        let name = step_name.to_lowercase();
        self.patterns.iter().any(|p| matches_glob(&name, p))
    }
}

/// Halt target: `step` or `step/command`, compared case-insensitively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopAfter {
    step: String,
    command: Option<String>,
}

impl StopAfter {
    /// `None` for a blank target
    pub fn parse(target: &str) -> Option<Self> {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        let (step, command) = match target.split_once('/') {
            Some((s, c)) if !c.trim().is_empty() => (s, Some(c.trim().to_lowercase())),
            Some((s, _)) => (s, None),
            None => (target, None),
        };
        Some(Self {
            step: step.trim().to_lowercase(),
            command,
        })
    }

    /// Checked after each command. A bare step target is reached by the
    /// step's last command.
    pub fn reached_after_command(&self, step: &str, command: &str, last_in_step: bool) -> bool {
        if self.step != step.to_lowercase() {
            return false;
        }
        match &self.command {
            Some(target) => *target == command.to_lowercase(),
            None => last_in_step,
        }
    }

    /// Checked after a step that ran no commands
    pub fn reached_after_empty_step(&self, step: &str) -> bool {
        self.command.is_none() && self.step == step.to_lowercase()
    }
}

impl std::fmt::Display for StopAfter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(cmd) => write!(f, "{}/{}", self.step, cmd),
            None => write!(f, "{}", self.step),
        }
    }
}
