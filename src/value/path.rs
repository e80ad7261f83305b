//! Match expressions for targeted overlay edits
//!
//! A restricted path grammar:
//!
//! ```text
//! key1.key2[?field=='value'].key3
//! ```
//!
//! Segments are separated by dots. A segment is a key optionally followed
//! by one or more `[?field==literal]` filters; the literal may be single-
//! or double-quoted, or bare. A trailing pipe (`| [0]`) is ignored.

use std::fmt;

use super::{scalar_text, Value};
use crate::common::{Error, Result};

/// One step of a parsed match expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// Descend into a mapping by key
    Key(String),
    /// Keep mapping elements of an array whose `field` scalar equals `value`
    Filter { field: String, value: String },
}

/// A parsed match expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub steps: Vec<PathStep>,
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for step in &self.steps {
            match step {
                PathStep::Key(k) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", k)?;
                }
                PathStep::Filter { field, value } => write!(f, "[?{}=='{}']", field, value)?,
            }
            first = false;
        }
        Ok(())
    }
}

impl Path {
    /// Parse a match expression
    pub fn parse(expr: &str) -> Result<Self> {
        let mut s = expr.trim();
        if let Some(pipe) = find_outside_brackets(s, '|') {
            s = s[..pipe].trim();
        }

        let mut steps = Vec::new();
        for segment in split_outside_brackets(s, '.') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            parse_segment(expr, segment, &mut steps)?;
        }

        if steps.is_empty() {
            return Err(Error::match_expr(expr, "empty match expression"));
        }
        Ok(Self { steps })
    }
}

fn parse_segment(expr: &str, segment: &str, steps: &mut Vec<PathStep>) -> Result<()> {
    let Some(lb) = segment.find('[') else {
        if segment.contains(']') {
            return Err(Error::match_expr(expr, format!("unbalanced filter in '{}'", segment)));
        }
        steps.push(PathStep::Key(segment.to_string()));
        return Ok(());
    };

    let key = segment[..lb].trim();
    if !key.is_empty() {
        steps.push(PathStep::Key(key.to_string()));
    }

    let mut rest = &segment[lb..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(Error::match_expr(
                expr,
                format!("unexpected text '{}' after filter", rest),
            ));
        }
        let close = closing_bracket(rest)
            .ok_or_else(|| Error::match_expr(expr, format!("unbalanced filter in '{}'", segment)))?;
        steps.push(parse_filter(expr, rest[1..close].trim())?);
        rest = rest[close + 1..].trim_start();
    }
    Ok(())
}

fn parse_filter(expr: &str, filter: &str) -> Result<PathStep> {
    let cond = filter
        .strip_prefix('?')
        .ok_or_else(|| Error::match_expr(expr, format!("unsupported filter '{}'", filter)))?
        .trim();
    let eq = cond
        .find("==")
        .ok_or_else(|| Error::match_expr(expr, format!("unsupported condition '{}'", cond)))?;

    let field = cond[..eq].trim();
    if field.is_empty() {
        return Err(Error::match_expr(expr, "filter field is empty"));
    }
    let value = unquote(cond[eq + 2..].trim());

    Ok(PathStep::Filter {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn unquote(s: &str) -> &str {
    for quote in ['\'', '"', '`'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Index of the `]` closing the bracket that opens `s`, honoring quotes
fn closing_bracket(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices().skip(1) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' || c == '`' => quote = Some(c),
            None if c == ']' => return Some(i),
            None => {}
        }
    }
    None
}

fn find_outside_brackets(s: &str, needle: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' if depth > 0 => quote = Some(c),
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                _ if c == needle && depth == 0 => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn split_outside_brackets(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(i) = find_outside_brackets(rest, sep) {
        parts.push(&rest[..i]);
        rest = &rest[i + sep.len_utf8()..];
    }
    parts.push(rest);
    parts
}

fn filter_matches(item: &Value, field: &str, expected: &str) -> bool {
    item.as_object()
        .and_then(|m| m.get(field))
        .and_then(scalar_text)
        .map(|text| text == expected)
        .unwrap_or(false)
}

/// Walk `path` from `root` and return the matched mapping nodes
pub fn match_nodes<'a>(root: &'a Value, path: &Path) -> Vec<&'a Value> {
    let mut current = vec![root];
    for step in &path.steps {
        let mut next = Vec::new();
        for node in current {
            match step {
                PathStep::Key(key) => {
                    if let Some(v) = node.as_object().and_then(|m| m.get(key)) {
                        next.push(v);
                    }
                }
                PathStep::Filter { field, value } => {
                    if let Value::Array(items) = node {
                        next.extend(items.iter().filter(|it| filter_matches(it, field, value)));
                    }
                }
            }
        }
        if next.is_empty() {
            return Vec::new();
        }
        current = next;
    }
    current.into_iter().filter(|n| n.is_object()).collect()
}

/// Mutable variant of [`match_nodes`]
pub fn match_nodes_mut<'a>(root: &'a mut Value, path: &Path) -> Vec<&'a mut Value> {
    let mut current = vec![root];
    for step in &path.steps {
        let mut next = Vec::new();
        for node in current {
            match step {
                PathStep::Key(key) => {
                    if let Value::Object(map) = node {
                        if let Some(v) = map.get_mut(key) {
                            next.push(v);
                        }
                    }
                }
                PathStep::Filter { field, value } => {
                    if let Value::Array(items) = node {
                        for item in items.iter_mut() {
                            if filter_matches(item, field, value) {
                                next.push(item);
                            }
                        }
                    }
                }
            }
        }
        if next.is_empty() {
            return Vec::new();
        }
        current = next;
    }
    current.into_iter().filter(|n| n.is_object()).collect()
}
