//! Overlay/merge engine
//!
//! Materializes step inputs by layering rendered fragments onto a copied
//! base fixture. Three directive kinds are applied in order, each feeding
//! the next:
//!
//! - overlay directories, merged file by file ([`apply_overlay_dir`])
//! - ops files with targeted `match`/`set` edits ([`apply_overlay_ops_file`])
//! - inline ops declared on the step ([`apply_overlay_ops`])
//!
//! Plain merges replace arrays wholesale; ops are the way to edit a single
//! element deep inside an array without touching its siblings.

pub mod template;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

pub use template::{render, render_value, TemplateContext};

use crate::common::{Error, Result};
use crate::value::path::{match_nodes_mut, Path as MatchPath};
use crate::value::{is_yaml_path, merge_value, parse_yaml, read_document, write_document, Map, Value};

/// A targeted edit: set keys on every mapping matched inside `file`
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct OverlayOp {
    /// Target file, relative to the step's working directory
    #[serde(default)]
    pub file: String,
    #[serde(default, rename = "match")]
    pub match_expr: String,
    #[serde(default)]
    pub set: Map<String, Value>,
    /// Reserved; accepted and ignored
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

/// Layout of an ops file
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct OpsFile {
    #[serde(default)]
    pub ops: Vec<OverlayOp>,
}

/// Merge one overlay file into `dst`.
///
/// The overlay is rendered first. Non-YAML overlays overwrite the target
/// verbatim; a YAML overlay is written as-is when the target does not exist
/// yet, and merged onto it otherwise.
pub fn apply_overlay_file(dst: &Path, overlay: &Path, ctx: &TemplateContext) -> Result<()> {
    let raw = fs::read_to_string(overlay).map_err(|e| Error::load(overlay, e))?;
    let rendered = render(&raw, ctx)
        .map_err(|e| Error::Overlay(format!("template overlay {}: {}", overlay.display(), e)))?;

    if !is_yaml_path(overlay) || !dst.exists() {
        debug!("Writing overlay {} -> {}", overlay.display(), dst.display());
        fs::write(dst, rendered)?;
        return Ok(());
    }

    let src = parse_yaml(&rendered)
        .map_err(|e| Error::Overlay(format!("parse overlay yaml {}: {}", overlay.display(), e)))?;
    let base_text = fs::read_to_string(dst)?;
    let base = parse_yaml(&base_text)
        .map_err(|e| Error::Overlay(format!("parse dst yaml {}: {}", dst.display(), e)))?;

    debug!("Merging overlay {} onto {}", overlay.display(), dst.display());
    let merged = merge_value(base, src);
    fs::write(dst, serde_yaml::to_string(&merged)?)?;
    Ok(())
}

/// Walk `overlay_dir` and apply each file onto the same relative path
/// under `dst_root`
pub fn apply_overlay_dir(dst_root: &Path, overlay_dir: &Path, ctx: &TemplateContext) -> Result<()> {
    if !overlay_dir.is_dir() {
        return Err(Error::load(overlay_dir, "overlay directory not found"));
    }
    for entry in WalkDir::new(overlay_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::load(overlay_dir, e))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(overlay_dir)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let out = dst_root.join(rel);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        apply_overlay_file(&out, entry.path(), ctx)?;
    }
    Ok(())
}

/// Apply an ops file; the whole file is rendered before it is parsed
pub fn apply_overlay_ops_file(dst_root: &Path, ops_path: &Path, ctx: &TemplateContext) -> Result<()> {
    let raw = fs::read_to_string(ops_path).map_err(|e| Error::load(ops_path, e))?;
    let rendered = render(&raw, ctx)
        .map_err(|e| Error::Overlay(format!("template ops {}: {}", ops_path.display(), e)))?;
    let ops: OpsFile = serde_yaml::from_str(&rendered)
        .map_err(|e| Error::Overlay(format!("parse ops yaml {}: {}", ops_path.display(), e)))?;

    for op in &ops.ops {
        apply_op(dst_root, op, &op.match_expr)
            .map_err(|e| annotate(e, &format!("ops file {}", ops_path.display())))?;
    }
    Ok(())
}

/// Apply inline ops; only each op's match expression is rendered
pub fn apply_overlay_ops(dst_root: &Path, ops: &[OverlayOp], ctx: &TemplateContext) -> Result<()> {
    for op in ops {
        let expr = render(&op.match_expr, ctx)?;
        apply_op(dst_root, op, &expr).map_err(|e| annotate(e, "inline op"))?;
    }
    Ok(())
}

fn annotate(err: Error, origin: &str) -> Error {
    match err {
        Error::Overlay(msg) => Error::Overlay(format!("{}: {}", origin, msg)),
        other => other,
    }
}

fn apply_op(dst_root: &Path, op: &OverlayOp, expr: &str) -> Result<()> {
    if op.file.trim().is_empty() {
        return Err(Error::Overlay("op is missing 'file'".to_string()));
    }
    let target = dst_root.join(&op.file);
    let mut doc = read_document_lenient(&target)?;

    let path = MatchPath::parse(expr)?;
    let touched = apply_op_to_document(&mut doc, &path, &op.set);
    if touched == 0 {
        return Err(Error::Overlay(format!(
            "match '{}' found no targets in {}",
            expr,
            target.display()
        )));
    }

    debug!("Op '{}' updated {} node(s) in {}", expr, touched, target.display());
    write_document(&target, &doc)
}

/// Targets are parsed as YAML regardless of extension so JSON files work
/// too; they are written back in the format their extension implies.
fn read_document_lenient(target: &Path) -> Result<Value> {
    if is_yaml_path(target) {
        return read_document(target);
    }
    let text = fs::read_to_string(target).map_err(|e| Error::load(target, e))?;
    parse_yaml(&text).map_err(|e| Error::load(target, e))
}

/// Write `set` onto every mapping matched by `path`; returns the number of
/// mappings touched
pub fn apply_op_to_document(doc: &mut Value, path: &MatchPath, set: &Map<String, Value>) -> usize {
    let matched = match_nodes_mut(doc, path);
    let count = matched.len();
    for node in matched {
        if let Value::Object(map) = node {
            for (key, value) in set {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    count
}
