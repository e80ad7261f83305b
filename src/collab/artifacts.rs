//! Artifact sinks

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::ArtifactSink;

/// Writes artifacts beneath a run directory
#[derive(Debug, Clone)]
pub struct FsArtifacts {
    root: PathBuf,
}

impl FsArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactSink for FsArtifacts {
    fn write(&self, rel: &Path, contents: &[u8]) {
        let path = self.root.join(rel);
        let result = path
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::write(&path, contents));
        if let Err(e) = result {
            debug!("Artifact write {} failed: {}", path.display(), e);
        }
    }

    fn location(&self, rel: &Path) -> Option<PathBuf> {
        Some(self.root.join(rel))
    }
}

/// Keeps artifacts in memory, keyed by relative path
#[derive(Debug, Default)]
pub struct MemoryArtifacts {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryArtifacts {
    /// Contents of `rel` as text, if it was written
    pub fn read(&self, rel: impl AsRef<Path>) -> Option<String> {
        let files = self.files.lock().ok()?;
        files
            .get(rel.as_ref())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// All written paths, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl ArtifactSink for MemoryArtifacts {
    fn write(&self, rel: &Path, contents: &[u8]) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(rel.to_path_buf(), contents.to_vec());
        }
    }

    fn location(&self, _rel: &Path) -> Option<PathBuf> {
        None
    }
}

/// Replace characters that are awkward in directory names
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ' ' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

/// `<NNN>-<name>` directory component
pub fn seq_dir(index: usize, name: &str) -> String {
    format!("{:03}-{}", index, sanitize_name(name))
}
