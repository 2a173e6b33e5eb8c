//! Read, write, search, and replace operations on confined files.
//!
//! Every operation validates its path through [`guard::confine`] before
//! touching the filesystem. Writes go to a temp file in the destination
//! directory followed by a rename, so a concurrent reader never observes a
//! partially written file.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::guard;
use crate::error::SandboxError;

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`.
    ///
    /// The directory is created if missing and canonicalized once, so
    /// every later containment check compares against the real path.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the contents of a file under the sandbox root.
    pub async fn read(&self, path: &str) -> Result<String, SandboxError> {
        let full = guard::confine(&self.root, path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SandboxError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `content` to a file under the sandbox root, creating parent
    /// directories as needed. Overwrites atomically.
    pub async fn write(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let full = guard::confine(&self.root, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(path = %full.display(), bytes = content.len(), "writing file");
        atomic_write(&full, content.as_bytes())
    }

    /// Find files matching a glob pattern rooted at the sandbox root.
    ///
    /// Recursive patterns (`**`) are supported. Results are relative to
    /// the root and sorted lexicographically. Matches whose normalized
    /// path falls outside the root (traversal inside the pattern) are
    /// dropped.
    pub async fn search(&self, pattern: &str) -> Result<Vec<String>, SandboxError> {
        let full_pattern = self.root.join(pattern);
        let entries = glob::glob(&full_pattern.to_string_lossy()).map_err(|e| {
            SandboxError::InvalidPattern {
                reason: e.to_string(),
            }
        })?;

        let mut matches = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| SandboxError::Io(e.into_error()))?;
            let resolved = guard::normalize(&path);
            if let Ok(relative) = resolved.strip_prefix(&self.root) {
                matches.push(relative.to_string_lossy().into_owned());
            }
        }
        matches.sort();
        Ok(matches)
    }

    /// Replace every literal occurrence of `old` with `new` in a file.
    ///
    /// Returns the number of replacements. A missing file is an error; an
    /// absent `old` is not, the file is simply left unchanged. Applying
    /// the same replacement twice therefore converges after the first
    /// application.
    pub async fn replace(&self, path: &str, old: &str, new: &str) -> Result<usize, SandboxError> {
        let content = self.read(path).await?;

        if old.is_empty() {
            return Ok(0);
        }

        let count = content.matches(old).count();
        if count == 0 {
            return Ok(0);
        }

        let updated = content.replace(old, new);
        self.write(path, &updated).await?;
        debug!(path, count, "replaced occurrences");
        Ok(count)
    }
}

/// Write through a temp file in the same directory, then rename over the
/// destination.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), SandboxError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| SandboxError::Io(e.error))?;
    Ok(())
}
