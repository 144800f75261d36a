//! Repository snapshot seam
//!
//! The pipeline never touches the working tree directly; it reads through a
//! `RepositorySnapshot` so retrieval sees one consistent view for the whole
//! step, and so tests can substitute an in-memory tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use forge_core::{ForgeError, Result};

/// Manifest filenames probed for by `RepositorySnapshot::manifest`
const MANIFEST_NAMES: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "requirements.txt",
    "go.mod",
];

/// Immutable, read-only view of a repository at a point in time
#[async_trait]
pub trait RepositorySnapshot: Send + Sync {
    /// Relative paths of every file in the snapshot, most recently modified
    /// first where the backing store tracks it
    async fn list_files(&self) -> Result<Vec<PathBuf>>;

    /// Contents of one file; `Err` if the path is not in the snapshot
    async fn read(&self, path: &Path) -> Result<String>;

    /// The root dependency manifest, if the snapshot carries one
    async fn manifest(&self) -> Result<Option<(PathBuf, String)>> {
        for name in MANIFEST_NAMES {
            let path = PathBuf::from(name);
            if let Ok(content) = self.read(&path).await {
                return Ok(Some((path, content)));
            }
        }
        Ok(None)
    }
}

/// Snapshot backed by a plain map, for tests and synthetic repos
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshot {
    files: BTreeMap<PathBuf, String>,
}

impl InMemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

#[async_trait]
impl RepositorySnapshot for InMemorySnapshot {
    async fn list_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self.files.keys().cloned().collect())
    }

    async fn read(&self, path: &Path) -> Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| ForgeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not in snapshot", path.display()),
            )))
    }
}

/// Snapshot over a directory on disk
///
/// Hidden entries and common build-output directories are skipped during
/// listing; listing order is modification time, newest first. Reads resolve
/// relative to the snapshot root.
pub struct DirSnapshot {
    root: PathBuf,
}

impl DirSnapshot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn skip_dir(name: &str) -> bool {
        name.starts_with('.')
            || matches!(name, "target" | "node_modules" | "__pycache__" | "dist" | "build")
    }
}

#[async_trait]
impl RepositorySnapshot for DirSnapshot {
    async fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if !Self::skip_dir(&name) {
                        pending.push(path);
                    }
                } else if file_type.is_file() && !name.starts_with('.') {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        let modified = entry
                            .metadata()
                            .await?
                            .modified()
                            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                        files.push((modified, relative.to_path_buf()));
                    }
                }
            }
        }

        // Newest first; path order breaks modification-time ties
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    async fn read(&self, path: &Path) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.root.join(path)).await?)
    }
}
