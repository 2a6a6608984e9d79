//! Project-rooted filesystem access.
//!
//! Every path a worker names is resolved against a single project root:
//! - Path validation (prevents traversal out of the root)
//! - Size limits on read/write operations
//! - Idempotent deletes
//! - Recursive listing that skips dependency and VCS directories

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::FileError;

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// Maximum listing depth below the requested directory.
const MAX_LIST_DEPTH: usize = 8;

/// One entry returned by [`FileStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Filesystem adapter consumed by the operation executor.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Project root every path is resolved against.
    fn root(&self) -> &Path;

    /// Resolve `path` under the root, rejecting escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, FileError>;

    async fn read(&self, path: &str) -> Result<String, FileError>;

    /// Write `content`, creating parent directories as needed.
    async fn write(&self, path: &str, content: &str) -> Result<PathBuf, FileError>;

    /// Delete a file or directory. Deleting something that does not exist succeeds.
    async fn delete(&self, path: &str) -> Result<(), FileError>;

    async fn list(&self, dir: &str) -> Result<Vec<FileEntry>, FileError>;

    /// Whether `path` resolves inside the root and exists.
    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(resolved) => fs::try_exists(&resolved).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Normalize a path by resolving `.` and `..` components lexically (no filesystem access).
///
/// `std::fs::canonicalize` only works on paths that exist, so new files are
/// normalized without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, std::path::Component::Normal(_)))
                {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            std::path::Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the nearest existing ancestor of `path` and re-append the rest,
/// so symlinks inside the root are followed even for files not yet created.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail_parts: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if ancestor.exists() {
            let mut result = ancestor
                .canonicalize()
                .unwrap_or_else(|_| ancestor.to_path_buf());
            for part in tail_parts.into_iter().rev() {
                result = result.join(part);
            }
            return result;
        }
        if let Some(name) = ancestor.file_name() {
            tail_parts.push(name);
        }
        match ancestor.parent() {
            Some(parent) if parent != ancestor => ancestor = parent,
            _ => return path.to_path_buf(),
        }
    }
}

/// Validate that `path_str` stays within `root` once resolved.
///
/// Relative paths are joined onto the root; absolute paths are accepted only
/// if they already point inside it.
pub fn validate_path(path_str: &str, root: &Path) -> Result<PathBuf, FileError> {
    let trimmed = path_str.trim();
    if trimmed.is_empty() {
        return Err(FileError::OutsideRoot(path_str.to_string()));
    }

    let root_canonical = root
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(root));

    let path = PathBuf::from(trimmed);
    let joined = if path.is_absolute() {
        path
    } else {
        root_canonical.join(path)
    };

    let resolved = canonicalize_existing_prefix(&normalize_lexical(&joined));

    if !resolved.starts_with(&root_canonical) {
        tracing::warn!(path = %path_str, root = %root.display(), "Rejected path outside project root");
        return Err(FileError::OutsideRoot(path_str.to_string()));
    }

    Ok(resolved)
}

/// Filesystem access confined to one project root.
#[derive(Debug, Clone)]
pub struct ProjectFiles {
    root: PathBuf,
}

impl ProjectFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the project root if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), FileError> {
        fs::create_dir_all(&self.root).await.map_err(|source| FileError::Io {
            path: self.root.clone(),
            source,
        })
    }

    fn canonical_root(&self) -> PathBuf {
        self.root
            .canonicalize()
            .unwrap_or_else(|_| normalize_lexical(&self.root))
    }

    /// Resolve a path that will be written or deleted. The root itself is
    /// never a valid target.
    fn resolve_entry(&self, path: &str) -> Result<PathBuf, FileError> {
        let resolved = self.resolve(path)?;
        if resolved == self.canonical_root() {
            tracing::warn!(path = %path, "Rejected modification of the project root");
            return Err(FileError::ProjectRoot(path.to_string()));
        }
        Ok(resolved)
    }

    fn relative_display(&self, path: &Path) -> String {
        let root = self.canonical_root();
        path.strip_prefix(&root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[async_trait]
impl FileStore for ProjectFiles {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FileError> {
        validate_path(path, &self.root)
    }

    async fn read(&self, path: &str) -> Result<String, FileError> {
        let resolved = self.resolve(path)?;

        let metadata = match fs::metadata(&resolved).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileError::NotFound(path.to_string()));
            }
            Err(source) => return Err(FileError::Io { path: resolved, source }),
        };
        if metadata.is_dir() {
            return Err(FileError::IsDirectory(path.to_string()));
        }
        if metadata.len() > MAX_READ_SIZE {
            return Err(FileError::TooLarge {
                size: metadata.len() as usize,
                max: MAX_READ_SIZE as usize,
            });
        }

        fs::read_to_string(&resolved)
            .await
            .map_err(|source| FileError::Io { path: resolved, source })
    }

    async fn write(&self, path: &str, content: &str) -> Result<PathBuf, FileError> {
        if content.len() > MAX_WRITE_SIZE {
            return Err(FileError::TooLarge {
                size: content.len(),
                max: MAX_WRITE_SIZE,
            });
        }

        let resolved = self.resolve_entry(path)?;
        if resolved.is_dir() {
            return Err(FileError::IsDirectory(path.to_string()));
        }

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| FileError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        fs::write(&resolved, content)
            .await
            .map_err(|source| FileError::Io {
                path: resolved.clone(),
                source,
            })?;

        tracing::debug!(path = %resolved.display(), bytes = content.len(), "Wrote file");
        Ok(resolved)
    }

    async fn delete(&self, path: &str) -> Result<(), FileError> {
        let resolved = self.resolve_entry(path)?;

        let metadata = match fs::symlink_metadata(&resolved).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(FileError::Io { path: resolved, source }),
        };

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&resolved).await
        } else {
            fs::remove_file(&resolved).await
        };

        match removed {
            Ok(()) => {
                tracing::debug!(path = %resolved.display(), "Deleted path");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FileError::Io { path: resolved, source }),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<FileEntry>, FileError> {
        let dir = if dir.trim().is_empty() { "." } else { dir };
        let resolved = self.resolve(dir)?;
        if !resolved.exists() {
            return Err(FileError::NotFound(dir.to_string()));
        }
        if !resolved.is_dir() {
            return Err(FileError::IsDirectory(dir.to_string()));
        }

        let mut entries = Vec::new();
        self.list_dir_inner(&resolved, 0, &mut entries).await?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

impl ProjectFiles {
    /// Recursively list directory contents.
    async fn list_dir_inner(
        &self,
        path: &Path,
        current_depth: usize,
        entries: &mut Vec<FileEntry>,
    ) -> Result<(), FileError> {
        if entries.len() >= MAX_DIR_ENTRIES {
            return Ok(());
        }

        let io_err = |source| FileError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut dir = fs::read_dir(path).await.map_err(io_err)?;

        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            if entries.len() >= MAX_DIR_ENTRIES {
                break;
            }

            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if name_str.starts_with('.')
                || matches!(
                    name_str.as_ref(),
                    "node_modules" | "target" | "__pycache__" | "venv"
                )
            {
                continue;
            }

            let entry_path = entry.path();
            let metadata = entry.metadata().await.ok();
            let is_dir = metadata.as_ref().is_some_and(|m| m.is_dir());

            entries.push(FileEntry {
                path: self.relative_display(&entry_path),
                is_dir,
                size: if is_dir {
                    0
                } else {
                    metadata.as_ref().map(|m| m.len()).unwrap_or(0)
                },
            });

            if is_dir && current_depth < MAX_LIST_DEPTH {
                Box::pin(self.list_dir_inner(&entry_path, current_depth + 1, entries)).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_file() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());

        let written = files.write("hello.txt", "hello world").await.unwrap();
        assert!(written.starts_with(dir.path().canonicalize().unwrap()));
        assert_eq!(files.read("hello.txt").await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_write_file_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());

        files.write("a/b/c/deep.txt", "deep").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a/b/c/deep.txt")).unwrap(),
            "deep"
        );
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());

        let err = files.read("nope.txt").await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());

        files.delete("ghost.js").await.unwrap();
        files.delete("ghost.js").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_directory_recursively() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());
        files.write("build/out/app.js", "x").await.unwrap();

        files.delete("build").await.unwrap();
        assert!(!dir.path().join("build").exists());
    }

    #[tokio::test]
    async fn test_project_root_cannot_be_deleted_or_overwritten() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());
        files.write("keep.txt", "k").await.unwrap();

        for path in [".", "./", "src/..", ""] {
            assert!(files.delete(path).await.is_err(), "{path:?}");
        }
        let err = files.delete(".").await.unwrap_err();
        assert!(matches!(err, FileError::ProjectRoot(_)));
        assert!(matches!(
            files.write(".", "x").await,
            Err(FileError::ProjectRoot(_))
        ));

        assert!(dir.path().join("keep.txt").exists());
        assert!(files.list(".").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_dependencies() {
        let dir = TempDir::new().unwrap();
        let files = ProjectFiles::new(dir.path());
        files.write("src/a.js", "a").await.unwrap();
        files.write("node_modules/pkg/index.js", "x").await.unwrap();
        files.write(".git/HEAD", "ref").await.unwrap();

        let entries = files.list(".").await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src", "src/a.js"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size, 1);
    }

    #[test]
    fn test_validate_path_rejects_relative_traversal() {
        let dir = TempDir::new().unwrap();
        let result = validate_path("../../etc/passwd", dir.path());
        assert!(matches!(result, Err(FileError::OutsideRoot(_))));
    }

    #[test]
    fn test_validate_path_rejects_traversal_through_missing_dirs() {
        let dir = TempDir::new().unwrap();
        let result = validate_path("new/dir/../../../outside.txt", dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_path_rejects_absolute_outside_root() {
        let dir = TempDir::new().unwrap();
        assert!(validate_path("/etc/passwd", dir.path()).is_err());
    }

    #[test]
    fn test_validate_path_accepts_absolute_inside_root() {
        let dir = TempDir::new().unwrap();
        let inside = dir.path().canonicalize().unwrap().join("src/a.js");
        let resolved = validate_path(inside.to_str().unwrap(), dir.path()).unwrap();
        assert_eq!(resolved, inside);
    }

    #[test]
    fn test_validate_path_rejects_empty() {
        let dir = TempDir::new().unwrap();
        assert!(validate_path("  ", dir.path()).is_err());
    }

    #[test]
    fn test_normalize_lexical_keeps_leading_parent() {
        let normalized = normalize_lexical(Path::new("a/../../b"));
        assert_eq!(normalized, PathBuf::from("../b"));
    }
}
