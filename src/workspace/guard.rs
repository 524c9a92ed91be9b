//! Confined access to a workspace root
//!
//! [`WorkspaceRoot`] is the only way host filesystem state enters a pure
//! computation. Every request is resolved against the root, lexically
//! normalized, and rejected if it lands outside. The handles it returns
//! carry digests only, never open file descriptors.

use crate::error::{CairnError, CairnResult};
use crate::workspace::digest::{self, ContentDigest};
use crate::workspace::selector::{PathSelector, SelectorMatcher};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A digested directory selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryHandle {
    /// Path relative to the workspace root (`.` for the root itself)
    pub path: String,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub digest: ContentDigest,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// A digested file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHandle {
    /// Path relative to the workspace root
    pub path: String,
    pub size: u64,
    pub digest: ContentDigest,
}

/// An absolute host directory acting as a security boundary
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
    canonical_root: PathBuf,
}

impl WorkspaceRoot {
    /// Bind to an existing absolute directory
    pub fn new(root: impl Into<PathBuf>) -> CairnResult<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(CairnError::WorkspaceRootInvalid {
                path: root,
                reason: "workspace root must be an absolute path".to_string(),
            });
        }

        let root = normalize(&root);
        if !root.is_dir() {
            return Err(CairnError::WorkspaceRootInvalid {
                path: root,
                reason: "not an existing directory".to_string(),
            });
        }

        let canonical_root = root.canonicalize().map_err(|e| {
            CairnError::io(format!("resolving workspace root {}", root.display()), e)
        })?;

        Ok(Self {
            root,
            canonical_root,
        })
    }

    /// The root as given (normalized)
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Map a requested path onto the host. Absolute requests are taken as
    /// root-relative. Pure: touches no filesystem state.
    pub fn resolve(&self, requested: &str) -> CairnResult<PathBuf> {
        let relative =
            requested.trim_start_matches(|c: char| c == '/' || c == std::path::MAIN_SEPARATOR);
        let resolved = normalize(&self.root.join(relative));

        if !resolved.starts_with(&self.root) {
            return Err(CairnError::confinement(requested, &self.root));
        }
        Ok(resolved)
    }

    /// Digest a directory selection
    pub async fn directory(
        &self,
        path: &str,
        includes: &[String],
        excludes: &[String],
    ) -> CairnResult<DirectoryHandle> {
        let resolved = self.resolve(path)?;
        self.check_target(path, &resolved)?;
        if !resolved.is_dir() {
            return Err(CairnError::NotADirectory(resolved));
        }

        let matcher = SelectorMatcher::new(includes, excludes)?;
        let dir = resolved.clone();
        let tree = tokio::task::spawn_blocking(move || digest::digest_tree(&dir, &matcher))
            .await
            .map_err(|e| CairnError::Internal(format!("digest task failed: {}", e)))??;

        let rel = self.relative(&resolved);
        debug!(
            "Digested {} ({} files, {} bytes): {}",
            rel, tree.files, tree.bytes, tree.digest
        );

        Ok(DirectoryHandle {
            path: rel,
            includes: includes.to_vec(),
            excludes: excludes.to_vec(),
            digest: tree.digest,
            file_count: tree.files,
            total_bytes: tree.bytes,
        })
    }

    /// Digest a [`PathSelector`]
    pub async fn select(&self, selector: &PathSelector) -> CairnResult<DirectoryHandle> {
        self.directory(&selector.path, &selector.includes, &selector.excludes)
            .await
    }

    /// Digest a single file
    pub async fn file(&self, path: &str) -> CairnResult<FileHandle> {
        let resolved = self.resolve(path)?;
        self.check_target(path, &resolved)?;
        if !resolved.is_file() {
            return Err(CairnError::NotAFile(resolved));
        }

        let target = resolved.clone();
        let (digest, size) = tokio::task::spawn_blocking(move || digest::digest_file(&target))
            .await
            .map_err(|e| CairnError::Internal(format!("digest task failed: {}", e)))??;

        Ok(FileHandle {
            path: self.relative(&resolved),
            size,
            digest,
        })
    }

    /// Existence plus a symlink-aware confinement check
    fn check_target(&self, requested: &str, resolved: &Path) -> CairnResult<()> {
        if resolved.symlink_metadata().is_err() {
            return Err(CairnError::PathNotFound(resolved.to_path_buf()));
        }

        let canonical = resolved
            .canonicalize()
            .map_err(|_| CairnError::PathNotFound(resolved.to_path_buf()))?;
        if !canonical.starts_with(&self.canonical_root) {
            return Err(CairnError::confinement(requested, &self.root));
        }
        Ok(())
    }

    fn relative(&self, resolved: &Path) -> String {
        match resolved.strip_prefix(&self.root) {
            Ok(p) if p.as_os_str().is_empty() => ".".to_string(),
            Ok(p) => p.to_string_lossy().replace('\\', "/"),
            Err(_) => resolved.display().to_string(),
        }
    }
}

/// Lexically resolve `.` and `..`. `..` at the filesystem root stays there.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}
